//! Decoding of the `:WAV:PRE?` metadata line.
//!
//! The instrument answers with ten comma separated fields, e.g.
//! `0,2,125000,1,8.000000e-09,-5.000000e-04,0,4.132813e-01,0,122`.
//! The field layout is described once, in [`PREAMBLE_FIELDS`], and consumed
//! generically by [`Preamble::parse`].

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreambleError {
    #[error("Malformed preamble: field {field_index} ({name}) has invalid value '{raw_value}'")]
    Malformed {
        field_index: usize,
        name: &'static str,
        raw_value: String,
    },

    #[error("Malformed preamble: expected {expected} fields, got {actual}")]
    FieldCount { expected: usize, actual: usize },
}

impl PreambleError {
    /// Position of the offending field. A missing field reports the index of
    /// the first absent position.
    pub fn field_index(&self) -> usize {
        match self {
            Self::Malformed { field_index, .. } => *field_index,
            Self::FieldCount { expected, actual } => (*actual).min(*expected),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveFormat {
    Byte,
    Word,
    Ascii,
}

impl WaveFormat {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Byte),
            1 => Some(Self::Word),
            2 => Some(Self::Ascii),
            _ => None,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Self::Byte => 0,
            Self::Word => 1,
            Self::Ascii => 2,
        }
    }

    /// Bytes per sample in the binary payload.
    pub fn sample_width(&self) -> Option<usize> {
        match self {
            Self::Byte => Some(1),
            Self::Word => Some(2),
            Self::Ascii => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionType {
    Normal,
    Max,
    Raw,
}

impl AcquisitionType {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Normal),
            1 => Some(Self::Max),
            2 => Some(Self::Raw),
            _ => None,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Self::Normal => 0,
            Self::Max => 1,
            Self::Raw => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Integer,
    Real,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FieldValue {
    Integer(i64),
    Real(f64),
}

impl FieldValue {
    fn integer(self) -> i64 {
        match self {
            Self::Integer(v) => v,
            Self::Real(v) => v as i64,
        }
    }

    fn real(self) -> f64 {
        match self {
            Self::Integer(v) => v as f64,
            Self::Real(v) => v,
        }
    }
}

/// Positional layout of the preamble response.
const PREAMBLE_FIELDS: [(&str, FieldKind); 10] = [
    ("format", FieldKind::Integer),
    ("type", FieldKind::Integer),
    ("points", FieldKind::Integer),
    ("count", FieldKind::Integer),
    ("xincrement", FieldKind::Real),
    ("xorigin", FieldKind::Real),
    ("xreference", FieldKind::Integer),
    ("yincrement", FieldKind::Real),
    ("yorigin", FieldKind::Integer),
    ("yreference", FieldKind::Integer),
];

/// Waveform metadata for one capture.
#[derive(Debug, Clone, PartialEq)]
pub struct Preamble {
    pub format: WaveFormat,
    pub acquisition_type: AcquisitionType,
    /// Number of samples in the payload.
    pub points: u64,
    /// Averages in average mode, 1 otherwise.
    pub count: u64,
    /// Seconds between consecutive samples.
    pub x_increment: f64,
    /// Time of the first sample relative to the trigger, in seconds.
    pub x_origin: f64,
    pub x_reference: i64,
    /// Volts per LSB, analog channels only.
    pub y_increment: f64,
    pub y_origin: i64,
    pub y_reference: i64,
}

impl Preamble {
    pub const FIELD_COUNT: usize = PREAMBLE_FIELDS.len();

    /// Parse a complete preamble line. Nothing is returned unless all ten
    /// fields decode.
    pub fn parse(line: &str) -> Result<Self, PreambleError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let raw: Vec<&str> = line.split(',').collect();

        if raw.len() > Self::FIELD_COUNT {
            return Err(PreambleError::FieldCount {
                expected: Self::FIELD_COUNT,
                actual: raw.len(),
            });
        }

        let mut values = [FieldValue::Integer(0); PREAMBLE_FIELDS.len()];
        for (index, (name, kind)) in PREAMBLE_FIELDS.iter().enumerate() {
            let token = raw.get(index).ok_or(PreambleError::FieldCount {
                expected: Self::FIELD_COUNT,
                actual: raw.len(),
            })?;
            values[index] = parse_field(index, name, *kind, token)?;
        }

        let malformed = |index: usize| PreambleError::Malformed {
            field_index: index,
            name: PREAMBLE_FIELDS[index].0,
            raw_value: raw[index].trim().to_string(),
        };

        let format = WaveFormat::from_code(values[0].integer()).ok_or_else(|| malformed(0))?;
        let acquisition_type =
            AcquisitionType::from_code(values[1].integer()).ok_or_else(|| malformed(1))?;
        let points = u64::try_from(values[2].integer()).map_err(|_| malformed(2))?;
        let count = u64::try_from(values[3].integer())
            .ok()
            .filter(|c| *c >= 1)
            .ok_or_else(|| malformed(3))?;

        Ok(Self {
            format,
            acquisition_type,
            points,
            count,
            x_increment: values[4].real(),
            x_origin: values[5].real(),
            x_reference: values[6].integer(),
            y_increment: values[7].real(),
            y_origin: values[8].integer(),
            y_reference: values[9].integer(),
        })
    }

    /// Time in seconds of the sample at `index`, relative to the trigger.
    pub fn sample_time(&self, index: u64) -> f64 {
        (index as f64 - self.x_reference as f64) * self.x_increment + self.x_origin
    }

    /// Voltage of a raw analog sample.
    pub fn voltage(&self, raw: u8) -> f64 {
        (f64::from(raw) - self.y_origin as f64 - self.y_reference as f64) * self.y_increment
    }

    /// Sample rate in samples per second.
    pub fn sample_rate(&self) -> f64 {
        if self.x_increment == 0.0 {
            0.0
        } else {
            1.0 / self.x_increment
        }
    }
}

fn parse_field(
    index: usize,
    name: &'static str,
    kind: FieldKind,
    token: &str,
) -> Result<FieldValue, PreambleError> {
    let trimmed = token.trim();
    let parsed = match kind {
        FieldKind::Integer => i64::from_str(trimmed).ok().map(FieldValue::Integer),
        FieldKind::Real => f64::from_str(trimmed)
            .ok()
            .filter(|v| v.is_finite())
            .map(FieldValue::Real),
    };

    parsed.ok_or_else(|| PreambleError::Malformed {
        field_index: index,
        name,
        raw_value: trimmed.to_string(),
    })
}

impl FromStr for Preamble {
    type Err = PreambleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Re-serializes into the instrument's line format.
impl fmt::Display for Preamble {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{:e},{:e},{},{:e},{},{}",
            self.format.code(),
            self.acquisition_type.code(),
            self.points,
            self.count,
            self.x_increment,
            self.x_origin,
            self.x_reference,
            self.y_increment,
            self.y_origin,
            self.y_reference
        )
    }
}
