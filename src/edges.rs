//! Edge extraction from logic-analyzer payloads.
//!
//! Every payload byte is one sample of a pod: bit `n` holds the logic level
//! of line `Dn` (or `D(n+8)` for the upper pod). A [`SignalMap`] names the
//! bit planes of interest and [`TransitionLog::extract`] walks the payload
//! once, recording where anything changed.

use crate::preamble::Preamble;
use polars::prelude::*;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalMapError {
    #[error("Bit plane {bit} for signal '{name}' out of range, must be between 0 and 7")]
    BitOutOfRange { name: String, bit: u8 },

    #[error("Signal '{0}' is already mapped")]
    DuplicateName(String),
}

/// Signal name to bit plane mapping, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalMap {
    signals: Vec<(String, u8)>,
}

impl SignalMap {
    pub const MAX_BIT: u8 = 7;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, bit: u8) -> Result<(), SignalMapError> {
        let name = name.into();
        if bit > Self::MAX_BIT {
            return Err(SignalMapError::BitOutOfRange { name, bit });
        }
        if self.bit(&name).is_some() {
            return Err(SignalMapError::DuplicateName(name));
        }
        self.signals.push((name, bit));
        Ok(())
    }

    pub fn with_signal(mut self, name: impl Into<String>, bit: u8) -> Result<Self, SignalMapError> {
        self.insert(name, bit)?;
        Ok(self)
    }

    pub fn bit(&self, name: &str) -> Option<u8> {
        self.signals
            .iter()
            .find(|(signal, _)| signal == name)
            .map(|(_, bit)| *bit)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u8)> {
        self.signals.iter().map(|(name, bit)| (name.as_str(), *bit))
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

/// One level change of a single signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalEdge {
    pub sample: u64,
    pub rising: bool,
}

const SAMPLE_COLUMN_NAME: &str = "sample";
const TIME_COLUMN_NAME: &str = "time";
const BITMAP_COLUMN_NAME: &str = "bitmap";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionLog {
    /// Sample index to pod byte, only where the byte changed.
    transitions: BTreeMap<u64, u8>,
    last_change: BTreeMap<String, u64>,
    edges: BTreeMap<String, Vec<SignalEdge>>,
    samples: u64,
}

impl TransitionLog {
    /// Walk `payload` once and record every change.
    ///
    /// The line state before the first sample is taken as all-low, so
    /// `(0, 0x00)` is always present and a non-zero first byte counts as a
    /// change at index 0. Bits that flip within the same byte share the
    /// sample index.
    pub fn extract(payload: &[u8], signals: &SignalMap) -> Self {
        profile_scope!("TransitionLog::extract");

        let mut extracted = Self {
            edges: signals
                .iter()
                .map(|(name, _)| (name.to_string(), Vec::new()))
                .collect(),
            ..Self::default()
        };
        extracted.transitions.insert(0, 0x00);

        let mut previous = 0x00u8;
        for (index, &byte) in payload.iter().enumerate() {
            let index = index as u64;
            if byte != previous {
                extracted.transitions.insert(index, byte);

                let changed = byte ^ previous;
                for (name, bit) in signals.iter() {
                    if changed >> bit & 1 == 1 {
                        extracted.last_change.insert(name.to_string(), index);
                        if let Some(history) = extracted.edges.get_mut(name) {
                            history.push(SignalEdge {
                                sample: index,
                                rising: byte >> bit & 1 == 1,
                            });
                        }
                    }
                }
            }
            previous = byte;
        }
        extracted.samples = payload.len() as u64;

        log::debug!(
            "Extracted {} transitions from {} samples",
            extracted.transitions.len(),
            extracted.samples
        );
        extracted
    }

    pub fn transitions(&self) -> &BTreeMap<u64, u8> {
        &self.transitions
    }

    /// Latest sample index at which `signal` changed level.
    pub fn last_change(&self, signal: &str) -> Option<u64> {
        self.last_change.get(signal).copied()
    }

    pub fn last_changes(&self) -> &BTreeMap<String, u64> {
        &self.last_change
    }

    /// Every level change of `signal`, oldest first.
    pub fn edges(&self, signal: &str) -> &[SignalEdge] {
        self.edges.get(signal).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn sample_count(&self) -> u64 {
        self.samples
    }

    /// One row per transition: sample index, raw byte, one boolean column
    /// per signal and, given a preamble, the calibrated time in seconds.
    pub fn to_dataframe(
        &self,
        signals: &SignalMap,
        preamble: Option<&Preamble>,
    ) -> Result<DataFrame, PolarsError> {
        profile_scope!("TransitionLog::to_dataframe");

        let samples: Vec<u64> = self.transitions.keys().copied().collect();
        let bitmaps: Vec<u32> = self.transitions.values().map(|b| u32::from(*b)).collect();

        let mut columns: Vec<Column> = vec![
            Series::new(SAMPLE_COLUMN_NAME.into(), samples).into(),
            Series::new(BITMAP_COLUMN_NAME.into(), bitmaps).into(),
        ];
        for (name, bit) in signals.iter() {
            let levels: Vec<bool> = self
                .transitions
                .values()
                .map(|byte| byte >> bit & 1 == 1)
                .collect();
            columns.push(Series::new(name.into(), levels).into());
        }

        let df = DataFrame::new(columns)?;
        let Some(preamble) = preamble else {
            return Ok(df);
        };

        df.lazy()
            .with_column(
                ((col(SAMPLE_COLUMN_NAME).cast(DataType::Float64)
                    - lit(preamble.x_reference as f64))
                    * lit(preamble.x_increment)
                    + lit(preamble.x_origin))
                .alias(TIME_COLUMN_NAME),
            )
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ab() -> SignalMap {
        SignalMap::new()
            .with_signal("A", 0)
            .unwrap()
            .with_signal("B", 1)
            .unwrap()
    }

    #[test]
    fn test_extract_records_changes() {
        let log = TransitionLog::extract(&[0x00, 0x00, 0x01, 0x01, 0x03], &ab());

        let indices: Vec<u64> = log.transitions().keys().copied().collect();
        assert_eq!(indices, vec![0, 2, 4]);
        assert_eq!(log.transitions()[&0], 0x00);
        assert_eq!(log.transitions()[&2], 0x01);
        assert_eq!(log.transitions()[&4], 0x03);
        assert_eq!(log.last_change("A"), Some(2));
        assert_eq!(log.last_change("B"), Some(4));
        assert_eq!(log.sample_count(), 5);
    }

    #[test]
    fn test_extract_is_idempotent() {
        let payload = [0x10, 0x11, 0x13, 0x02, 0x02, 0x00, 0xff];
        let first = TransitionLog::extract(&payload, &ab());
        let second = TransitionLog::extract(&payload, &ab());
        assert_eq!(first, second);
    }

    #[test]
    fn test_initial_entry_always_present() {
        let log = TransitionLog::extract(&[], &ab());
        assert_eq!(log.transitions().len(), 1);
        assert_eq!(log.transitions()[&0], 0x00);
        assert!(log.last_changes().is_empty());
    }

    #[test]
    fn test_nonzero_first_sample_overwrites_initial_entry() {
        let log = TransitionLog::extract(&[0x02, 0x02], &ab());
        assert_eq!(log.transitions().len(), 1);
        assert_eq!(log.transitions()[&0], 0x02);
        assert_eq!(log.last_change("A"), None);
        assert_eq!(log.last_change("B"), Some(0));
    }

    #[test]
    fn test_simultaneous_bits_share_index() {
        let log = TransitionLog::extract(&[0x00, 0x03], &ab());
        assert_eq!(log.last_change("A"), Some(1));
        assert_eq!(log.last_change("B"), Some(1));
    }

    #[test]
    fn test_unmapped_bits_only_touch_transitions() {
        let log = TransitionLog::extract(&[0x00, 0x80, 0x00], &ab());
        assert_eq!(log.transitions().len(), 3);
        assert!(log.last_changes().is_empty());
    }

    #[test]
    fn test_edge_history_keeps_every_change() {
        let log = TransitionLog::extract(&[0x01, 0x00, 0x01, 0x03, 0x02], &ab());
        assert_eq!(
            log.edges("A"),
            &[
                SignalEdge { sample: 0, rising: true },
                SignalEdge { sample: 1, rising: false },
                SignalEdge { sample: 2, rising: true },
                SignalEdge { sample: 4, rising: false },
            ]
        );
        assert_eq!(log.edges("B"), &[SignalEdge { sample: 3, rising: true }]);
        assert_eq!(log.last_change("A"), Some(4));
        assert!(log.edges("C").is_empty());
    }

    #[test]
    fn test_signal_map_validation() {
        assert_eq!(
            SignalMap::new().with_signal("X", 8),
            Err(SignalMapError::BitOutOfRange {
                name: "X".to_string(),
                bit: 8
            })
        );
        assert_eq!(
            ab().with_signal("A", 5),
            Err(SignalMapError::DuplicateName("A".to_string()))
        );
        let map = ab();
        assert_eq!(map.bit("B"), Some(1));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_to_dataframe() {
        let signals = ab();
        let log = TransitionLog::extract(&[0x00, 0x00, 0x01, 0x01, 0x03], &signals);
        let preamble = Preamble::parse("0,2,5,1,1e-6,-2e-6,0,1,0,0").unwrap();

        let df = log.to_dataframe(&signals, Some(&preamble)).unwrap();
        assert_eq!(df.height(), 3);

        let b: Vec<bool> = df.column("B").unwrap().bool().unwrap().into_no_null_iter().collect();
        assert_eq!(b, vec![false, false, true]);

        let time: Vec<f64> = df
            .column("time")
            .unwrap()
            .f64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert!((time[0] + 2e-6).abs() < 1e-12);
        assert!((time[2] - 2e-6).abs() < 1e-12);

        let plain = log.to_dataframe(&signals, None).unwrap();
        assert!(plain.column("time").is_err());
    }
}
