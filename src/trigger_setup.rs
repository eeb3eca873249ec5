//! Capture configuration sent before arming a single-shot acquisition.
//!
//! [`TriggerSetup::default`] is the setup used for logic captures: channel 1
//! as a 10x probed edge trigger at 3 V, pod 1 (D0-D7) on with a 3 V
//! threshold, 125k points of memory at 200 us/div in high resolution mode.
//! Commands come out in the order the firmware needs them: analog channels,
//! then the logic analyzer, then the trigger (which may reference the pods),
//! then acquisition and timebase, and finally `:SING`.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SetupError {
    #[error("Analog channel {0} out of range, must be between 1 and 4")]
    ChannelOutOfRange(u8),

    #[error("Logic pod {0} out of range, must be 1 or 2")]
    PodOutOfRange(u8),

    #[error("Digital line D{0} out of range, must be between 0 and 15")]
    DigitalLineOutOfRange(u8),

    #[error("Memory depth must be non-zero")]
    ZeroMemoryDepth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeSlope {
    Positive,
    Negative,
    Either,
}

impl EdgeSlope {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeSlope::Positive => "POS",
            EdgeSlope::Negative => "NEG",
            EdgeSlope::Either => "RFAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionMode {
    Normal,
    Average,
    Peak,
    HighResolution,
}

impl AcquisitionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcquisitionMode::Normal => "NORM",
            AcquisitionMode::Average => "AVER",
            AcquisitionMode::Peak => "PEAK",
            AcquisitionMode::HighResolution => "HRES",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Channel(u8),
    Digital(u8),
}

impl TriggerSource {
    fn as_scpi(&self) -> String {
        match self {
            TriggerSource::Channel(n) => format!("CHAN{n}"),
            TriggerSource::Digital(n) => format!("D{n}"),
        }
    }
}

/// Vertical settings of an enabled analog channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSetup {
    pub probe_ratio: u16,
    /// Volts per division.
    pub scale: f64,
    pub offset: f64,
}

impl Default for ChannelSetup {
    fn default() -> Self {
        Self {
            probe_ratio: 10,
            scale: 1.0,
            offset: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PodSetup {
    pub enabled: bool,
    /// Logic threshold in volts.
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerSetup {
    channels: [Option<ChannelSetup>; 4],
    pods: [PodSetup; 2],
    source: TriggerSource,
    slope: EdgeSlope,
    level: f64,
    memory_depth: u32,
    /// Seconds per division.
    timebase_scale: f64,
    acquisition: AcquisitionMode,
}

impl Default for TriggerSetup {
    fn default() -> Self {
        Self {
            channels: [Some(ChannelSetup::default()), None, None, None],
            pods: [
                PodSetup {
                    enabled: true,
                    threshold: 3.0,
                },
                PodSetup {
                    enabled: false,
                    threshold: 3.0,
                },
            ],
            source: TriggerSource::Channel(1),
            slope: EdgeSlope::Positive,
            level: 3.0,
            memory_depth: 125_000,
            timebase_scale: 0.0002,
            acquisition: AcquisitionMode::HighResolution,
        }
    }
}

impl TriggerSetup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable (`Some`) or disable (`None`) analog channel `channel` (1-4).
    pub fn channel(mut self, channel: u8, setup: Option<ChannelSetup>) -> Result<Self, SetupError> {
        let slot = usize::from(channel)
            .checked_sub(1)
            .and_then(|i| self.channels.get_mut(i))
            .ok_or(SetupError::ChannelOutOfRange(channel))?;
        *slot = setup;
        Ok(self)
    }

    pub fn pod(mut self, pod: u8, enabled: bool, threshold: f64) -> Result<Self, SetupError> {
        let slot = usize::from(pod)
            .checked_sub(1)
            .and_then(|i| self.pods.get_mut(i))
            .ok_or(SetupError::PodOutOfRange(pod))?;
        *slot = PodSetup { enabled, threshold };
        Ok(self)
    }

    pub fn edge(mut self, source: TriggerSource, slope: EdgeSlope, level: f64) -> Result<Self, SetupError> {
        match source {
            TriggerSource::Channel(n) if !(1..=4).contains(&n) => {
                return Err(SetupError::ChannelOutOfRange(n))
            }
            TriggerSource::Digital(n) if n > 15 => return Err(SetupError::DigitalLineOutOfRange(n)),
            _ => {}
        }
        self.source = source;
        self.slope = slope;
        self.level = level;
        Ok(self)
    }

    pub fn memory_depth(mut self, points: u32) -> Result<Self, SetupError> {
        if points == 0 {
            return Err(SetupError::ZeroMemoryDepth);
        }
        self.memory_depth = points;
        Ok(self)
    }

    pub fn timebase_scale(mut self, seconds_per_division: f64) -> Self {
        self.timebase_scale = seconds_per_division;
        self
    }

    pub fn acquisition(mut self, mode: AcquisitionMode) -> Self {
        self.acquisition = mode;
        self
    }

    pub fn memory_depth_points(&self) -> u32 {
        self.memory_depth
    }

    /// The full command sequence, ending with the single-shot arm.
    pub fn commands(&self) -> Vec<String> {
        let mut commands = Vec::with_capacity(24);

        for (i, channel) in self.channels.iter().enumerate() {
            let n = i + 1;
            match channel {
                Some(setup) => {
                    commands.push(format!(":CHAN{n}:DISP ON"));
                    commands.push(format!(":CHAN{n}:PROB {}", setup.probe_ratio));
                    commands.push(format!(":CHAN{n}:UNIT VOLT"));
                    commands.push(format!(":CHAN{n}:SCAL {}", setup.scale));
                    commands.push(format!(":CHAN{n}:OFFS {}", setup.offset));
                }
                None => commands.push(format!(":CHAN{n}:DISP OFF")),
            }
        }

        commands.push(":LA:STAT ON".to_string());
        for (i, pod) in self.pods.iter().enumerate() {
            let n = i + 1;
            let state = if pod.enabled { "ON" } else { "OFF" };
            commands.push(format!(":LA:POD{n}:DISP {state}"));
            commands.push(format!(":LA:POD{n}:THR {}", pod.threshold));
        }

        commands.push(":TRIG:MODE EDGE".to_string());
        commands.push(format!(":TRIG:EDG:SOUR {}", self.source.as_scpi()));
        commands.push(format!(":TRIG:EDG:SLOP {}", self.slope.as_str()));
        commands.push(format!(":TRIG:EDG:LEV {}", self.level));
        commands.push(format!(":ACQ:MDEP {}", self.memory_depth));
        commands.push(format!(":TIM:MAIN:SCAL {}", self.timebase_scale));
        commands.push(format!(":ACQ:TYPE {}", self.acquisition.as_str()));
        commands.push(":SING".to_string());

        commands
    }
}
