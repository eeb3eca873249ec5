use crate::edges::{SignalMap, TransitionLog};
use crate::frame::{FrameError, WaveformFrame};
use crate::preamble::{Preamble, PreambleError};
use crate::transport::{Transport, TransportError};
use crate::trigger_setup::{SetupError, TriggerSetup};
use std::fmt;
use std::time::Duration;

/// Memory a `:WAV:DATA?` query may be read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveformSource {
    /// Analog channel 1-4.
    Channel(u8),
    /// Logic pod addressed by its first line: `D0` yields D0-D7, `D8` D8-D15.
    Digital(u8),
    Math,
}

impl WaveformSource {
    pub const LOWER_POD: Self = Self::Digital(0);
    pub const UPPER_POD: Self = Self::Digital(8);

    /// Check the channel or line number against what the instrument has.
    pub fn validate(self) -> Result<Self, SetupError> {
        match self {
            Self::Channel(n) if !(1..=4).contains(&n) => Err(SetupError::ChannelOutOfRange(n)),
            Self::Digital(n) if n > 15 => Err(SetupError::DigitalLineOutOfRange(n)),
            _ => Ok(self),
        }
    }
}

impl fmt::Display for WaveformSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaveformSource::Channel(n) => write!(f, "CHAN{n}"),
            WaveformSource::Digital(n) => write!(f, "D{n}"),
            WaveformSource::Math => f.write_str("MATH"),
        }
    }
}

/// Protocol limits and timing of one capture session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub max_attempts: u32,
    pub poll_interval: Duration,
    pub status_read_len: usize,
    pub preamble_read_len: usize,
    /// Samples requested per `:WAV:DATA?` (`:WAV:STOP`). 125000 is the most a
    /// single BYTE query may return.
    pub sample_window: u32,
    pub waveform_read_len: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            poll_interval: Duration::from_secs(1),
            status_read_len: 100,
            preamble_read_len: 100,
            sample_window: 125_000,
            waveform_read_len: 125_000,
        }
    }
}

impl CaptureConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets both the requested window and the number of bytes read back.
    pub fn with_sample_window(mut self, samples: u32) -> Self {
        self.sample_window = samples;
        self.waveform_read_len = samples as usize;
        self
    }

    pub fn with_waveform_read_len(mut self, bytes: usize) -> Self {
        self.waveform_read_len = bytes;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Armed,
    Polling,
    Stopped,
    TimedOut,
}

#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    #[error("Failed to send '{command}': {source}")]
    Write {
        command: String,
        #[source]
        source: TransportError,
    },

    #[error("Failed to read response to '{command}': {source}")]
    Read {
        command: String,
        #[source]
        source: TransportError,
    },

    #[error("Capture did not stop after {attempts} status polls")]
    CaptureTimeout { attempts: u32 },

    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    MalformedPreamble(#[from] PreambleError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Everything one triggered capture produced.
#[derive(Debug, Clone)]
pub struct Capture {
    pub preamble: Preamble,
    pub frame: WaveformFrame,
    pub transitions: TransitionLog,
}

pub struct RigolScope<T: Transport> {
    transport: T,
    config: CaptureConfig,
    state: CaptureState,
}

impl<T: Transport> RigolScope<T> {
    const STATUS_QUERY: &'static str = "TRIG:STAT?";
    const STOPPED: &'static str = "STOP";

    pub fn new(transport: T) -> Self {
        Self::with_config(transport, CaptureConfig::default())
    }

    pub fn with_config(transport: T, config: CaptureConfig) -> Self {
        Self {
            transport,
            config,
            state: CaptureState::Idle,
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Give the transport back; dropping it closes the connection.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Write `commands` in order. Stops at the first command the transport
    /// did not fully accept; nothing after it is sent.
    pub fn send_commands<S: AsRef<str>>(&mut self, commands: &[S]) -> Result<(), ScopeError> {
        for command in commands {
            self.send(command.as_ref())?;
        }
        Ok(())
    }

    fn send(&mut self, command: &str) -> Result<(), ScopeError> {
        log::debug!("-> {}", command);
        let expected = command.len();
        match self.transport.write(command.as_bytes()) {
            Ok(written) if written == expected => Ok(()),
            Ok(written) => Err(ScopeError::Write {
                command: command.to_string(),
                source: TransportError::PartialWrite { written, expected },
            }),
            Err(source) => Err(ScopeError::Write {
                command: command.to_string(),
                source,
            }),
        }
    }

    fn read(&mut self, command: &str, max_bytes: usize) -> Result<Vec<u8>, ScopeError> {
        self.transport
            .read(max_bytes)
            .map_err(|source| ScopeError::Read {
                command: command.to_string(),
                source,
            })
    }

    /// Send a query and return the first line of the answer.
    fn query_line(&mut self, command: &str, max_bytes: usize) -> Result<String, ScopeError> {
        self.send(command)?;
        let response = self.read(command, max_bytes)?;
        let text = String::from_utf8_lossy(&response);
        let line = text.split('\n').next().unwrap_or_default().trim_end_matches('\r');
        log::debug!("<- {}", line);
        Ok(line.to_string())
    }

    /// `*IDN?`: manufacturer, model, serial and firmware version.
    pub fn identify(&mut self) -> Result<String, ScopeError> {
        let identity = self.query_line("*IDN?", self.config.status_read_len)?;
        log::info!("Connected to {}", identity);
        Ok(identity)
    }

    /// Configure with [`TriggerSetup::default`] and arm a single shot.
    pub fn trigger(&mut self) -> Result<(), ScopeError> {
        self.trigger_with(&TriggerSetup::default())
    }

    pub fn trigger_with(&mut self, setup: &TriggerSetup) -> Result<(), ScopeError> {
        log::info!("Configuring capture and arming single shot");
        self.send_commands(&setup.commands())?;
        self.state = CaptureState::Armed;
        Ok(())
    }

    /// Poll the trigger status until the instrument reports `STOP`.
    ///
    /// Sleeps `poll_interval` before every poll and gives up with
    /// [`ScopeError::CaptureTimeout`] after `max_attempts` polls.
    pub fn wait_for_capture(&mut self) -> Result<(), ScopeError> {
        let _span =
            tracing::debug_span!("wait_for_capture", max_attempts = self.config.max_attempts)
                .entered();

        if self.state != CaptureState::Armed {
            log::warn!("Waiting for a capture in state {:?}", self.state);
        }
        self.state = CaptureState::Polling;

        for attempt in 1..=self.config.max_attempts {
            std::thread::sleep(self.config.poll_interval);

            let status = match self.query_line(Self::STATUS_QUERY, self.config.status_read_len) {
                Ok(status) => status,
                Err(e) => {
                    self.state = CaptureState::Idle;
                    return Err(e);
                }
            };
            log::debug!("Trigger status after poll {}: {}", attempt, status);

            if status.trim() == Self::STOPPED {
                log::info!("Capture complete after {} polls", attempt);
                self.state = CaptureState::Stopped;
                return Ok(());
            }
        }

        log::warn!(
            "Capture did not complete within {} polls",
            self.config.max_attempts
        );
        self.state = CaptureState::TimedOut;
        Err(ScopeError::CaptureTimeout {
            attempts: self.config.max_attempts,
        })
    }

    /// Read the raw sample window of `source` from capture memory.
    ///
    /// The frame holds the first `waveform_read_len` bytes of the answer; the
    /// transport consumes the rest of the block.
    pub fn fetch_waveform(&mut self, source: WaveformSource) -> Result<WaveformFrame, ScopeError> {
        let source = source.validate()?;
        let _span = tracing::debug_span!("fetch_waveform", %source).entered();

        let setup = [
            format!(":WAV:SOUR {source}"),
            ":WAV:MODE RAW".to_string(),
            ":WAV:FORM BYTE".to_string(),
            ":WAV:STAR 1".to_string(),
            format!(":WAV:STOP {}", self.config.sample_window),
            ":WAV:DATA?".to_string(),
        ];
        self.send_commands(&setup)?;

        let response = self.read(":WAV:DATA?", self.config.waveform_read_len)?;
        log::debug!("Received {} byte waveform response", response.len());

        Ok(WaveformFrame::split(response)?)
    }

    pub fn fetch_preamble(&mut self) -> Result<Preamble, ScopeError> {
        let line = self.query_line(":WAV:PRE?", self.config.preamble_read_len)?;
        Ok(Preamble::parse(&line)?)
    }

    /// Trigger, wait, download `source` and decode its edges.
    pub fn capture(
        &mut self,
        source: WaveformSource,
        signals: &SignalMap,
    ) -> Result<Capture, ScopeError> {
        let _span = tracing::info_span!("capture", %source).entered();

        self.trigger()?;
        self.wait_for_capture()?;
        let frame = self.fetch_waveform(source)?;
        let preamble = self.fetch_preamble()?;
        frame.check_points(&preamble)?;

        let transitions = TransitionLog::extract(frame.payload(), signals);
        Ok(Capture {
            preamble,
            frame,
            transitions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::FakeTransport;
    use crate::transport::SocketTransport;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::time::Instant;

    const MSO_PREAMBLE: &str = "0,2,125000,1,8.000000e-09,-5.000000e-04,0,4.132813e-01,0,122\n";

    fn fast() -> CaptureConfig {
        CaptureConfig::default().with_poll_interval(Duration::ZERO)
    }

    fn waveform_response(payload: &[u8]) -> Vec<u8> {
        let mut data = format!("#9{:09}", payload.len()).into_bytes();
        data.extend_from_slice(payload);
        data.push(b'\n');
        data
    }

    #[test]
    fn test_waveform_source_names() {
        assert_eq!(WaveformSource::Channel(2).to_string(), "CHAN2");
        assert_eq!(WaveformSource::LOWER_POD.to_string(), "D0");
        assert_eq!(WaveformSource::UPPER_POD.to_string(), "D8");
        assert_eq!(WaveformSource::Math.to_string(), "MATH");
    }

    #[test]
    fn test_waveform_source_range() {
        assert_eq!(WaveformSource::Channel(4).validate(), Ok(WaveformSource::Channel(4)));
        assert_eq!(WaveformSource::Digital(15).validate(), Ok(WaveformSource::Digital(15)));
        assert_eq!(WaveformSource::Math.validate(), Ok(WaveformSource::Math));
        assert_eq!(
            WaveformSource::Channel(0).validate(),
            Err(SetupError::ChannelOutOfRange(0))
        );
        assert_eq!(
            WaveformSource::Digital(16).validate(),
            Err(SetupError::DigitalLineOutOfRange(16))
        );
    }

    #[test]
    fn test_send_commands_in_order() {
        let mut scope = RigolScope::new(FakeTransport::new());
        scope.send_commands(&["A", "B", "C"]).unwrap();
        assert_eq!(scope.transport().written, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_send_commands_stops_at_short_write() {
        let mut scope = RigolScope::new(FakeTransport::new().short_write_at(1));
        let err = scope.send_commands(&[":ONE", ":TWO", ":THREE"]).unwrap_err();

        assert!(matches!(
            &err,
            ScopeError::Write {
                command,
                source: TransportError::PartialWrite {
                    written: 3,
                    expected: 4
                },
            } if command == ":TWO"
        ));
        assert_eq!(scope.transport().written, vec![":ONE"]);
    }

    #[test]
    fn test_trigger_sends_setup_and_arms() {
        let mut scope = RigolScope::new(FakeTransport::new());
        scope.trigger().unwrap();

        assert_eq!(scope.transport().written, TriggerSetup::default().commands());
        assert_eq!(scope.transport().written.len(), 21);
        assert_eq!(scope.state(), CaptureState::Armed);
    }

    #[test]
    fn test_wait_returns_on_first_stop() {
        let transport = FakeTransport::new()
            .respond("RUN\n")
            .respond("WAIT\n")
            .respond("STOP\n")
            .respond("STOP\n");
        let mut scope = RigolScope::with_config(transport, fast());
        scope.trigger().unwrap();
        scope.wait_for_capture().unwrap();

        let transport = scope.transport();
        let polls = transport.written.iter().filter(|c| *c == "TRIG:STAT?").count();
        assert_eq!(polls, 3);
        assert_eq!(transport.read_requests, vec![100; 3]);
        assert_eq!(transport.reads.len(), 1);
        assert_eq!(scope.state(), CaptureState::Stopped);
    }

    #[test]
    fn test_wait_only_compares_first_line() {
        let transport = FakeTransport::new().respond("STOP\nTD\n");
        let mut scope = RigolScope::with_config(transport, fast());
        assert!(scope.wait_for_capture().is_ok());

        let transport = FakeTransport::new().respond("TD\nSTOP\n").respond("STOPPED\n");
        let mut scope = RigolScope::with_config(transport, fast().with_max_attempts(2));
        assert!(matches!(
            scope.wait_for_capture(),
            Err(ScopeError::CaptureTimeout { attempts: 2 })
        ));
    }

    #[test]
    fn test_wait_times_out_after_exactly_max_attempts() {
        let mut transport = FakeTransport::new();
        for _ in 0..61 {
            transport = transport.respond("WAIT\n");
        }
        let mut scope = RigolScope::with_config(transport, fast());

        let err = scope.wait_for_capture().unwrap_err();
        assert!(matches!(err, ScopeError::CaptureTimeout { attempts: 60 }));
        assert_eq!(scope.transport().written.len(), 60);
        assert_eq!(scope.transport().read_requests.len(), 60);
        assert_eq!(scope.transport().reads.len(), 1);
        assert_eq!(scope.state(), CaptureState::TimedOut);
    }

    #[test]
    fn test_wait_surfaces_read_failure() {
        let mut scope = RigolScope::with_config(FakeTransport::new(), fast());
        let err = scope.wait_for_capture().unwrap_err();
        assert!(matches!(
            err,
            ScopeError::Read {
                source: TransportError::Closed,
                ..
            }
        ));
        assert_eq!(scope.transport().written.len(), 1);
        assert_eq!(scope.state(), CaptureState::Idle);
    }

    #[test]
    fn test_fetch_waveform() {
        let payload = vec![0x5A; 124_988];
        let transport = FakeTransport::new().respond(waveform_response(&payload));
        let mut scope = RigolScope::new(transport);

        let frame = scope.fetch_waveform(WaveformSource::LOWER_POD).unwrap();
        assert_eq!(frame.header(), b"#9000124988");
        assert_eq!(frame.payload().len(), 124_988);
        assert_eq!(frame.terminator(), b'\n');
        assert_eq!(
            scope.transport().written,
            vec![
                ":WAV:SOUR D0",
                ":WAV:MODE RAW",
                ":WAV:FORM BYTE",
                ":WAV:STAR 1",
                ":WAV:STOP 125000",
                ":WAV:DATA?",
            ]
        );
        assert_eq!(scope.transport().read_requests, vec![125_000]);
    }

    #[test]
    fn test_fetch_waveform_short_read() {
        let transport = FakeTransport::new().respond(b"#900000".to_vec());
        let mut scope = RigolScope::new(transport);
        let err = scope.fetch_waveform(WaveformSource::LOWER_POD).unwrap_err();
        assert!(matches!(
            err,
            ScopeError::Frame(FrameError::ShortRead { actual: 7, .. })
        ));
    }

    #[test]
    fn test_fetch_waveform_rejects_unknown_source() {
        let mut scope = RigolScope::new(FakeTransport::new());
        assert!(matches!(
            scope.fetch_waveform(WaveformSource::Channel(9)),
            Err(ScopeError::Setup(SetupError::ChannelOutOfRange(9)))
        ));
        assert!(matches!(
            scope.fetch_waveform(WaveformSource::Digital(16)),
            Err(ScopeError::Setup(SetupError::DigitalLineOutOfRange(16)))
        ));
        assert!(scope.transport().written.is_empty());
    }

    #[test]
    fn test_preamble_after_full_waveform_block() {
        let transport = FakeTransport::new()
            .respond(waveform_response(&[0x01; 125_000]))
            .respond(MSO_PREAMBLE);
        let mut scope = RigolScope::new(transport);

        let frame = scope.fetch_waveform(WaveformSource::LOWER_POD).unwrap();
        assert_eq!(frame.payload().len(), 124_988);
        assert_eq!(scope.fetch_preamble().unwrap().points, 125_000);
    }

    /// Answers capture queries the way an MSO does on its LAN port.
    fn serve_instrument(listener: TcpListener) {
        let (stream, _) = listener.accept().unwrap();
        let mut writer = stream.try_clone().unwrap();
        for line in BufReader::new(stream).lines() {
            let Ok(line) = line else { break };
            match line.as_str() {
                "TRIG:STAT?" => writer.write_all(b"STOP\n").unwrap(),
                ":WAV:DATA?" => {
                    let payload: Vec<u8> = (0..125_000u32).map(|i| i as u8).collect();
                    writer.write_all(&waveform_response(&payload)).unwrap();
                }
                ":WAV:PRE?" => writer.write_all(MSO_PREAMBLE.as_bytes()).unwrap(),
                _ => {}
            }
        }
    }

    #[test]
    fn test_socket_session_stays_in_step() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || serve_instrument(listener));

        let transport = SocketTransport::connect("127.0.0.1", port).unwrap();
        let mut scope = RigolScope::with_config(transport, fast().with_max_attempts(1));

        let started = Instant::now();
        scope.wait_for_capture().unwrap();
        assert!(started.elapsed() < SocketTransport::DEFAULT_TIMEOUT);

        let frame = scope.fetch_waveform(WaveformSource::LOWER_POD).unwrap();
        assert_eq!(frame.header(), b"#9000125000");
        assert_eq!(frame.payload().len(), 124_988);
        assert_eq!(frame.payload()[..3], [0u8, 1, 2]);

        let preamble = scope.fetch_preamble().unwrap();
        assert_eq!(preamble.points, 125_000);

        drop(scope);
        server.join().unwrap();
    }

    #[test]
    fn test_fetch_preamble() {
        let transport = FakeTransport::new()
            .respond("0,2,125000,1,8.000000e-09,-5.000000e-04,0,4.132813e-01,0,122\n");
        let mut scope = RigolScope::new(transport);
        let preamble = scope.fetch_preamble().unwrap();
        assert_eq!(preamble.points, 125_000);
        assert_eq!(scope.transport().written, vec![":WAV:PRE?"]);
        assert_eq!(scope.transport().read_requests, vec![100]);
    }

    #[test]
    fn test_fetch_preamble_malformed() {
        let transport = FakeTransport::new().respond("1,2,1000\n");
        let mut scope = RigolScope::new(transport);
        assert!(matches!(
            scope.fetch_preamble(),
            Err(ScopeError::MalformedPreamble(_))
        ));
    }

    #[test]
    fn test_identify() {
        let transport = FakeTransport::new().respond("RIGOL TECHNOLOGIES,MSO1104Z,DS1ZC0000,00.04.04\n");
        let mut scope = RigolScope::new(transport);
        assert_eq!(
            scope.identify().unwrap(),
            "RIGOL TECHNOLOGIES,MSO1104Z,DS1ZC0000,00.04.04"
        );
    }

    #[test]
    fn test_capture_session() {
        let payload = [0x00, 0x00, 0x01, 0x01, 0x03];
        let transport = FakeTransport::new()
            .respond("WAIT\n")
            .respond("STOP\n")
            .respond(waveform_response(&payload))
            .respond("0,2,5,1,1e-06,0,0,1,0,0\n");
        let config = fast().with_sample_window(17);
        let mut scope = RigolScope::with_config(transport, config);
        let signals = SignalMap::new()
            .with_signal("A", 0)
            .unwrap()
            .with_signal("B", 1)
            .unwrap();

        let capture = scope.capture(WaveformSource::LOWER_POD, &signals).unwrap();
        assert_eq!(capture.frame.payload(), &payload);
        assert_eq!(capture.preamble.points, 5);
        let indices: Vec<u64> = capture.transitions.transitions().keys().copied().collect();
        assert_eq!(indices, vec![0, 2, 4]);
        assert_eq!(capture.transitions.last_change("A"), Some(2));
        assert_eq!(capture.transitions.last_change("B"), Some(4));
        assert!(scope
            .transport()
            .written
            .contains(&":WAV:STOP 17".to_string()));
    }

    #[test]
    fn test_capture_rejects_oversized_payload() {
        let transport = FakeTransport::new()
            .respond("STOP\n")
            .respond(waveform_response(&[0x01; 8]))
            .respond("0,2,4,1,1e-06,0,0,1,0,0\n");
        let mut scope = RigolScope::with_config(transport, fast().with_sample_window(20));
        let err = scope
            .capture(WaveformSource::LOWER_POD, &SignalMap::new())
            .unwrap_err();
        assert!(matches!(
            err,
            ScopeError::Frame(FrameError::PointCountMismatch {
                payload: 8,
                points: 4
            })
        ));
    }

    #[test]
    fn test_boxed_transport() {
        let transport: Box<dyn Transport> = Box::new(FakeTransport::new().respond("STOP\n"));
        let mut scope = RigolScope::with_config(transport, fast());
        assert!(scope.wait_for_capture().is_ok());
    }
}
