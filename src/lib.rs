//! # Rigol Scope RS
//!
//! A Rust library for capturing logic-analyzer waveforms from Rigol MSO
//! oscilloscopes over SCPI and turning them into signal edges.
//!
//! The library drives the instrument through a single blocking [`Transport`]
//! (a raw LAN socket, USBTMC bulk endpoints, a serial port, or anything else
//! that can move bytes), arms a single-shot capture, waits for the trigger,
//! downloads the raw sample memory and decodes which logic lines changed when.
//!
//! ## Features
//!
//! - **Pluggable transport**: a two-method [`Transport`] trait; LAN, USBTMC and
//!   serial implementations included, fakes are trivial to write for tests
//! - **Capture sequencing**: ordered trigger setup, bounded status polling,
//!   framed waveform download
//! - **Preamble decoding**: the `:WAV:PRE?` metadata with time and voltage
//!   calibration
//! - **Edge extraction**: per-sample transitions and per-signal edge history
//! - **DataFrame output**: Uses `polars` to tabulate transitions
//!
//! ## Examples
//!
//! ### Capturing edges over LAN
//!
//! ```rust,no_run
//! use rigol_scope::{RigolConnector, RigolScope, SignalMap, WaveformSource};
//!
//! let transport = RigolConnector::open("TCPIP::192.168.1.70::INSTR")?;
//! let mut scope = RigolScope::new(transport);
//!
//! let signals = SignalMap::new()
//!     .with_signal("RD", 0)?
//!     .with_signal("MREQ", 1)?;
//! let capture = scope.capture(WaveformSource::LOWER_POD, &signals)?;
//!
//! for (sample, pins) in capture.transitions.transitions() {
//!     println!("{:>8} {:08b}", sample, pins);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Decoding a payload
//!
//! ```rust
//! use rigol_scope::{SignalMap, TransitionLog};
//!
//! let signals = SignalMap::new().with_signal("A", 0)?.with_signal("B", 1)?;
//! let log = TransitionLog::extract(&[0x00, 0x00, 0x01, 0x01, 0x03], &signals);
//!
//! assert_eq!(log.last_change("A"), Some(2));
//! assert_eq!(log.last_change("B"), Some(4));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Parsing a preamble
//!
//! ```rust
//! use rigol_scope::{Preamble, WaveFormat};
//!
//! let preamble = Preamble::parse("0,2,125000,1,8.0e-09,-5.0e-04,0,4.1e-01,0,122")?;
//! assert_eq!(preamble.format, WaveFormat::Byte);
//! assert_eq!(preamble.points, 125_000);
//! # Ok::<(), rigol_scope::PreambleError>(())
//! ```

macro_rules! profile_scope {
    ($name:literal) => {
        #[cfg(feature = "cpu-profiling")]
        let _profile_span = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!($name), 0));
    };
}

pub mod connector;
pub mod edges;
pub mod frame;
pub mod preamble;
pub mod rigol_scope;
pub mod transport;
pub mod trigger_setup;
pub mod usbtmc;

// Re-export the main types for convenience
pub use connector::{ConnectorError, Resource, RigolConnector, RigolDevice};

pub use edges::{SignalEdge, SignalMap, SignalMapError, TransitionLog};

pub use frame::{FrameError, WaveformFrame};

pub use preamble::{AcquisitionType, Preamble, PreambleError, WaveFormat};

pub use rigol_scope::{
    Capture, CaptureConfig, CaptureState, RigolScope, ScopeError, WaveformSource,
};

pub use transport::{SerialTransport, SocketTransport, Transport, TransportError};

pub use trigger_setup::{
    AcquisitionMode, ChannelSetup, EdgeSlope, PodSetup, SetupError, TriggerSetup, TriggerSource,
};

pub use usbtmc::UsbtmcTransport;
