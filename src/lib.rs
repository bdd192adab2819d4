//! # SRPICO RS
//!
//! Host side driver for the SRPICO RP2040 logic analyzer firmware.
//!
//! The analyzer is programmed over a serial line with a handful of one-line
//! commands and then streams its samples in a compact run-length encoding.
//! This crate speaks that protocol, reassembles the stream and decodes it
//! sample by sample, and lets you scan the result for trigger conditions
//! without expanding long idle stretches.
//!
//! ## Features
//!
//! - **Identification**: channel counts, protocol version, board and pin names
//! - **Configuration**: channel selection by name, sample count and rate,
//!   validated before anything is sent
//! - **Streaming**: abort handshake and byte count check on the capture trailer
//! - **Decoding**: narrow, wide and analog sample layouts
//! - **Triggers**: level and edge conditions plus sample skipping, evaluated
//!   against whole runs at once
//! - **DataFrame output**: uses `polars` for the decoded capture
//!
//! ## Examples
//!
//! ### Free running capture
//!
//! ```rust,no_run
//! use srpico_rs::{CaptureRequest, ConnectOptions, PicoConnector};
//!
//! let mut analyzer = PicoConnector::connect("/dev/ttyACM0", &ConnectOptions::default())?;
//! analyzer.configure(CaptureRequest::new(10_000, 1_000_000).channels(["D2", "D3", "D4"]))?;
//!
//! let data = analyzer.acquire()?.into_dataframe()?;
//! println!("Captured {} samples", data.height());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Waiting for edges
//!
//! ```rust,no_run
//! use srpico_rs::{CaptureRequest, ConnectOptions, PicoConnector, TriggerCondition};
//!
//! let mut analyzer = PicoConnector::connect("/dev/ttyACM0", &ConnectOptions::default())?;
//! let clock_rises = TriggerCondition::when().rising(0).build();
//! analyzer.configure(
//!     CaptureRequest::new(50_000, 10_000_000)
//!         .channels(["D2", "D3"])
//!         .trigger(clock_rises.clone()),
//! )?;
//!
//! let mut acquisition = analyzer.acquire()?;
//! loop {
//!     match acquisition.wait_for(&[clock_rises.clone()]) {
//!         Ok(hit) => println!("{}: data = {}", hit.sample_index, hit.sample.bit(1)),
//!         Err(e) if e.is_end_of_stream() => break,
//!         Err(e) => return Err(e.into()),
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Trigger conditions
//!
//! ```rust
//! use srpico_rs::trigger_config::{PinCondition, TriggerCondition};
//!
//! let start = TriggerCondition::when()
//!     .falling(0)
//!     .pin(1, PinCondition::High)
//!     .build();
//! assert!(start.matches(Some(0b11), 0b10));
//!
//! let later = TriggerCondition::skip(1_000);
//! assert_eq!(later.skip_budget(), Some(1_000));
//! ```

pub mod capture_framer;
pub mod channel_config;
pub mod pico_analyzer;
pub mod pico_connector;
pub mod protocol;
pub mod sample_decoder;
pub mod serial_terminal;
pub mod trigger_config;
pub mod trigger_matcher;

// Re-export the main types for convenience
pub use capture_framer::{CaptureBuffer, CaptureError, FramingError, SampleBoundary};

pub use channel_config::{BitMapping, ChannelConfiguration, ConfigurationError};

pub use pico_analyzer::{Acquisition, CaptureRequest, PicoAnalyzer, PicoError, SampleSink};

pub use pico_connector::{ConnectOptions, PicoConnector};

pub use protocol::{DeviceDescriptor, ProtocolError, SUPPORTED_SAMPLE_RATES};

pub use sample_decoder::{DecodeError, DecodeMode, DecoderCursor, Sample, SampleDecoder};

pub use serial_terminal::{PicoTerminal, TerminalError, Transport};

pub use trigger_config::{PinCondition, PinTriggerBuilder, TriggerCondition};

pub use trigger_matcher::{SampleSource, SkipProgress, TriggerMatch, TriggerPoint};

/// Tracy span covering the rest of the enclosing block when built with
/// `cpu-profiling`.
macro_rules! profile_span {
    ($name:literal) => {
        #[cfg(feature = "cpu-profiling")]
        let _span = {
            tracy_client::Client::start();
            tracy_client::span!($name)
        };
    };
}

pub(crate) use profile_span;
