//! Framing of the raw capture stream.
//!
//! After `F` or `C` the device streams encoded samples as they are taken. It
//! may interrupt itself with a chunk ending in `!`, which the host answers
//! with `+`. The stream ends with a `$<byte count>+` trailer.

use crate::serial_terminal::{PicoTerminal, TerminalError, Transport};
use crate::trigger_matcher::TriggerScanner;
use std::time::{Duration, Instant};

const TRAILER_START: u8 = b'$';
const TRAILER_END: u8 = b'+';
const ABORT_MARKER: u8 = b'!';
const CONTINUE: &[u8] = b"+";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("Missed bytes: trailer declares {declared} bytes but {received} were received")]
    ByteCountMismatch { declared: usize, received: usize },

    #[error("Malformed trailer {0:?}")]
    MalformedTrailer(String),

    #[error("Expected continuation byte, got 0x{0:02x}")]
    ExpectedContinuation(u8),

    #[error("Expected the first byte of a sample, got 0x{0:02x}")]
    ExpectedSampleStart(u8),

    #[error("Unrecognized RLE byte 0x{0:02x}")]
    UnrecognizedRle(u8),

    #[error("Capture ends in the middle of a sample")]
    TruncatedSample,
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Serial terminal error: {0}")]
    Terminal(#[from] TerminalError),

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("No data from device for {0:?}")]
    IdleTimeout(Duration),
}

/// First chunk of the buffer that can be decoded on its own, and the absolute
/// index of the sample it starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleBoundary {
    pub chunk: usize,
    pub sample_index: u64,
}

/// Capture bytes exactly as they were read, one entry per transport read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureBuffer {
    chunks: Vec<Vec<u8>>,
    first_sample: u64,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_chunks(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks,
            first_sample: 0,
        }
    }

    fn push_chunk(&mut self, chunk: Vec<u8>) {
        self.chunks.push(chunk);
    }

    pub fn chunks(&self) -> &[Vec<u8>] {
        &self.chunks
    }

    pub fn chunk(&self, index: usize) -> Option<&[u8]> {
        self.chunks.get(index).map(Vec::as_slice)
    }

    /// Total number of bytes across all chunks.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(Vec::is_empty)
    }

    /// Absolute index of the first sample held in the buffer.
    pub fn first_sample(&self) -> u64 {
        self.first_sample
    }

    /// Drop every chunk before `boundary`. Returns the number of bytes freed.
    pub fn discard_pretrigger(&mut self, boundary: SampleBoundary) -> usize {
        let cut = boundary.chunk.min(self.chunks.len());
        let freed: usize = self.chunks.drain(..cut).map(|c| c.len()).sum();
        self.first_sample = boundary.sample_index;
        log::debug!(
            "Discarded {} pretrigger chunks ({} bytes), capture now starts at sample {}",
            cut,
            freed,
            self.first_sample
        );
        freed
    }
}

/// Start streaming, conditional on the device trigger when `triggered`.
pub fn start_capture<T: Transport>(
    terminal: &mut PicoTerminal<T>,
    triggered: bool,
) -> Result<(), TerminalError> {
    terminal.command(if triggered { "C" } else { "F" })
}

/// Spin until the device has something for us and read all of it.
fn poll_chunk<T: Transport>(
    terminal: &mut PicoTerminal<T>,
    idle_timeout: Option<Duration>,
) -> Result<Vec<u8>, CaptureError> {
    let started = Instant::now();
    loop {
        let available = terminal.bytes_available()?;
        if available > 0 {
            return Ok(terminal.read_exact(available)?);
        }
        if let Some(limit) = idle_timeout {
            if started.elapsed() >= limit {
                return Err(CaptureError::IdleTimeout(limit));
            }
        }
        std::hint::spin_loop();
    }
}

fn parse_trailer(trailer: &[u8]) -> Result<usize, FramingError> {
    let malformed =
        || FramingError::MalformedTrailer(String::from_utf8_lossy(trailer).into_owned());
    let body = trailer.strip_prefix(&[TRAILER_START]).ok_or_else(malformed)?;
    let end = body
        .iter()
        .position(|&b| b == TRAILER_END)
        .ok_or_else(malformed)?;
    if end + 1 < body.len() {
        log::debug!("Ignoring {} bytes after trailer", body.len() - end - 1);
    }
    std::str::from_utf8(&body[..end])
        .ok()
        .and_then(|count| count.trim().parse().ok())
        .ok_or_else(malformed)
}

/// Read the capture stream into chunks until the trailer and check it.
///
/// When a scanner is given every chunk is fed to it as it arrives so the
/// trigger point is known once streaming ends.
pub fn stream_until_trailer<T: Transport>(
    terminal: &mut PicoTerminal<T>,
    mut scanner: Option<&mut TriggerScanner>,
    idle_timeout: Option<Duration>,
) -> Result<CaptureBuffer, CaptureError> {
    crate::profile_span!("stream_until_trailer");

    let mut buffer = CaptureBuffer::new();
    let mut trailer = loop {
        let mut chunk = poll_chunk(terminal, idle_timeout)?;
        if chunk.first() == Some(&TRAILER_START) {
            break chunk;
        }

        let aborted = chunk.last() == Some(&ABORT_MARKER);
        if aborted {
            chunk.pop();
        }
        if !chunk.is_empty() {
            if let Some(scanner) = scanner.as_deref_mut() {
                scanner.feed(buffer.chunks.len(), &chunk)?;
            }
            buffer.push_chunk(chunk);
        }
        if aborted {
            log::debug!("Device signalled abort, sending continue");
            terminal.write_raw(CONTINUE)?;
        }
    };

    while !trailer[1..].contains(&TRAILER_END) {
        let more = poll_chunk(terminal, idle_timeout)?;
        trailer.extend_from_slice(&more);
    }

    let declared = parse_trailer(&trailer)?;
    let received = buffer.len();
    log::debug!(
        "Capture complete: {} bytes in {} chunks",
        received,
        buffer.chunks.len()
    );
    if declared != received {
        return Err(FramingError::ByteCountMismatch { declared, received }.into());
    }
    Ok(buffer)
}
