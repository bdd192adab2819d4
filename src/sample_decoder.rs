//! Decoding of the run-length-encoded capture stream.
//!
//! The encoding depends on the enabled channels and is fixed for a whole
//! acquisition:
//!
//! - analog channels enabled: every sample is sent in full, digital bits in
//!   7-bit groups (high bit set) followed by one byte per analog channel;
//! - up to 4 digital channels: one byte per sample carrying the value and up
//!   to 7 repeats of the previous sample, plus RLE bytes worth multiples of 8;
//! - more digital channels: samples in 7-bit groups, RLE bytes worth 1 to 32
//!   repeats or 64 to 1568 in steps of 32.
//!
//! Repeat counts always add occurrences of the sample decoded before them.

use crate::capture_framer::{CaptureBuffer, FramingError};
use crate::channel_config::{BitMapping, ChannelConfiguration};

/// Voltage of a full scale analog reading.
pub const ANALOG_FULL_SCALE_VOLTS: f64 = 3.3;
const ANALOG_FULL_SCALE_RAW: f64 = 127.0;
const NARROW_MAX_CHANNELS: usize = 4;
const BITS_PER_BYTE: usize = 7;
const SAMPLE_FLAG: u8 = 0x80;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("End of capture stream")]
    EndOfStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Analog {
        digital_bytes: usize,
        analog_channels: usize,
    },
    Narrow,
    Wide {
        bytes_per_sample: usize,
    },
}

impl DecodeMode {
    pub fn for_channels(digital_channels: usize, analog_channels: usize) -> Self {
        let digital_bytes = digital_channels.div_ceil(BITS_PER_BYTE);
        if analog_channels > 0 {
            DecodeMode::Analog {
                digital_bytes,
                analog_channels,
            }
        } else if digital_channels <= NARROW_MAX_CHANNELS {
            DecodeMode::Narrow
        } else {
            DecodeMode::Wide {
                bytes_per_sample: digital_bytes,
            }
        }
    }

    pub fn for_config(config: &ChannelConfiguration) -> Self {
        Self::for_channels(config.digital_count(), config.analog_count())
    }
}

/// One decoded sample: digital bits in output order plus analog readings in
/// volts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sample {
    pub bits: u32,
    pub analog: Vec<f64>,
}

impl Sample {
    pub fn digital(bits: u32) -> Self {
        Self {
            bits,
            analog: Vec::new(),
        }
    }

    pub fn bit(&self, bit: u8) -> bool {
        self.bits.checked_shr(u32::from(bit)).unwrap_or(0) & 1 == 1
    }
}

/// What a completed group of wire bytes means.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    /// `repeats` more copies of the previous sample, then `sample`.
    Sample { repeats: u64, sample: Sample },
    /// More copies of the previous sample.
    Run(u64),
}

/// Byte-at-a-time state machine turning wire bytes into [`RawEvent`]s.
#[derive(Debug, Clone)]
pub struct SampleAssembler {
    mode: DecodeMode,
    mapping: BitMapping,
    collected: usize,
    bits: u64,
    analog: Vec<f64>,
}

impl SampleAssembler {
    pub fn new(mode: DecodeMode, mapping: BitMapping) -> Self {
        Self {
            mode,
            mapping,
            collected: 0,
            bits: 0,
            analog: Vec::new(),
        }
    }

    pub fn for_config(config: &ChannelConfiguration) -> Self {
        Self::new(DecodeMode::for_config(config), config.bit_mapping.clone())
    }

    pub fn mode(&self) -> DecodeMode {
        self.mode
    }

    /// No sample is half assembled.
    pub fn is_idle(&self) -> bool {
        self.collected == 0
    }

    fn reset(&mut self) {
        self.collected = 0;
        self.bits = 0;
        self.analog.clear();
    }

    fn accumulate(&mut self, byte: u8) {
        self.bits |= u64::from(byte & !SAMPLE_FLAG) << (BITS_PER_BYTE * self.collected);
        self.collected += 1;
    }

    fn finish(&mut self, repeats: u64) -> RawEvent {
        let sample = Sample {
            bits: self.mapping.apply(self.bits as u32),
            analog: std::mem::take(&mut self.analog),
        };
        self.reset();
        RawEvent::Sample { repeats, sample }
    }

    pub fn push(&mut self, byte: u8) -> Result<Option<RawEvent>, FramingError> {
        match self.mode {
            DecodeMode::Narrow => match byte {
                0x80..=0xFF => {
                    self.accumulate(byte & 0x0F);
                    Ok(Some(self.finish(u64::from((byte >> 4) & 0x07))))
                }
                0x30..=0x7F => Ok(Some(RawEvent::Run((u64::from(byte - 0x30) + 1) * 8))),
                _ => Err(FramingError::UnrecognizedRle(byte)),
            },
            DecodeMode::Wide { bytes_per_sample } => {
                if self.collected == 0 {
                    match byte {
                        0x80..=0xFF => self.accumulate(byte),
                        48..=79 => return Ok(Some(RawEvent::Run(u64::from(byte) - 47))),
                        80..=127 => return Ok(Some(RawEvent::Run((u64::from(byte) - 78) * 32))),
                        _ => return Err(FramingError::UnrecognizedRle(byte)),
                    }
                } else if byte & SAMPLE_FLAG == 0 {
                    self.reset();
                    return Err(FramingError::ExpectedContinuation(byte));
                } else {
                    self.accumulate(byte);
                }
                Ok((self.collected == bytes_per_sample).then(|| self.finish(0)))
            }
            DecodeMode::Analog {
                digital_bytes,
                analog_channels,
            } => {
                if self.collected < digital_bytes {
                    if byte & SAMPLE_FLAG == 0 {
                        let first = self.collected == 0;
                        self.reset();
                        return Err(if first {
                            FramingError::ExpectedSampleStart(byte)
                        } else {
                            FramingError::ExpectedContinuation(byte)
                        });
                    }
                    self.accumulate(byte);
                } else {
                    let raw = f64::from(byte & !SAMPLE_FLAG);
                    self.analog
                        .push(raw / ANALOG_FULL_SCALE_RAW * ANALOG_FULL_SCALE_VOLTS);
                    self.collected += 1;
                }
                Ok((self.collected == digital_bytes + analog_channels).then(|| self.finish(0)))
            }
        }
    }
}

/// Decode position within one acquisition.
///
/// Only ever moves forward. `samples` counts samples handed out, including
/// repeats consumed in bulk with [`DecoderCursor::consume_run`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecoderCursor {
    chunk: usize,
    offset: usize,
    bytes_consumed: u64,
    samples: u64,
    current: Option<Sample>,
    pending: Option<Sample>,
    run: u64,
}

impl DecoderCursor {
    pub fn new(first_sample: u64) -> Self {
        Self {
            samples: first_sample,
            ..Self::default()
        }
    }

    pub fn at_start(buffer: &CaptureBuffer) -> Self {
        Self::new(buffer.first_sample())
    }

    pub fn bytes_consumed(&self) -> u64 {
        self.bytes_consumed
    }

    pub fn samples_consumed(&self) -> u64 {
        self.samples
    }

    /// The most recently handed out sample.
    pub fn current(&self) -> Option<&Sample> {
        self.current.as_ref()
    }

    /// Repeats of [`current`](Self::current) not handed out yet.
    pub fn run_remaining(&self) -> u64 {
        self.run
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Hand out `count` repeats of the current sample without decoding them.
    pub fn consume_run(&mut self, count: u64) {
        let count = count.min(self.run);
        self.run -= count;
        self.samples += count;
    }

    fn emit(&mut self, sample: Sample) -> Sample {
        self.samples += 1;
        self.current = Some(sample.clone());
        sample
    }

    fn next_byte(&mut self, buffer: &CaptureBuffer) -> Option<u8> {
        while let Some(chunk) = buffer.chunk(self.chunk) {
            if let Some(&byte) = chunk.get(self.offset) {
                self.offset += 1;
                self.bytes_consumed += 1;
                return Some(byte);
            }
            self.chunk += 1;
            self.offset = 0;
        }
        None
    }
}

#[derive(Debug, Clone)]
pub struct SampleDecoder {
    assembler: SampleAssembler,
}

impl SampleDecoder {
    pub fn new(mode: DecodeMode, mapping: BitMapping) -> Self {
        Self {
            assembler: SampleAssembler::new(mode, mapping),
        }
    }

    pub fn for_config(config: &ChannelConfiguration) -> Self {
        Self {
            assembler: SampleAssembler::for_config(config),
        }
    }

    pub fn mode(&self) -> DecodeMode {
        self.assembler.mode()
    }

    fn read_event(
        &mut self,
        buffer: &CaptureBuffer,
        cursor: &mut DecoderCursor,
    ) -> Result<Option<RawEvent>, FramingError> {
        while let Some(byte) = cursor.next_byte(buffer) {
            if let Some(event) = self.assembler.push(byte)? {
                return Ok(Some(event));
            }
        }
        if self.assembler.is_idle() {
            Ok(None)
        } else {
            Err(FramingError::TruncatedSample)
        }
    }

    /// Hand out the next sample occurrence.
    ///
    /// Outstanding repeats come first, then a sample that was decoded along
    /// with them, then fresh bytes. Returns [`DecodeError::EndOfStream`] once
    /// the buffer is exhausted.
    pub fn decode_next(
        &mut self,
        buffer: &CaptureBuffer,
        cursor: &mut DecoderCursor,
    ) -> Result<Sample, DecodeError> {
        loop {
            if cursor.run > 0 {
                if let Some(sample) = cursor.current.clone() {
                    cursor.run -= 1;
                    cursor.samples += 1;
                    return Ok(sample);
                }
                cursor.run = 0;
            }
            if let Some(sample) = cursor.pending.take() {
                return Ok(cursor.emit(sample));
            }

            match self.read_event(buffer, cursor)? {
                None => {
                    cursor.samples += cursor.run;
                    cursor.run = 0;
                    return Err(DecodeError::EndOfStream);
                }
                Some(RawEvent::Run(count)) => {
                    if cursor.current.is_some() {
                        cursor.run += count;
                    } else {
                        log::trace!("Dropping run of {} before the first sample", count);
                    }
                }
                Some(RawEvent::Sample { repeats, sample }) => {
                    if repeats > 0 && cursor.current.is_some() {
                        cursor.run += repeats;
                        cursor.pending = Some(sample);
                    } else {
                        return Ok(cursor.emit(sample));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Encode sample values the way the firmware does for up to 4 channels.
    fn encode_narrow(values: &[u8]) -> Vec<u8> {
        let mut runs: Vec<(u8, u64)> = Vec::new();
        for &v in values {
            match runs.last_mut() {
                Some((last, count)) if *last == v => *count += 1,
                _ => runs.push((v, 1)),
            }
        }

        let mut out = Vec::new();
        let mut carry = 0u64;
        for (value, count) in runs {
            out.push(0x80 | ((carry as u8) << 4) | value);
            let mut extra = count - 1;
            while extra >= 8 {
                let units = (extra / 8).min(80);
                out.push(0x30 + units as u8 - 1);
                extra -= units * 8;
            }
            carry = extra;
        }
        if carry > 0 {
            let last = values[values.len() - 1];
            out.push(0x80 | (((carry - 1) as u8) << 4) | last);
        }
        out
    }

    fn decode_all(
        decoder: &mut SampleDecoder,
        buffer: &CaptureBuffer,
    ) -> (Vec<u32>, DecoderCursor) {
        let mut cursor = DecoderCursor::at_start(buffer);
        let mut bits = Vec::new();
        loop {
            match decoder.decode_next(buffer, &mut cursor) {
                Ok(sample) => bits.push(sample.bits),
                Err(DecodeError::EndOfStream) => return (bits, cursor),
                Err(e) => unreachable!("decode failed: {e}"),
            }
        }
    }

    fn narrow() -> SampleDecoder {
        SampleDecoder::new(DecodeMode::Narrow, BitMapping::Identity)
    }

    #[test]
    fn test_mode_selection() {
        assert_eq!(DecodeMode::for_channels(4, 0), DecodeMode::Narrow);
        assert_eq!(
            DecodeMode::for_channels(5, 0),
            DecodeMode::Wide {
                bytes_per_sample: 1
            }
        );
        assert_eq!(
            DecodeMode::for_channels(21, 0),
            DecodeMode::Wide {
                bytes_per_sample: 3
            }
        );
        assert_eq!(
            DecodeMode::for_channels(2, 3),
            DecodeMode::Analog {
                digital_bytes: 1,
                analog_channels: 3
            }
        );
    }

    #[test]
    fn test_narrow_sample_then_rle() {
        let buffer = CaptureBuffer::from_chunks(vec![vec![0x85, 0x32]]);
        let mut decoder = narrow();
        let mut cursor = DecoderCursor::at_start(&buffer);

        assert_eq!(decoder.decode_next(&buffer, &mut cursor).unwrap().bits, 5);
        assert_eq!(cursor.samples_consumed(), 1);
        assert_eq!(cursor.run_remaining(), 0);

        // the RLE byte only extends the run; repeats come out one at a time
        assert_eq!(decoder.decode_next(&buffer, &mut cursor).unwrap().bits, 5);
        assert_eq!(cursor.run_remaining(), 23);

        cursor.consume_run(23);
        assert_eq!(cursor.samples_consumed(), 25);
        assert_eq!(
            decoder.decode_next(&buffer, &mut cursor),
            Err(DecodeError::EndOfStream)
        );
        assert_eq!(cursor.samples_consumed(), 25);
        assert_eq!(cursor.bytes_consumed(), 2);
    }

    #[test]
    fn test_narrow_repeat_prefix_holds_pending_sample() {
        // 1, then two more 1s followed by 2
        let buffer = CaptureBuffer::from_chunks(vec![vec![0x81], vec![0xA2]]);
        let mut decoder = narrow();
        let mut cursor = DecoderCursor::at_start(&buffer);

        assert_eq!(decoder.decode_next(&buffer, &mut cursor).unwrap().bits, 1);
        assert_eq!(decoder.decode_next(&buffer, &mut cursor).unwrap().bits, 1);
        assert!(cursor.has_pending());
        assert_eq!(decoder.decode_next(&buffer, &mut cursor).unwrap().bits, 1);
        assert_eq!(decoder.decode_next(&buffer, &mut cursor).unwrap().bits, 2);
        assert!(!cursor.has_pending());
        assert_eq!(cursor.samples_consumed(), 4);
    }

    #[test]
    fn test_narrow_round_trip_boundaries() {
        for &repeats in &[0usize, 1, 7, 8, 9, 640, 641, 1568] {
            let mut values = vec![3u8, 3, 9];
            values.extend(std::iter::repeat(0xA).take(repeats + 1));
            values.push(0);
            values.extend(std::iter::repeat(0xF).take(repeats + 1));

            let encoded = encode_narrow(&values);
            let buffer = CaptureBuffer::from_chunks(vec![encoded]);
            let (bits, cursor) = decode_all(&mut narrow(), &buffer);

            let expected: Vec<u32> = values.iter().map(|&v| u32::from(v)).collect();
            assert_eq!(bits, expected, "repeats = {}", repeats);
            assert_eq!(cursor.samples_consumed(), values.len() as u64);
        }
    }

    #[test]
    fn test_narrow_rejects_low_bytes() {
        let buffer = CaptureBuffer::from_chunks(vec![vec![0x81, 0x2F]]);
        let mut decoder = narrow();
        let mut cursor = DecoderCursor::at_start(&buffer);
        decoder.decode_next(&buffer, &mut cursor).unwrap();
        assert_eq!(
            decoder.decode_next(&buffer, &mut cursor),
            Err(DecodeError::Framing(FramingError::UnrecognizedRle(0x2F)))
        );
    }

    #[test]
    fn test_wide_sample_widths() {
        for &channels in &[5usize, 7, 8, 14, 15, 26] {
            let mode = DecodeMode::for_channels(channels, 0);
            let DecodeMode::Wide { bytes_per_sample } = mode else {
                unreachable!("{channels} channels should decode in wide mode");
            };
            assert_eq!(bytes_per_sample, channels.div_ceil(7));

            let value: u32 = 0x2AAA_AAAA & ((1u32 << channels) - 1);
            let encoded: Vec<u8> = (0..bytes_per_sample)
                .map(|i| 0x80 | ((value >> (7 * i)) & 0x7F) as u8)
                .collect();

            let buffer = CaptureBuffer::from_chunks(vec![encoded]);
            let mut decoder = SampleDecoder::new(mode, BitMapping::Identity);
            let (bits, _) = decode_all(&mut decoder, &buffer);
            assert_eq!(bits, vec![value], "channels = {}", channels);
        }
    }

    #[test]
    fn test_wide_sample_split_across_chunks() {
        let mode = DecodeMode::for_channels(14, 0);
        let buffer = CaptureBuffer::from_chunks(vec![vec![0x81], vec![0x82, 48]]);
        let mut decoder = SampleDecoder::new(mode, BitMapping::Identity);
        let (bits, cursor) = decode_all(&mut decoder, &buffer);
        assert_eq!(bits, vec![0x101, 0x101]);
        assert_eq!(cursor.bytes_consumed(), 3);
    }

    #[test]
    fn test_wide_rle_ranges() {
        let mode = DecodeMode::for_channels(6, 0);
        for &(byte, repeats) in &[(48u8, 1u64), (79, 32), (80, 64), (81, 96), (127, 1568)] {
            let buffer = CaptureBuffer::from_chunks(vec![vec![0x81, byte]]);
            let mut decoder = SampleDecoder::new(mode, BitMapping::Identity);
            let mut cursor = DecoderCursor::at_start(&buffer);
            decoder.decode_next(&buffer, &mut cursor).unwrap();
            decoder.decode_next(&buffer, &mut cursor).unwrap();
            assert_eq!(cursor.run_remaining() + 1, repeats, "byte = {}", byte);
        }
    }

    #[test]
    fn test_wide_framing_errors() {
        let mode = DecodeMode::for_channels(10, 0);

        let buffer = CaptureBuffer::from_chunks(vec![vec![0x81, 0x05]]);
        let mut cursor = DecoderCursor::at_start(&buffer);
        assert_eq!(
            SampleDecoder::new(mode, BitMapping::Identity).decode_next(&buffer, &mut cursor),
            Err(DecodeError::Framing(FramingError::ExpectedContinuation(0x05)))
        );

        let buffer = CaptureBuffer::from_chunks(vec![vec![0x20]]);
        let mut cursor = DecoderCursor::at_start(&buffer);
        assert_eq!(
            SampleDecoder::new(mode, BitMapping::Identity).decode_next(&buffer, &mut cursor),
            Err(DecodeError::Framing(FramingError::UnrecognizedRle(0x20)))
        );

        let buffer = CaptureBuffer::from_chunks(vec![vec![0x81]]);
        let mut cursor = DecoderCursor::at_start(&buffer);
        assert_eq!(
            SampleDecoder::new(mode, BitMapping::Identity).decode_next(&buffer, &mut cursor),
            Err(DecodeError::Framing(FramingError::TruncatedSample))
        );
    }

    #[test]
    fn test_analog_samples() {
        let mode = DecodeMode::for_channels(3, 2);
        let buffer =
            CaptureBuffer::from_chunks(vec![vec![0x85, 0xFF, 0x80], vec![0x82, 0x40, 0x00]]);
        let mut decoder = SampleDecoder::new(mode, BitMapping::Identity);
        let mut cursor = DecoderCursor::at_start(&buffer);

        let first = decoder.decode_next(&buffer, &mut cursor).unwrap();
        assert_eq!(first.bits, 5);
        assert!((first.analog[0] - 3.3).abs() < 1e-9);
        assert!(first.analog[1].abs() < 1e-9);

        let second = decoder.decode_next(&buffer, &mut cursor).unwrap();
        assert_eq!(second.bits, 2);
        assert!((second.analog[0] - 64.0 / 127.0 * 3.3).abs() < 1e-9);
        assert_eq!(
            decoder.decode_next(&buffer, &mut cursor),
            Err(DecodeError::EndOfStream)
        );
    }

    #[test]
    fn test_analog_requires_sample_start() {
        let mode = DecodeMode::for_channels(3, 1);
        let buffer = CaptureBuffer::from_chunks(vec![vec![0x35, 0x10]]);
        let mut cursor = DecoderCursor::at_start(&buffer);
        assert_eq!(
            SampleDecoder::new(mode, BitMapping::Identity).decode_next(&buffer, &mut cursor),
            Err(DecodeError::Framing(FramingError::ExpectedSampleStart(0x35)))
        );
    }

    #[test]
    fn test_bit_mapping_applied() {
        let mapping = BitMapping::Permutation(vec![1, 2, 0]);
        let buffer = CaptureBuffer::from_chunks(vec![vec![0x81, 0x84]]);
        let (bits, _) = decode_all(&mut SampleDecoder::new(DecodeMode::Narrow, mapping), &buffer);
        assert_eq!(bits, vec![0b010, 0b001]);
    }

    #[test]
    fn test_leading_run_after_trim_is_ignored() {
        let mut buffer = CaptureBuffer::from_chunks(vec![vec![0x81], vec![0xF3, 0x31]]);
        buffer.discard_pretrigger(crate::capture_framer::SampleBoundary {
            chunk: 1,
            sample_index: 8,
        });
        let (bits, cursor) = decode_all(&mut narrow(), &buffer);
        assert_eq!(bits.len(), 17);
        assert!(bits.iter().all(|&b| b == 3));
        assert_eq!(cursor.samples_consumed(), 8 + 17);
    }
}
