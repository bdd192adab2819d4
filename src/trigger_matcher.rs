//! Evaluation of trigger conditions over the decoded sample stream.
//!
//! Long runs of identical samples are never expanded: a run is checked once
//! against every condition and consumed in bulk up to the first match.

use crate::capture_framer::{FramingError, SampleBoundary};
use crate::sample_decoder::{DecodeError, RawEvent, Sample, SampleAssembler};
use crate::trigger_config::TriggerCondition;

const SAMPLE_FLAG: u8 = 0x80;

/// Anything `wait` can pull samples from.
pub trait SampleSource {
    /// The most recently handed out sample.
    fn current(&self) -> Option<&Sample>;
    /// Repeats of the current sample known but not handed out yet.
    fn run_remaining(&self) -> u64;
    /// Hand out `count` repeats without decoding them.
    fn consume_run(&mut self, count: u64);
    fn samples_consumed(&self) -> u64;
    fn next_sample(&mut self) -> Result<Sample, DecodeError>;
}

/// Remaining skip budget per condition, carried across `wait` calls.
///
/// `None` entries belong to pin conditions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkipProgress {
    remaining: Vec<Option<u64>>,
}

impl SkipProgress {
    pub fn new(conditions: &[TriggerCondition]) -> Self {
        Self {
            remaining: conditions.iter().map(TriggerCondition::skip_budget).collect(),
        }
    }

    pub fn remaining(&self, index: usize) -> Option<u64> {
        self.remaining.get(index).copied().flatten()
    }

    /// Start over when handed a different condition list.
    fn align(&mut self, conditions: &[TriggerCondition]) {
        if self.remaining.len() != conditions.len() {
            *self = Self::new(conditions);
        }
    }

    fn advance(&mut self, samples: u64) {
        for budget in self.remaining.iter_mut().flatten() {
            *budget = budget.saturating_sub(samples);
        }
    }

    fn rearm(&mut self, conditions: &[TriggerCondition], fired: &[usize]) {
        for &index in fired {
            if let (Some(slot), Some(budget)) = (
                self.remaining.get_mut(index),
                conditions.get(index).and_then(TriggerCondition::skip_budget),
            ) {
                *slot = Some(budget);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerMatch {
    /// Indices of every condition that fired on this sample.
    pub matched: Vec<usize>,
    pub sample: Sample,
    /// Absolute index of `sample` within the acquisition.
    pub sample_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// A condition fired on repeat number `consumed` of the run.
    Matched { consumed: u64, fired: Vec<usize> },
    /// Nothing fired; the whole run was accounted for.
    Exhausted,
}

/// Check `run` repeats of `value` against every condition at once.
pub fn match_run(
    conditions: &[TriggerCondition],
    progress: &mut SkipProgress,
    value: u32,
    run: u64,
) -> RunOutcome {
    progress.align(conditions);
    if run == 0 {
        return RunOutcome::Exhausted;
    }
    if conditions.is_empty() {
        return RunOutcome::Matched {
            consumed: 1,
            fired: Vec::new(),
        };
    }

    let candidates: Vec<(usize, u64)> = conditions
        .iter()
        .enumerate()
        .filter_map(|(index, condition)| {
            let at = match condition {
                TriggerCondition::Skip(_) => progress
                    .remaining(index)
                    .map(|budget| budget.max(1))
                    .filter(|&at| at <= run),
                TriggerCondition::Pins(_) => condition.matches_repeat(value).then_some(1),
            };
            at.map(|at| (index, at))
        })
        .collect();

    match candidates.iter().map(|&(_, at)| at).min() {
        Some(earliest) => {
            progress.advance(earliest);
            RunOutcome::Matched {
                consumed: earliest,
                fired: candidates
                    .iter()
                    .filter(|&&(_, at)| at == earliest)
                    .map(|&(index, _)| index)
                    .collect(),
            }
        }
        None => {
            progress.advance(run);
            RunOutcome::Exhausted
        }
    }
}

/// Check one freshly decoded sample against every condition.
pub fn match_sample(
    conditions: &[TriggerCondition],
    progress: &mut SkipProgress,
    previous: Option<u32>,
    current: u32,
) -> Option<Vec<usize>> {
    progress.align(conditions);
    if conditions.is_empty() {
        return Some(Vec::new());
    }
    progress.advance(1);

    let fired: Vec<usize> = conditions
        .iter()
        .enumerate()
        .filter(|(index, condition)| match condition {
            TriggerCondition::Skip(_) => progress.remaining(*index) == Some(0),
            TriggerCondition::Pins(_) => condition.matches(previous, current),
        })
        .map(|(index, _)| index)
        .collect();
    (!fired.is_empty()).then_some(fired)
}

/// Advance `source` until any of `conditions` fires.
///
/// An empty list fires on the very next sample. Skip budgets are kept in
/// `progress`, and the ones that fired are re-armed, so the same progress
/// can be handed to the next call.
pub fn wait<S: SampleSource + ?Sized>(
    source: &mut S,
    conditions: &[TriggerCondition],
    progress: &mut SkipProgress,
) -> Result<TriggerMatch, DecodeError> {
    crate::profile_span!("wait");
    progress.align(conditions);

    loop {
        let run = source.run_remaining();
        if run > 0 {
            if let Some(current) = source.current().cloned() {
                match match_run(conditions, progress, current.bits, run) {
                    RunOutcome::Matched { consumed, fired } => {
                        source.consume_run(consumed);
                        progress.rearm(conditions, &fired);
                        return Ok(TriggerMatch {
                            matched: fired,
                            sample: current,
                            sample_index: source.samples_consumed().saturating_sub(1),
                        });
                    }
                    RunOutcome::Exhausted => {
                        source.consume_run(run);
                        continue;
                    }
                }
            }
        }

        let previous = source.current().map(|sample| sample.bits);
        let sample = source.next_sample()?;
        if let Some(fired) = match_sample(conditions, progress, previous, sample.bits) {
            progress.rearm(conditions, &fired);
            return Ok(TriggerMatch {
                matched: fired,
                sample,
                sample_index: source.samples_consumed().saturating_sub(1),
            });
        }
    }
}

/// Where the scanner saw the trigger fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerPoint {
    pub chunk: usize,
    pub sample_index: u64,
}

/// Looks for the trigger while the capture is still streaming in.
///
/// Only bit values and sample counts are tracked, nothing is stored. Besides
/// the trigger point the scanner remembers the last chunk before it that
/// starts cleanly on a sample, which is where decoding can later resume.
#[derive(Debug)]
pub struct TriggerScanner {
    assembler: SampleAssembler,
    conditions: Vec<TriggerCondition>,
    progress: SkipProgress,
    previous: Option<u32>,
    samples: u64,
    chunk_start: Option<usize>,
    candidate: Option<SampleBoundary>,
    boundary: Option<SampleBoundary>,
    trigger: Option<TriggerPoint>,
}

impl TriggerScanner {
    pub fn new(assembler: SampleAssembler, conditions: Vec<TriggerCondition>) -> Self {
        let progress = SkipProgress::new(&conditions);
        Self {
            assembler,
            conditions,
            progress,
            previous: None,
            samples: 0,
            chunk_start: None,
            candidate: None,
            boundary: None,
            trigger: None,
        }
    }

    pub fn trigger(&self) -> Option<TriggerPoint> {
        self.trigger
    }

    /// Earliest point the capture can be trimmed to without losing the
    /// trigger. Only known once the trigger fired.
    pub fn pretrigger_boundary(&self) -> Option<SampleBoundary> {
        self.boundary
    }

    fn scan_run(&mut self, count: u64) -> Option<u64> {
        let value = self.previous?;
        match match_run(&self.conditions, &mut self.progress, value, count) {
            RunOutcome::Matched { consumed, .. } => {
                self.samples += consumed;
                Some(self.samples - 1)
            }
            RunOutcome::Exhausted => {
                self.samples += count;
                None
            }
        }
    }

    fn scan_sample(&mut self, bits: u32) -> Option<u64> {
        let fired = match_sample(&self.conditions, &mut self.progress, self.previous, bits);
        self.previous = Some(bits);
        self.samples += 1;
        fired.map(|_| self.samples - 1)
    }

    /// Feed the next chunk as it was appended to the capture buffer.
    pub fn feed(&mut self, chunk_index: usize, bytes: &[u8]) -> Result<(), FramingError> {
        if self.trigger.is_some() {
            return Ok(());
        }

        self.chunk_start = match bytes.first() {
            Some(&first) if first & SAMPLE_FLAG != 0 && self.assembler.is_idle() => {
                Some(chunk_index)
            }
            _ => None,
        };

        for &byte in bytes {
            let Some(event) = self.assembler.push(byte)? else {
                continue;
            };
            let fired = match event {
                RawEvent::Run(count) => self.scan_run(count),
                RawEvent::Sample { repeats, sample } => {
                    let start = self.chunk_start.take();
                    match self.scan_run(repeats) {
                        Some(index) => Some(index),
                        None => {
                            let index = self.samples;
                            let fired = self.scan_sample(sample.bits);
                            if fired.is_none() {
                                if let Some(chunk) = start {
                                    self.candidate = Some(SampleBoundary {
                                        chunk,
                                        sample_index: index,
                                    });
                                }
                            }
                            fired
                        }
                    }
                }
            };

            if let Some(sample_index) = fired {
                self.trigger = Some(TriggerPoint {
                    chunk: chunk_index,
                    sample_index,
                });
                self.boundary = self.candidate;
                log::debug!(
                    "Trigger at sample {} in chunk {}, trim point {:?}",
                    sample_index,
                    chunk_index,
                    self.boundary
                );
                return Ok(());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture_framer::CaptureBuffer;
    use crate::channel_config::BitMapping;
    use crate::sample_decoder::{DecodeMode, DecoderCursor, SampleDecoder};
    use crate::trigger_config::PinCondition;

    struct Decoded {
        buffer: CaptureBuffer,
        cursor: DecoderCursor,
        decoder: SampleDecoder,
    }

    impl Decoded {
        fn narrow(chunks: Vec<Vec<u8>>) -> Self {
            let buffer = CaptureBuffer::from_chunks(chunks);
            Self {
                cursor: DecoderCursor::at_start(&buffer),
                buffer,
                decoder: SampleDecoder::new(DecodeMode::Narrow, BitMapping::Identity),
            }
        }
    }

    impl SampleSource for Decoded {
        fn current(&self) -> Option<&Sample> {
            self.cursor.current()
        }

        fn run_remaining(&self) -> u64 {
            self.cursor.run_remaining()
        }

        fn consume_run(&mut self, count: u64) {
            self.cursor.consume_run(count)
        }

        fn samples_consumed(&self) -> u64 {
            self.cursor.samples_consumed()
        }

        fn next_sample(&mut self) -> Result<Sample, DecodeError> {
            self.decoder.decode_next(&self.buffer, &mut self.cursor)
        }
    }

    fn wait_once(
        source: &mut Decoded,
        conditions: &[TriggerCondition],
    ) -> Result<TriggerMatch, DecodeError> {
        wait(source, conditions, &mut SkipProgress::new(conditions))
    }

    #[test]
    fn test_empty_conditions_take_one_sample() {
        let mut source = Decoded::narrow(vec![vec![0x85, 0x32]]);
        for expected in 0..25 {
            let hit = wait_once(&mut source, &[]).unwrap();
            assert_eq!(hit.sample_index, expected);
            assert_eq!(hit.sample.bits, 5);
            assert!(hit.matched.is_empty());
            assert_eq!(source.samples_consumed(), expected + 1);
        }
        assert_eq!(wait_once(&mut source, &[]), Err(DecodeError::EndOfStream));
    }

    #[test]
    fn test_skip_inside_run_reads_no_bytes() {
        let mut source = Decoded::narrow(vec![vec![0x85, 0x32, 0x81]]);
        wait_once(&mut source, &[]).unwrap();
        wait_once(&mut source, &[]).unwrap();
        assert_eq!(source.run_remaining(), 23);
        assert_eq!(source.cursor.bytes_consumed(), 2);

        let hit = wait_once(&mut source, &[TriggerCondition::skip(23)]).unwrap();
        assert_eq!(hit.matched, vec![0]);
        assert_eq!(hit.sample_index, 24);
        assert_eq!(source.cursor.bytes_consumed(), 2);
        assert_eq!(source.run_remaining(), 0);

        let next = wait_once(&mut source, &[]).unwrap();
        assert_eq!(next.sample.bits, 1);
        assert_eq!(next.sample_index, 25);
    }

    #[test]
    fn test_skip_progress_spans_calls() {
        // 0, then 8 more 0s, then 1
        let mut source = Decoded::narrow(vec![vec![0x80, 0x30, 0x81]]);
        let conditions = [TriggerCondition::skip(4)];
        let mut progress = SkipProgress::new(&conditions);

        let hit = wait(&mut source, &conditions, &mut progress).unwrap();
        assert_eq!(hit.sample_index, 3);
        // re-armed after firing
        assert_eq!(progress.remaining(0), Some(4));
        let hit = wait(&mut source, &conditions, &mut progress).unwrap();
        assert_eq!(hit.sample_index, 7);
        assert_eq!(source.run_remaining(), 1);
    }

    #[test]
    fn test_level_matches_inside_run_edge_does_not() {
        let mut source = Decoded::narrow(vec![vec![0x81, 0x3F, 0x80]]);
        wait_once(&mut source, &[]).unwrap();
        wait_once(&mut source, &[]).unwrap();

        let high = [TriggerCondition::when().high(0).build()];
        let hit = wait_once(&mut source, &high).unwrap();
        assert_eq!(hit.sample_index, 2);

        let falling = [TriggerCondition::when().falling(0).build()];
        let hit = wait_once(&mut source, &falling).unwrap();
        assert_eq!(hit.sample.bits, 0);
        assert_eq!(hit.sample_index, 129);
        assert_eq!(hit.matched, vec![0]);
    }

    #[test]
    fn test_first_sample_has_no_edge() {
        let mut source = Decoded::narrow(vec![vec![0x81, 0x80, 0x81]]);
        let rising = [TriggerCondition::when().rising(0).build()];
        let hit = wait_once(&mut source, &rising).unwrap();
        assert_eq!(hit.sample_index, 2);
    }

    #[test]
    fn test_simultaneous_matches_are_all_reported() {
        let mut source = Decoded::narrow(vec![vec![0x81, 0x82]]);
        let conditions = [
            TriggerCondition::when().pin(1, PinCondition::Rising).build(),
            TriggerCondition::skip(2),
            TriggerCondition::when().high(0).build(),
        ];
        let mut progress = SkipProgress::new(&conditions);
        let hit = wait(&mut source, &conditions, &mut progress).unwrap();
        assert_eq!(hit.matched, vec![2]);
        let hit = wait(&mut source, &conditions, &mut progress).unwrap();
        assert_eq!(hit.matched, vec![0, 1]);
    }

    #[test]
    fn test_match_run_picks_earliest() {
        let conditions = [TriggerCondition::skip(10), TriggerCondition::skip(3)];
        let mut progress = SkipProgress::new(&conditions);
        assert_eq!(
            match_run(&conditions, &mut progress, 0, 5),
            RunOutcome::Matched {
                consumed: 3,
                fired: vec![1]
            }
        );
        assert_eq!(progress.remaining(0), Some(7));
        progress.rearm(&conditions, &[1]);
        assert_eq!(match_run(&conditions, &mut progress, 0, 2), RunOutcome::Exhausted);
        assert_eq!(progress.remaining(0), Some(5));
    }

    #[test]
    fn test_progress_follows_condition_list() {
        let mut progress = SkipProgress::default();
        let conditions = [TriggerCondition::skip(2)];
        assert_eq!(match_sample(&conditions, &mut progress, None, 0), None);
        assert_eq!(progress.remaining(0), Some(1));
        assert_eq!(match_sample(&conditions, &mut progress, Some(0), 0), Some(vec![0]));
    }

    fn scan(chunks: &[&[u8]], conditions: Vec<TriggerCondition>) -> TriggerScanner {
        scan_mode(DecodeMode::Narrow, chunks, conditions)
    }

    fn scan_mode(
        mode: DecodeMode,
        chunks: &[&[u8]],
        conditions: Vec<TriggerCondition>,
    ) -> TriggerScanner {
        let assembler = SampleAssembler::new(mode, BitMapping::Identity);
        let mut scanner = TriggerScanner::new(assembler, conditions);
        for (index, chunk) in chunks.iter().enumerate() {
            scanner.feed(index, chunk).unwrap();
        }
        scanner
    }

    #[test]
    fn test_scanner_finds_trigger_and_boundary() {
        let scanner = scan(
            &[&[0x80, 0x30], &[0xF0, 0x31], &[0x80], &[0x81, 0x80]],
            vec![TriggerCondition::when().rising(0).build()],
        );
        assert_eq!(
            scanner.trigger(),
            Some(TriggerPoint {
                chunk: 3,
                sample_index: 34
            })
        );
        assert_eq!(
            scanner.pretrigger_boundary(),
            Some(SampleBoundary {
                chunk: 2,
                sample_index: 33
            })
        );
    }

    #[test]
    fn test_scanner_boundary_never_on_trigger_sample() {
        let scanner = scan(
            &[&[0x80], &[0x81]],
            vec![TriggerCondition::when().rising(0).build()],
        );
        assert_eq!(scanner.trigger().map(|t| t.sample_index), Some(1));
        assert_eq!(
            scanner.pretrigger_boundary(),
            Some(SampleBoundary {
                chunk: 0,
                sample_index: 0
            })
        );
    }

    #[test]
    fn test_scanner_trigger_inside_run() {
        let scanner = scan(
            &[&[0x80], &[0x31]],
            vec![TriggerCondition::skip(10)],
        );
        assert_eq!(scanner.trigger().map(|t| t.sample_index), Some(9));
        assert_eq!(scanner.trigger().map(|t| t.chunk), Some(1));
    }

    #[test]
    fn test_scanner_without_trigger() {
        let scanner = scan(&[&[0x80, 0x31]], vec![TriggerCondition::when().high(0).build()]);
        assert_eq!(scanner.trigger(), None);
        assert_eq!(scanner.pretrigger_boundary(), None);
    }

    #[test]
    fn test_scanner_skips_chunk_starting_mid_sample() {
        // 14 channels, two bytes per sample. Chunks 2 and 3 open with the
        // second byte of a sample split across reads.
        let wide = DecodeMode::for_channels(14, 0);
        let scanner = scan_mode(
            wide,
            &[&[0x80, 0x80], &[0x80], &[0x80, 0x80], &[0x80], &[0x81, 0x80]],
            vec![TriggerCondition::when().rising(0).build()],
        );
        assert_eq!(
            scanner.trigger(),
            Some(TriggerPoint {
                chunk: 4,
                sample_index: 3
            })
        );
        assert_eq!(
            scanner.pretrigger_boundary(),
            Some(SampleBoundary {
                chunk: 0,
                sample_index: 0
            })
        );
    }

    #[test]
    fn test_scanner_resumes_boundaries_after_split_sample() {
        // chunk 2 finishes sample 1 before holding sample 2, chunk 3 is clean
        let wide = DecodeMode::for_channels(14, 0);
        let scanner = scan_mode(
            wide,
            &[&[0x80, 0x80], &[0x80], &[0x80, 0x80, 0x80], &[0x80, 0x80], &[0x81, 0x80]],
            vec![TriggerCondition::when().rising(0).build()],
        );
        assert_eq!(scanner.trigger().map(|t| t.sample_index), Some(4));
        assert_eq!(
            scanner.pretrigger_boundary(),
            Some(SampleBoundary {
                chunk: 3,
                sample_index: 3
            })
        );
    }
}
