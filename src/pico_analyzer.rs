use crate::capture_framer::{
    start_capture, stream_until_trailer, CaptureBuffer, CaptureError, FramingError,
};
use crate::channel_config::{ChannelConfiguration, ConfigurationError};
use crate::protocol::{identify, program, validate_capture, DeviceDescriptor, ProtocolError};
use crate::sample_decoder::{DecodeError, DecoderCursor, Sample, SampleAssembler, SampleDecoder};
use crate::serial_terminal::{PicoTerminal, TerminalError, Transport};
use crate::trigger_config::TriggerCondition;
use crate::trigger_matcher::{
    self, SampleSource, SkipProgress, TriggerMatch, TriggerPoint, TriggerScanner,
};
use polars::prelude::*;
use std::time::Duration;

const SAMPLE_COLUMN_NAME: &str = "sample";
const TIME_COLUMN_NAME: &str = "time";

#[derive(Debug, thiserror::Error)]
pub enum PicoError {
    #[error("Serial terminal error: {0}")]
    Terminal(#[from] TerminalError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("End of capture stream")]
    EndOfStream,

    #[error("DataFrame error: {0}")]
    Polars(#[from] PolarsError),
}

impl PicoError {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, PicoError::EndOfStream)
    }
}

impl From<DecodeError> for PicoError {
    fn from(error: DecodeError) -> Self {
        match error {
            DecodeError::Framing(e) => PicoError::Framing(e),
            DecodeError::EndOfStream => PicoError::EndOfStream,
        }
    }
}

/// What to capture next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub sample_count: u32,
    /// Hz, one of [`SUPPORTED_SAMPLE_RATES`](crate::protocol::SUPPORTED_SAMPLE_RATES).
    pub sample_rate: u64,
    /// `None` captures every channel the device has.
    pub channels: Option<Vec<String>>,
    /// Conditions used to locate the trigger while streaming.
    pub triggers: Vec<TriggerCondition>,
}

impl CaptureRequest {
    pub fn new(sample_count: u32, sample_rate: u64) -> Self {
        Self {
            sample_count,
            sample_rate,
            channels: None,
            triggers: Vec::new(),
        }
    }

    pub fn channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = Some(channels.into_iter().map(Into::into).collect());
        self
    }

    pub fn trigger(mut self, condition: TriggerCondition) -> Self {
        self.triggers.push(condition);
        self
    }

    pub fn is_triggered(&self) -> bool {
        !self.triggers.is_empty()
    }
}

#[derive(Debug)]
struct Configured {
    config: ChannelConfiguration,
    request: CaptureRequest,
}

/// An identified SRPICO analyzer.
#[derive(Debug)]
pub struct PicoAnalyzer<T: Transport> {
    terminal: PicoTerminal<T>,
    descriptor: DeviceDescriptor,
    configured: Option<Configured>,
    idle_timeout: Option<Duration>,
}

impl<T: Transport> PicoAnalyzer<T> {
    /// Identify the device behind `transport`.
    pub fn new(transport: T) -> Result<Self, PicoError> {
        let mut terminal = PicoTerminal::new(transport);
        let descriptor = identify(&mut terminal)?;
        Ok(Self::from_parts(terminal, descriptor))
    }

    pub(crate) fn from_parts(terminal: PicoTerminal<T>, descriptor: DeviceDescriptor) -> Self {
        Self {
            terminal,
            descriptor,
            configured: None,
            idle_timeout: None,
        }
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Give up streaming when the device stays silent this long.
    pub fn set_idle_timeout(&mut self, timeout: Option<Duration>) {
        self.idle_timeout = timeout;
    }

    /// Channel selection of the last successful [`configure`](Self::configure).
    pub fn configuration(&self) -> Option<&ChannelConfiguration> {
        self.configured.as_ref().map(|c| &c.config)
    }

    /// Resolve and validate `request`, then program the device with it.
    ///
    /// Nothing is written to the device unless the whole request is valid.
    #[tracing::instrument(
        skip_all,
        fields(sample_count = request.sample_count, sample_rate = request.sample_rate)
    )]
    pub fn configure(
        &mut self,
        request: CaptureRequest,
    ) -> Result<&ChannelConfiguration, PicoError> {
        let config = ChannelConfiguration::resolve(&self.descriptor, request.channels.as_deref())?;
        validate_capture(
            &self.descriptor,
            &config,
            request.sample_count,
            request.sample_rate,
        )?;

        self.configured = None;
        program(
            &mut self.terminal,
            &config,
            request.sample_count,
            request.sample_rate,
        )?;
        log::debug!(
            "Configured {} samples at {} Hz, {} digital and {} analog channels",
            request.sample_count,
            request.sample_rate,
            config.digital_count(),
            config.analog_count()
        );

        let configured = self.configured.insert(Configured { config, request });
        Ok(&configured.config)
    }

    /// Run one capture to completion.
    ///
    /// With triggers configured the device is started in conditional mode and
    /// everything before the last clean chunk boundary ahead of the trigger
    /// is dropped.
    #[tracing::instrument(skip_all)]
    pub fn acquire(&mut self) -> Result<Acquisition, PicoError> {
        crate::profile_span!("acquire");

        let Some(configured) = self.configured.as_ref() else {
            return Err(ConfigurationError::NotConfigured.into());
        };
        let triggered = configured.request.is_triggered();

        start_capture(&mut self.terminal, triggered)?;
        let mut scanner = triggered.then(|| {
            TriggerScanner::new(
                SampleAssembler::for_config(&configured.config),
                configured.request.triggers.clone(),
            )
        });
        let mut buffer =
            stream_until_trailer(&mut self.terminal, scanner.as_mut(), self.idle_timeout)?;

        let trigger = scanner.as_ref().and_then(TriggerScanner::trigger);
        match scanner.as_ref().and_then(TriggerScanner::pretrigger_boundary) {
            Some(boundary) => {
                buffer.discard_pretrigger(boundary);
            }
            None if triggered => {
                log::debug!("No trim point before the trigger, keeping the whole capture");
            }
            None => {}
        }

        let mut acquisition = Acquisition::from_buffer(
            configured.config.clone(),
            buffer,
            configured.request.sample_rate,
        );
        acquisition.trigger = trigger;
        Ok(acquisition)
    }

    /// Nudge the device back into command mode after a failed exchange.
    pub fn resync(&mut self) -> Result<(), PicoError> {
        log::debug!("Sending resync");
        self.terminal.write_raw(b"*")?;
        self.terminal.reset_input()?;
        Ok(())
    }

    pub fn into_inner(self) -> T {
        self.terminal.into_inner()
    }
}

/// Receives decoded samples. `count` consecutive samples starting at
/// absolute index `first` all equal `sample`.
pub trait SampleSink {
    fn put(&mut self, first: u64, count: u64, sample: &Sample);
}

impl<F> SampleSink for F
where
    F: FnMut(u64, u64, &Sample),
{
    fn put(&mut self, first: u64, count: u64, sample: &Sample) {
        self(first, count, sample)
    }
}

/// One finished capture, decoded on demand.
#[derive(Debug, Clone)]
pub struct Acquisition {
    config: ChannelConfiguration,
    buffer: CaptureBuffer,
    cursor: DecoderCursor,
    decoder: SampleDecoder,
    sample_rate: u64,
    trigger: Option<TriggerPoint>,
}

impl Acquisition {
    pub fn from_buffer(
        config: ChannelConfiguration,
        buffer: CaptureBuffer,
        sample_rate: u64,
    ) -> Self {
        Self {
            cursor: DecoderCursor::at_start(&buffer),
            decoder: SampleDecoder::for_config(&config),
            config,
            buffer,
            sample_rate,
            trigger: None,
        }
    }

    pub fn config(&self) -> &ChannelConfiguration {
        &self.config
    }

    pub fn buffer(&self) -> &CaptureBuffer {
        &self.buffer
    }

    pub fn cursor(&self) -> &DecoderCursor {
        &self.cursor
    }

    pub fn sample_rate(&self) -> u64 {
        self.sample_rate
    }

    /// Trigger point found while streaming, if any.
    pub fn trigger_point(&self) -> Option<TriggerPoint> {
        self.trigger
    }

    /// Continue decoding until one of `conditions` fires.
    ///
    /// Keep passing the same `progress` to let skip conditions count across
    /// calls. Returns [`PicoError::EndOfStream`] once the capture is used up.
    pub fn wait(
        &mut self,
        conditions: &[TriggerCondition],
        progress: &mut SkipProgress,
    ) -> Result<TriggerMatch, PicoError> {
        Ok(trigger_matcher::wait(self, conditions, progress)?)
    }

    pub fn wait_for(&mut self, conditions: &[TriggerCondition]) -> Result<TriggerMatch, PicoError> {
        self.wait(conditions, &mut SkipProgress::new(conditions))
    }

    /// Decode everything left into `sink`, handing over runs in one piece.
    /// Returns the number of samples delivered.
    pub fn decode_into<S: SampleSink + ?Sized>(
        &mut self,
        sink: &mut S,
    ) -> Result<u64, FramingError> {
        crate::profile_span!("decode_into");

        let mut delivered = 0;
        loop {
            let run = self.cursor.run_remaining();
            if run > 0 {
                if let Some(current) = self.cursor.current() {
                    sink.put(self.cursor.samples_consumed(), run, current);
                    self.cursor.consume_run(run);
                    delivered += run;
                    continue;
                }
            }

            match self.decoder.decode_next(&self.buffer, &mut self.cursor) {
                Ok(sample) => {
                    sink.put(self.cursor.samples_consumed().saturating_sub(1), 1, &sample);
                    delivered += 1;
                }
                Err(DecodeError::EndOfStream) => return Ok(delivered),
                Err(DecodeError::Framing(e)) => return Err(e),
            }
        }
    }

    /// Decode the rest of the capture into a table with a `sample` index, a
    /// `time` column in seconds and one column per channel.
    pub fn into_dataframe(mut self) -> Result<DataFrame, PicoError> {
        let digital_names = self.config.digital_names.clone();
        let analog_names = self.config.analog_names.clone();

        let mut index: Vec<u64> = Vec::new();
        let mut digital: Vec<Vec<bool>> = vec![Vec::new(); digital_names.len()];
        let mut analog: Vec<Vec<f64>> = vec![Vec::new(); analog_names.len()];

        self.decode_into(&mut |first: u64, count: u64, sample: &Sample| {
            index.extend(first..first + count);
            for (bit, column) in digital.iter_mut().enumerate() {
                let level = sample.bit(bit as u8);
                column.extend(std::iter::repeat(level).take(count as usize));
            }
            for (channel, column) in analog.iter_mut().enumerate() {
                let volts = sample.analog.get(channel).copied().unwrap_or(f64::NAN);
                column.extend(std::iter::repeat(volts).take(count as usize));
            }
        })?;

        let mut columns: Vec<Column> = vec![Series::new(SAMPLE_COLUMN_NAME.into(), index).into()];
        for (name, values) in digital_names.iter().zip(digital) {
            columns.push(Series::new(name.as_str().into(), values).into());
        }
        for (name, values) in analog_names.iter().zip(analog) {
            columns.push(Series::new(name.as_str().into(), values).into());
        }

        let mut order = vec![col(TIME_COLUMN_NAME), col(SAMPLE_COLUMN_NAME)];
        order.extend(
            digital_names
                .iter()
                .chain(analog_names.iter())
                .map(|name| col(name.as_str())),
        );

        let df = DataFrame::new(columns)?
            .lazy()
            .with_column(
                (col(SAMPLE_COLUMN_NAME).cast(DataType::Float64)
                    * lit(1.0 / self.sample_rate as f64))
                .alias(TIME_COLUMN_NAME),
            )
            .select(order)
            .collect()?;
        Ok(df)
    }
}

impl SampleSource for Acquisition {
    fn current(&self) -> Option<&Sample> {
        self.cursor.current()
    }

    fn run_remaining(&self) -> u64 {
        self.cursor.run_remaining()
    }

    fn consume_run(&mut self, count: u64) {
        self.cursor.consume_run(count);
    }

    fn samples_consumed(&self) -> u64 {
        self.cursor.samples_consumed()
    }

    fn next_sample(&mut self) -> Result<Sample, DecodeError> {
        self.decoder.decode_next(&self.buffer, &mut self.cursor)
    }
}
