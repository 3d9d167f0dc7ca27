//! Local playback outputs
//!
//! An output renders a [`ClipReader`] until the reader is exhausted or
//! the cancel channel fires. Rendering blocks the calling thread, which
//! is the playback worker of one channel.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use crate::audio::device::resolve_output;
use crate::audio::source::ClipReader;
use crate::error::{contain_panic, AudioError};
use crate::protocol::AudioFormat;

/// How a render call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    /// The trim window was played to its end
    Finished,
    /// The cancel channel fired first
    Cancelled,
}

/// Where local playback goes
pub trait LocalOutput: Send + Sync + 'static {
    /// Render `reader` until it is exhausted or `cancel` receives a
    /// message or disconnects.
    fn render(
        &self,
        device_id: &str,
        reader: ClipReader,
        cancel: &Receiver<()>,
    ) -> Result<RenderOutcome, AudioError>;

    fn name(&self) -> &'static str;
}

/// Maps clip frames onto an output's channel count and sample rate
///
/// Channels: mono is duplicated, anything to mono is averaged, otherwise
/// channels map one to one and extras are silent. Rate differences are
/// bridged with linear interpolation.
pub struct FrameAdapter {
    reader: ClipReader,
    in_channels: usize,
    out_channels: usize,
    step: f64,
    frac: f64,
    current: Vec<f32>,
    next: Vec<f32>,
    source_done: bool,
    finished: bool,
}

impl FrameAdapter {
    pub fn new(mut reader: ClipReader, out_rate: u32, out_channels: u16) -> Self {
        let format = reader.format();
        let in_channels = format.channels.max(1) as usize;
        let mut current = vec![0.0; in_channels];
        let mut next = vec![0.0; in_channels];

        let finished = reader.read(&mut current) == 0;
        let source_done = finished || reader.read(&mut next) == 0;
        if source_done {
            next.copy_from_slice(&current);
        }

        Self {
            reader,
            in_channels,
            out_channels: out_channels.max(1) as usize,
            step: format.sample_rate as f64 / out_rate.max(1) as f64,
            frac: 0.0,
            current,
            next,
            source_done,
            finished,
        }
    }

    /// Fill `out` with interleaved output frames; silence after the end.
    ///
    /// Returns false once the source has been fully rendered.
    pub fn fill(&mut self, out: &mut [f32]) -> bool {
        for frame in out.chunks_mut(self.out_channels) {
            if self.finished {
                frame.fill(0.0);
                continue;
            }

            let t = self.frac as f32;
            for (c, slot) in frame.iter_mut().enumerate() {
                *slot = self.mapped(c, t);
            }

            self.frac += self.step;
            while self.frac >= 1.0 {
                self.frac -= 1.0;
                if self.source_done {
                    self.finished = true;
                    break;
                }
                std::mem::swap(&mut self.current, &mut self.next);
                if self.reader.read(&mut self.next) == 0 {
                    self.source_done = true;
                    self.next.copy_from_slice(&self.current);
                }
            }
        }
        !self.finished
    }

    fn sample(&self, c: usize, t: f32) -> f32 {
        let a = self.current[c];
        a + (self.next[c] - a) * t
    }

    fn mapped(&self, out_c: usize, t: f32) -> f32 {
        if self.in_channels == 1 {
            self.sample(0, t)
        } else if self.out_channels == 1 {
            (0..self.in_channels).map(|c| self.sample(c, t)).sum::<f32>() / self.in_channels as f32
        } else if out_c < self.in_channels {
            self.sample(out_c, t)
        } else {
            0.0
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Renders to a cpal output device
///
/// Unknown device ids fall back to the default output device.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalOutput;

impl CpalOutput {
    pub fn new() -> Self {
        Self
    }
}

impl LocalOutput for CpalOutput {
    fn render(
        &self,
        device_id: &str,
        reader: ClipReader,
        cancel: &Receiver<()>,
    ) -> Result<RenderOutcome, AudioError> {
        let device = resolve_output(device_id)?;
        let clip_format = reader.format();
        let (config, sample_format) = choose_output_config(&device, clip_format)?;

        if config.sample_rate.0 != clip_format.sample_rate {
            tracing::debug!(
                "Output runs at {} Hz, converting from {} Hz",
                config.sample_rate.0,
                clip_format.sample_rate
            );
        }

        let adapter = FrameAdapter::new(reader, config.sample_rate.0, config.channels);
        let (done_tx, done_rx) = bounded::<()>(1);
        let (err_tx, err_rx) = bounded::<String>(4);

        let stream = match sample_format {
            SampleFormat::F32 => build_stream::<f32>(&device, &config, adapter, done_tx, err_tx)?,
            SampleFormat::I16 => build_stream::<i16>(&device, &config, adapter, done_tx, err_tx)?,
            SampleFormat::U16 => build_stream::<u16>(&device, &config, adapter, done_tx, err_tx)?,
            other => {
                return Err(AudioError::UnsupportedFormat(format!("{:?}", other)));
            }
        };
        stream.play()?;

        let outcome = select! {
            recv(cancel) -> _ => Ok(RenderOutcome::Cancelled),
            recv(done_rx) -> _ => Ok(RenderOutcome::Finished),
            recv(err_rx) -> msg => Err(AudioError::StreamError(
                msg.unwrap_or_else(|_| "output stream closed".to_string()),
            )),
        };

        if let Err(e) = stream.pause() {
            tracing::debug!("Pausing output stream failed: {}", e);
        }
        drop(stream);
        outcome
    }

    fn name(&self) -> &'static str {
        "cpal"
    }
}

/// Prefer a config at the clip's rate and channel count, in a sample
/// format the renderer writes; else the device default
fn choose_output_config(
    device: &cpal::Device,
    wanted: AudioFormat,
) -> Result<(StreamConfig, SampleFormat), AudioError> {
    let rate = cpal::SampleRate(wanted.sample_rate);
    let writable = |f: SampleFormat| matches!(f, SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16);

    if let Ok(ranges) = device.supported_output_configs() {
        let mut candidates: Vec<_> = ranges
            .filter(|r| writable(r.sample_format()))
            .filter(|r| r.min_sample_rate() <= rate && rate <= r.max_sample_rate())
            .collect();
        candidates.sort_by_key(|r| {
            (
                r.channels() != wanted.channels,
                r.sample_format() != SampleFormat::F32,
            )
        });
        if let Some(range) = candidates.into_iter().next() {
            let supported = range.with_sample_rate(rate);
            return Ok((supported.config(), supported.sample_format()));
        }
    }

    let default = device.default_output_config()?;
    Ok((default.config(), default.sample_format()))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut adapter: FrameAdapter,
    done_tx: Sender<()>,
    err_tx: Sender<String>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<f32>,
{
    let mut scratch: Vec<f32> = Vec::new();
    let mut signalled = false;

    let stream = device.build_output_stream(
        config,
        move |out: &mut [T], _: &cpal::OutputCallbackInfo| {
            contain_panic("output callback", || {
                if scratch.len() < out.len() {
                    scratch.resize(out.len(), 0.0);
                }
                let more = adapter.fill(&mut scratch[..out.len()]);
                for (dst, &s) in out.iter_mut().zip(scratch.iter()) {
                    *dst = T::from_sample(s);
                }
                if !more && !signalled {
                    signalled = true;
                    let _ = done_tx.try_send(());
                }
            });
        },
        move |err| {
            tracing::warn!("Output stream error: {}", err);
            let _ = err_tx.try_send(err.to_string());
        },
        None,
    )?;
    Ok(stream)
}

/// Consumes the clip in real time without a device
///
/// Used on headless hosts and in tests; the timing of natural end
/// matches a real device.
#[derive(Debug, Clone, Copy)]
pub struct NullOutput {
    chunk: Duration,
}

impl NullOutput {
    pub fn new() -> Self {
        Self {
            chunk: Duration::from_millis(10),
        }
    }
}

impl Default for NullOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalOutput for NullOutput {
    fn render(
        &self,
        _device_id: &str,
        mut reader: ClipReader,
        cancel: &Receiver<()>,
    ) -> Result<RenderOutcome, AudioError> {
        let format = reader.format();
        let frames_per_chunk =
            ((format.sample_rate as u128 * self.chunk.as_micros()) / 1_000_000).max(1) as usize;
        let mut buf = vec![0.0f32; frames_per_chunk * format.channels.max(1) as usize];

        let start = Instant::now();
        let mut played_frames: u64 = 0;
        loop {
            let n = reader.read(&mut buf);
            if n == 0 {
                return Ok(RenderOutcome::Finished);
            }
            played_frames += (n / format.channels.max(1) as usize) as u64;

            let deadline = start
                + Duration::from_micros(played_frames * 1_000_000 / format.sample_rate.max(1) as u64);
            match cancel.recv_deadline(deadline) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    return Ok(RenderOutcome::Cancelled);
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "null"
    }
}
