//! Playback sources
//!
//! A [`ClipReader`] exposes the trim window of a source, with gain
//! applied, to whichever output consumes it. File sources are decoded
//! with symphonia one packet at a time after seeking to the window
//! start, so memory and start-up cost follow the window, not the file.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};

use crate::constants::{MAX_GAIN_DB, MIN_GAIN_DB};
use crate::error::AudioError;
use crate::protocol::AudioFormat;

/// Interleaved samples already in memory
#[derive(Debug, Clone)]
pub struct Clip {
    samples: Arc<Vec<f32>>,
    sample_rate: u32,
    channels: u16,
}

impl Clip {
    pub fn from_samples(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples: Arc::new(samples),
            sample_rate: sample_rate.max(1),
            channels: channels.max(1),
        }
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat::float(self.sample_rate, self.channels)
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn duration_ms(&self) -> u64 {
        self.frames() as u64 * 1000 / self.sample_rate as u64
    }
}

/// An audio file that has been opened and probed but not decoded
///
/// Opening is cheap and catches missing, locked or unrecognised files.
pub struct SourceFile {
    path: PathBuf,
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: u16,
    time_base: Option<TimeBase>,
    n_frames: Option<u64>,
}

impl SourceFile {
    pub fn open(path: &Path) -> Result<Self, AudioError> {
        let file = File::open(path)
            .map_err(|e| AudioError::SourceUnavailable(format!("{}: {}", path.display(), e)))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| AudioError::DecodeFailed(format!("probe {}: {}", path.display(), e)))?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| AudioError::DecodeFailed(format!("{}: no audio track", path.display())))?;
        let params = &track.codec_params;
        let track_id = track.id;
        let sample_rate = params.sample_rate.unwrap_or(0);
        let channels = params.channels.map(|c| c.count() as u16).unwrap_or(0);
        if sample_rate == 0 || channels == 0 {
            return Err(AudioError::UnsupportedFormat(format!(
                "{}: unknown sample rate or channel count",
                path.display()
            )));
        }
        let time_base = params.time_base;
        let n_frames = params.n_frames;

        let decoder = symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .map_err(|e| AudioError::DecodeFailed(e.to_string()))?;

        Ok(Self {
            path: path.to_path_buf(),
            format,
            decoder,
            track_id,
            sample_rate,
            channels,
            time_base,
            n_frames,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat::float(self.sample_rate, self.channels)
    }

    /// Length from the container, when it declares one
    pub fn duration_ms(&self) -> Option<u64> {
        self.n_frames
            .map(|frames| frames * 1000 / self.sample_rate as u64)
    }

    /// Position the reader at `frame`; returns how many decoded frames
    /// still precede it
    fn seek_to_frame(&mut self, frame: u64) -> u64 {
        if frame == 0 {
            return 0;
        }
        let to = SeekTo::Time {
            time: Time::from(frame as f64 / self.sample_rate as f64),
            track_id: Some(self.track_id),
        };
        match self.format.seek(SeekMode::Accurate, to) {
            Ok(seeked) => {
                self.decoder.reset();
                let behind = seeked.required_ts.saturating_sub(seeked.actual_ts);
                match self.time_base {
                    Some(tb) => {
                        let t = tb.calc_time(behind);
                        ((t.seconds as f64 + t.frac) * self.sample_rate as f64).round() as u64
                    }
                    None => behind,
                }
            }
            Err(e) => {
                // Decode from the top and drop everything before the window
                tracing::debug!("Seek in {} failed: {}", self.path.display(), e);
                frame
            }
        }
    }
}

/// Packet-at-a-time decoder over an opened file
struct FileStream {
    source: SourceFile,
    pending: Vec<f32>,
    offset: usize,
    /// Samples still to drop before the window starts
    skip: usize,
    scratch: Option<SampleBuffer<f32>>,
    exhausted: bool,
}

impl FileStream {
    fn new(mut source: SourceFile, start_frame: u64) -> Self {
        let skip_frames = source.seek_to_frame(start_frame);
        let skip = skip_frames as usize * source.channels as usize;
        Self {
            source,
            pending: Vec::new(),
            offset: 0,
            skip,
            scratch: None,
            exhausted: false,
        }
    }

    fn read_into(&mut self, out: &mut [f32]) -> usize {
        let mut written = 0;
        while written < out.len() {
            if self.offset == self.pending.len() && !self.refill() {
                break;
            }
            let n = (self.pending.len() - self.offset).min(out.len() - written);
            out[written..written + n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
            self.offset += n;
            written += n;
        }
        written
    }

    /// Decode packets until one yields samples inside the window
    fn refill(&mut self) -> bool {
        if self.exhausted {
            return false;
        }
        loop {
            let packet = match self.source.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    self.exhausted = true;
                    return false;
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.source.decoder.reset();
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Reading {} stopped: {}", self.source.path.display(), e);
                    self.exhausted = true;
                    return false;
                }
            };
            if packet.track_id() != self.source.track_id {
                continue;
            }

            let decoded = match self.source.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    tracing::warn!(
                        "Skipping corrupt packet in {}: {}",
                        self.source.path.display(),
                        e
                    );
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Decoding {} stopped: {}", self.source.path.display(), e);
                    self.exhausted = true;
                    return false;
                }
            };

            let spec = *decoded.spec();
            let frames = decoded.capacity() as u64;
            let required = frames as usize * spec.channels.count();
            if self.scratch.as_ref().map_or(true, |buf| buf.capacity() < required) {
                self.scratch = Some(SampleBuffer::new(frames, spec));
            }
            let Some(buf) = self.scratch.as_mut() else {
                continue;
            };
            buf.copy_interleaved_ref(decoded);

            self.pending.clear();
            self.pending.extend_from_slice(buf.samples());
            self.offset = self.skip.min(self.pending.len());
            self.skip -= self.offset;
            if self.offset < self.pending.len() {
                return true;
            }
        }
    }
}

enum Frames {
    Memory { clip: Clip, position: usize },
    File(Box<FileStream>),
}

/// Linear gain for a dB value clamped to the accepted range
pub fn db_to_gain(gain_db: f32) -> f32 {
    let db = if gain_db.is_nan() {
        0.0
    } else {
        gain_db.clamp(MIN_GAIN_DB, MAX_GAIN_DB)
    };
    10f32.powf(db / 20.0)
}

/// Effective `[start, end)` in ms for a requested window over `total_ms`
///
/// `end_ms == 0` means the end of the clip.
pub fn effective_window(start_ms: u64, end_ms: u64, total_ms: u64) -> (u64, u64) {
    let start = start_ms.min(total_ms);
    let end = if end_ms == 0 { total_ms } else { end_ms.min(total_ms) };
    (start, end.max(start))
}

fn frame_at_ms(ms: u64, sample_rate: u32) -> u64 {
    (ms as u128 * sample_rate as u128 / 1000).min(u64::MAX as u128) as u64
}

/// Reads the trim window of a source with gain applied
pub struct ClipReader {
    frames: Frames,
    format: AudioFormat,
    /// Samples left in the window; `None` reads until the source ends
    remaining: Option<usize>,
    gain: f32,
    window_ms: (u64, u64),
}

impl ClipReader {
    /// Window over samples already in memory
    pub fn new(clip: Clip, start_ms: u64, end_ms: u64, gain_db: f32) -> Self {
        let format = clip.format();
        let window_ms = effective_window(start_ms, end_ms, clip.duration_ms());
        let channels = format.channels as usize;
        let total = clip.frames() as u64;

        let start = frame_at_ms(window_ms.0, format.sample_rate).min(total);
        let end = if end_ms == 0 {
            total
        } else {
            frame_at_ms(window_ms.1, format.sample_rate).min(total)
        };

        Self {
            frames: Frames::Memory {
                clip,
                position: start as usize * channels,
            },
            format,
            remaining: Some(end.saturating_sub(start) as usize * channels),
            gain: db_to_gain(gain_db),
            window_ms,
        }
    }

    /// Window over a file, decoded as it is read
    pub fn from_source(source: SourceFile, start_ms: u64, end_ms: u64, gain_db: f32) -> Self {
        let format = source.format();
        let channels = format.channels as usize;
        let total_ms = source.duration_ms().unwrap_or(u64::MAX);
        let window_ms = effective_window(start_ms, end_ms, total_ms);

        let start = frame_at_ms(window_ms.0, format.sample_rate);
        let remaining = if end_ms == 0 {
            None
        } else {
            let end = frame_at_ms(window_ms.1, format.sample_rate);
            Some(end.saturating_sub(start) as usize * channels)
        };

        Self {
            frames: Frames::File(Box::new(FileStream::new(source, start))),
            format,
            remaining,
            gain: db_to_gain(gain_db),
            window_ms,
        }
    }

    /// Fill `out` with up to `out.len()` samples, whole frames only.
    ///
    /// Returns the number of samples written; 0 once the window is exhausted.
    pub fn read(&mut self, out: &mut [f32]) -> usize {
        let channels = self.format.channels as usize;
        let mut want = out.len() / channels * channels;
        if let Some(remaining) = self.remaining {
            want = want.min(remaining);
        }
        if want == 0 {
            return 0;
        }

        let n = match &mut self.frames {
            Frames::Memory { clip, position } => {
                let n = want.min(clip.samples.len() - *position);
                out[..n].copy_from_slice(&clip.samples[*position..*position + n]);
                *position += n;
                n
            }
            Frames::File(stream) => stream.read_into(&mut out[..want]),
        };

        for s in &mut out[..n] {
            *s *= self.gain;
        }
        self.remaining = match self.remaining {
            _ if n == 0 => Some(0),
            Some(remaining) => Some(remaining - n),
            None => None,
        };
        n
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Effective window in ms after clamping
    pub fn window_ms(&self) -> (u64, u64) {
        self.window_ms
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Frames left in the window, when the window end is known
    pub fn remaining_frames(&self) -> Option<usize> {
        self.remaining
            .map(|samples| samples / self.format.channels as usize)
    }

    pub fn is_finished(&self) -> bool {
        self.remaining == Some(0)
    }
}

impl std::fmt::Debug for ClipReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipReader")
            .field("format", &self.format)
            .field("window_ms", &self.window_ms)
            .field("remaining", &self.remaining)
            .field("gain", &self.gain)
            .finish()
    }
}
