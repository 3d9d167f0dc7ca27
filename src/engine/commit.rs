//! Writing captured audio to disk

use chrono::{DateTime, TimeZone};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CaptureError, Result};
use crate::protocol::{AudioFormat, ChannelId};

/// Where a committed capture went and how long it is
#[derive(Debug, Clone, PartialEq)]
pub struct CommitResult {
    pub file_path: PathBuf,
    pub duration: Duration,
}

/// `Pad{NN}_Echo_{yyyyMMdd_HHmmss}`
pub fn capture_file_stem<Tz: TimeZone>(channel: ChannelId, now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("Pad{:02}_Echo_{}", channel, now.format("%Y%m%d_%H%M%S"))
}

/// Float sample to 16-bit PCM, clamped and rounded
pub fn to_pcm16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16
}

/// Write interleaved samples as a 16-bit PCM WAV file `<dir>/<stem>.wav`
pub fn write_wav(
    samples: &[f32],
    format: AudioFormat,
    dir: &Path,
    stem: &str,
) -> Result<CommitResult> {
    if samples.is_empty() {
        return Err(CaptureError::Empty.into());
    }
    std::fs::create_dir_all(dir)?;

    let file_path = dir.join(format!("{}.wav", stem));
    let spec = hound::WavSpec {
        channels: format.channels.max(1),
        sample_rate: format.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(&file_path, spec)?;
    for &s in samples {
        writer.write_sample(to_pcm16(s))?;
    }
    writer.finalize()?;

    let duration =
        Duration::from_secs_f64(samples.len() as f64 / format.samples_per_second().max(1) as f64);
    tracing::info!(
        "Committed {:.2} s of capture to {}",
        duration.as_secs_f64(),
        file_path.display()
    );

    Ok(CommitResult {
        file_path,
        duration,
    })
}
