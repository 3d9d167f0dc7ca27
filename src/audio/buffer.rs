//! Rolling capture buffer with metering
//!
//! A fixed-capacity ring of interleaved `f32` samples. Once full, new
//! samples overwrite the oldest. A single mutex guards the whole ring:
//! one writer (device or network callback) and any number of readers
//! (meters, commit).

use parking_lot::Mutex;
use std::sync::Arc;

use crate::constants::{DEFAULT_METER_WINDOW_MS, SILENCE_DB};
use crate::protocol::AudioFormat;

/// Linear values at or below this read as silence
const SILENCE_THRESHOLD: f32 = 1e-6;

struct Ring {
    data: Vec<f32>,
    write: usize,
    filled: usize,
    format: AudioFormat,
}

impl Ring {
    fn allocate(seconds: u32, format: AudioFormat) -> Self {
        let capacity = (seconds.max(1) as usize * format.samples_per_second()).max(1);
        Self {
            data: vec![0.0; capacity],
            write: 0,
            filled: 0,
            format,
        }
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn push(&mut self, samples: &[f32]) {
        let cap = self.capacity();
        if samples.len() >= cap {
            self.data.copy_from_slice(&samples[samples.len() - cap..]);
            self.write = 0;
            self.filled = cap;
            return;
        }

        let first = (cap - self.write).min(samples.len());
        self.data[self.write..self.write + first].copy_from_slice(&samples[..first]);
        let rest = samples.len() - first;
        if rest > 0 {
            self.data[..rest].copy_from_slice(&samples[first..]);
        }
        self.write = (self.write + samples.len()) % cap;
        self.filled = (self.filled + samples.len()).min(cap);
    }

    /// The newest `n` samples in chronological order, as two slices
    fn recent(&self, n: usize) -> (&[f32], &[f32]) {
        let cap = self.capacity();
        let n = n.min(self.filled);
        let start = (self.write + cap - n) % cap;
        if start + n <= cap {
            (&self.data[start..start + n], &[])
        } else {
            (&self.data[start..], &self.data[..self.write])
        }
    }

    /// Newest whole frames covering `window_ms`, capped at what is buffered
    fn window_samples(&self, window_ms: u32) -> usize {
        let window_ms = if window_ms == 0 {
            DEFAULT_METER_WINDOW_MS
        } else {
            window_ms
        };
        let channels = self.format.channels.max(1) as usize;
        let frames = self.format.sample_rate as u64 * window_ms as u64 / 1000;
        let available = self.filled / channels;
        (frames as usize).min(available) * channels
    }

    /// Visit the mono downmix of the newest frames covering `window_ms`
    fn for_each_mono<F: FnMut(f32)>(&self, window_ms: u32, mut f: F) -> usize {
        let n = self.window_samples(window_ms);
        if n == 0 {
            return 0;
        }
        let channels = self.format.channels.max(1) as usize;
        let (a, b) = self.recent(n);

        let mut acc = 0.0f32;
        let mut k = 0;
        for &s in a.iter().chain(b) {
            acc += s;
            k += 1;
            if k == channels {
                f(acc / channels as f32);
                acc = 0.0;
                k = 0;
            }
        }
        n / channels
    }

    fn to_vec(&self, n: usize) -> Vec<f32> {
        let (a, b) = self.recent(n);
        let mut out = Vec::with_capacity(a.len() + b.len());
        out.extend_from_slice(a);
        out.extend_from_slice(b);
        out
    }
}

/// Rolling buffer shared between a capture source and its readers
pub struct RollingBuffer {
    inner: Mutex<Ring>,
}

/// Shared rolling buffer handle
pub type SharedRollingBuffer = Arc<RollingBuffer>;

impl RollingBuffer {
    /// Buffer holding `seconds` (at least 1) of audio in `format`
    pub fn new(seconds: u32, format: AudioFormat) -> Self {
        Self {
            inner: Mutex::new(Ring::allocate(seconds, format)),
        }
    }

    /// Reallocate for a new length or format and discard all samples
    pub fn reset(&self, seconds: u32, format: AudioFormat) {
        *self.inner.lock() = Ring::allocate(seconds, format);
    }

    /// Append interleaved samples, overwriting the oldest once full
    pub fn add_samples(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        self.inner.lock().push(samples);
    }

    /// RMS of the mono downmix over the newest `window_ms`, in [0, 1]
    pub fn rms_last_ms(&self, window_ms: u32) -> f32 {
        let ring = self.inner.lock();
        let mut sum = 0.0f64;
        let frames = ring.for_each_mono(window_ms, |m| sum += (m as f64) * (m as f64));
        if frames == 0 {
            return 0.0;
        }
        clamp_unit((sum / frames as f64).sqrt() as f32)
    }

    /// Peak of the mono downmix over the newest `window_ms`, in [0, 1]
    pub fn peak_last_ms(&self, window_ms: u32) -> f32 {
        let ring = self.inner.lock();
        let mut peak = 0.0f32;
        ring.for_each_mono(window_ms, |m| {
            let a = m.abs();
            if a > peak {
                peak = a;
            }
        });
        clamp_unit(peak)
    }

    /// RMS in dBFS, floored at -90
    pub fn db_last_ms(&self, window_ms: u32) -> f32 {
        linear_to_db(self.rms_last_ms(window_ms))
    }

    /// Peak in dBFS, floored at -90
    pub fn peak_db_last_ms(&self, window_ms: u32) -> f32 {
        linear_to_db(self.peak_last_ms(window_ms))
    }

    /// Every buffered sample, oldest first
    pub fn read_all(&self) -> Vec<f32> {
        let ring = self.inner.lock();
        ring.to_vec(ring.filled)
    }

    /// The newest `seconds` of audio, oldest first
    pub fn snapshot_last_seconds(&self, seconds: f32) -> Vec<f32> {
        if seconds.is_nan() || seconds <= 0.0 {
            return Vec::new();
        }
        let ring = self.inner.lock();
        let channels = ring.format.channels.max(1) as usize;
        let frames = (seconds as f64 * ring.format.sample_rate as f64).round() as usize;
        ring.to_vec(frames.saturating_mul(channels))
    }

    pub fn format(&self) -> AudioFormat {
        self.inner.lock().format
    }

    /// Capacity in samples
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    /// Buffered samples, never more than capacity
    pub fn filled(&self) -> usize {
        self.inner.lock().filled
    }
}

fn clamp_unit(x: f32) -> f32 {
    if x.is_finite() {
        x.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// dBFS of a linear amplitude, in [-90, 0]
pub fn linear_to_db(x: f32) -> f32 {
    if x.is_nan() || x <= SILENCE_THRESHOLD {
        return SILENCE_DB;
    }
    (20.0 * x.log10()).clamp(SILENCE_DB, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn mono(rate: u32) -> AudioFormat {
        AudioFormat::float(rate, 1)
    }

    #[test]
    fn test_capacity() {
        let buf = RollingBuffer::new(2, AudioFormat::float(48000, 2));
        assert_eq!(buf.capacity(), 2 * 48000 * 2);
        assert_eq!(buf.filled(), 0);

        buf.reset(0, mono(1000));
        assert_eq!(buf.capacity(), 1000);
    }

    #[test]
    fn test_wraps_and_keeps_order() {
        let buf = RollingBuffer::new(1, mono(4));
        buf.add_samples(&[1.0, 2.0, 3.0]);
        assert_eq!(buf.read_all(), vec![1.0, 2.0, 3.0]);

        buf.add_samples(&[4.0, 5.0]);
        assert_eq!(buf.read_all(), vec![2.0, 3.0, 4.0, 5.0]);
        assert_eq!(buf.filled(), 4);
    }

    #[test]
    fn test_oversized_add_keeps_tail() {
        let buf = RollingBuffer::new(1, mono(4));
        buf.add_samples(&[9.0]);
        buf.add_samples(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(buf.read_all(), vec![3.0, 4.0, 5.0, 6.0]);
        buf.add_samples(&[7.0]);
        assert_eq!(buf.read_all(), vec![4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_empty_meters_floor() {
        let buf = RollingBuffer::new(1, AudioFormat::default());
        assert_eq!(buf.rms_last_ms(120), 0.0);
        assert_eq!(buf.peak_last_ms(120), 0.0);
        assert_eq!(buf.db_last_ms(120), SILENCE_DB);
        assert_eq!(buf.peak_db_last_ms(120), SILENCE_DB);
    }

    #[test]
    fn test_rms_of_constant() {
        let buf = RollingBuffer::new(1, mono(1000));
        buf.add_samples(&vec![0.5; 1000]);
        assert_relative_eq!(buf.rms_last_ms(100), 0.5, epsilon = 1e-6);
        assert_relative_eq!(buf.db_last_ms(100), -6.0206, epsilon = 1e-3);
    }

    #[test]
    fn test_downmix_before_metering() {
        // Opposite-phase stereo cancels to silence in the mono mix
        let buf = RollingBuffer::new(1, AudioFormat::float(1000, 2));
        let samples: Vec<f32> = (0..200).map(|i| if i % 2 == 0 { 0.8 } else { -0.8 }).collect();
        buf.add_samples(&samples);
        assert_eq!(buf.peak_last_ms(50), 0.0);

        buf.add_samples(&[0.6, 0.2]);
        assert_relative_eq!(buf.peak_last_ms(50), 0.4, epsilon = 1e-6);
    }

    #[test]
    fn test_window_only_sees_recent() {
        let buf = RollingBuffer::new(1, mono(1000));
        buf.add_samples(&vec![1.0; 500]);
        buf.add_samples(&vec![0.0; 100]);
        assert_eq!(buf.peak_last_ms(100), 0.0);
        assert_eq!(buf.peak_last_ms(101), 1.0);
        // Window longer than the data uses what is there
        assert_eq!(buf.peak_last_ms(5000), 1.0);
    }

    #[test]
    fn test_meters_clamped() {
        let buf = RollingBuffer::new(1, mono(1000));
        buf.add_samples(&[4.0, -3.0, f32::NAN]);
        assert!(buf.peak_last_ms(10) <= 1.0);
        assert!(buf.rms_last_ms(10) >= 0.0 && buf.rms_last_ms(10) <= 1.0);
        assert!(buf.peak_db_last_ms(10) <= 0.0);
    }

    #[test]
    fn test_snapshot_last_seconds() {
        let buf = RollingBuffer::new(2, AudioFormat::float(4, 2));
        let samples: Vec<f32> = (0..12).map(|i| i as f32).collect();
        buf.add_samples(&samples);
        assert_eq!(buf.snapshot_last_seconds(1.0), (4..12).map(|i| i as f32).collect::<Vec<_>>());
        assert_eq!(buf.snapshot_last_seconds(10.0), samples);
        assert!(buf.snapshot_last_seconds(0.0).is_empty());
    }

    #[test]
    fn test_linear_to_db() {
        assert_eq!(linear_to_db(0.0), SILENCE_DB);
        assert_eq!(linear_to_db(1e-7), SILENCE_DB);
        assert_eq!(linear_to_db(1.0), 0.0);
        assert_relative_eq!(linear_to_db(0.1), -20.0, epsilon = 1e-4);
    }

    proptest! {
        #[test]
        fn read_all_returns_last_capacity_samples(
            adds in prop::collection::vec(prop::collection::vec(-1.0f32..1.0, 0..40), 0..20)
        ) {
            let buf = RollingBuffer::new(1, mono(16));
            let mut all = Vec::new();
            for chunk in &adds {
                buf.add_samples(chunk);
                all.extend_from_slice(chunk);
            }
            let keep = all.len().min(16);
            prop_assert_eq!(buf.read_all(), all[all.len() - keep..].to_vec());
        }

        #[test]
        fn meters_stay_in_unit_range(samples in prop::collection::vec(-4.0f32..4.0, 0..500)) {
            let buf = RollingBuffer::new(1, AudioFormat::float(1000, 2));
            buf.add_samples(&samples);
            let rms = buf.rms_last_ms(120);
            let peak = buf.peak_last_ms(120);
            prop_assert!((0.0..=1.0).contains(&rms));
            prop_assert!((0.0..=1.0).contains(&peak));
            prop_assert!(buf.db_last_ms(120) >= SILENCE_DB && buf.db_last_ms(120) <= 0.0);
        }
    }
}
