//! Engine facade
//!
//! `PadEngine` is what a controller talks to: per-channel playback,
//! per-channel rolling capture, metering and commit-to-file.

pub mod channels;
pub mod commit;
pub mod playback;

pub use channels::ChannelTable;
pub use commit::{capture_file_stem, CommitResult};
pub use playback::{frame_duration, EndReason, PlaybackEngine, PlaybackEvent, PlaybackMode};

use crossbeam_channel::Receiver;
use std::path::Path;
use std::sync::Arc;

use crate::audio::buffer::SharedRollingBuffer;
use crate::audio::capture::CaptureTap;
use crate::audio::playback::LocalOutput;
use crate::config::EngineConfig;
use crate::constants::SILENCE_DB;
use crate::error::{CaptureError, Result};
use crate::protocol::{AudioDeviceInfo, AudioFormat, ChannelId, Endpoint, PlaybackRequest};

pub struct PadEngine {
    config: EngineConfig,
    playback: PlaybackEngine,
    taps: ChannelTable<CaptureTap>,
}

impl PadEngine {
    /// Engine rendering local playback through cpal
    pub fn new(config: EngineConfig) -> Self {
        let playback = PlaybackEngine::with_cpal(config.network.clone());
        Self::assemble(config, playback)
    }

    /// Engine rendering local playback through `output`
    pub fn with_output(config: EngineConfig, output: Arc<dyn LocalOutput>) -> Self {
        let playback = PlaybackEngine::new(output, config.network.clone());
        Self::assemble(config, playback)
    }

    fn assemble(config: EngineConfig, playback: PlaybackEngine) -> Self {
        tracing::info!(
            "Engine ready (rolling {} s, meter window {} ms)",
            config.rolling_seconds,
            config.meter_window_ms
        );
        Self {
            config,
            playback,
            taps: ChannelTable::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn playback(&self) -> &PlaybackEngine {
        &self.playback
    }

    // Playback

    /// Play a clip on `channel`, replacing whatever was playing there
    pub fn play(&self, channel: ChannelId, request: &PlaybackRequest) -> Result<()> {
        self.playback.play(channel, request)
    }

    /// Stop `channel`; returns whether anything was playing
    pub fn stop(&self, channel: ChannelId) -> bool {
        self.playback.stop(channel)
    }

    pub fn events(&self) -> Receiver<PlaybackEvent> {
        self.playback.events()
    }

    pub fn is_playing(&self, channel: ChannelId) -> bool {
        self.playback.is_playing(channel)
    }

    // Capture

    /// Start a rolling capture on `channel`. An existing tap on the
    /// channel is stopped first. `rolling_seconds` of 0 uses the
    /// configured length.
    pub fn start_capture(
        &self,
        channel: ChannelId,
        endpoint: Endpoint,
        rolling_seconds: u32,
    ) -> Result<()> {
        self.stop_capture(channel);

        let seconds = self.config.rolling_seconds_or_default(rolling_seconds);
        let mut tap = CaptureTap::new(channel, endpoint, self.config.network.clone());
        tap.start(seconds)?;

        let generation = self.taps.next_generation();
        if let Some(mut displaced) = self.taps.replace(channel, generation, tap) {
            displaced.stop();
        }
        Ok(())
    }

    /// Stop the tap on `channel`; returns whether one was running
    pub fn stop_capture(&self, channel: ChannelId) -> bool {
        match self.taps.take(channel) {
            Some(mut tap) => {
                tap.stop();
                true
            }
            None => false,
        }
    }

    pub fn is_capturing(&self, channel: ChannelId) -> bool {
        self.taps.contains(channel)
    }

    /// Format of the audio buffered on `channel`
    pub fn capture_format(&self, channel: ChannelId) -> Option<AudioFormat> {
        self.taps.with(channel, |tap| tap.format())
    }

    fn buffer(&self, channel: ChannelId) -> Option<SharedRollingBuffer> {
        self.taps.with(channel, |tap| tap.buffer())
    }

    // Metering. A window of 0 uses the configured one; unknown channels
    // read as silence.

    pub fn rms01(&self, channel: ChannelId, window_ms: u32) -> f32 {
        let window = self.config.meter_window_or_default(window_ms);
        self.buffer(channel)
            .map_or(0.0, |buffer| buffer.rms_last_ms(window))
    }

    pub fn db(&self, channel: ChannelId, window_ms: u32) -> f32 {
        let window = self.config.meter_window_or_default(window_ms);
        self.buffer(channel)
            .map_or(SILENCE_DB, |buffer| buffer.db_last_ms(window))
    }

    pub fn peak01(&self, channel: ChannelId, window_ms: u32) -> f32 {
        let window = self.config.meter_window_or_default(window_ms);
        self.buffer(channel)
            .map_or(0.0, |buffer| buffer.peak_last_ms(window))
    }

    pub fn peak_db(&self, channel: ChannelId, window_ms: u32) -> f32 {
        let window = self.config.meter_window_or_default(window_ms);
        self.buffer(channel)
            .map_or(SILENCE_DB, |buffer| buffer.peak_db_last_ms(window))
    }

    // Commit

    /// Write everything buffered on `channel` to
    /// `<output_dir>/<file_name_no_ext>.wav`
    pub fn commit_capture_to_file(
        &self,
        channel: ChannelId,
        output_dir: &Path,
        file_name_no_ext: &str,
    ) -> Result<CommitResult> {
        let buffer = self
            .buffer(channel)
            .ok_or(CaptureError::NotRunning(channel))?;
        let format = buffer.format();
        let samples = buffer.read_all();
        commit::write_wav(&samples, format, output_dir, file_name_no_ext)
    }

    /// Commit to the configured capture directory under a timestamped name
    pub fn commit_capture(&self, channel: ChannelId) -> Result<CommitResult> {
        let stem = capture_file_stem(channel, &chrono::Local::now());
        self.commit_capture_to_file(channel, &self.config.capture_dir(), &stem)
    }

    pub fn list_devices(&self) -> Vec<AudioDeviceInfo> {
        crate::audio::device::list_devices()
    }

    /// Stop all playback and capture
    pub fn shutdown(&self) {
        self.playback.stop_all();
        for (_, mut tap) in self.taps.drain() {
            tap.stop();
        }
    }
}

impl Drop for PadEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
