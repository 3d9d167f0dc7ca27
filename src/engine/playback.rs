//! Pad playback
//!
//! Each playing channel owns one resource set: a worker thread that
//! either renders the clip to a local output or paces it out through a
//! VBAN transmitter, plus the cancel channel that stops it. Sets live in
//! a [`ChannelTable`]; whoever removes a set from the table reports the
//! end of that playback, so every playback ends exactly once.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::playback::{CpalOutput, LocalOutput, RenderOutcome};
use crate::audio::source::{ClipReader, SourceFile};
use crate::config::NetworkConfig;
use crate::engine::channels::ChannelTable;
use crate::error::{AudioError, Result};
use crate::network::sender::VbanTransmitter;
use crate::protocol::{ChannelId, Endpoint, PlaybackRequest};

const EVENT_QUEUE_DEPTH: usize = 256;

/// Largest frame the wire format can describe
const MAX_FRAME_SAMPLES: usize = 256;

/// Why a playback ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The trim window played to its end
    Finished,
    /// Stopped, or replaced by a new playback on the same channel
    Stopped,
    /// The source could not be decoded or the output failed
    Failed,
}

/// Notification from the playback engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    Ended { channel: ChannelId, reason: EndReason },
}

/// Where a channel is currently playing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackMode {
    Local,
    Network,
}

struct ActivePlayback {
    mode: PlaybackMode,
    cancel: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

type PlaybackTable = ChannelTable<ActivePlayback>;

enum Job {
    Local {
        device_id: String,
    },
    Network {
        transmitter: VbanTransmitter,
        frame_samples: usize,
        nominal_rate: u32,
    },
}

/// Real-time duration of one frame of `samples_per_channel`
pub fn frame_duration(samples_per_channel: usize, sample_rate: u32) -> Duration {
    Duration::from_secs_f64(samples_per_channel as f64 / sample_rate.max(1) as f64)
}

/// Plays trimmed, gain-adjusted clips per channel
pub struct PlaybackEngine {
    table: Arc<PlaybackTable>,
    output: Arc<dyn LocalOutput>,
    network: NetworkConfig,
    events_tx: Sender<PlaybackEvent>,
    events_rx: Receiver<PlaybackEvent>,
}

impl PlaybackEngine {
    pub fn new(output: Arc<dyn LocalOutput>, network: NetworkConfig) -> Self {
        let (events_tx, events_rx) = bounded(EVENT_QUEUE_DEPTH);
        Self {
            table: Arc::new(ChannelTable::new()),
            output,
            network,
            events_tx,
            events_rx,
        }
    }

    /// Engine rendering local playback to cpal devices
    pub fn with_cpal(network: NetworkConfig) -> Self {
        Self::new(Arc::new(CpalOutput::new()), network)
    }

    /// Receiver of playback events
    ///
    /// Clones share one queue; each event is delivered to one of them.
    pub fn events(&self) -> Receiver<PlaybackEvent> {
        self.events_rx.clone()
    }

    /// Start `request` on `channel`, stopping whatever played there.
    ///
    /// An unopenable source or an unusable network endpoint returns an
    /// error and leaves the channel idle.
    pub fn play(&self, channel: ChannelId, request: &PlaybackRequest) -> Result<()> {
        self.stop(channel);

        let source = SourceFile::open(&request.source).map_err(|e| {
            tracing::warn!("Channel {}: not playing, {}", channel, e);
            e
        })?;

        let (mode, job) = match &request.destination {
            Endpoint::Local { device_id, .. } => {
                tracing::debug!("Channel {} renders to the {} output", channel, self.output.name());
                (
                    PlaybackMode::Local,
                    Job::Local {
                        device_id: device_id.clone(),
                    },
                )
            }
            Endpoint::Network(ep) => {
                let transmitter = VbanTransmitter::new(ep, &self.network).map_err(|e| {
                    tracing::warn!("Channel {}: not playing, {}", channel, e);
                    e
                })?;
                (
                    PlaybackMode::Network,
                    Job::Network {
                        transmitter,
                        frame_samples: ep.frame_samples.clamp(1, MAX_FRAME_SAMPLES),
                        nominal_rate: ep.sample_rate,
                    },
                )
            }
        };

        let (cancel_tx, cancel_rx) = bounded::<()>(1);
        let (start_tx, start_rx) = bounded::<()>(1);
        let generation = self.table.next_generation();
        let worker = Worker {
            channel,
            generation,
            table: self.table.clone(),
            events: self.events_tx.clone(),
            start: start_rx,
            playback: Playback {
                source,
                start_ms: request.start_ms,
                end_ms: request.end_ms,
                gain_db: request.gain_db,
                job,
                output: self.output.clone(),
                cancel: cancel_rx,
            },
        };

        // The worker waits for `start`, so the slot always holds its handle
        // before it can touch the output or the socket
        let handle = thread::Builder::new()
            .name(format!("pad-{}-{}", channel, mode.label()))
            .spawn(move || worker.run())
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        let active = ActivePlayback {
            mode,
            cancel: Some(cancel_tx),
            worker: Some(handle),
        };
        if let Some(displaced) = self.table.replace(channel, generation, active) {
            // A concurrent play on the same channel got in between
            self.teardown(channel, displaced);
        }
        // Fails only if a concurrent stop already tore the set down
        let _ = start_tx.send(());

        tracing::info!(
            "Playback started on channel {} ({}): {} [{}..{} ms, {:+.1} dB]",
            channel,
            mode.label(),
            request.source.display(),
            request.start_ms,
            request.end_ms,
            request.gain_db
        );
        Ok(())
    }

    /// Stop whatever plays on `channel`; false if it was idle.
    ///
    /// Returns once the channel's worker has released its output and
    /// socket.
    pub fn stop(&self, channel: ChannelId) -> bool {
        match self.table.take(channel) {
            Some(active) => {
                self.teardown(channel, active);
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        for (channel, active) in self.table.drain() {
            self.teardown(channel, active);
        }
    }

    /// True while a resource set exists for the channel
    pub fn is_playing(&self, channel: ChannelId) -> bool {
        self.table.contains(channel)
    }

    pub fn mode(&self, channel: ChannelId) -> Option<PlaybackMode> {
        self.table.with(channel, |active| active.mode)
    }

    /// Number of live resource sets
    pub fn active_count(&self) -> usize {
        self.table.len()
    }

    fn teardown(&self, channel: ChannelId, mut active: ActivePlayback) {
        drop(active.cancel.take());

        if let Some(handle) = active.worker.take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::error!("Playback worker for channel {} panicked", channel);
            }
        }

        tracing::info!("Playback stopped on channel {}", channel);
        emit(
            &self.events_tx,
            PlaybackEvent::Ended {
                channel,
                reason: EndReason::Stopped,
            },
        );
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.stop_all();
    }
}

impl PlaybackMode {
    fn label(self) -> &'static str {
        match self {
            PlaybackMode::Local => "local",
            PlaybackMode::Network => "vban",
        }
    }
}

fn emit(events: &Sender<PlaybackEvent>, event: PlaybackEvent) {
    match events.try_send(event) {
        Ok(()) | Err(TrySendError::Disconnected(_)) => {}
        Err(TrySendError::Full(_)) => {
            tracing::warn!("Playback event queue full, dropping {:?}", event);
        }
    }
}

/// Everything one playback consumes
struct Playback {
    source: SourceFile,
    start_ms: u64,
    end_ms: u64,
    gain_db: f32,
    job: Job,
    output: Arc<dyn LocalOutput>,
    cancel: Receiver<()>,
}

impl Playback {
    fn execute(self, channel: ChannelId) -> std::result::Result<RenderOutcome, AudioError> {
        // Seeking and decoding happen here, off the caller's thread
        let mut reader =
            ClipReader::from_source(self.source, self.start_ms, self.end_ms, self.gain_db);
        let (start, end) = reader.window_ms();
        tracing::debug!(
            "Channel {} window {}..{} ms, gain x{:.3}",
            channel,
            start,
            end,
            reader.gain()
        );

        match self.job {
            Job::Local { device_id } => self.output.render(&device_id, reader, &self.cancel),
            Job::Network {
                mut transmitter,
                frame_samples,
                nominal_rate,
            } => {
                let rate = reader.format().sample_rate;
                if rate != nominal_rate {
                    tracing::warn!(
                        "Channel {}: sending at the clip's {} Hz, endpoint expects {} Hz",
                        channel,
                        rate,
                        nominal_rate
                    );
                }
                let outcome =
                    pace_to_network(&mut reader, &mut transmitter, frame_samples, &self.cancel);
                tracing::debug!("Channel {} transmitter: {:?}", channel, transmitter.stats());
                Ok(outcome)
            }
        }
    }
}

struct Worker {
    channel: ChannelId,
    generation: u64,
    table: Arc<PlaybackTable>,
    events: Sender<PlaybackEvent>,
    start: Receiver<()>,
    playback: Playback,
}

impl Worker {
    fn run(self) {
        let channel = self.channel;
        // Torn down before it was released: the stop reports the end
        crossbeam_channel::select! {
            recv(self.start) -> started => if started.is_err() { return },
            recv(self.playback.cancel) -> _ => return,
        }

        let reason = match self.playback.execute(channel) {
            Ok(RenderOutcome::Finished) => EndReason::Finished,
            Ok(RenderOutcome::Cancelled) => EndReason::Stopped,
            Err(e) => {
                tracing::warn!("Playback on channel {} failed: {}", channel, e);
                EndReason::Failed
            }
        };

        // A stop that got here first has already reported the end
        if self.table.take_if_current(channel, self.generation).is_some() {
            tracing::info!("Playback on channel {} ended ({:?})", channel, reason);
            emit(&self.events, PlaybackEvent::Ended { channel, reason });
        }
    }
}

/// Send `reader` as VBAN frames, paced to real time.
///
/// Each frame is read, sent, and followed by a wait until the moment the
/// audio sent so far would have finished playing. Returns `Cancelled` as
/// soon as `cancel` fires or disconnects.
pub fn pace_to_network(
    reader: &mut ClipReader,
    transmitter: &mut VbanTransmitter,
    frame_samples: usize,
    cancel: &Receiver<()>,
) -> RenderOutcome {
    let format = reader.format();
    let channels = format.channels.max(1);
    let rate = format.sample_rate.max(1);
    let mut frame = vec![0.0f32; frame_samples.clamp(1, MAX_FRAME_SAMPLES) * channels as usize];

    let mut deadline = Instant::now();
    let mut send_failures: u64 = 0;

    loop {
        let n = reader.read(&mut frame);
        if n == 0 {
            return RenderOutcome::Finished;
        }

        if let Err(e) = transmitter.send_frame(&frame[..n], rate, channels) {
            send_failures += 1;
            if send_failures == 1 {
                tracing::warn!(
                    "VBAN send of '{}' to {} failed: {}",
                    transmitter.stream_name(),
                    transmitter.remote(),
                    e
                );
            } else {
                tracing::debug!("VBAN send failed ({} so far): {}", send_failures, e);
            }
        }

        deadline += frame_duration(n / channels as usize, rate);
        match cancel.recv_deadline(deadline) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return RenderOutcome::Cancelled,
        }
    }
}
