//! Capture taps
//!
//! A tap feeds one channel's rolling buffer from either a local device
//! (input or loopback of a render device) or a VBAN receiver. Device
//! streams are built and owned by a dedicated thread since a cpal stream
//! cannot leave the thread that created it.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::{RollingBuffer, SharedRollingBuffer};
use crate::audio::device::resolve_input;
use crate::config::NetworkConfig;
use crate::error::{contain_panic, AudioError, Result};
use crate::network::receiver::{ReceiverStats, VbanReceiver};
use crate::protocol::{AudioFormat, ChannelId, Endpoint, NetworkEndpoint, SampleEncoding};

/// How long `start` waits for a device stream to come up
const DEVICE_START_TIMEOUT: Duration = Duration::from_secs(5);

enum Source {
    Device {
        running: Arc<AtomicBool>,
        thread_handle: Option<JoinHandle<()>>,
    },
    Network(VbanReceiver),
}

/// Rolling capture of one logical input channel
pub struct CaptureTap {
    channel: ChannelId,
    endpoint: Endpoint,
    network_config: NetworkConfig,
    buffer: SharedRollingBuffer,
    /// Cleared before sources are torn down so in-flight callbacks
    /// stop writing
    attached: Arc<AtomicBool>,
    source: Option<Source>,
}

impl CaptureTap {
    pub fn new(channel: ChannelId, endpoint: Endpoint, network_config: NetworkConfig) -> Self {
        let format = match &endpoint {
            Endpoint::Network(ep) => ep.nominal_format(),
            Endpoint::Local { .. } => AudioFormat::default(),
        };
        Self {
            channel,
            endpoint,
            network_config,
            buffer: Arc::new(RollingBuffer::new(1, format)),
            attached: Arc::new(AtomicBool::new(false)),
            source: None,
        }
    }

    /// Start capturing into a buffer of `rolling_seconds` (at least 1).
    ///
    /// Starting a running tap is a no-op.
    pub fn start(&mut self, rolling_seconds: u32) -> Result<()> {
        if self.source.is_some() {
            return Ok(());
        }
        let seconds = rolling_seconds.max(1);

        let source = match self.endpoint.clone() {
            Endpoint::Network(ep) => self.start_network(ep, seconds)?,
            Endpoint::Local {
                device_id,
                is_loopback,
            } => self.start_device(&device_id, is_loopback, seconds)?,
        };
        self.source = Some(source);

        let format = self.buffer.format();
        tracing::info!(
            "Capture started on channel {}: {} ({} Hz, {} ch, {} s)",
            self.channel,
            describe(&self.endpoint),
            format.sample_rate,
            format.channels,
            seconds
        );
        Ok(())
    }

    fn start_network(&mut self, endpoint: NetworkEndpoint, seconds: u32) -> Result<Source> {
        self.buffer.reset(seconds, endpoint.nominal_format());

        let mut receiver = VbanReceiver::new(endpoint, self.network_config.clone());
        let buffer = self.buffer.clone();
        let attached = self.attached.clone();
        let channel = self.channel;

        self.attached.store(true, Ordering::SeqCst);
        let started = receiver.start(move |chunk| {
            if !attached.load(Ordering::Acquire) {
                return;
            }
            if buffer.format() != chunk.format {
                tracing::info!(
                    "Channel {} capture format now {} Hz, {} ch",
                    channel,
                    chunk.format.sample_rate,
                    chunk.format.channels
                );
                buffer.reset(seconds, chunk.format);
            }
            buffer.add_samples(chunk.samples);
        });

        if let Err(e) = started {
            self.attached.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        Ok(Source::Network(receiver))
    }

    fn start_device(&mut self, device_id: &str, is_loopback: bool, seconds: u32) -> Result<Source> {
        let resolved = resolve_input(device_id, is_loopback)?;
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = bounded::<std::result::Result<(), AudioError>>(1);

        let buffer = self.buffer.clone();
        let attached = self.attached.clone();
        let running_for_thread = running.clone();

        self.attached.store(true, Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name(format!("capture-ch-{}", self.channel))
            .spawn(move || {
                let opened = open_device_stream(
                    &resolved.device,
                    resolved.loopback,
                    seconds,
                    buffer,
                    attached,
                );
                let stream = match opened {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(e.into()));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                tracing::debug!(
                    "Capturing from '{}'{}",
                    resolved.name,
                    if resolved.loopback { " (loopback)" } else { "" }
                );
                while running_for_thread.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(20));
                }
                // Stream is dropped here, stopping capture
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        let startup = ready_rx
            .recv_timeout(DEVICE_START_TIMEOUT)
            .unwrap_or_else(|_| Err(AudioError::StreamError("capture stream did not start".into())));

        if let Err(e) = startup {
            self.attached.store(false, Ordering::SeqCst);
            running.store(false, Ordering::SeqCst);
            let _ = handle.join();
            return Err(e.into());
        }

        Ok(Source::Device {
            running,
            thread_handle: Some(handle),
        })
    }

    /// Stop capturing. Buffered audio stays readable until the next start.
    pub fn stop(&mut self) {
        self.attached.store(false, Ordering::SeqCst);

        match self.source.take() {
            Some(Source::Device {
                running,
                mut thread_handle,
            }) => {
                running.store(false, Ordering::SeqCst);
                if let Some(handle) = thread_handle.take() {
                    if handle.join().is_err() {
                        tracing::error!("Capture thread for channel {} panicked", self.channel);
                    }
                }
            }
            Some(Source::Network(mut receiver)) => receiver.stop(),
            None => return,
        }
        tracing::info!("Capture stopped on channel {}", self.channel);
    }

    pub fn is_running(&self) -> bool {
        self.source.is_some()
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn buffer(&self) -> SharedRollingBuffer {
        self.buffer.clone()
    }

    /// Format of the audio currently in the buffer
    pub fn format(&self) -> AudioFormat {
        self.buffer.format()
    }

    /// Receiver counters, for network taps
    pub fn receiver_stats(&self) -> Option<ReceiverStats> {
        match &self.source {
            Some(Source::Network(receiver)) => Some(receiver.stats()),
            _ => None,
        }
    }
}

impl Drop for CaptureTap {
    fn drop(&mut self) {
        self.stop();
    }
}

fn describe(endpoint: &Endpoint) -> String {
    match endpoint {
        Endpoint::Local {
            device_id,
            is_loopback,
        } => {
            let name = if device_id.is_empty() { "<default>" } else { device_id };
            if *is_loopback {
                format!("loopback {}", name)
            } else {
                name.to_string()
            }
        }
        Endpoint::Network(ep) => format!("vban '{}' on port {}", ep.stream_name, ep.port),
    }
}

/// Encoding reported for a device sample format
fn encoding_of(format: SampleFormat) -> Option<SampleEncoding> {
    match format {
        SampleFormat::F32 => Some(SampleEncoding::Float32),
        SampleFormat::I16 | SampleFormat::U16 => Some(SampleEncoding::Int16),
        SampleFormat::I32 => Some(SampleEncoding::Int32),
        _ => None,
    }
}

fn open_device_stream(
    device: &cpal::Device,
    loopback: bool,
    seconds: u32,
    buffer: SharedRollingBuffer,
    attached: Arc<AtomicBool>,
) -> std::result::Result<cpal::Stream, AudioError> {
    // Loopback captures in the render device's own mix format
    let supported = if loopback {
        device.default_output_config()?
    } else {
        device.default_input_config()?
    };
    let sample_format = supported.sample_format();
    let encoding = encoding_of(sample_format)
        .ok_or_else(|| AudioError::UnsupportedFormat(format!("{:?}", sample_format)))?;
    let config: StreamConfig = supported.config();

    buffer.reset(
        seconds,
        AudioFormat::new(config.sample_rate.0, config.channels, encoding),
    );

    match sample_format {
        SampleFormat::F32 => build_input::<f32>(device, &config, buffer, attached),
        SampleFormat::I16 => build_input::<i16>(device, &config, buffer, attached),
        SampleFormat::I32 => build_input::<i32>(device, &config, buffer, attached),
        SampleFormat::U16 => build_input::<u16>(device, &config, buffer, attached),
        other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    buffer: SharedRollingBuffer,
    attached: Arc<AtomicBool>,
) -> std::result::Result<cpal::Stream, AudioError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut scratch: Vec<f32> = Vec::new();
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            if !attached.load(Ordering::Relaxed) {
                return;
            }
            contain_panic("capture callback", || {
                scratch.clear();
                scratch.extend(data.iter().map(|&s| f32::from_sample(s)));
                buffer.add_samples(&scratch);
            });
        },
        move |err| {
            tracing::warn!("Capture stream error: {}", err);
        },
        None,
    )?;
    Ok(stream)
}
