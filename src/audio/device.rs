//! Audio device enumeration and resolution
//!
//! Device ids are `input:<name>`, `output:<name>` or `loop:<name>`. A
//! `loop:` id names an output device whose rendered audio is captured
//! (loopback). An empty id selects the system default.

use cpal::traits::{DeviceTrait, HostTrait};

use crate::error::AudioError;
use crate::protocol::AudioDeviceInfo;

const INPUT_PREFIX: &str = "input:";
const OUTPUT_PREFIX: &str = "output:";
const LOOPBACK_PREFIX: &str = "loop:";

/// What a device id refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Input,
    Output,
    Loopback,
}

/// Split an id into its kind and device name
///
/// Unprefixed ids are treated as input names. An empty name means the
/// default device of that kind.
pub fn parse_device_id(id: &str) -> (DeviceKind, &str) {
    let id = id.trim();
    if let Some(name) = id.strip_prefix(LOOPBACK_PREFIX) {
        (DeviceKind::Loopback, name)
    } else if let Some(name) = id.strip_prefix(OUTPUT_PREFIX) {
        (DeviceKind::Output, name)
    } else if let Some(name) = id.strip_prefix(INPUT_PREFIX) {
        (DeviceKind::Input, name)
    } else {
        (DeviceKind::Input, id)
    }
}

/// List capture endpoints, render endpoints and loopback taps of the
/// render endpoints
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    match host.input_devices() {
        Ok(inputs) => {
            for device in inputs {
                let Ok(name) = device.name() else { continue };
                let (sample_rates, channels) = device_capabilities(&device, true);
                devices.push(AudioDeviceInfo {
                    id: format!("{}{}", INPUT_PREFIX, name),
                    is_default: default_input_name.as_ref() == Some(&name),
                    name,
                    is_input: true,
                    is_output: false,
                    is_loopback: false,
                    sample_rates,
                    channels,
                });
            }
        }
        Err(e) => tracing::warn!("Failed to enumerate input devices: {}", e),
    }

    match host.output_devices() {
        Ok(outputs) => {
            for device in outputs {
                let Ok(name) = device.name() else { continue };
                let (sample_rates, channels) = device_capabilities(&device, false);
                let is_default = default_output_name.as_ref() == Some(&name);

                devices.push(AudioDeviceInfo {
                    id: format!("{}{}", OUTPUT_PREFIX, name),
                    name: name.clone(),
                    is_input: false,
                    is_output: true,
                    is_loopback: false,
                    is_default,
                    sample_rates: sample_rates.clone(),
                    channels: channels.clone(),
                });
                devices.push(AudioDeviceInfo {
                    id: format!("{}{}", LOOPBACK_PREFIX, name),
                    name: format!("Loopback: {}", name),
                    is_input: true,
                    is_output: false,
                    is_loopback: true,
                    is_default: false,
                    sample_rates,
                    channels,
                });
            }
        }
        Err(e) => tracing::warn!("Failed to enumerate output devices: {}", e),
    }

    devices
}

fn device_capabilities(device: &cpal::Device, is_input: bool) -> (Vec<u32>, Vec<u16>) {
    let configs: Vec<cpal::SupportedStreamConfigRange> = if is_input {
        device
            .supported_input_configs()
            .map(|c| c.collect())
            .unwrap_or_default()
    } else {
        device
            .supported_output_configs()
            .map(|c| c.collect())
            .unwrap_or_default()
    };

    let mut sample_rates = Vec::new();
    let mut channels = Vec::new();
    for config in &configs {
        for rate in [44100u32, 48000, 88200, 96000, 176400, 192000] {
            let sr = cpal::SampleRate(rate);
            if sr >= config.min_sample_rate()
                && sr <= config.max_sample_rate()
                && !sample_rates.contains(&rate)
            {
                sample_rates.push(rate);
            }
        }
        if !channels.contains(&config.channels()) {
            channels.push(config.channels());
        }
    }
    sample_rates.sort_unstable();
    channels.sort_unstable();
    (sample_rates, channels)
}

fn find_named(
    devices: Result<impl Iterator<Item = cpal::Device>, cpal::DevicesError>,
    name: &str,
) -> Result<Option<cpal::Device>, AudioError> {
    Ok(devices?.find(|d| d.name().map(|n| n == name).unwrap_or(false)))
}

/// A capture device and whether it must be opened as loopback
pub struct ResolvedInput {
    pub device: cpal::Device,
    pub name: String,
    pub loopback: bool,
}

/// Resolve a capture source
///
/// `output:` and `loop:` ids, or `force_loopback`, select loopback capture
/// of a render device.
pub fn resolve_input(device_id: &str, force_loopback: bool) -> Result<ResolvedInput, AudioError> {
    let host = cpal::default_host();
    let (kind, name) = parse_device_id(device_id);
    let loopback = force_loopback || kind != DeviceKind::Input;

    let device = if loopback {
        if name.is_empty() {
            host.default_output_device()
        } else {
            find_named(host.output_devices(), name)?
        }
    } else if name.is_empty() {
        host.default_input_device()
    } else {
        find_named(host.input_devices(), name)?
    };

    let device = device.ok_or_else(|| AudioError::DeviceNotFound(device_id.to_string()))?;
    let name = device.name().unwrap_or_else(|_| "<unknown>".to_string());
    Ok(ResolvedInput {
        device,
        name,
        loopback,
    })
}

/// Resolve a render device, falling back to the default output
pub fn resolve_output(device_id: &str) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    let (_, name) = parse_device_id(device_id);

    if !name.is_empty() {
        match find_named(host.output_devices(), name) {
            Ok(Some(device)) => return Ok(device),
            Ok(None) => tracing::warn!("Output device '{}' not found, using default", name),
            Err(e) => tracing::warn!("Output lookup for '{}' failed ({}), using default", name, e),
        }
    }

    host.default_output_device()
        .ok_or_else(|| AudioError::DeviceNotFound("no default output device".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_id() {
        assert_eq!(parse_device_id("input:Mic"), (DeviceKind::Input, "Mic"));
        assert_eq!(parse_device_id("output:Speakers"), (DeviceKind::Output, "Speakers"));
        assert_eq!(parse_device_id("loop:Speakers"), (DeviceKind::Loopback, "Speakers"));
        assert_eq!(parse_device_id("Line In"), (DeviceKind::Input, "Line In"));
        assert_eq!(parse_device_id(""), (DeviceKind::Input, ""));
        assert_eq!(parse_device_id("loop:"), (DeviceKind::Loopback, ""));
    }

    #[test]
    fn test_list_devices_shape() {
        // Hosts without audio hardware simply list nothing
        for dev in list_devices() {
            match parse_device_id(&dev.id).0 {
                DeviceKind::Loopback => {
                    assert!(dev.is_loopback && dev.is_input);
                    assert!(dev.name.starts_with("Loopback: "));
                }
                DeviceKind::Output => assert!(dev.is_output && !dev.is_input),
                DeviceKind::Input => assert!(dev.is_input && !dev.is_loopback),
            }
        }
    }
}
