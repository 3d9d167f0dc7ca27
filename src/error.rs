//! Error types for the pad audio engine

use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Decoding failed: {0}")]
    DecodeFailed(String),

    #[error("Audio host unavailable: {0}")]
    HostUnavailable(String),
}

/// Stream framing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Packet too short: {0} bytes")]
    TooShort(usize),

    #[error("Bad magic")]
    BadMagic,

    #[error("Sample rate index out of range: {0}")]
    BadSampleRateIndex(u8),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
}

/// Capture tap errors
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No capture running on channel {0}")]
    NotRunning(u32),

    #[error("Rolling buffer is empty")]
    Empty,
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, Error>;

impl From<cpal::DevicesError> for AudioError {
    fn from(e: cpal::DevicesError) -> Self {
        AudioError::HostUnavailable(e.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for AudioError {
    fn from(e: cpal::DefaultStreamConfigError) -> Self {
        match e {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => {
                AudioError::DeviceNotFound(e.to_string())
            }
            cpal::DefaultStreamConfigError::StreamTypeNotSupported => {
                AudioError::UnsupportedFormat(e.to_string())
            }
            cpal::DefaultStreamConfigError::BackendSpecific { .. } => {
                AudioError::StreamError(e.to_string())
            }
        }
    }
}

impl From<cpal::BuildStreamError> for AudioError {
    fn from(e: cpal::BuildStreamError) -> Self {
        AudioError::StreamError(e.to_string())
    }
}

impl From<cpal::PlayStreamError> for AudioError {
    fn from(e: cpal::PlayStreamError) -> Self {
        AudioError::StreamError(e.to_string())
    }
}

/// Run a callback on a real-time or network thread, logging a panic
/// instead of letting it take the thread down
pub(crate) fn contain_panic<F: FnOnce()>(context: &str, f: F) {
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::error!("{} panicked: {}", context, msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpal_errors_map_to_causes() {
        let gone: AudioError = cpal::DefaultStreamConfigError::DeviceNotAvailable.into();
        assert!(matches!(gone, AudioError::DeviceNotFound(_)));

        let kind: AudioError = cpal::DefaultStreamConfigError::StreamTypeNotSupported.into();
        assert!(matches!(kind, AudioError::UnsupportedFormat(_)));

        let host: AudioError = cpal::DevicesError::BackendSpecific {
            err: cpal::BackendSpecificError {
                description: "no server".into(),
            },
        }
        .into();
        assert!(matches!(host, AudioError::HostUnavailable(ref msg) if msg.contains("no server")));
    }

    #[test]
    fn test_contain_panic_returns() {
        contain_panic("test callback", || panic!("boom"));
        let mut ran = false;
        contain_panic("test callback", || ran = true);
        assert!(ran);
    }
}
