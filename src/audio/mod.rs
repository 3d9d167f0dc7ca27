//! Audio subsystem: devices, sources, outputs and capture

pub mod buffer;
pub mod capture;
pub mod device;
pub mod playback;
pub mod source;

pub use buffer::{RollingBuffer, SharedRollingBuffer};
pub use capture::CaptureTap;
pub use device::{list_devices, resolve_input, resolve_output};
pub use playback::{CpalOutput, LocalOutput, NullOutput, RenderOutcome};
pub use source::{Clip, ClipReader, SourceFile};
