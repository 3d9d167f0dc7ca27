//! Network subsystem for VBAN audio over UDP

pub mod receiver;
pub mod sender;
pub mod udp;

pub use receiver::{ReceivedChunk, ReceiverStats, VbanReceiver};
pub use sender::{TransmitterStats, VbanTransmitter};
pub use udp::{create_recv_socket, create_send_socket};
