//! VBAN transmitter: one socket, one remote endpoint, one stream name

use std::net::{SocketAddr, UdpSocket};

use crate::codec::encoder::{packet_size, PacketEncoder};
use crate::config::NetworkConfig;
use crate::constants::MAX_PACKET_SIZE;
use crate::error::NetworkError;
use crate::network::udp::{create_send_socket, parse_remote};
use crate::protocol::NetworkEndpoint;

/// Transmitter statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransmitterStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
}

/// Sends interleaved float frames as VBAN packets to a fixed remote
pub struct VbanTransmitter {
    socket: UdpSocket,
    remote: SocketAddr,
    encoder: PacketEncoder,
    frame_counter: u32,
    warned_oversize: bool,
    stats: TransmitterStats,
}

impl VbanTransmitter {
    pub fn new(endpoint: &NetworkEndpoint, config: &NetworkConfig) -> Result<Self, NetworkError> {
        let remote = parse_remote(&endpoint.remote_ip, endpoint.port)?;
        let socket = create_send_socket(remote, config.send_buffer_bytes)?;

        tracing::info!(
            "VBAN transmitter ready -> {} stream='{}' frame={} samples/ch",
            remote,
            endpoint.stream_name,
            endpoint.frame_samples
        );

        Ok(Self {
            socket,
            remote,
            encoder: PacketEncoder::new(endpoint.stream_name.clone()),
            frame_counter: 0,
            warned_oversize: false,
            stats: TransmitterStats::default(),
        })
    }

    /// Frame and send one chunk of interleaved samples as a single datagram.
    ///
    /// Returns the datagram size; an empty chunk sends nothing.
    pub fn send_frame(
        &mut self,
        samples: &[f32],
        sample_rate: u32,
        channels: u16,
    ) -> Result<usize, NetworkError> {
        if samples.is_empty() {
            return Ok(0);
        }

        let channels = channels.max(1);
        let spc = samples.len() / channels as usize;
        if !self.warned_oversize && packet_size(spc, channels) > MAX_PACKET_SIZE {
            tracing::warn!(
                "VBAN packets of {} bytes exceed {} and will fragment; lower frame_samples",
                packet_size(spc, channels),
                MAX_PACKET_SIZE
            );
            self.warned_oversize = true;
        }

        let packet = self
            .encoder
            .encode(samples, sample_rate, channels, self.frame_counter);
        self.frame_counter = self.frame_counter.wrapping_add(1);

        match self.socket.send_to(&packet, self.remote) {
            Ok(sent) => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += sent as u64;
                Ok(sent)
            }
            Err(e) => {
                self.stats.send_errors += 1;
                Err(NetworkError::SendFailed(e.to_string()))
            }
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn frame_counter(&self) -> u32 {
        self.frame_counter
    }

    pub fn stream_name(&self) -> &str {
        self.encoder.stream_name()
    }

    pub fn stats(&self) -> TransmitterStats {
        self.stats
    }

    #[cfg(test)]
    pub(crate) fn set_frame_counter(&mut self, counter: u32) {
        self.frame_counter = counter;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{try_parse_header, HEADER_SIZE};
    use std::time::Duration;

    fn listener() -> (UdpSocket, NetworkEndpoint) {
        let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        rx.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut ep = NetworkEndpoint::transmit_default();
        ep.remote_ip = "127.0.0.1".into();
        ep.port = rx.local_addr().unwrap().port();
        (rx, ep)
    }

    #[test]
    fn test_send_frame() {
        let (rx, ep) = listener();
        let mut tx = VbanTransmitter::new(&ep, &NetworkConfig::default()).unwrap();

        let samples = vec![0.25f32; 64 * 2];
        let sent = tx.send_frame(&samples, 44100, 2).unwrap();
        assert_eq!(sent, HEADER_SIZE + 64 * 2 * 4);

        let mut buf = [0u8; 2048];
        let n = rx.recv(&mut buf).unwrap();
        let header = try_parse_header(&buf[..n]).unwrap();
        assert_eq!(header.sample_rate, 44100);
        assert_eq!(header.samples_per_channel, 64);
        assert_eq!(header.stream_name, "ECHO_OUT");
        assert_eq!(tx.stream_name(), header.stream_name);
        assert_eq!(header.frame_counter, 0);

        assert_eq!(tx.stats().packets_sent, 1);
        assert_eq!(tx.frame_counter(), 1);
    }

    #[test]
    fn test_empty_frame_is_noop() {
        let (_rx, ep) = listener();
        let mut tx = VbanTransmitter::new(&ep, &NetworkConfig::default()).unwrap();
        assert_eq!(tx.send_frame(&[], 48000, 2).unwrap(), 0);
        assert_eq!(tx.frame_counter(), 0);
    }

    #[test]
    fn test_frame_counter_wraps() {
        let (rx, ep) = listener();
        let mut tx = VbanTransmitter::new(&ep, &NetworkConfig::default()).unwrap();
        tx.set_frame_counter(u32::MAX);

        tx.send_frame(&[0.0, 0.0], 48000, 2).unwrap();
        tx.send_frame(&[0.0, 0.0], 48000, 2).unwrap();

        let mut buf = [0u8; 64];
        let n = rx.recv(&mut buf).unwrap();
        assert_eq!(try_parse_header(&buf[..n]).unwrap().frame_counter, u32::MAX);
        let n = rx.recv(&mut buf).unwrap();
        assert_eq!(try_parse_header(&buf[..n]).unwrap().frame_counter, 0);
    }

    #[test]
    fn test_bad_remote() {
        let mut ep = NetworkEndpoint::transmit_default();
        ep.remote_ip = "nowhere".into();
        assert!(matches!(
            VbanTransmitter::new(&ep, &NetworkConfig::default()),
            Err(NetworkError::InvalidAddress(_))
        ));
    }
}
