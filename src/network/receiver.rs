//! VBAN receiver
//!
//! Listens on a UDP port, keeps only PCM audio packets for one stream
//! name (and optionally one sender), decodes them to float and hands the
//! samples to a callback on the receive thread.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::codec::decoder::decode_into;
use crate::codec::vban::{VbanHeader, HEADER_SIZE};
use crate::config::NetworkConfig;
use crate::error::{contain_panic, NetworkError};
use crate::network::udp::create_recv_socket;
use crate::protocol::{AudioFormat, NetworkEndpoint};

/// Largest datagram the receive loop reads
const MAX_DATAGRAM: usize = 65_536;

const REJECT_WINDOW: Duration = Duration::from_secs(1);

/// Senders tracked by the reject budget at once
const MAX_TRACKED_SENDERS: usize = 1024;

/// One decoded packet, as delivered to the receive callback
#[derive(Debug)]
pub struct ReceivedChunk<'a> {
    pub format: AudioFormat,
    /// True on the first chunk and whenever the sender's format changed
    pub format_changed: bool,
    /// Interleaved samples in [-1, 1]
    pub samples: &'a [f32],
    pub sender: SocketAddr,
    pub frame_counter: u32,
}

/// Why a datagram was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reject {
    Short,
    Header,
    Sender,
    Stream,
    Protocol,
    RateLimited,
}

/// Receiver counters
#[derive(Debug, Default)]
struct ReceiverCounters {
    accepted: AtomicU64,
    rejected_short: AtomicU64,
    rejected_header: AtomicU64,
    rejected_stream: AtomicU64,
    rejected_sender: AtomicU64,
    rejected_protocol: AtomicU64,
    rejected_rate_limited: AtomicU64,
    format_changes: AtomicU64,
    receive_errors: AtomicU64,
}

/// Receiver statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    pub accepted: u64,
    pub rejected_short: u64,
    pub rejected_header: u64,
    pub rejected_stream: u64,
    /// Right stream, but not from the configured sender
    pub rejected_sender: u64,
    pub rejected_protocol: u64,
    pub rejected_rate_limited: u64,
    pub format_changes: u64,
    pub receive_errors: u64,
}

impl ReceiverCounters {
    fn count_reject(&self, reason: Reject) {
        let counter = match reason {
            Reject::Short => &self.rejected_short,
            Reject::Header => &self.rejected_header,
            Reject::Stream => &self.rejected_stream,
            Reject::Sender => &self.rejected_sender,
            Reject::Protocol => &self.rejected_protocol,
            Reject::RateLimited => &self.rejected_rate_limited,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ReceiverStats {
        ReceiverStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected_short: self.rejected_short.load(Ordering::Relaxed),
            rejected_header: self.rejected_header.load(Ordering::Relaxed),
            rejected_stream: self.rejected_stream.load(Ordering::Relaxed),
            rejected_sender: self.rejected_sender.load(Ordering::Relaxed),
            rejected_protocol: self.rejected_protocol.load(Ordering::Relaxed),
            rejected_rate_limited: self.rejected_rate_limited.load(Ordering::Relaxed),
            format_changes: self.format_changes.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
        }
    }
}

/// Per-sender budget of malformed packets per window
///
/// A sender that exceeds the budget is ignored until its window rolls
/// over. A budget of 0 disables limiting. At most
/// `MAX_TRACKED_SENDERS` senders are tracked; expired ones are swept at
/// most once per window.
#[derive(Debug)]
pub struct RejectLimiter {
    budget: u32,
    window: Duration,
    senders: HashMap<IpAddr, (Instant, u32)>,
    last_sweep: Option<Instant>,
}

impl RejectLimiter {
    pub fn new(budget: u32, window: Duration) -> Self {
        Self {
            budget,
            window,
            senders: HashMap::new(),
            last_sweep: None,
        }
    }

    pub fn tracked(&self) -> usize {
        self.senders.len()
    }

    pub fn is_blocked(&mut self, ip: IpAddr, now: Instant) -> bool {
        if self.budget == 0 {
            return false;
        }
        match self.senders.get(&ip) {
            Some(&(start, count)) if now.duration_since(start) < self.window => count >= self.budget,
            Some(_) => {
                self.senders.remove(&ip);
                false
            }
            None => false,
        }
    }

    /// Count a rejected packet; true when this one exhausts the budget
    pub fn record(&mut self, ip: IpAddr, now: Instant) -> bool {
        if self.budget == 0 {
            return false;
        }
        if self.senders.len() >= MAX_TRACKED_SENDERS && !self.senders.contains_key(&ip) {
            let due = self
                .last_sweep
                .map_or(true, |last| now.duration_since(last) >= self.window);
            if due {
                let window = self.window;
                self.senders
                    .retain(|_, (start, _)| now.duration_since(*start) < window);
                self.last_sweep = Some(now);
            }
            if self.senders.len() >= MAX_TRACKED_SENDERS {
                return false;
            }
        }

        let entry = self.senders.entry(ip).or_insert((now, 0));
        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }
        entry.1 = entry.1.saturating_add(1);
        entry.1 == self.budget
    }
}

/// Accepted packet metadata
#[derive(Debug)]
pub struct Accepted {
    pub header: VbanHeader,
    pub format: AudioFormat,
}

/// Packet admission rules for one receiver
#[derive(Debug)]
pub struct PacketFilter {
    stream_name: String,
    sender: Option<IpAddr>,
    limiter: RejectLimiter,
}

impl PacketFilter {
    pub fn new(endpoint: &NetworkEndpoint, reject_budget: u32) -> Self {
        Self {
            stream_name: endpoint.stream_name.clone(),
            sender: endpoint.sender_filter(),
            limiter: RejectLimiter::new(reject_budget, REJECT_WINDOW),
        }
    }

    /// Decide whether a datagram belongs to this stream
    pub fn admit(&mut self, datagram: &[u8], from: SocketAddr, now: Instant) -> Result<Accepted, Reject> {
        if self.limiter.is_blocked(from.ip(), now) {
            return Err(Reject::RateLimited);
        }

        let verdict = self.check(datagram, from);
        // Well-formed VBAN for another stream or sender is normal LAN
        // traffic; only malformed datagrams spend the budget
        let malformed = matches!(verdict, Err(Reject::Short | Reject::Header));
        if malformed && self.limiter.record(from.ip(), now) {
            tracing::warn!(
                "Sender {} exceeded its reject budget; ignoring it for {:?}",
                from.ip(),
                REJECT_WINDOW
            );
        }
        verdict
    }

    fn check(&self, datagram: &[u8], from: SocketAddr) -> Result<Accepted, Reject> {
        if datagram.len() < HEADER_SIZE {
            return Err(Reject::Short);
        }
        let header = VbanHeader::parse(datagram).map_err(|_| Reject::Header)?;

        if !header.matches_stream(&self.stream_name) {
            return Err(Reject::Stream);
        }
        if let Some(expected) = self.sender {
            if from.ip() != expected {
                return Err(Reject::Sender);
            }
        }
        if !header.is_pcm_audio() {
            return Err(Reject::Protocol);
        }
        let format = header.format().ok_or(Reject::Protocol)?;

        Ok(Accepted { header, format })
    }
}

/// Callback invoked on the receive thread for every decoded packet
pub type ChunkCallback = Box<dyn FnMut(ReceivedChunk<'_>) + Send + 'static>;

/// UDP receiver for one VBAN stream
pub struct VbanReceiver {
    endpoint: NetworkEndpoint,
    config: NetworkConfig,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    locked_format: Arc<Mutex<Option<AudioFormat>>>,
    counters: Arc<ReceiverCounters>,
    local_addr: Option<SocketAddr>,
}

impl VbanReceiver {
    pub fn new(endpoint: NetworkEndpoint, config: NetworkConfig) -> Self {
        Self {
            endpoint,
            config,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            locked_format: Arc::new(Mutex::new(None)),
            counters: Arc::new(ReceiverCounters::default()),
            local_addr: None,
        }
    }

    /// Bind the port and start the receive thread
    ///
    /// A running receiver is stopped first.
    pub fn start<F>(&mut self, on_chunk: F) -> Result<(), NetworkError>
    where
        F: FnMut(ReceivedChunk<'_>) + Send + 'static,
    {
        self.stop();

        let socket = create_recv_socket(
            self.endpoint.port,
            self.config.recv_buffer_bytes,
            Duration::from_millis(self.config.recv_poll_ms),
        )?;
        self.local_addr = socket.local_addr().ok();
        *self.locked_format.lock() = None;

        let worker = ReceiveLoop {
            socket,
            running: self.running.clone(),
            filter: PacketFilter::new(&self.endpoint, self.config.reject_budget_per_sec),
            locked_format: self.locked_format.clone(),
            counters: self.counters.clone(),
            retry_delay: Duration::from_millis(self.config.recv_retry_ms),
            on_chunk: Box::new(on_chunk),
        };

        self.running.store(true, Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name(format!("vban-rx-{}", self.endpoint.port))
            .spawn(move || worker.run())
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                NetworkError::ReceiveFailed(e.to_string())
            })?;
        self.thread_handle = Some(handle);

        tracing::info!(
            "VBAN receiver listening on {:?} stream='{}' sender={}",
            self.local_addr,
            self.endpoint.stream_name,
            self.endpoint
                .sender_filter()
                .map_or_else(|| "*".to_string(), |ip| ip.to_string())
        );
        Ok(())
    }

    /// Stop the receive thread and release the socket
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                tracing::error!("VBAN receive thread panicked");
            }
        }
        self.local_addr = None;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Format of the most recently accepted packet
    pub fn locked_format(&self) -> Option<AudioFormat> {
        *self.locked_format.lock()
    }

    /// Address the socket is bound to while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn stats(&self) -> ReceiverStats {
        self.counters.snapshot()
    }
}

impl Drop for VbanReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ReceiveLoop {
    socket: UdpSocket,
    running: Arc<AtomicBool>,
    filter: PacketFilter,
    locked_format: Arc<Mutex<Option<AudioFormat>>>,
    counters: Arc<ReceiverCounters>,
    retry_delay: Duration,
    on_chunk: ChunkCallback,
}

impl ReceiveLoop {
    fn run(mut self) {
        let mut datagram = vec![0u8; MAX_DATAGRAM];
        let mut samples: Vec<f32> = Vec::with_capacity(4096);

        while self.running.load(Ordering::Acquire) {
            let (len, from) = match self.socket.recv_from(&mut datagram) {
                Ok(received) => received,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
                Err(e) => {
                    if !self.running.load(Ordering::Acquire) {
                        break;
                    }
                    self.counters.receive_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("VBAN receive error: {}", e);
                    thread::sleep(self.retry_delay);
                    continue;
                }
            };

            let packet = &datagram[..len];
            let accepted = match self.filter.admit(packet, from, Instant::now()) {
                Ok(accepted) => accepted,
                Err(reason) => {
                    self.counters.count_reject(reason);
                    tracing::trace!("Dropped {} byte datagram from {}: {:?}", len, from, reason);
                    continue;
                }
            };

            samples.clear();
            decode_into(&packet[HEADER_SIZE..], accepted.format.encoding, &mut samples);
            if samples.is_empty() {
                continue;
            }

            let format_changed = {
                let mut locked = self.locked_format.lock();
                if *locked != Some(accepted.format) {
                    *locked = Some(accepted.format);
                    true
                } else {
                    false
                }
            };
            if format_changed {
                self.counters.format_changes.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    "VBAN format locked: {} Hz, {} ch, {:?} from {}",
                    accepted.format.sample_rate,
                    accepted.format.channels,
                    accepted.format.encoding,
                    from
                );
            }

            self.counters.accepted.fetch_add(1, Ordering::Relaxed);
            let chunk = ReceivedChunk {
                format: accepted.format,
                format_changed,
                samples: &samples,
                sender: from,
                frame_counter: accepted.header.frame_counter,
            };
            let on_chunk = &mut self.on_chunk;
            contain_panic("VBAN receive callback", || on_chunk(chunk));
        }

        tracing::debug!("VBAN receive loop ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_header;
    use crate::protocol::SampleEncoding;

    fn packet(name: &str, encoding: SampleEncoding, payload: &[u8]) -> Vec<u8> {
        let bpp = encoding.bytes_per_sample();
        let spc = (payload.len() / bpp / 2).max(1);
        let mut p = encode_header(48000, 2, spc, encoding, name, 0).to_vec();
        p.extend_from_slice(payload);
        p
    }

    fn endpoint(name: &str) -> NetworkEndpoint {
        let mut ep = NetworkEndpoint::receive_default();
        ep.stream_name = name.into();
        ep.remote_ip = String::new();
        ep
    }

    fn from() -> SocketAddr {
        "10.0.0.5:6980".parse().unwrap()
    }

    #[test]
    fn test_filter_stream_name() {
        let mut filter = PacketFilter::new(&endpoint("ECHO_OUT"), 0);
        let now = Instant::now();

        let other = packet("OTHER", SampleEncoding::Float32, &[0; 8]);
        assert_eq!(filter.admit(&other, from(), now).unwrap_err(), Reject::Stream);

        let ours = packet("echo_out", SampleEncoding::Float32, &[0; 8]);
        let accepted = filter.admit(&ours, from(), now).unwrap();
        assert_eq!(accepted.format, AudioFormat::float(48000, 2));
    }

    #[test]
    fn test_filter_short_and_garbage() {
        let mut filter = PacketFilter::new(&endpoint("S"), 0);
        let now = Instant::now();
        assert_eq!(filter.admit(&[0u8; 27], from(), now).unwrap_err(), Reject::Short);
        assert_eq!(filter.admit(&[0u8; 64], from(), now).unwrap_err(), Reject::Header);
    }

    #[test]
    fn test_filter_sender() {
        let mut ep = endpoint("S");
        ep.remote_ip = "10.0.0.9".into();
        let mut filter = PacketFilter::new(&ep, 0);
        let p = packet("S", SampleEncoding::Int16, &[0; 4]);

        assert_eq!(filter.admit(&p, from(), Instant::now()).unwrap_err(), Reject::Sender);
        assert!(filter
            .admit(&p, "10.0.0.9:1".parse().unwrap(), Instant::now())
            .is_ok());
    }

    #[test]
    fn test_filter_protocol() {
        let mut filter = PacketFilter::new(&endpoint("S"), 0);
        let mut p = packet("S", SampleEncoding::Float32, &[0; 8]);
        p[7] = (p[7] & 0x0F) | 0x10;
        assert_eq!(filter.admit(&p, from(), Instant::now()).unwrap_err(), Reject::Protocol);

        let mut p = packet("S", SampleEncoding::Float32, &[0; 8]);
        p[7] = 0x06; // 12-bit, not decoded here
        assert_eq!(filter.admit(&p, from(), Instant::now()).unwrap_err(), Reject::Protocol);
    }

    #[test]
    fn test_reject_budget() {
        let mut filter = PacketFilter::new(&endpoint("S"), 3);
        let start = Instant::now();
        let garbage = [0u8; 40];
        let good = packet("S", SampleEncoding::Float32, &[0; 8]);

        for _ in 0..3 {
            assert_eq!(filter.admit(&garbage, from(), start).unwrap_err(), Reject::Header);
        }
        assert_eq!(filter.admit(&good, from(), start).unwrap_err(), Reject::RateLimited);

        // Another sender is unaffected
        assert!(filter.admit(&good, "10.0.0.6:1".parse().unwrap(), start).is_ok());

        // Window rolls over
        let later = start + REJECT_WINDOW + Duration::from_millis(1);
        assert!(filter.admit(&good, from(), later).is_ok());
    }

    #[test]
    fn test_other_streams_do_not_spend_budget() {
        let mut ep = endpoint("S");
        ep.remote_ip = "10.0.0.9".into();
        let mut filter = PacketFilter::new(&ep, 3);
        let now = Instant::now();
        let mixer: SocketAddr = "10.0.0.9:6980".parse().unwrap();
        let other = packet("OTHER", SampleEncoding::Int16, &[0; 4]);
        let ours = packet("S", SampleEncoding::Int16, &[0; 4]);

        // A mixer sending several streams to the same port
        for _ in 0..10 {
            assert_eq!(filter.admit(&other, mixer, now).unwrap_err(), Reject::Stream);
            assert!(filter.admit(&ours, mixer, now).is_ok());
        }
        // Neither does a well-formed packet from a sender we do not listen to
        for _ in 0..10 {
            assert_eq!(filter.admit(&ours, from(), now).unwrap_err(), Reject::Sender);
        }
        assert_eq!(filter.limiter.tracked(), 0);
    }

    #[test]
    fn test_limiter_sweeps_once_per_window_when_full() {
        let mut limiter = RejectLimiter::new(5, REJECT_WINDOW);
        let ip = |i: usize| IpAddr::from([10, 1, (i >> 8) as u8, i as u8]);
        let t0 = Instant::now();
        let half = MAX_TRACKED_SENDERS / 2;
        for i in 0..half {
            limiter.record(ip(i), t0);
        }
        let t1 = t0 + Duration::from_millis(600);
        for i in half..MAX_TRACKED_SENDERS {
            limiter.record(ip(i), t1);
        }
        assert_eq!(limiter.tracked(), MAX_TRACKED_SENDERS);

        // Full and nothing expired: the newcomer is not tracked
        let newcomer: IpAddr = "192.168.1.1".parse().unwrap();
        assert!(!limiter.record(newcomer, t1));
        assert_eq!(limiter.tracked(), MAX_TRACKED_SENDERS);

        // The first half expired, but the last sweep is too recent
        let t2 = t0 + Duration::from_millis(1100);
        assert!(!limiter.record(newcomer, t2));
        assert_eq!(limiter.tracked(), MAX_TRACKED_SENDERS);

        // Tracked senders keep counting while the map is full
        for _ in 0..4 {
            assert!(!limiter.record(ip(MAX_TRACKED_SENDERS - 1), t2));
        }
        assert!(limiter.record(ip(MAX_TRACKED_SENDERS - 1), t2));
        assert!(limiter.is_blocked(ip(MAX_TRACKED_SENDERS - 1), t2));

        // A window after the last sweep everything stale goes at once
        let t3 = t1 + REJECT_WINDOW + Duration::from_millis(1);
        limiter.record(newcomer, t3);
        assert_eq!(limiter.tracked(), 1);
    }

    #[test]
    fn test_sender_rejects_counted_apart_from_stream() {
        let counters = ReceiverCounters::default();
        counters.count_reject(Reject::Sender);
        counters.count_reject(Reject::Sender);
        counters.count_reject(Reject::Stream);
        let stats = counters.snapshot();
        assert_eq!(stats.rejected_sender, 2);
        assert_eq!(stats.rejected_stream, 1);
    }

    #[test]
    fn test_limiter_disabled() {
        let mut limiter = RejectLimiter::new(0, REJECT_WINDOW);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let now = Instant::now();
        for _ in 0..1000 {
            assert!(!limiter.record(ip, now));
        }
        assert!(!limiter.is_blocked(ip, now));
    }
}
