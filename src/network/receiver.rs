//! UDP receiver feeding the packet queue
//!
//! The receiver runs on its own OS thread with a single-threaded tokio runtime,
//! so decoding load on other threads never delays a `recv`. Every datagram is:
//!
//! 1. forwarded to the configured forwarding address, if any
//! 2. kept in the crash-capture ring, if enabled
//! 3. handed to the recorder, while recording
//! 4. pushed into the [`PacketQueue`] for the decode worker
//!
//! Neither the queue nor the recorder ever blocks the receiver. When decoding
//! falls behind, the oldest queued datagrams are dropped; when the disk falls
//! behind a recording, new datagrams are left out of the recording.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use lidarcap::network::{NetworkReceiver, ReceiverConfig};
//! use lidarcap::queue::PacketQueue;
//! use std::sync::Arc;
//!
//! fn listen() -> lidarcap::Result<()> {
//!     let queue = Arc::new(PacketQueue::default());
//!     let mut receiver = NetworkReceiver::start(ReceiverConfig::default(), Arc::clone(&queue))?;
//!
//!     while let Some(packet) = queue.dequeue() {
//!         println!("{} bytes", packet.len());
//!     }
//!     receiver.stop();
//!     Ok(())
//! }
//! ```

use super::packet::UdpPacketBuilder;
use crate::config::{CrashAnalysisConfig, ForwardingConfig, LiveSourceConfig};
use crate::pcap::{CaptureWriter, LinkType};
use crate::queue::PacketQueue;
use crate::types::{CaptureTimestamp, RawPacket};
use crate::{CaptureError, Result};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Largest datagram accepted from the socket.
pub const RECEIVE_BUFFER_SIZE: usize = 34_000;

/// Datagrams buffered for the recorder thread before new ones are dropped.
pub const RECORDING_BACKLOG: usize = 8_192;

const STATS_INTERVAL: u64 = 10_000;
const RECORDING_DROP_LOG_INTERVAL: u64 = 1_000;
const MAX_ERRORS: u32 = 10;

/// Socket and side-channel settings of a [`NetworkReceiver`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiverConfig {
    pub listening_port: u16,
    pub multicast_address: Option<Ipv4Addr>,
    pub local_listening_address: IpAddr,
    pub forwarding: Option<ForwardingConfig>,
    pub crash_analysis: Option<CrashAnalysisConfig>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig::from(&LiveSourceConfig::default())
    }
}

impl From<&LiveSourceConfig> for ReceiverConfig {
    fn from(config: &LiveSourceConfig) -> Self {
        Self {
            listening_port: config.listening_port,
            multicast_address: config.multicast_address,
            local_listening_address: config.local_listening_address,
            forwarding: config.forwarding,
            crash_analysis: config.crash_analysis.clone(),
        }
    }
}

/// A datagram together with the port it came from.
#[derive(Debug, Clone)]
struct Datagram {
    packet: RawPacket,
    source_port: u16,
}

/// State shared between the receive thread and the owner.
#[derive(Debug)]
struct Shared {
    listening_port: u16,
    crash_ring: Mutex<CrashRing>,
    recorder: Mutex<Option<mpsc::Sender<Datagram>>>,
    recording_dropped: AtomicU64,
    received: AtomicU64,
}

impl Shared {
    fn crash_ring(&self) -> MutexGuard<'_, CrashRing> {
        self.crash_ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn recorder(&self) -> MutexGuard<'_, Option<mpsc::Sender<Datagram>>> {
        self.recorder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn builder(&self, source_port: u16) -> UdpPacketBuilder {
        UdpPacketBuilder::new(source_port, self.listening_port)
    }

    /// Hand a datagram to the recorder without waiting for the disk.
    fn record(&self, datagram: &Datagram) {
        let recorder = self.recorder();
        let Some(sender) = recorder.as_ref() else {
            return;
        };
        match sender.try_send(datagram.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.recording_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % RECORDING_DROP_LOG_INTERVAL == 1 {
                    warn!(dropped, backlog = sender.max_capacity(), "Recording is falling behind, dropping datagrams");
                }
            }
            Err(TrySendError::Closed(_)) => debug!("Recorder is gone, dropping datagram"),
        }
    }
}

/// Most recent datagrams, kept to reproduce a decoder crash offline.
#[derive(Debug, Default)]
struct CrashRing {
    packets: VecDeque<Datagram>,
    capacity: usize,
}

impl CrashRing {
    fn push(&mut self, datagram: &Datagram) {
        if self.capacity == 0 {
            return;
        }
        if self.packets.len() >= self.capacity {
            self.packets.pop_front();
        }
        self.packets.push_back(datagram.clone());
    }
}

/// Background thread writing recorded datagrams to a capture file.
#[derive(Debug)]
struct Recording {
    path: PathBuf,
    thread: JoinHandle<Result<u64>>,
}

/// Owner of the live UDP socket.
///
/// Dropping the receiver stops it.
#[derive(Debug)]
pub struct NetworkReceiver {
    config: ReceiverConfig,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
    recording: Option<Recording>,
}

impl NetworkReceiver {
    /// Bind the socket and start receiving into `queue`.
    ///
    /// Socket errors (port in use, bad multicast group) are returned here rather
    /// than from the receive thread.
    pub fn start(config: ReceiverConfig, queue: Arc<PacketQueue<RawPacket>>) -> Result<Self> {
        let socket = bind_listen_socket(&config)?;
        let local_addr = socket.local_addr().map_err(|e| CaptureError::socket("query local address", e))?;
        let forwarding = config.forwarding.map(|forward| bind_forward_socket(&forward)).transpose()?;

        let shared = Arc::new(Shared {
            listening_port: local_addr.port(),
            crash_ring: Mutex::new(CrashRing {
                packets: VecDeque::new(),
                capacity: config.crash_analysis.as_ref().map_or(0, |c| c.capacity),
            }),
            recorder: Mutex::new(None),
            recording_dropped: AtomicU64::new(0),
            received: AtomicU64::new(0),
        });
        let cancel = CancellationToken::new();

        let thread = {
            let shared = Arc::clone(&shared);
            let cancel = cancel.clone();
            thread::Builder::new()
                .name("lidar-receiver".to_string())
                .spawn(move || run_receiver(socket, forwarding, shared, queue, cancel))
                .map_err(|e| CaptureError::socket("spawn receiver thread", e))?
        };

        info!(
            %local_addr,
            multicast = ?config.multicast_address,
            forwarding = ?config.forwarding,
            crash_analysis = config.crash_analysis.is_some(),
            "Network receiver started"
        );
        Ok(Self { config, shared, cancel, thread: Some(thread), local_addr, recording: None })
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// Address the socket is bound to (port resolved when 0 was requested).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Datagrams received so far.
    pub fn received(&self) -> u64 {
        self.shared.received.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop receiving, finish any recording and flush the crash ring.
    ///
    /// Idempotent.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.cancel.cancel();
        if thread.join().is_err() {
            error!("Receiver thread panicked");
        }
        if let Err(e) = self.stop_recording() {
            warn!(error = %e, "Recording did not finish cleanly");
        }
        if self.config.crash_analysis.is_some() {
            if let Err(e) = self.flush_crash_capture() {
                warn!(error = %e, "Could not write crash capture");
            }
        }
        info!(received = self.received(), "Network receiver stopped");
    }

    /// Write the crash ring to its configured capture file.
    ///
    /// Returns the number of datagrams written; 0 when crash analysis is off.
    pub fn flush_crash_capture(&self) -> Result<u64> {
        let Some(crash) = &self.config.crash_analysis else {
            return Ok(0);
        };
        let packets: Vec<Datagram> = self.shared.crash_ring().packets.iter().cloned().collect();

        let mut writer = CaptureWriter::create(&crash.path, LinkType::Ethernet)?;
        for datagram in &packets {
            write_datagram(&mut writer, &self.shared, datagram)?;
        }
        writer.flush()?;
        info!(path = %crash.path.display(), packets = packets.len(), "Crash capture written");
        Ok(writer.records_written())
    }

    /// Start writing every received datagram to `path`.
    ///
    /// A recording already in progress is finished first. Up to
    /// [`RECORDING_BACKLOG`] datagrams wait for the writer; beyond that they are
    /// dropped from the recording and counted in [`recording_dropped`](Self::recording_dropped).
    pub fn start_recording(&mut self, path: &Path) -> Result<()> {
        self.start_recording_with_backlog(path, RECORDING_BACKLOG)
    }

    fn start_recording_with_backlog(&mut self, path: &Path, backlog: usize) -> Result<()> {
        self.stop_recording()?;
        let mut writer = CaptureWriter::create(path, LinkType::Ethernet)?;
        let (sender, mut receiver) = mpsc::channel::<Datagram>(backlog.max(1));
        let shared = Arc::clone(&self.shared);
        self.shared.recording_dropped.store(0, Ordering::Relaxed);

        let thread = thread::Builder::new()
            .name("lidar-recorder".to_string())
            .spawn(move || -> Result<u64> {
                while let Some(datagram) = receiver.blocking_recv() {
                    write_datagram(&mut writer, &shared, &datagram)?;
                }
                writer.flush()?;
                Ok(writer.records_written())
            })
            .map_err(|e| CaptureError::socket("spawn recorder thread", e))?;

        *self.shared.recorder() = Some(sender);
        self.recording = Some(Recording { path: path.to_path_buf(), thread });
        info!(path = %path.display(), "Recording started");
        Ok(())
    }

    /// Finish the current recording, returning the number of datagrams written.
    pub fn stop_recording(&mut self) -> Result<u64> {
        // closing the channel ends the writer loop
        self.shared.recorder().take();
        let Some(recording) = self.recording.take() else {
            return Ok(0);
        };
        let written = recording
            .thread
            .join()
            .map_err(|_| CaptureError::State { reason: "recorder thread panicked".to_string() })??;
        info!(
            path = %recording.path.display(),
            packets = written,
            dropped = self.recording_dropped(),
            "Recording finished"
        );
        Ok(written)
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    /// Datagrams left out of the current (or last) recording because the
    /// writer could not keep up.
    pub fn recording_dropped(&self) -> u64 {
        self.shared.recording_dropped.load(Ordering::Relaxed)
    }
}

impl Drop for NetworkReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn write_datagram<W: std::io::Write>(writer: &mut CaptureWriter<W>, shared: &Shared, datagram: &Datagram) -> Result<()> {
    writer.write_udp_payload(
        &shared.builder(datagram.source_port),
        &datagram.packet.data,
        CaptureTimestamp::from_secs_f64(datagram.packet.timestamp),
    )
}

fn new_socket(domain: Domain) -> std::io::Result<Socket> {
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn bind_listen_socket(config: &ReceiverConfig) -> Result<std::net::UdpSocket> {
    let port = config.listening_port;
    let socket = match config.multicast_address {
        Some(group) => bind_multicast(group, config.local_listening_address, port),
        None => {
            let addr = SocketAddr::new(config.local_listening_address, port);
            new_socket(Domain::for_address(addr)).and_then(|socket| {
                if addr.is_ipv6() {
                    // accept IPv4 senders on the IPv6 wildcard
                    socket.set_only_v6(false)?;
                }
                socket.bind(&SockAddr::from(addr))?;
                debug!(%addr, "Bound listening socket");
                Ok(socket)
            })
        }
    }
    .map_err(|e| CaptureError::socket(format!("bind UDP port {}", port), e))?;
    Ok(socket.into())
}

fn bind_multicast(group: Ipv4Addr, local: IpAddr, port: u16) -> std::io::Result<Socket> {
    let interface = match local {
        IpAddr::V4(addr) => addr,
        IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
    };
    let socket = new_socket(Domain::IPV4)?;
    socket.set_reuse_address(true)?;
    let buffer = socket.recv_buffer_size()?;
    socket.set_recv_buffer_size(buffer * 2)?;

    // unix filters on the bound address; windows refuses to bind to a group
    #[cfg(unix)]
    let bind_addr = SocketAddr::new(IpAddr::V4(group), port);
    #[cfg(not(unix))]
    let bind_addr = SocketAddr::new(IpAddr::V4(interface), port);
    socket.bind(&SockAddr::from(bind_addr))?;

    socket.join_multicast_v4(&group, &interface)?;
    debug!(%bind_addr, %group, %interface, "Joined multicast group");
    Ok(socket)
}

fn bind_forward_socket(forward: &ForwardingConfig) -> Result<(std::net::UdpSocket, SocketAddr)> {
    let target = SocketAddr::new(forward.ip, forward.port);
    let local = match forward.ip {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    let socket = new_socket(Domain::for_address(target))
        .and_then(|socket| {
            if target.is_ipv4() {
                socket.set_multicast_loop_v4(true)?;
            }
            socket.bind(&SockAddr::from(local))?;
            Ok(socket)
        })
        .map_err(|e| CaptureError::socket(format!("open forwarding socket to {}", target), e))?;
    debug!(%target, "Forwarding enabled");
    Ok((socket.into(), target))
}

fn run_receiver(
    socket: std::net::UdpSocket,
    forwarding: Option<(std::net::UdpSocket, SocketAddr)>,
    shared: Arc<Shared>,
    queue: Arc<PacketQueue<RawPacket>>,
    cancel: CancellationToken,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Could not start receiver runtime");
            return;
        }
    };

    runtime.block_on(async move {
        let socket = match UdpSocket::from_std(socket) {
            Ok(socket) => socket,
            Err(e) => {
                error!(error = %e, "Could not register listening socket");
                return;
            }
        };
        let forwarding = match forwarding.map(|(s, target)| UdpSocket::from_std(s).map(|s| (s, target))).transpose() {
            Ok(forwarding) => forwarding,
            Err(e) => {
                warn!(error = %e, "Could not register forwarding socket, forwarding disabled");
                None
            }
        };
        receive_loop(socket, forwarding, &shared, &queue, &cancel).await;
    });
}

async fn receive_loop(
    socket: UdpSocket,
    forwarding: Option<(UdpSocket, SocketAddr)>,
    shared: &Shared,
    queue: &PacketQueue<RawPacket>,
    cancel: &CancellationToken,
) {
    let mut buffer = vec![0u8; RECEIVE_BUFFER_SIZE];
    let mut error_count = 0u32;

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Receive loop cancelled");
                break;
            }
            result = socket.recv_from(&mut buffer) => result,
        };

        let (len, from) = match result {
            Ok(received) => {
                error_count = 0;
                received
            }
            Err(e) => {
                error_count += 1;
                warn!(error = %e, error_count, "Receive failed");
                if error_count >= MAX_ERRORS {
                    error!("Too many consecutive receive errors, receiver stopping");
                    break;
                }
                // Exponential backoff: 10ms, 20ms, 40ms, ...
                let backoff = Duration::from_millis(10 * (1 << error_count.min(6)));
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => continue,
                }
            }
        };

        let timestamp = CaptureTimestamp::now().as_secs_f64();
        let datagram = Datagram { packet: RawPacket::new(buffer[..len].to_vec(), timestamp), source_port: from.port() };
        trace!(len, %from, "Datagram received");

        if let Some((forward, target)) = &forwarding {
            if let Err(e) = forward.send_to(&datagram.packet.data, target).await {
                trace!(error = %e, "Forwarding failed");
            }
        }

        shared.crash_ring().push(&datagram);
        shared.record(&datagram);

        queue.enqueue(datagram.packet);

        let received = shared.received.fetch_add(1, Ordering::Relaxed) + 1;
        if received % STATS_INTERVAL == 0 {
            debug!(received, queued = queue.len(), dropped = queue.dropped(), "Receiver statistics");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcap::{CaptureReader, PacketFilter};
    use anyhow::{Context, Result, ensure};
    use std::time::Instant;

    fn loopback_config() -> ReceiverConfig {
        ReceiverConfig {
            listening_port: 0,
            local_listening_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..ReceiverConfig::default()
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn datagrams_reach_the_queue_in_order() -> Result<()> {
        let queue = Arc::new(PacketQueue::with_capacity(16));
        let mut receiver = NetworkReceiver::start(loopback_config(), Arc::clone(&queue))?;
        let target = receiver.local_addr();

        let sender = std::net::UdpSocket::bind("127.0.0.1:0")?;
        for i in 0..3u8 {
            sender.send_to(&[i; 10], target)?;
        }
        ensure!(wait_for(|| queue.len() == 3), "datagrams not received");

        let first = queue.try_dequeue().context("first datagram")?;
        ensure!(first.data == vec![0u8; 10]);
        ensure!(first.timestamp > 1e9);
        ensure!(receiver.received() == 3);

        receiver.stop();
        ensure!(!receiver.is_running());
        Ok(())
    }

    #[test]
    fn crash_ring_keeps_only_recent_datagrams() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("crash.pcap");
        let config = ReceiverConfig {
            crash_analysis: Some(CrashAnalysisConfig { path: path.clone(), capacity: 2 }),
            ..loopback_config()
        };
        let queue = Arc::new(PacketQueue::default());
        let mut receiver = NetworkReceiver::start(config, Arc::clone(&queue))?;

        let sender = std::net::UdpSocket::bind("127.0.0.1:0")?;
        for i in 0..4u8 {
            sender.send_to(&[i; 4], receiver.local_addr())?;
        }
        ensure!(wait_for(|| receiver.received() == 4));
        receiver.stop();

        let mut reader = CaptureReader::open(&path, PacketFilter::Udp, true)?;
        let first = reader.next_packet()?.context("first crash record")?;
        ensure!(first.payload() == [2u8; 4]);
        ensure!(reader.next_packet()?.is_some());
        ensure!(reader.next_packet()?.is_none());
        Ok(())
    }

    #[test]
    fn recording_writes_every_datagram() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("record.pcap");
        let queue = Arc::new(PacketQueue::default());
        let mut receiver = NetworkReceiver::start(loopback_config(), Arc::clone(&queue))?;
        receiver.start_recording(&path)?;
        ensure!(receiver.is_recording());

        let sender = std::net::UdpSocket::bind("127.0.0.1:0")?;
        for i in 0..5u8 {
            sender.send_to(&[i; 32], receiver.local_addr())?;
        }
        ensure!(wait_for(|| receiver.received() == 5));
        ensure!(receiver.stop_recording()? == 5);

        let mut reader = CaptureReader::open(&path, PacketFilter::udp_port(Some(receiver.local_addr().port())), true)?;
        let mut count = 0;
        while reader.next_packet()?.is_some() {
            count += 1;
        }
        ensure!(count == 5, "read back {} datagrams", count);
        Ok(())
    }

    #[test]
    fn stalled_recorder_drops_instead_of_growing() {
        let shared = Shared {
            listening_port: 2368,
            crash_ring: Mutex::new(CrashRing::default()),
            recorder: Mutex::new(None),
            recording_dropped: AtomicU64::new(0),
            received: AtomicU64::new(0),
        };
        // nobody drains this channel, like a writer stuck on a slow disk
        let (sender, mut backlog) = mpsc::channel(2);
        *shared.recorder() = Some(sender);

        for i in 0..5u8 {
            shared.record(&Datagram { packet: RawPacket::new(vec![i; 4], 1.0), source_port: 10_000 });
        }
        assert_eq!(shared.recording_dropped.load(Ordering::Relaxed), 3);

        let kept: Vec<u8> = std::iter::from_fn(|| backlog.try_recv().ok()).map(|d| d.packet.data[0]).collect();
        assert_eq!(kept, vec![0, 1]);
    }

    #[test]
    fn recording_backlog_survives_a_burst() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("burst.pcap");
        let mut receiver = NetworkReceiver::start(loopback_config(), Arc::new(PacketQueue::default()))?;
        receiver.start_recording_with_backlog(&path, 4)?;

        let sender = std::net::UdpSocket::bind("127.0.0.1:0")?;
        for i in 0..50u8 {
            sender.send_to(&[i; 16], receiver.local_addr())?;
        }
        ensure!(wait_for(|| receiver.received() == 50), "burst not received");
        let written = receiver.stop_recording()?;
        ensure!(written + receiver.recording_dropped() == 50, "{written} written");
        ensure!(written >= 4, "the backlog itself is always written");
        Ok(())
    }

    #[test]
    fn forwarding_copies_datagrams() -> Result<()> {
        let sink = std::net::UdpSocket::bind("127.0.0.1:0")?;
        sink.set_read_timeout(Some(Duration::from_secs(5)))?;
        let config = ReceiverConfig {
            forwarding: Some(ForwardingConfig { ip: IpAddr::V4(Ipv4Addr::LOCALHOST), port: sink.local_addr()?.port() }),
            ..loopback_config()
        };
        let queue = Arc::new(PacketQueue::default());
        let receiver = NetworkReceiver::start(config, queue)?;

        std::net::UdpSocket::bind("127.0.0.1:0")?.send_to(b"forward me", receiver.local_addr())?;
        let mut buffer = [0u8; 64];
        let (len, _) = sink.recv_from(&mut buffer)?;
        ensure!(&buffer[..len] == b"forward me");
        Ok(())
    }

    #[test]
    fn port_conflicts_are_socket_errors() -> Result<()> {
        let taken = std::net::UdpSocket::bind("127.0.0.1:0")?;
        let config = ReceiverConfig { listening_port: taken.local_addr()?.port(), ..loopback_config() };
        let err = NetworkReceiver::start(config, Arc::new(PacketQueue::default()))
            .err()
            .context("second bind must fail")?;
        ensure!(matches!(err, CaptureError::Socket { .. }));
        Ok(())
    }
}
