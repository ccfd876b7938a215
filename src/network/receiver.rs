//! Network receive loops
//!
//! One thread per session owns the socket: a datagram loop for UDP or an
//! accept-and-read loop for length-prefixed TCP (the USB-forwarded
//! localhost path). Both feed every packet through the same ingest path:
//! parse, lazy audio init on the first valid frame, payload-size check,
//! network-age accounting, then a push into the jitter buffer.
//!
//! The receiver never blocks on the player; backpressure is the jitter
//! buffer's drop-oldest overflow policy. All socket waits are bounded by
//! timeouts so the loop observes shutdown promptly. On a fatal error the
//! receiver only clears the running flag and returns; joining threads is
//! the supervisor's job.

use std::io::Read;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::protocol::AudioFrame;

use super::session::{ensure_pipeline, SessionShared};
use super::stats::MAX_PLAUSIBLE_AGE_US;

/// Kernel receive buffer requested for the UDP socket
const UDP_RECV_BUFFER_BYTES: usize = 256 * 1024;

/// Receive timeout so the UDP loop can observe shutdown
const UDP_RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// Accept timeout so the TCP loop can observe shutdown
const TCP_ACCEPT_TIMEOUT: Duration = Duration::from_millis(800);

/// Read timeout within an accepted connection
const TCP_READ_TIMEOUT: Duration = Duration::from_millis(800);

/// Fixed receive buffer; an audio datagram never comes close to this
const DATAGRAM_BUF_LEN: usize = 8192;

/// Bind the session's datagram socket: SO_REUSEADDR, a large kernel
/// buffer, and a bounded receive timeout.
pub(crate) fn bind_udp(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_recv_buffer_size(UDP_RECV_BUFFER_BYTES)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;

    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(UDP_RECV_TIMEOUT))?;
    Ok(socket)
}

/// Bind the session's listening socket with SO_REUSEADDR and a bounded
/// accept timeout (SO_RCVTIMEO applies to `accept` as well).
pub(crate) fn bind_tcp(port: u16) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_read_timeout(Some(TCP_ACCEPT_TIMEOUT))?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    socket.listen(4)?;
    Ok(socket.into())
}

/// UDP datagram loop.
pub(crate) fn run_udp(shared: Arc<SessionShared>, socket: UdpSocket) {
    let mut ingest = FrameIngest::new(Arc::clone(&shared));
    let mut buf = [0u8; DATAGRAM_BUF_LEN];

    while shared.is_running() {
        match socket.recv_from(&mut buf) {
            Ok((len, _from)) => ingest.ingest(&buf[..len], len as u64),
            Err(err) if is_timeout(&err) => continue,
            Err(err) if is_transient(&err) => {
                warn!("UDP receive error: {err}");
                shared.stats.add_parse_error();
            }
            Err(err) => {
                error!("UDP socket failed: {err}");
                shared.shutdown();
            }
        }
    }
    debug!("UDP receiver exiting");
}

/// TCP accept loop: one sender at a time, length-prefixed packets.
pub(crate) fn run_tcp(shared: Arc<SessionShared>, listener: TcpListener) {
    let mut ingest = FrameIngest::new(Arc::clone(&shared));

    while shared.is_running() {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) if is_timeout(&err) => continue,
            Err(err) => {
                error!("TCP accept failed: {err}");
                shared.shutdown();
                break;
            }
        };

        info!("sender connected from {peer}");
        match serve_connection(&shared, stream, &mut ingest) {
            Ok(()) => info!("sender {peer} disconnected"),
            Err(err) => debug!("connection to {peer} ended: {err}"),
        }
    }
    debug!("TCP receiver exiting");
}

/// Read length-prefixed packets from one connection until it ends.
/// A read error or timeout drops the connection; the accept loop takes
/// the next client.
fn serve_connection(
    shared: &Arc<SessionShared>,
    mut stream: TcpStream,
    ingest: &mut FrameIngest,
) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(TCP_READ_TIMEOUT))?;

    let mut len_buf = [0u8; 2];
    let mut scratch = Vec::with_capacity(4096);

    while shared.is_running() {
        stream.read_exact(&mut len_buf)?;
        let len = u16::from_le_bytes(len_buf) as usize;
        if len == 0 {
            warn!("invalid zero-length packet prefix, dropping connection");
            shared.stats.add_parse_error();
            return Ok(());
        }

        scratch.resize(len, 0);
        stream.read_exact(&mut scratch)?;
        // The 2-byte prefix is wire overhead carried by this transport.
        ingest.ingest(&scratch, (len + 2) as u64);
    }
    Ok(())
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
    )
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionRefused
    )
}

/// Per-session ingest state: parses packets, triggers lazy audio init,
/// and keeps the previous network-age sample for the jitter sum.
struct FrameIngest {
    shared: Arc<SessionShared>,
    prev_age_us: Option<u64>,
}

impl FrameIngest {
    fn new(shared: Arc<SessionShared>) -> Self {
        Self {
            shared,
            prev_age_us: None,
        }
    }

    fn ingest(&mut self, data: &[u8], wire_bytes: u64) {
        self.shared.stats.add_packet(wire_bytes);

        let started = Instant::now();
        let Some(frame) = AudioFrame::from_bytes(data) else {
            self.shared.stats.add_parse_error();
            return;
        };
        self.shared
            .stats
            .record_decode_us(started.elapsed().as_micros() as u64);

        let pipeline = match ensure_pipeline(&self.shared, &frame) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                // Audio init failure is fatal for the session.
                error!("failed to initialize audio output: {err}");
                self.shared.shutdown();
                return;
            }
        };

        if frame.samples.len() != pipeline.params.samples_per_packet() {
            self.shared.stats.add_payload_error();
            return;
        }

        self.record_age(&frame);
        pipeline.jitter.push(frame);
    }

    fn record_age(&mut self, frame: &AudioFrame) {
        let age = unix_time_us() as i64 - frame.send_time_us as i64;
        if age < 0 || age > MAX_PLAUSIBLE_AGE_US as i64 {
            return;
        }
        let age = age as u64;
        self.shared.stats.record_age_us(age, self.prev_age_us);
        self.prev_age_us = Some(age);
    }
}

fn unix_time_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or(0)
}
