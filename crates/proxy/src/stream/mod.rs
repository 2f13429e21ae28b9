//! The stream engine: raw TCP and UDP forwarding.
//!
//! TCP connections are spliced bidirectionally to an upstream member chosen
//! by consistent-hashing the client address; dial failures mark the member
//! failed and fall through to the next ring candidate, at most one attempt
//! per member. UDP keeps a size-bounded, LRU-evicting session map from
//! client address to a dedicated upstream socket, with a reverse-relay task
//! per session and idle expiry.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info, warn};

use portico_common::BoundedTable;
use portico_config::{StreamServer, StreamUpstream};

use crate::access::AccessProtocol;
use crate::context::EngineCtx;
use crate::drain::DrainTracker;
use crate::errors::ProxyError;
use crate::upstream::ring::HashRing;

/// Copy buffer for the TCP splice.
const SPLICE_BUF: usize = 16 * 1024;
/// Maximum datagram we relay.
const MAX_DATAGRAM: usize = 65_536;
/// Bound on concurrently tracked UDP sessions.
const MAX_UDP_SESSIONS: usize = 8_192;
/// Cadence of the UDP session sweeper.
const UDP_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// The swappable part of a stream listener: everything except the bound
/// socket itself. Reconfiguration of an unchanged `(port, protocol)` swaps
/// this in place; sessions in flight keep the settings they started with.
pub struct StreamSettings {
    pub upstream_name: String,
    ring: HashRing,
    connect_timeout: Duration,
    idle_timeout: Duration,
}

impl StreamSettings {
    pub fn new(server: &StreamServer, upstream: &StreamUpstream) -> Arc<Self> {
        let ring = HashRing::new(
            upstream
                .members
                .iter()
                .map(|m| (m.addr.clone(), m.weight)),
        );
        Arc::new(Self {
            upstream_name: upstream.name.clone(),
            ring,
            connect_timeout: portico_common::parse_duration(&server.connect_timeout)
                .unwrap_or(Duration::from_secs(10)),
            idle_timeout: portico_common::parse_duration(&server.idle_timeout)
                .unwrap_or(Duration::from_secs(600)),
        })
    }
}

/// Resolved runtime view of one stream server block.
pub struct StreamListener {
    pub listen_port: u16,
    pub protocol: portico_config::StreamProtocol,
    settings: parking_lot::RwLock<Arc<StreamSettings>>,
    pub ctx: Arc<EngineCtx>,
    pub drain: DrainTracker,
}

impl StreamListener {
    pub fn new(
        server: &StreamServer,
        upstream: &StreamUpstream,
        ctx: Arc<EngineCtx>,
    ) -> Arc<Self> {
        Arc::new(Self {
            listen_port: server.listen_port,
            protocol: server.protocol,
            settings: parking_lot::RwLock::new(StreamSettings::new(server, upstream)),
            ctx,
            drain: DrainTracker::new(),
        })
    }

    pub fn settings(&self) -> Arc<StreamSettings> {
        self.settings.read().clone()
    }

    pub fn swap_settings(&self, settings: Arc<StreamSettings>) {
        *self.settings.write() = settings;
    }

    pub async fn serve(self: Arc<Self>) -> Result<(), ProxyError> {
        match self.protocol {
            portico_config::StreamProtocol::Tcp => self.serve_tcp().await,
            portico_config::StreamProtocol::Udp => self.serve_udp().await,
        }
    }

    /// Ring candidates for a client, passed through passive-failure
    /// filtering (which keeps the soonest-expiring member when everything
    /// is marked failed).
    fn candidates(&self, client: &SocketAddr) -> Vec<String> {
        let settings = self.settings();
        let ordered = settings.ring.ordered_candidates(&client.ip().to_string());
        self.ctx
            .selector
            .filter_stream_candidates(&ordered)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    fn client_allowed(&self, client: &SocketAddr) -> bool {
        self.ctx.access.allows(
            AccessProtocol::Stream,
            &client.ip(),
            &client.ip().to_string(),
        )
    }

    // ------------------------------------------------------------------
    // TCP
    // ------------------------------------------------------------------

    async fn serve_tcp(self: Arc<Self>) -> Result<(), ProxyError> {
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], self.listen_port));
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| ProxyError::Bind {
                addr: bind_addr.to_string(),
                reason: e.to_string(),
            })?;

        info!(
            port = self.listen_port,
            upstream = %self.settings().upstream_name,
            "stream tcp listening"
        );

        loop {
            match listener.accept().await {
                Ok((client_socket, client_addr)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        let _guard = server.drain.enter();
                        if let Err(e) = server.handle_tcp(client_socket, client_addr).await {
                            debug!(client = %client_addr, error = %e, "tcp session ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(port = self.listen_port, error = %e, "tcp accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_tcp(
        &self,
        mut client_socket: TcpStream,
        client_addr: SocketAddr,
    ) -> Result<(), ProxyError> {
        if !self.client_allowed(&client_addr) {
            // Stream clients see a reset, nothing else.
            return Ok(());
        }

        let settings = self.settings();
        let candidates = self.candidates(&client_addr);
        if candidates.is_empty() {
            warn!(upstream = %settings.upstream_name, "no stream members available");
            return Ok(());
        }

        // One dial attempt per ring candidate.
        let mut upstream_socket = None;
        for member in &candidates {
            match tokio::time::timeout(
                settings.connect_timeout,
                TcpStream::connect(member.as_str()),
            )
            .await
            {
                Ok(Ok(socket)) => {
                    self.ctx.selector.record_success(member);
                    upstream_socket = Some((socket, member.clone()));
                    break;
                }
                Ok(Err(e)) => {
                    self.ctx.selector.record_failure(member);
                    debug!(member = %member, error = %e, "stream dial failed");
                }
                Err(_) => {
                    self.ctx.selector.record_failure(member);
                    debug!(member = %member, "stream dial timed out");
                }
            }
        }

        let Some((mut upstream_socket, member)) = upstream_socket else {
            self.ctx.observer.push_log(format!(
                "[STREAM :{}] all members of '{}' failed for {}",
                self.listen_port, settings.upstream_name, client_addr
            ));
            return Ok(());
        };

        debug!(client = %client_addr, member = %member, "tcp splice open");
        let (in_bytes, out_bytes) =
            splice(&mut client_socket, &mut upstream_socket, settings.idle_timeout).await;
        debug!(
            client = %client_addr,
            member = %member,
            bytes_in = in_bytes,
            bytes_out = out_bytes,
            "tcp splice closed"
        );

        Ok(())
    }

    // ------------------------------------------------------------------
    // UDP
    // ------------------------------------------------------------------

    async fn serve_udp(self: Arc<Self>) -> Result<(), ProxyError> {
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], self.listen_port));
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| ProxyError::Bind {
                addr: bind_addr.to_string(),
                reason: e.to_string(),
            })?;
        let socket = Arc::new(socket);

        info!(
            port = self.listen_port,
            upstream = %self.settings().upstream_name,
            "stream udp listening"
        );

        let sessions: Arc<Mutex<BoundedTable<SocketAddr, UdpSession>>> =
            Arc::new(Mutex::new(BoundedTable::new(MAX_UDP_SESSIONS)));

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut sweep = tokio::time::interval(UDP_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    let idle = self.settings().idle_timeout;
                    let now = Instant::now();
                    sessions.lock().retain(|_, s| {
                        now.duration_since(s.last_seen_instant()) < idle
                    });
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, client_addr)) => {
                            self.clone()
                                .on_datagram(&socket, &sessions, &buf[..len], client_addr)
                                .await;
                        }
                        Err(e) => {
                            warn!(port = self.listen_port, error = %e, "udp recv error");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
            }
        }
    }

    async fn on_datagram(
        self: Arc<Self>,
        listen_socket: &Arc<UdpSocket>,
        sessions: &Arc<Mutex<BoundedTable<SocketAddr, UdpSession>>>,
        payload: &[u8],
        client_addr: SocketAddr,
    ) {
        if !self.client_allowed(&client_addr) {
            return;
        }

        // Fast path: existing session.
        let existing = {
            let mut map = sessions.lock();
            map.get_mut(&client_addr).map(|s| {
                s.touch();
                s.socket.clone()
            })
        };

        if let Some(upstream_socket) = existing {
            let _ = upstream_socket.send(payload).await;
            return;
        }

        // New session: pick a member, open a dedicated socket, start the
        // reverse relay.
        let candidates = self.candidates(&client_addr);
        let Some(member) = candidates.first() else {
            return;
        };
        let Ok(upstream_addr) = member.parse::<SocketAddr>() else {
            warn!(member = %member, "udp member is not a socket address");
            return;
        };

        let upstream_socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "udp session socket bind failed");
                return;
            }
        };
        if let Err(e) = upstream_socket.connect(upstream_addr).await {
            self.ctx.selector.record_failure(member);
            warn!(member = %member, error = %e, "udp session connect failed");
            return;
        }
        let upstream_socket = Arc::new(upstream_socket);

        let session = UdpSession::start(
            upstream_socket.clone(),
            listen_socket.clone(),
            client_addr,
        );
        debug!(client = %client_addr, member = %member, "udp session open");

        let _ = upstream_socket.send(payload).await;
        sessions.lock().insert(client_addr, session);
    }
}

// ============================================================================
// UDP session
// ============================================================================

struct UdpSession {
    socket: Arc<UdpSocket>,
    /// Milliseconds of activity age, measured against `epoch`.
    last_seen_ms: Arc<AtomicU64>,
    epoch: Instant,
    relay: tokio::task::JoinHandle<()>,
}

impl UdpSession {
    /// Open the reverse relay: upstream datagrams go back to the client
    /// through the listening socket.
    fn start(
        upstream_socket: Arc<UdpSocket>,
        listen_socket: Arc<UdpSocket>,
        client_addr: SocketAddr,
    ) -> Self {
        let epoch = Instant::now();
        let last_seen_ms = Arc::new(AtomicU64::new(0));
        let seen = last_seen_ms.clone();
        let relay_socket = upstream_socket.clone();

        let relay = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match relay_socket.recv(&mut buf).await {
                    Ok(len) => {
                        seen.store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
                        if listen_socket.send_to(&buf[..len], client_addr).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            socket: upstream_socket,
            last_seen_ms,
            epoch,
            relay,
        }
    }

    fn touch(&self) {
        self.last_seen_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn last_seen_instant(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed))
    }
}

impl Drop for UdpSession {
    fn drop(&mut self) {
        self.relay.abort();
    }
}

// ============================================================================
// TCP splice
// ============================================================================

/// Copy both directions until either side closes or no bytes move in either
/// direction for `idle_timeout`. Returns (client→upstream, upstream→client)
/// byte counts.
async fn splice(
    client: &mut TcpStream,
    upstream: &mut TcpStream,
    idle_timeout: Duration,
) -> (u64, u64) {
    let activity = Arc::new(AtomicU64::new(0));
    let epoch = Instant::now();

    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();

    let a = activity.clone();
    let c_to_u = async move {
        let mut buf = [0u8; SPLICE_BUF];
        let mut total = 0u64;
        loop {
            let n = match client_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            a.store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
            if upstream_write.write_all(&buf[..n]).await.is_err() {
                break;
            }
            total += n as u64;
        }
        let _ = upstream_write.shutdown().await;
        total
    };

    let b = activity.clone();
    let u_to_c = async move {
        let mut buf = [0u8; SPLICE_BUF];
        let mut total = 0u64;
        loop {
            let n = match upstream_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            b.store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
            if client_write.write_all(&buf[..n]).await.is_err() {
                break;
            }
            total += n as u64;
        }
        let _ = client_write.shutdown().await;
        total
    };

    let watchdog = async {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let last = Duration::from_millis(activity.load(Ordering::Relaxed));
            if epoch.elapsed().saturating_sub(last) > idle_timeout {
                break;
            }
        }
    };

    tokio::select! {
        (sent, received) = async { tokio::join!(c_to_u, u_to_c) } => (sent, received),
        _ = watchdog => {
            debug!("stream idle timeout");
            (0, 0)
        }
    }
}
