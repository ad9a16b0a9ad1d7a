//! LAN discovery in one of two roles.
//!
//! - **Advertiser**: sends a UDP beacon every `beacon_interval` and
//!   accepts invitations on a TCP listener.
//! - **Browser**: listens for beacons, keeps the registry's discovered
//!   set current and issues invitations through [`DiscoveryService::contact`].
//!
//! Start failures are returned once and never retried. A socket failure
//! after start is logged and published as [`DiscoveryStatus::Failed`].

pub mod beacon;
mod invite;

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{DiscoveryConfig, validate_service_type};
use crate::error::PeerError;
use crate::identity::NodeId;
use crate::network::Session;
use crate::request::ConnectionRequest;

pub use beacon::Beacon;
pub use invite::{AcceptAll, InvitationPolicy};

// ── Role ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Advertiser,
    Browser,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Advertiser => write!(f, "advertiser"),
            Self::Browser => write!(f, "browser"),
        }
    }
}

// ── DiscoveryStatus ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryStatus {
    Running,
    /// The discovery socket failed after start. Not retried.
    Failed(String),
    Stopped,
}

// ── DiscoveryService ─────────────────────────────────────────────

pub struct DiscoveryService {
    role: Role,
    config: DiscoveryConfig,
    session: Arc<Session>,
    discovery_addr: SocketAddr,
    session_addr: Option<SocketAddr>,
    status: Arc<watch::Sender<DiscoveryStatus>>,
    cancel: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
}

impl DiscoveryService {
    /// Start discovery with the accept-all invitation policy.
    pub async fn start(
        role: Role,
        session: Arc<Session>,
        config: DiscoveryConfig,
    ) -> Result<Self, PeerError> {
        Self::start_with_policy(role, session, config, Arc::new(AcceptAll)).await
    }

    /// Bind sockets and spawn the role's tasks.
    ///
    /// Binding or group-join failures come back as
    /// [`PeerError::DiscoveryStart`].
    pub async fn start_with_policy(
        role: Role,
        session: Arc<Session>,
        config: DiscoveryConfig,
        policy: Arc<dyn InvitationPolicy>,
    ) -> Result<Self, PeerError> {
        validate_service_type(&config.service_type)?;
        let start_err = |source| PeerError::DiscoveryStart { role, source };

        let (status_tx, _) = watch::channel(DiscoveryStatus::Running);
        let status = Arc::new(status_tx);
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        let (discovery_addr, session_addr) = match role {
            Role::Advertiser => {
                let listener = TcpListener::bind(config.session_bind)
                    .await
                    .map_err(start_err)?;
                let session_addr = listener.local_addr().map_err(start_err)?;
                let socket = advertiser_socket(config.announce_addr)
                    .await
                    .map_err(start_err)?;
                let discovery_addr = socket.local_addr().map_err(start_err)?;

                let beacon = Beacon::new(
                    config.service_type.clone(),
                    session.local().clone(),
                    session_addr.port(),
                );
                tasks.spawn(beacon_loop(
                    socket,
                    beacon,
                    config.clone(),
                    Arc::clone(&status),
                    cancel.clone(),
                ));
                tasks.spawn(accept_loop(
                    listener,
                    Arc::clone(&session),
                    policy,
                    config.clone(),
                    Arc::clone(&status),
                    cancel.clone(),
                ));
                (discovery_addr, Some(session_addr))
            }
            Role::Browser => {
                let socket = browser_socket(config.browse_bind, config.announce_addr)
                    .await
                    .map_err(start_err)?;
                let discovery_addr = socket.local_addr().map_err(start_err)?;
                tasks.spawn(browse_loop(
                    socket,
                    Arc::clone(&session),
                    config.clone(),
                    Arc::clone(&status),
                    cancel.clone(),
                ));
                (discovery_addr, None)
            }
        };

        info!(%role, service_type = %config.service_type, %discovery_addr, "discovery started");
        Ok(Self {
            role,
            config,
            session,
            discovery_addr,
            session_addr,
            status,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Local address of the UDP socket (beacon source or listen address).
    pub fn local_discovery_addr(&self) -> SocketAddr {
        self.discovery_addr
    }

    /// Advertiser only: where invitations are accepted.
    pub fn session_addr(&self) -> Option<SocketAddr> {
        self.session_addr
    }

    pub fn status(&self) -> DiscoveryStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<DiscoveryStatus> {
        self.status.subscribe()
    }

    /// Browser only: invite a discovered peer. Returns immediately; the
    /// outcome shows up in the registry as `connected`, or as the peer
    /// reverting to `discovered` on rejection or timeout.
    ///
    /// Contacting a peer that is already `connecting` or `connected` is a
    /// no-op.
    pub async fn contact(&self, peer: &NodeId, request: &ConnectionRequest) -> Result<(), PeerError> {
        if self.role != Role::Browser {
            return Err(PeerError::WrongRole {
                expected: Role::Browser,
            });
        }
        let context = request.to_bytes()?;
        let Some(endpoint) = self.session.registry().begin_contact(peer)? else {
            debug!(peer = %peer, "contact ignored: already engaged");
            return Ok(());
        };

        info!(peer = %peer, %endpoint, "contacting peer");
        let session = Arc::clone(&self.session);
        let limit = self.config.invite_timeout;
        let peer = *peer;
        let cancel = self.cancel.clone();
        let mut tasks = self.tasks.lock().await;
        // Reap finished contacts so the set does not grow.
        while let Some(res) = tasks.try_join_next() {
            if let Err(e) = res {
                if e.is_panic() {
                    error!("contact task panicked: {e}");
                }
            }
        }
        tasks.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    session.registry().contact_failed(&peer);
                }
                _ = invite::contact_peer(Arc::clone(&session), endpoint, peer, context, limit) => {}
            }
        });
        Ok(())
    }

    /// Stop all discovery tasks. An advertiser sends a departing beacon
    /// first. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut tasks = self.tasks.lock().await;
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                if e.is_panic() {
                    error!("discovery task panicked: {e}");
                }
            }
        }
        self.status.send_if_modified(|status| {
            if matches!(status, DiscoveryStatus::Failed(_) | DiscoveryStatus::Stopped) {
                return false;
            }
            *status = DiscoveryStatus::Stopped;
            true
        });
        info!(role = %self.role, "discovery stopped");
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Sockets ──────────────────────────────────────────────────────

fn unspecified(addr: &SocketAddr) -> IpAddr {
    match addr {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

async fn advertiser_socket(announce: SocketAddr) -> std::io::Result<UdpSocket> {
    let bind_ip = if announce.ip().is_loopback() {
        announce.ip()
    } else {
        unspecified(&announce)
    };
    let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0)).await?;
    if let IpAddr::V4(group) = announce.ip() {
        if group.is_multicast() {
            socket.set_multicast_ttl_v4(1)?;
            socket.set_multicast_loop_v4(true)?;
        }
    }
    Ok(socket)
}

async fn browser_socket(bind: SocketAddr, announce: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind(bind).await?;
    match announce.ip() {
        IpAddr::V4(group) if group.is_multicast() => {
            socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
        }
        IpAddr::V6(group) if group.is_multicast() => {
            socket.join_multicast_v6(&group, 0)?;
        }
        _ => {}
    }
    Ok(socket)
}

fn fail(status: &watch::Sender<DiscoveryStatus>, role: Role, what: &str, e: std::io::Error) {
    error!(%role, "{what} failed, discovery halted: {e}");
    status.send_replace(DiscoveryStatus::Failed(format!("{what}: {e}")));
}

// ── Advertiser tasks ─────────────────────────────────────────────

async fn beacon_loop(
    socket: UdpSocket,
    beacon: Beacon,
    config: DiscoveryConfig,
    status: Arc<watch::Sender<DiscoveryStatus>>,
    cancel: CancellationToken,
) {
    let (announce, departing) = match (beacon.encode(), beacon.clone().departing().encode()) {
        (Ok(a), Ok(d)) => (a, d),
        (Err(e), _) | (_, Err(e)) => {
            error!("cannot encode beacon: {e}");
            status.send_replace(DiscoveryStatus::Failed(e.to_string()));
            return;
        }
    };

    let mut ticker = tokio::time::interval(config.beacon_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = socket.send_to(&departing, config.announce_addr).await {
                    debug!("departing beacon not sent: {e}");
                }
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&announce, config.announce_addr).await {
                    fail(&status, Role::Advertiser, "beacon send", e);
                    return;
                }
                trace!(to = %config.announce_addr, "beacon sent");
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    session: Arc<Session>,
    policy: Arc<dyn InvitationPolicy>,
    config: DiscoveryConfig,
    status: Arc<watch::Sender<DiscoveryStatus>>,
    cancel: CancellationToken,
) {
    let mut handlers = JoinSet::new();
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            // Reap finished handlers so the set does not grow.
            Some(_) = handlers.join_next(), if !handlers.is_empty() => continue,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                debug!(%addr, "inbound connection");
                handlers.spawn(invite::handle_invitation(
                    stream,
                    addr,
                    Arc::clone(&session),
                    Arc::clone(&policy),
                    config.invite_timeout,
                ));
            }
            Err(e) => {
                fail(&status, Role::Advertiser, "session accept", e);
                break;
            }
        }
    }
    handlers.abort_all();
}

// ── Browser task ─────────────────────────────────────────────────

async fn browse_loop(
    socket: UdpSocket,
    session: Arc<Session>,
    config: DiscoveryConfig,
    status: Arc<watch::Sender<DiscoveryStatus>>,
    cancel: CancellationToken,
) {
    let local = session.local().id();
    let registry = session.registry().clone();
    let mut last_seen: HashMap<NodeId, Instant> = HashMap::new();
    let mut buf = vec![0u8; beacon::MAX_BEACON_SIZE];

    let sweep_every = (config.peer_timeout / 2).max(std::time::Duration::from_millis(10));
    let mut sweep = tokio::time::interval(sweep_every);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            received = socket.recv_from(&mut buf) => {
                let (n, from) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        fail(&status, Role::Browser, "beacon receive", e);
                        return;
                    }
                };
                let beacon = match Beacon::decode(&buf[..n]) {
                    Ok(b) => b,
                    Err(e) => {
                        trace!(%from, "ignoring datagram: {e}");
                        continue;
                    }
                };
                if !beacon.is_relevant(&config.service_type, &local) {
                    continue;
                }
                let id = beacon.identity.id();
                if beacon.departing {
                    last_seen.remove(&id);
                    registry.peer_lost(&id);
                    continue;
                }
                last_seen.insert(id, Instant::now());
                let endpoint = SocketAddr::new(from.ip(), beacon.session_port);
                registry.peer_found(beacon.identity, endpoint);
            }
            _ = sweep.tick() => {
                let now = Instant::now();
                let expired: Vec<NodeId> = last_seen
                    .iter()
                    .filter(|(_, seen)| now.duration_since(**seen) >= config.peer_timeout)
                    .map(|(id, _)| *id)
                    .collect();
                for id in expired {
                    last_seen.remove(&id);
                    warn!(peer = %id, "peer announcements timed out");
                    registry.peer_lost(&id);
                }
            }
        }
    }
}
