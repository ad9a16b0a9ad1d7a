//! Node runner core logic.
//!
//! Runs one node in either role until stopped:
//! - **advertise**: wait for invitations and log (optionally save) every
//!   payload received.
//! - **browse**: find a peer, contact it and stream the capture file to
//!   it, starting over whenever the peer goes away.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use peercam_core::{
    CaptureHandle, ConnectionRequest, InboundMessage, LoopPhase, Node, NodeId, PeerError,
    PeerRegistry, PeerState, RegistrySnapshot, Role,
};

use crate::capture::FileCapture;
use crate::config::NodeFileConfig;

/// Placeholder sent in every connection request.
pub const REQUEST_PLACEHOLDER: &str = concat!("peercam-node/", env!("CARGO_PKG_VERSION"));

// ── Mode ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Mode {
    Advertise {
        /// Write each received payload here.
        save: Option<PathBuf>,
    },
    Browse {
        image: PathBuf,
        /// Overrides `capture.interval_secs`.
        interval: Option<u64>,
        /// Only contact the peer with this label.
        peer: Option<String>,
    },
}

impl Mode {
    pub fn role(&self) -> Role {
        match self {
            Mode::Advertise { .. } => Role::Advertiser,
            Mode::Browse { .. } => Role::Browser,
        }
    }
}

// ── NodeService ──────────────────────────────────────────────────

pub struct NodeService {
    config: NodeFileConfig,
    label: String,
    mode: Mode,
    running: Arc<AtomicBool>,
}

impl NodeService {
    pub fn new(config: NodeFileConfig, label: impl Into<String>, mode: Mode) -> Self {
        Self {
            config,
            label: label.into(),
            mode,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Obtain a handle that can be used to stop the service from another
    /// task (e.g. the Ctrl-C handler).
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run until stopped.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.running.store(true, Ordering::SeqCst);
        let mut node_config = self.config.to_node_config()?;
        if let Mode::Browse {
            interval: Some(secs),
            ..
        } = &self.mode
        {
            node_config.capture.interval_secs = *secs;
            node_config.validate()?;
        }

        let node = Node::start(self.mode.role(), self.label.clone(), node_config).await?;
        info!(node = %node.identity(), role = %node.role(), "node up");
        if let Some(addr) = node.discovery().session_addr() {
            info!("accepting invitations on {addr}");
        }

        let save = match &self.mode {
            Mode::Advertise { save } => save.clone(),
            Mode::Browse { .. } => None,
        };
        let observer = tokio::spawn(observe(node.registry().clone(), save));

        let result = match &self.mode {
            Mode::Advertise { .. } => {
                wait_for_stop(&self.running).await;
                Ok(())
            }
            Mode::Browse { image, peer, .. } => {
                self.browse(&node, image.clone(), peer.as_deref()).await
            }
        };

        observer.abort();
        node.shutdown().await;
        self.running.store(false, Ordering::SeqCst);
        info!("node service stopped");
        result
    }

    // ── Internal ─────────────────────────────────────────────────

    async fn browse(
        &self,
        node: &Node,
        image: PathBuf,
        label: Option<&str>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (handle, _task) = node.capture_loop(Arc::new(FileCapture::new(image)))?;
        let request = ConnectionRequest::new(REQUEST_PLACEHOLDER);
        let invite_wait = self.config.discovery.invite_timeout_secs.max(1) + 1;
        let retry = self.config.retry_delay();

        while self.is_running() {
            let Some(target) = self.wait_for_target(node.registry(), label).await else {
                break;
            };
            node.contact(&target, &request).await?;
            if !self.wait_for_connected(node.registry(), target, invite_wait).await {
                debug!(peer = %target, delay = ?retry, "invitation failed; retrying later");
                tokio::select! {
                    _ = tokio::time::sleep(retry) => {}
                    _ = wait_for_stop(&self.running) => {}
                }
                continue;
            }
            if let Err(e) = self.stream_to(&handle, target).await {
                warn!(peer = %target, "capture loop error: {e}");
            }
        }
        handle.stop().await?;
        Ok(())
    }

    /// Next peer worth contacting: discovered (or disconnected) and
    /// matching `label` if one was given.
    async fn wait_for_target(&self, registry: &PeerRegistry, label: Option<&str>) -> Option<NodeId> {
        let pick = |snap: &RegistrySnapshot| {
            snap.peers()
                .iter()
                .filter(|p| matches!(p.state(), PeerState::Discovered | PeerState::Disconnected))
                .filter(|p| p.endpoint().is_some())
                .find(|p| label.is_none_or(|l| p.identity().label() == l))
                .map(|p| p.id())
        };
        let mut rx = registry.subscribe();
        tokio::select! {
            found = rx.wait_for(|snap| pick(snap).is_some()) => {
                found.ok().and_then(|snap| pick(&*snap))
            }
            _ = wait_for_stop(&self.running) => None,
        }
    }

    async fn wait_for_connected(&self, registry: &PeerRegistry, peer: NodeId, secs: u64) -> bool {
        let mut rx = registry.subscribe();
        let connected = rx.wait_for(|snap| match snap.peer(&peer) {
            Some(p) => p.state() != PeerState::Connecting,
            None => true,
        });
        tokio::select! {
            settled = tokio::time::timeout(Duration::from_secs(secs), connected) => {
                settled
                    .ok()
                    .and_then(Result::ok)
                    .is_some_and(|snap| snap.is_connected(&peer))
            }
            _ = wait_for_stop(&self.running) => false,
        }
    }

    /// Stream to `peer` until the loop goes idle or the service stops.
    async fn stream_to(&self, handle: &CaptureHandle, peer: NodeId) -> Result<(), PeerError> {
        handle.select_peer(peer).await?;
        handle.start().await?;
        let mut status = handle.subscribe();
        let ended = tokio::select! {
            idle = status.wait_for(|s| s.phase == LoopPhase::Idle) => idle.is_ok(),
            _ = wait_for_stop(&self.running) => false,
        };
        if ended {
            let s = handle.status();
            info!(sends = s.sends, skips = s.skips, "stream ended");
        }
        Ok(())
    }
}

/// Log registry changes; in advertise mode also persist inbound payloads.
async fn observe(registry: PeerRegistry, save: Option<PathBuf>) {
    let mut rx: watch::Receiver<RegistrySnapshot> = registry.subscribe();
    let mut peers_seen: Vec<(NodeId, PeerState)> = Vec::new();
    let mut last_inbound: Option<InboundMessage> = None;

    while rx.changed().await.is_ok() {
        let snap = rx.borrow_and_update().clone();

        let peers: Vec<_> = snap.peers().iter().map(|p| (p.id(), p.state())).collect();
        if peers != peers_seen {
            for p in snap.peers() {
                info!(peer = %p.identity(), state = %p.state(), "peer");
            }
            if peers.is_empty() {
                info!("no peers");
            }
            peers_seen = peers;
        }

        if let Some(inbound) = snap.inbound() {
            if last_inbound.as_ref() != Some(inbound) {
                info!(from = %inbound.sender, len = inbound.bytes.len(), "payload received");
                if let Some(path) = &save {
                    if let Err(e) = tokio::fs::write(path, &inbound.bytes).await {
                        warn!("cannot save payload to {}: {e}", path.display());
                    }
                }
                last_inbound = Some(inbound.clone());
            }
        }
    }
}

/// Async helper: resolves when `running` becomes false.
async fn wait_for_stop(running: &Arc<AtomicBool>) {
    loop {
        if !running.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_creates_stopped() {
        let svc = NodeService::new(
            NodeFileConfig::default(),
            "cam",
            Mode::Advertise { save: None },
        );
        assert!(!svc.is_running());
    }

    #[test]
    fn stop_handle_works() {
        let svc = NodeService::new(
            NodeFileConfig::default(),
            "cam",
            Mode::Advertise { save: None },
        );
        let handle = svc.stop_handle();
        handle.store(true, Ordering::SeqCst);
        assert!(svc.is_running());
        svc.stop();
        assert!(!svc.is_running());
    }

    #[test]
    fn mode_maps_to_role() {
        assert_eq!(Mode::Advertise { save: None }.role(), Role::Advertiser);
        let browse = Mode::Browse {
            image: "latest.png".into(),
            interval: None,
            peer: None,
        };
        assert_eq!(browse.role(), Role::Browser);
    }

    #[tokio::test]
    async fn out_of_range_interval_fails_run() {
        let svc = NodeService::new(
            NodeFileConfig::default(),
            "cam",
            Mode::Browse {
                image: "latest.png".into(),
                interval: Some(0),
                peer: None,
            },
        );
        assert!(svc.run().await.is_err());
    }

    #[tokio::test]
    async fn refused_invitations_are_paced() {
        use std::sync::atomic::AtomicUsize;

        use peercam_core::discovery::Beacon;
        use peercam_core::NodeIdentity;
        use tokio::net::{TcpListener, UdpSocket};

        // Advertiser stand-in that closes every invitation unanswered.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let session_port = listener.local_addr().unwrap().port();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&attempts);
        let refuser = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counted.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });

        let browse_port = std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut config = NodeFileConfig::default();
        config.network.bind_ip = "127.0.0.1".into();
        config.network.announce_addr = format!("127.0.0.1:{browse_port}");
        config.discovery.service_type = "x7z9".into();
        config.discovery.retry_delay_ms = 500;

        let svc = Arc::new(NodeService::new(
            config,
            "browser",
            Mode::Browse {
                image: "/nonexistent/peercam/latest.png".into(),
                interval: None,
                peer: None,
            },
        ));
        let runner = tokio::spawn({
            let svc = Arc::clone(&svc);
            async move { svc.run().await.is_ok() }
        });

        let beacon = Beacon::new("x7z9", NodeIdentity::new("cam"), session_port)
            .encode()
            .unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let announcer = tokio::spawn(async move {
            loop {
                let _ = sender.send_to(&beacon, ("127.0.0.1", browse_port)).await;
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while attempts.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let first = attempts.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1200)).await;
        let made = attempts.load(Ordering::SeqCst) - first;
        assert!(made <= 4, "{made} invitations in 1.2s");

        svc.stop();
        let finished = tokio::time::timeout(Duration::from_secs(5), runner).await;
        assert!(finished.unwrap().unwrap());
        announcer.abort();
        refuser.abort();
    }

    #[tokio::test]
    async fn observer_saves_inbound_payload() {
        let registry = PeerRegistry::new();
        let path = std::env::temp_dir().join(format!("peercam-observe-{}.bin", std::process::id()));
        let task = tokio::spawn(observe(registry.clone(), Some(path.clone())));

        registry.record_inbound(
            peercam_core::NodeIdentity::new("browser"),
            bytes::Bytes::from_static(b"\x50\x4E\x47"),
        );
        let saved = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(data) = tokio::fs::read(&path).await {
                    break data;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(saved, b"\x50\x4E\x47");

        task.abort();
        let _ = tokio::fs::remove_file(&path).await;
    }
}
