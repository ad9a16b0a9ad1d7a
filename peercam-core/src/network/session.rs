//! The node's single transport session, shared by all of its peers.
//!
//! Links are established by discovery (after an accepted invitation) and
//! handed to [`Session::attach`]. From then on the session owns them:
//! `send` fans a payload out to the requested peers, and any failure
//! resets the whole session together with the registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::codec::FrameCodec;
use crate::config::SessionConfig;
use crate::frame::{Frame, MAX_PAYLOAD_SIZE};
use crate::identity::{NodeId, NodeIdentity};
use crate::network::link::{self, LinkParams, Links};
use crate::network::{PayloadSink, SendOutcome};
use crate::state::PeerRegistry;

pub struct Session {
    local: NodeIdentity,
    registry: PeerRegistry,
    links: Links,
    config: SessionConfig,
    next_generation: AtomicU64,
}

impl Session {
    pub fn new(local: NodeIdentity, registry: PeerRegistry, config: SessionConfig) -> Self {
        Self {
            local,
            registry,
            links: Links::default(),
            config,
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn local(&self) -> &NodeIdentity {
        &self.local
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Ids of peers that currently have a live link.
    pub async fn linked_peers(&self) -> Vec<NodeId> {
        let mut ids: Vec<_> = self.links.lock().await.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Take ownership of an established stream to `remote`.
    ///
    /// The peer must already be `connecting` in the registry. A link that
    /// replaces an older one for the same peer closes the old one.
    pub(crate) async fn attach(&self, framed: Framed<TcpStream, FrameCodec>, remote: NodeIdentity) {
        let id = remote.id();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut links = self.links.lock().await;
            let handle = link::spawn(
                framed,
                LinkParams {
                    remote: remote.clone(),
                    generation,
                    queue: self.config.link_queue,
                    heartbeat: self.config.heartbeat_interval,
                },
                self.registry.clone(),
                Arc::clone(&self.links),
            );
            if let Some(old) = links.insert(id, handle) {
                debug!(peer = %id, generation = old.generation, "replacing existing link");
                old.cancel.cancel();
            }
        }

        self.registry.session_connected(&remote);
        if !self.registry.is_connected(&id) {
            // Registry refused the peer, or the link already died.
            let mut links = self.links.lock().await;
            if links.get(&id).is_some_and(|l| l.generation == generation) {
                if let Some(orphan) = links.remove(&id) {
                    orphan.cancel.cancel();
                }
            }
            return;
        }
        info!(peer = %remote, generation, "link up");
    }

    /// Queue `payload` on the link of every peer in `to`.
    ///
    /// An empty target set, or no connected peers at all, is a no-op. Any
    /// failure (an oversized payload, a target without a live link, a closed
    /// link or a queue that stays full past `send_timeout`) resets the
    /// session.
    pub async fn send(&self, payload: Bytes, to: &[NodeId]) -> SendOutcome {
        if to.is_empty() || self.registry.connected_count() == 0 {
            debug!(targets = to.len(), "nothing to send to");
            return SendOutcome::Skipped;
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            warn!(len = payload.len(), max = MAX_PAYLOAD_SIZE, "payload too large to frame");
            self.reset().await;
            return SendOutcome::Reset;
        }

        let targets: Result<Vec<(NodeId, mpsc::Sender<Frame>)>, NodeId> = {
            let links = self.links.lock().await;
            to.iter()
                .map(|id| links.get(id).map(|l| (*id, l.tx.clone())).ok_or(*id))
                .collect()
        };
        let targets = match targets {
            Ok(targets) => targets,
            Err(id) => {
                warn!(peer = %id, "send target has no live link");
                self.reset().await;
                return SendOutcome::Reset;
            }
        };

        for (id, tx) in targets {
            match timeout(self.config.send_timeout, tx.send(Frame::Data(payload.clone()))).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    warn!(peer = %id, "link closed during send");
                    self.reset().await;
                    return SendOutcome::Reset;
                }
                Err(_) => {
                    warn!(peer = %id, timeout = ?self.config.send_timeout, "send timed out");
                    self.reset().await;
                    return SendOutcome::Reset;
                }
            }
        }
        debug!(len = payload.len(), targets = to.len(), "payload queued");
        SendOutcome::Delivered
    }

    /// Close one peer's link. The peer is reported disconnected.
    pub async fn disconnect(&self, id: &NodeId) -> bool {
        let removed = self.links.lock().await.remove(id);
        match removed {
            Some(handle) => {
                handle.cancel.cancel();
                self.registry.session_disconnected(id);
                true
            }
            None => false,
        }
    }

    /// Drop every link and clear the registry in one step.
    pub async fn reset(&self) {
        let drained: Vec<_> = self.links.lock().await.drain().collect();
        for (_, handle) in &drained {
            handle.cancel.cancel();
        }
        warn!(links = drained.len(), "session reset");
        self.registry.reset();
    }

    /// Say goodbye on every link. Peers are reported disconnected; the
    /// rest of the registry is left alone.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.links.lock().await.drain().collect();
        for (id, handle) in drained {
            handle.cancel.cancel();
            self.registry.session_disconnected(&id);
        }
    }
}

#[async_trait]
impl PayloadSink for Session {
    async fn deliver(&self, payload: Bytes, to: &[NodeId]) -> SendOutcome {
        self.send(payload, to).await
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;

    async fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    /// Two sessions joined by one link, both sides `connected`.
    async fn joined() -> (Session, Session) {
        let a = Session::new(
            NodeIdentity::new("a"),
            PeerRegistry::new(),
            SessionConfig::default(),
        );
        let b = Session::new(
            NodeIdentity::new("b"),
            PeerRegistry::new(),
            SessionConfig::default(),
        );
        let (sa, sb) = stream_pair().await;
        a.registry().invitation_received(b.local().clone());
        b.registry().invitation_received(a.local().clone());
        a.attach(Framed::new(sa, FrameCodec), b.local().clone()).await;
        b.attach(Framed::new(sb, FrameCodec), a.local().clone()).await;
        (a, b)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn attached_link_delivers_bytes() {
        let (a, b) = joined().await;
        assert!(a.registry().is_connected(&b.local().id()));
        assert_eq!(a.linked_peers().await, vec![b.local().id()]);

        let outcome = a
            .send(Bytes::from_static(&[0x50, 0x4E, 0x47]), &[b.local().id()])
            .await;
        assert_eq!(outcome, SendOutcome::Delivered);

        wait_for(|| b.registry().inbound().is_some()).await;
        let inbound = b.registry().inbound().unwrap();
        assert_eq!(&inbound.bytes[..], &[0x50, 0x4E, 0x47]);
        assert_eq!(inbound.sender, *a.local());
    }

    #[tokio::test]
    async fn empty_targets_are_skipped() {
        let (a, b) = joined().await;
        assert_eq!(
            a.send(Bytes::from_static(b"x"), &[]).await,
            SendOutcome::Skipped
        );
        assert!(a.registry().is_connected(&b.local().id()));
    }

    #[tokio::test]
    async fn nobody_connected_is_skipped() {
        let session = Session::new(
            NodeIdentity::new("lonely"),
            PeerRegistry::new(),
            SessionConfig::default(),
        );
        let outcome = session
            .send(Bytes::from_static(b"x"), &[NodeId::random()])
            .await;
        assert_eq!(outcome, SendOutcome::Skipped);
    }

    #[tokio::test]
    async fn send_failure_resets_everything() {
        let (a, b) = joined().await;
        a.registry().record_inbound(b.local().clone(), Bytes::from_static(b"old"));
        a.registry().select(&b.local().id()).unwrap();

        let outcome = a
            .send(Bytes::from_static(b"x"), &[NodeId::random()])
            .await;
        assert_eq!(outcome, SendOutcome::Reset);

        let snap = a.registry().snapshot();
        assert!(snap.peers().is_empty());
        assert!(snap.inbound().is_none());
        assert!(snap.selected().is_none());
        assert!(a.linked_peers().await.is_empty());
    }

    #[tokio::test]
    async fn oversized_payload_resets_session() {
        let (a, b) = joined().await;
        a.registry().record_inbound(b.local().clone(), Bytes::from_static(b"old"));

        let outcome = a
            .send(Bytes::from(vec![7u8; MAX_PAYLOAD_SIZE + 1]), &[b.local().id()])
            .await;
        assert_eq!(outcome, SendOutcome::Reset);

        let snap = a.registry().snapshot();
        assert!(snap.peers().is_empty());
        assert!(snap.inbound().is_none());
        assert!(a.linked_peers().await.is_empty());
        assert!(b.registry().inbound().is_none());
    }

    #[tokio::test]
    async fn remote_goodbye_disconnects_peer() {
        let (a, b) = joined().await;
        b.shutdown().await;
        wait_for(|| !a.registry().is_connected(&b.local().id())).await;
        wait_for(|| a.registry().peer(&b.local().id()).is_none()).await;
    }

    #[tokio::test]
    async fn attach_without_invitation_is_refused() {
        let a = Session::new(
            NodeIdentity::new("a"),
            PeerRegistry::new(),
            SessionConfig::default(),
        );
        let (sa, _sb) = stream_pair().await;
        let stranger = NodeIdentity::new("stranger");
        a.attach(Framed::new(sa, FrameCodec), stranger.clone()).await;
        assert!(!a.registry().is_connected(&stranger.id()));
        assert!(a.linked_peers().await.is_empty());
    }
}
