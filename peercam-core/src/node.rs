//! One node: identity, registry, session and discovery for a fixed role.

use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::info;

use crate::capture::{CaptureHandle, CaptureService, CaptureSource};
use crate::config::NodeConfig;
use crate::discovery::{AcceptAll, DiscoveryService, InvitationPolicy, Role};
use crate::error::PeerError;
use crate::identity::{NodeId, NodeIdentity};
use crate::network::{PayloadSink, SendOutcome, Session};
use crate::request::ConnectionRequest;
use crate::state::PeerRegistry;

pub struct Node {
    session: Arc<Session>,
    discovery: DiscoveryService,
    config: NodeConfig,
}

impl Node {
    pub async fn start(
        role: Role,
        label: impl Into<String>,
        config: NodeConfig,
    ) -> Result<Self, PeerError> {
        Self::start_with_policy(role, label, config, Arc::new(AcceptAll)).await
    }

    pub async fn start_with_policy(
        role: Role,
        label: impl Into<String>,
        config: NodeConfig,
        policy: Arc<dyn InvitationPolicy>,
    ) -> Result<Self, PeerError> {
        config.validate()?;
        let identity = NodeIdentity::new(label);
        let session = Arc::new(Session::new(
            identity.clone(),
            PeerRegistry::new(),
            config.session.clone(),
        ));
        let discovery = DiscoveryService::start_with_policy(
            role,
            Arc::clone(&session),
            config.discovery.clone(),
            policy,
        )
        .await?;
        info!(%role, node = %identity, "node started");
        Ok(Self {
            session,
            discovery,
            config,
        })
    }

    pub fn identity(&self) -> &NodeIdentity {
        self.session.local()
    }

    pub fn role(&self) -> Role {
        self.discovery.role()
    }

    pub fn registry(&self) -> &PeerRegistry {
        self.session.registry()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn discovery(&self) -> &DiscoveryService {
        &self.discovery
    }

    /// Browser only. See [`DiscoveryService::contact`].
    pub async fn contact(&self, peer: &NodeId, request: &ConnectionRequest) -> Result<(), PeerError> {
        self.discovery.contact(peer, request).await
    }

    pub async fn send(&self, payload: Bytes, to: &[NodeId]) -> SendOutcome {
        self.session.send(payload, to).await
    }

    /// Spawn a capture-send loop feeding this node's session.
    pub fn capture_loop(
        &self,
        source: Arc<dyn CaptureSource>,
    ) -> Result<(CaptureHandle, JoinHandle<()>), PeerError> {
        let sink: Arc<dyn PayloadSink> = Arc::clone(&self.session) as Arc<dyn PayloadSink>;
        CaptureService::spawn(
            self.registry().clone(),
            sink,
            source,
            self.config.capture.clone(),
        )
    }

    /// Stop discovery, then close every link.
    pub async fn shutdown(&self) {
        self.discovery.shutdown().await;
        self.session.shutdown().await;
        info!(node = %self.identity(), "node stopped");
    }
}
