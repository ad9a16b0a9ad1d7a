//! Invitation handshake over TCP.
//!
//! ```text
//!  browser                          advertiser
//!     │ ── Invite { from, context } ──► │  decode ConnectionRequest
//!     │ ◄── Accept { from } ─────────── │  (or Reject { reason })
//!     │ ══════ session link ══════════  │
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::codec::FrameCodec;
use crate::error::PeerError;
use crate::frame::Frame;
use crate::identity::{NodeId, NodeIdentity};
use crate::network::Session;
use crate::request::ConnectionRequest;

/// Advertiser-side decision on well-formed invitations.
pub trait InvitationPolicy: Send + Sync {
    /// `Err(reason)` rejects the offer; the reason is sent to the browser.
    fn evaluate(&self, from: &NodeIdentity, request: &ConnectionRequest) -> Result<(), String>;
}

/// Accept every well-formed invitation.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl InvitationPolicy for AcceptAll {
    fn evaluate(&self, _from: &NodeIdentity, _request: &ConnectionRequest) -> Result<(), String> {
        Ok(())
    }
}

// ── Browser side ─────────────────────────────────────────────────

/// Connect to `endpoint`, send the invitation and wait for the answer.
/// On acceptance the returned stream is ready to become a session link.
pub(crate) async fn send_invitation(
    endpoint: SocketAddr,
    local: &NodeIdentity,
    expected: NodeId,
    context: Vec<u8>,
) -> Result<(Framed<TcpStream, FrameCodec>, NodeIdentity), PeerError> {
    let stream = TcpStream::connect(endpoint).await?;
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, FrameCodec);

    framed
        .send(Frame::Invite {
            from: local.clone(),
            context,
        })
        .await?;

    match framed.next().await {
        Some(Ok(Frame::Accept { from })) if from.id() == expected => Ok((framed, from)),
        Some(Ok(Frame::Accept { .. })) => Err(PeerError::ProtocolViolation(
            "accepted by a different identity than announced",
        )),
        Some(Ok(Frame::Reject { reason })) => Err(PeerError::Other(format!(
            "invitation rejected: {reason}"
        ))),
        Some(Ok(_)) => Err(PeerError::ProtocolViolation(
            "expected Accept or Reject in response to Invite",
        )),
        Some(Err(e)) => Err(e),
        None => Err(PeerError::ChannelClosed),
    }
}

/// Run one `contact()` to completion, updating the registry either way.
pub(crate) async fn contact_peer(
    session: Arc<Session>,
    endpoint: SocketAddr,
    peer: NodeId,
    context: Vec<u8>,
    limit: Duration,
) {
    let local = session.local().clone();
    let result = timeout(limit, send_invitation(endpoint, &local, peer, context))
        .await
        .unwrap_or(Err(PeerError::Timeout(limit)));

    match result {
        Ok((framed, remote)) => {
            debug!(peer = %remote, "invitation accepted");
            session.attach(framed, remote).await;
        }
        Err(e) => {
            warn!(peer = %peer, %endpoint, "invitation failed: {e}");
            session.registry().contact_failed(&peer);
        }
    }
}

// ── Advertiser side ──────────────────────────────────────────────

/// Handle one inbound TCP connection, expected to open with an `Invite`.
pub(crate) async fn handle_invitation(
    stream: TcpStream,
    addr: SocketAddr,
    session: Arc<Session>,
    policy: Arc<dyn InvitationPolicy>,
    limit: Duration,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%addr, "set_nodelay failed: {e}");
    }
    let mut framed = Framed::new(stream, FrameCodec);

    let (from, context) = match timeout(limit, framed.next()).await {
        Ok(Some(Ok(Frame::Invite { from, context }))) => (from, context),
        Ok(Some(Ok(other))) => {
            warn!(%addr, kind = %other.kind(), "connection did not open with an invitation");
            return;
        }
        Ok(Some(Err(e))) => {
            warn!(%addr, "unreadable invitation: {e}");
            return;
        }
        Ok(None) => {
            debug!(%addr, "connection closed before invitation");
            return;
        }
        Err(_) => {
            warn!(%addr, "no invitation within {limit:?}");
            return;
        }
    };

    let request = match ConnectionRequest::from_bytes(&context) {
        Ok(request) => request,
        Err(e) => {
            warn!(peer = %from, %addr, "rejecting invitation: {e}");
            reject(&mut framed, "malformed connection request").await;
            return;
        }
    };

    if from.id() == session.local().id() {
        reject(&mut framed, "cannot invite self").await;
        return;
    }
    if let Err(reason) = policy.evaluate(&from, &request) {
        info!(peer = %from, "invitation declined: {reason}");
        reject(&mut framed, reason).await;
        return;
    }

    let registry = session.registry();
    if !registry.invitation_received(from.clone()) {
        debug!(peer = %from, "invitation while a session is active");
        reject(&mut framed, "session already active").await;
        return;
    }

    let accept = Frame::Accept {
        from: session.local().clone(),
    };
    if let Err(e) = framed.send(accept).await {
        warn!(peer = %from, "failed to accept invitation: {e}");
        registry.contact_failed(&from.id());
        return;
    }

    info!(peer = %from, placeholder = %request.placeholder, "invitation accepted");
    session.attach(framed, from).await;
}

async fn reject(framed: &mut Framed<TcpStream, FrameCodec>, reason: impl Into<String>) {
    let frame = Frame::Reject {
        reason: reason.into(),
    };
    if let Err(e) = framed.send(frame).await {
        debug!("failed to send rejection: {e}");
    }
}
