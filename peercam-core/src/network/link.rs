//! One session link: a framed TCP stream split into a writer task and a
//! reader task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::FrameCodec;
use crate::frame::Frame;
use crate::identity::{NodeId, NodeIdentity};
use crate::state::PeerRegistry;

pub(crate) type Links = Arc<Mutex<HashMap<NodeId, LinkHandle>>>;

/// Sending half of a link, held in the session's link table.
#[derive(Debug)]
pub(crate) struct LinkHandle {
    pub(crate) tx: mpsc::Sender<Frame>,
    pub(crate) cancel: CancellationToken,
    pub(crate) generation: u64,
}

pub(crate) struct LinkParams {
    pub(crate) remote: NodeIdentity,
    pub(crate) generation: u64,
    pub(crate) queue: usize,
    pub(crate) heartbeat: Duration,
}

/// Spawn the reader and writer tasks for an established stream.
///
/// When the link ends for any reason it removes itself from `links`
/// (if still the current generation for that peer) and reports the peer
/// disconnected.
pub(crate) fn spawn(
    framed: Framed<TcpStream, FrameCodec>,
    params: LinkParams,
    registry: PeerRegistry,
    links: Links,
) -> LinkHandle {
    let (mut net_writer, mut net_reader) = framed.split();
    let (tx, mut rx) = mpsc::channel::<Frame>(params.queue);
    let cancel = CancellationToken::new();

    // Writer task: queue -> network, plus heartbeats.
    let writer_cancel = cancel.clone();
    let heartbeat = params.heartbeat;
    let writer_peer = params.remote.id();
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
        loop {
            let frame = tokio::select! {
                _ = writer_cancel.cancelled() => {
                    let _ = net_writer.send(Frame::Goodbye).await;
                    break;
                }
                next = rx.recv() => match next {
                    Some(frame) => frame,
                    None => break,
                },
                _ = ticker.tick() => Frame::Heartbeat,
            };
            if let Err(e) = net_writer.send(frame).await {
                warn!(peer = %writer_peer, "link write error: {e}");
                break;
            }
        }
        writer_cancel.cancel();
    });

    // Reader task: network -> registry.
    let reader_cancel = cancel.clone();
    let LinkParams {
        remote, generation, ..
    } = params;
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = reader_cancel.cancelled() => break,
                next = net_reader.next() => next,
            };
            match next {
                Some(Ok(Frame::Data(bytes))) => registry.record_inbound(remote.clone(), bytes),
                Some(Ok(Frame::Heartbeat)) => trace!(peer = %remote.id(), "heartbeat"),
                Some(Ok(Frame::Goodbye)) => {
                    debug!(peer = %remote.id(), "peer said goodbye");
                    break;
                }
                Some(Ok(other)) => {
                    warn!(peer = %remote.id(), kind = %other.kind(), "unexpected frame on session link");
                    break;
                }
                Some(Err(e)) => {
                    warn!(peer = %remote.id(), "link read error: {e}");
                    break;
                }
                None => {
                    debug!(peer = %remote.id(), "link closed by peer");
                    break;
                }
            }
        }
        reader_cancel.cancel();

        let current = {
            let mut links = links.lock().await;
            let current = links
                .get(&remote.id())
                .is_some_and(|link| link.generation == generation);
            if current {
                links.remove(&remote.id());
            }
            current
        };
        if current {
            registry.session_disconnected(&remote.id());
        }
    });

    LinkHandle {
        tx,
        cancel,
        generation,
    }
}
