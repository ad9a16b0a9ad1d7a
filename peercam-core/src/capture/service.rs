//! Capture-send actor.
//!
//! ```text
//!   Idle ──select_peer──► Armed ──start──► Running
//!    ▲                      │                 │
//!    └──── stop / destination lost ◄──────────┘
//! ```
//!
//! The actor owns all loop state. Commands arrive over an mpsc channel
//! and are acknowledged through oneshots; status is published on a watch
//! channel. At most one tick is in flight, and the ticker is not polled
//! while it is, so a slow tick delays the next one.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, Interval, MissedTickBehavior, timeout};
use tracing::{debug, info, warn};

use crate::capture::source::CaptureSource;
use crate::config::CaptureConfig;
use crate::error::PeerError;
use crate::identity::NodeId;
use crate::network::{PayloadSink, SendOutcome};
use crate::state::PeerRegistry;

// ── Status ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopPhase {
    #[default]
    Idle,
    /// Destination selected, not ticking.
    Armed,
    Running,
}

impl fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Armed => write!(f, "armed"),
            Self::Running => write!(f, "running"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopStatus {
    pub phase: LoopPhase,
    pub interval: Duration,
    pub destination: Option<NodeId>,
    /// Ticks started.
    pub ticks: u64,
    /// Payloads delivered to the session.
    pub sends: u64,
    /// Ticks that ended without a delivery.
    pub skips: u64,
    /// Timer reschedules caused by interval changes.
    pub reschedules: u64,
}

// ── Commands ─────────────────────────────────────────────────────

type Ack = oneshot::Sender<Result<(), PeerError>>;

enum Command {
    SelectPeer(NodeId, Ack),
    Start(Ack),
    Stop(Ack),
    SetInterval(u64, Ack),
}

/// Cloneable control handle. The actor exits when every handle is dropped.
#[derive(Clone)]
pub struct CaptureHandle {
    tx: mpsc::Sender<Command>,
    status: watch::Receiver<LoopStatus>,
}

impl CaptureHandle {
    async fn request(&self, make: impl FnOnce(Ack) -> Command) -> Result<(), PeerError> {
        let (ack, rx) = oneshot::channel();
        self.tx.send(make(ack)).await?;
        rx.await.map_err(|_| PeerError::ChannelClosed)?
    }

    /// Choose the destination. The peer must be connected.
    pub async fn select_peer(&self, peer: NodeId) -> Result<(), PeerError> {
        self.request(|ack| Command::SelectPeer(peer, ack)).await
    }

    /// Send once now, then every interval. No-op while running.
    pub async fn start(&self) -> Result<(), PeerError> {
        self.request(Command::Start).await
    }

    /// Back to idle. Any in-flight tick is abandoned.
    pub async fn stop(&self) -> Result<(), PeerError> {
        self.request(Command::Stop).await
    }

    /// Change the interval; takes effect at the next tick boundary.
    pub async fn set_interval(&self, secs: u64) -> Result<(), PeerError> {
        self.request(|ack| Command::SetInterval(secs, ack)).await
    }

    pub fn status(&self) -> LoopStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LoopStatus> {
        self.status.clone()
    }
}

// ── Actor ────────────────────────────────────────────────────────

#[derive(Debug)]
enum TickOutcome {
    Sent(SendOutcome),
    Skipped(String),
}

pub struct CaptureService {
    registry: PeerRegistry,
    sink: Arc<dyn PayloadSink>,
    source: Arc<dyn CaptureSource>,
    config: CaptureConfig,

    phase: LoopPhase,
    interval: Duration,
    destination: Option<NodeId>,
    ticker: Option<Interval>,
    last_tick: Option<Instant>,
    in_flight: Option<JoinHandle<TickOutcome>>,

    ticks: u64,
    sends: u64,
    skips: u64,
    reschedules: u64,

    status: watch::Sender<LoopStatus>,
}

impl CaptureService {
    /// Spawn the actor on the current runtime.
    pub fn spawn(
        registry: PeerRegistry,
        sink: Arc<dyn PayloadSink>,
        source: Arc<dyn CaptureSource>,
        config: CaptureConfig,
    ) -> Result<(CaptureHandle, JoinHandle<()>), PeerError> {
        let interval = config.check_interval(config.interval_secs)?;
        let (tx, rx) = mpsc::channel(16);
        let (status_tx, status_rx) = watch::channel(LoopStatus {
            phase: LoopPhase::Idle,
            interval,
            destination: None,
            ticks: 0,
            sends: 0,
            skips: 0,
            reschedules: 0,
        });

        let service = Self {
            registry,
            sink,
            source,
            config,
            phase: LoopPhase::Idle,
            interval,
            destination: None,
            ticker: None,
            last_tick: None,
            in_flight: None,
            ticks: 0,
            sends: 0,
            skips: 0,
            reschedules: 0,
            status: status_tx,
        };
        let task = tokio::spawn(service.run(rx));
        Ok((
            CaptureHandle {
                tx,
                status: status_rx,
            },
            task,
        ))
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut changes = self.registry.subscribe();
        let mut registry_open = true;
        loop {
            let ticking = self.in_flight.is_none();
            tokio::select! {
                biased;
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                changed = changes.changed(), if registry_open => {
                    if changed.is_err() {
                        registry_open = false;
                    }
                    self.check_destination();
                }
                result = join_in_flight(&mut self.in_flight) => {
                    self.in_flight = None;
                    self.finish_tick(result);
                }
                _ = next_tick(&mut self.ticker), if ticking => self.tick(),
            }
            self.publish();
        }
        self.abandon_in_flight();
        debug!("capture loop exited");
    }

    fn handle(&mut self, cmd: Command) {
        let (ack, result) = match cmd {
            Command::SelectPeer(peer, ack) => (ack, self.select_peer(peer)),
            Command::Start(ack) => (ack, self.start()),
            Command::Stop(ack) => {
                self.go_idle("stopped");
                (ack, Ok(()))
            }
            Command::SetInterval(secs, ack) => (ack, self.set_interval(secs)),
        };
        // Callers read status right after the ack.
        self.publish();
        let _ = ack.send(result);
    }

    fn select_peer(&mut self, peer: NodeId) -> Result<(), PeerError> {
        self.registry.select(&peer)?;
        self.destination = Some(peer);
        if self.phase == LoopPhase::Idle {
            self.phase = LoopPhase::Armed;
        }
        info!(peer = %peer, phase = %self.phase, "destination selected");
        Ok(())
    }

    fn start(&mut self) -> Result<(), PeerError> {
        match self.phase {
            LoopPhase::Running => Ok(()),
            LoopPhase::Idle => Err(PeerError::NoDestination),
            LoopPhase::Armed => {
                let mut ticker = tokio::time::interval(self.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.ticker = Some(ticker);
                self.phase = LoopPhase::Running;
                info!(interval = ?self.interval, "capture loop running");
                Ok(())
            }
        }
    }

    fn set_interval(&mut self, secs: u64) -> Result<(), PeerError> {
        let new = self.config.check_interval(secs)?;
        if new == self.interval {
            return Ok(());
        }
        let old = std::mem::replace(&mut self.interval, new);
        if self.phase == LoopPhase::Running {
            // Next tick is one new interval after the last one, or now if
            // that moment has already passed.
            let now = Instant::now();
            let first = self.last_tick.map_or(now, |t| t + new).max(now);
            let mut ticker = tokio::time::interval_at(first, new);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.ticker = Some(ticker);
            self.reschedules += 1;
        }
        info!(?old, ?new, "interval changed");
        Ok(())
    }

    /// Leave the running/armed states if the destination is gone.
    fn check_destination(&mut self) {
        if let Some(peer) = self.destination {
            if !self.registry.is_connected(&peer) {
                warn!(peer = %peer, "destination lost");
                self.go_idle("destination lost");
            }
        }
    }

    fn go_idle(&mut self, reason: &str) {
        if self.phase == LoopPhase::Idle && self.destination.is_none() {
            return;
        }
        self.abandon_in_flight();
        self.ticker = None;
        self.last_tick = None;
        self.destination = None;
        self.phase = LoopPhase::Idle;
        self.registry.clear_selection();
        info!(reason, "capture loop idle");
    }

    fn abandon_in_flight(&mut self) {
        if let Some(task) = self.in_flight.take() {
            debug!("abandoning in-flight tick");
            task.abort();
        }
    }

    fn tick(&mut self) {
        let Some(peer) = self.destination else {
            self.go_idle("no destination");
            return;
        };
        if !self.registry.is_connected(&peer) {
            self.go_idle("destination lost");
            return;
        }

        self.ticks += 1;
        self.last_tick = Some(Instant::now());
        let source = Arc::clone(&self.source);
        let sink = Arc::clone(&self.sink);
        let grace = self.config.capture_grace;
        self.in_flight = Some(tokio::spawn(async move {
            let capture = match timeout(grace, source.request_capture()).await {
                Ok(Ok(capture)) => capture,
                Ok(Err(e)) => return TickOutcome::Skipped(format!("capture failed: {e}")),
                Err(_) => return TickOutcome::Skipped(format!("capture exceeded {grace:?}")),
            };
            if !capture.is_sendable() {
                return TickOutcome::Skipped("capture not ready".into());
            }
            TickOutcome::Sent(sink.deliver(capture.bytes, &[peer]).await)
        }));
    }

    fn finish_tick(&mut self, result: Result<TickOutcome, JoinError>) {
        match result {
            Ok(TickOutcome::Sent(SendOutcome::Delivered)) => self.sends += 1,
            Ok(TickOutcome::Sent(outcome)) => {
                debug!(?outcome, "tick sent nothing");
                self.skips += 1;
            }
            Ok(TickOutcome::Skipped(reason)) => {
                debug!(%reason, "tick skipped");
                self.skips += 1;
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                warn!("tick task failed: {e}");
                self.skips += 1;
            }
        }
    }

    fn publish(&self) {
        let next = LoopStatus {
            phase: self.phase,
            interval: self.interval,
            destination: self.destination,
            ticks: self.ticks,
            sends: self.sends,
            skips: self.skips,
            reschedules: self.reschedules,
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

async fn join_in_flight(
    slot: &mut Option<JoinHandle<TickOutcome>>,
) -> Result<TickOutcome, JoinError> {
    match slot {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) -> Instant {
    match ticker {
        Some(ticker) => ticker.tick().await,
        None => std::future::pending().await,
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::time::sleep;
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::capture::source::{Capture, StaticCapture};
    use crate::identity::NodeIdentity;

    /// Records the second (relative to creation) of every delivery.
    struct RecordingSink {
        t0: Instant,
        sent: Mutex<Vec<u64>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                t0: Instant::now(),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn seconds(&self) -> Vec<u64> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PayloadSink for RecordingSink {
        async fn deliver(&self, _payload: Bytes, _to: &[NodeId]) -> SendOutcome {
            let at = Instant::now().duration_since(self.t0).as_secs();
            self.sent.lock().unwrap().push(at);
            SendOutcome::Delivered
        }
    }

    /// Ready flags consumed one per request; ready once exhausted.
    struct ScriptedCapture {
        script: Mutex<VecDeque<bool>>,
    }

    #[async_trait]
    impl CaptureSource for ScriptedCapture {
        async fn request_capture(&self) -> Result<Capture, PeerError> {
            let ready = self.script.lock().unwrap().pop_front().unwrap_or(true);
            Ok(if ready {
                Capture::ready(&b"\x50\x4E\x47"[..])
            } else {
                Capture::not_ready()
            })
        }
    }

    /// Takes `delay` per capture and tracks overlapping requests.
    struct SlowCapture {
        delay: Duration,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    #[async_trait]
    impl CaptureSource for SlowCapture {
        async fn request_capture(&self) -> Result<Capture, PeerError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(Capture::ready(&b"slow"[..]))
        }
    }

    fn connected(registry: &PeerRegistry) -> NodeId {
        let peer = NodeIdentity::new("advertiser");
        registry.peer_found(peer.clone(), SocketAddr::from(([127, 0, 0, 1], 4000)));
        registry.begin_contact(&peer.id()).unwrap();
        assert!(registry.session_connected(&peer));
        peer.id()
    }

    fn spawn(
        registry: &PeerRegistry,
        sink: Arc<RecordingSink>,
        source: Arc<dyn CaptureSource>,
        config: CaptureConfig,
    ) -> CaptureHandle {
        let (handle, _task) = CaptureService::spawn(registry.clone(), sink, source, config).unwrap();
        handle
    }

    fn default_source() -> Arc<dyn CaptureSource> {
        Arc::new(StaticCapture::new(&b"png"[..]))
    }

    #[tokio::test(start_paused = true)]
    async fn sends_every_interval_without_drift() {
        let registry = PeerRegistry::new();
        let peer = connected(&registry);
        let sink = RecordingSink::new();
        let handle = spawn(&registry, sink.clone(), default_source(), CaptureConfig::default());

        assert_ok!(handle.select_peer(peer).await);
        assert_eq!(handle.status().phase, LoopPhase::Armed);
        assert_ok!(handle.start().await);

        sleep(Duration::from_millis(6500)).await;
        assert_eq!(sink.seconds(), vec![0, 2, 4, 6]);
        let status = handle.status();
        assert_eq!(status.phase, LoopPhase::Running);
        assert_eq!(status.ticks, 4);
        assert_eq!(status.sends, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn not_ready_skips_one_tick() {
        let registry = PeerRegistry::new();
        let peer = connected(&registry);
        let sink = RecordingSink::new();
        let source = Arc::new(ScriptedCapture {
            script: Mutex::new(VecDeque::from([true, true, false, true])),
        });
        let handle = spawn(&registry, sink.clone(), source, CaptureConfig::default());

        handle.select_peer(peer).await.unwrap();
        handle.start().await.unwrap();
        sleep(Duration::from_millis(6500)).await;

        assert_eq!(sink.seconds(), vec![0, 2, 6]);
        let status = handle.status();
        assert_eq!(status.phase, LoopPhase::Running);
        assert_eq!(status.skips, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn longer_interval_reschedules_once() {
        let registry = PeerRegistry::new();
        let peer = connected(&registry);
        let sink = RecordingSink::new();
        let handle = spawn(&registry, sink.clone(), default_source(), CaptureConfig::default());

        handle.select_peer(peer).await.unwrap();
        handle.start().await.unwrap();
        sleep(Duration::from_secs(3)).await;
        handle.set_interval(5).await.unwrap();
        sleep(Duration::from_millis(9500)).await;

        // Last tick at 2, so the new schedule starts at 7.
        assert_eq!(sink.seconds(), vec![0, 2, 7, 12]);
        let status = handle.status();
        assert_eq!(status.reschedules, 1);
        assert_eq!(status.interval, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn shorter_interval_drops_no_tick() {
        let registry = PeerRegistry::new();
        let peer = connected(&registry);
        let sink = RecordingSink::new();
        let config = CaptureConfig {
            interval_secs: 10,
            ..CaptureConfig::default()
        };
        let handle = spawn(&registry, sink.clone(), default_source(), config);

        handle.select_peer(peer).await.unwrap();
        handle.start().await.unwrap();
        sleep(Duration::from_secs(3)).await;
        handle.set_interval(2).await.unwrap();
        sleep(Duration::from_millis(4500)).await;

        // 0 + 2 already passed at t=3, so the next tick fires immediately.
        let sent = sink.seconds();
        assert_eq!(sent, vec![0, 3, 5, 7]);
        assert!(sent.windows(2).all(|w| w[1] - w[0] >= 2));
        assert_eq!(handle.status().reschedules, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn same_interval_is_not_a_reschedule() {
        let registry = PeerRegistry::new();
        let peer = connected(&registry);
        let handle = spawn(&registry, RecordingSink::new(), default_source(), CaptureConfig::default());
        handle.select_peer(peer).await.unwrap();
        handle.start().await.unwrap();
        handle.set_interval(2).await.unwrap();
        assert_eq!(handle.status().reschedules, 0);
        assert_err!(handle.set_interval(0).await);
        assert_err!(handle.set_interval(61).await);
        assert_eq!(handle.status().interval, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn destination_loss_goes_idle() {
        let registry = PeerRegistry::new();
        let peer = connected(&registry);
        let sink = RecordingSink::new();
        let handle = spawn(&registry, sink.clone(), default_source(), CaptureConfig::default());
        handle.select_peer(peer).await.unwrap();
        handle.start().await.unwrap();

        sleep(Duration::from_secs(3)).await;
        registry.session_disconnected(&peer);
        sleep(Duration::from_secs(5)).await;

        assert_eq!(sink.seconds(), vec![0, 2]);
        let status = handle.status();
        assert_eq!(status.phase, LoopPhase::Idle);
        assert_eq!(status.destination, None);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_abandons_in_flight_tick() {
        let registry = PeerRegistry::new();
        let peer = connected(&registry);
        let sink = RecordingSink::new();
        let source = Arc::new(SlowCapture {
            delay: Duration::from_secs(1),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        });
        let handle = spawn(&registry, sink.clone(), source, CaptureConfig::default());
        handle.select_peer(peer).await.unwrap();
        handle.start().await.unwrap();

        sleep(Duration::from_millis(500)).await;
        handle.stop().await.unwrap();
        sleep(Duration::from_secs(5)).await;

        assert!(sink.seconds().is_empty());
        assert_eq!(handle.status().phase, LoopPhase::Idle);
        assert_eq!(registry.selected(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tick_delays_instead_of_overlapping() {
        let registry = PeerRegistry::new();
        let peer = connected(&registry);
        let sink = RecordingSink::new();
        let source = Arc::new(SlowCapture {
            delay: Duration::from_secs(3),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        });
        let config = CaptureConfig {
            capture_grace: Duration::from_secs(5),
            ..CaptureConfig::default()
        };
        let handle = spawn(&registry, sink.clone(), source.clone(), config);
        handle.select_peer(peer).await.unwrap();
        handle.start().await.unwrap();

        sleep(Duration::from_millis(9500)).await;
        assert_eq!(sink.seconds(), vec![3, 6, 9]);
        assert_eq!(source.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn capture_past_grace_is_skipped() {
        let registry = PeerRegistry::new();
        let peer = connected(&registry);
        let sink = RecordingSink::new();
        let source = Arc::new(SlowCapture {
            delay: Duration::from_secs(30),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        });
        let handle = spawn(&registry, sink.clone(), source, CaptureConfig::default());
        handle.select_peer(peer).await.unwrap();
        handle.start().await.unwrap();

        sleep(Duration::from_millis(2500)).await;
        assert!(sink.seconds().is_empty());
        let status = handle.status();
        assert_eq!(status.phase, LoopPhase::Running);
        assert!(status.skips >= 1);
    }

    #[tokio::test]
    async fn commands_validate_state() {
        let registry = PeerRegistry::new();
        let handle = spawn(&registry, RecordingSink::new(), default_source(), CaptureConfig::default());

        assert!(matches!(handle.start().await, Err(PeerError::NoDestination)));
        assert!(matches!(
            handle.select_peer(NodeId::random()).await,
            Err(PeerError::UnknownPeer(_))
        ));
        assert_eq!(handle.status().phase, LoopPhase::Idle);

        let peer = connected(&registry);
        handle.select_peer(peer).await.unwrap();
        handle.start().await.unwrap();
        handle.start().await.unwrap();
        assert_eq!(handle.status().phase, LoopPhase::Running);
        assert_eq!(registry.selected(), Some(peer));
    }
}
