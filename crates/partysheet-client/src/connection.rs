// Connection lifecycle: at most one live push channel per session identity.
//
// Every connection instance is a spawned task that owns its transport and
// reports through a shared event channel. Events are tagged with the
// generation of the instance that produced them; the manager only acts on
// events of the current generation and forces anything older closed.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use partysheet_core::identity::redacted_endpoint;
use partysheet_core::{FrameKind, InboundFrame, SessionIdentity};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::transport::{Connector, Transport, TransportError, TransportMessage};

pub const NORMAL_CLOSURE: u16 = 1000;
pub const GOING_AWAY: u16 = 1001;

/// Close reason used whenever the manager replaces or drops a connection.
pub const REINITIALIZING: &str = "reinitializing";

const OUTBOUND_CAPACITY: usize = 64;

/// Monotonic connection instance counter.
pub type Generation = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    Open,
    ClosedWithError,
    ClosedClean,
}

impl ConnectionPhase {
    /// Connecting or open: a sync against the same target is a no-op.
    pub fn is_live(self) -> bool {
        matches!(self, ConnectionPhase::Connecting | ConnectionPhase::Open)
    }
}

/// 1000 and 1001 are orderly; anything else, or no code at all, is a fault.
pub fn is_clean_close(code: Option<u16>) -> bool {
    matches!(code, Some(NORMAL_CLOSURE) | Some(GOING_AWAY))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    Opened,
    Frame(String),
    Error(String),
    Closed { code: Option<u16>, reason: String },
}

/// One event from one connection instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub generation: Generation,
    pub kind: TransportEventKind,
}

// ---------------------------------------------------------------------------
// Event sink
// ---------------------------------------------------------------------------

/// The producer side a connection task reports through. Detaching it makes
/// every later emit a silent no-op, so a replaced instance cannot publish.
#[derive(Debug, Clone)]
struct EventSink {
    generation: Generation,
    events: mpsc::Sender<TransportEvent>,
    attached: Arc<AtomicBool>,
}

impl EventSink {
    fn new(generation: Generation, events: mpsc::Sender<TransportEvent>) -> Self {
        EventSink {
            generation,
            events,
            attached: Arc::new(AtomicBool::new(true)),
        }
    }

    fn detach(&self) {
        self.attached.store(false, Ordering::SeqCst);
    }

    fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Returns false when detached or when the session loop is gone.
    async fn emit(&self, kind: TransportEventKind) -> bool {
        if !self.is_attached() {
            return false;
        }
        self.events
            .send(TransportEvent {
                generation: self.generation,
                kind,
            })
            .await
            .is_ok()
    }
}

// ---------------------------------------------------------------------------
// Listener registry and the consumer view
// ---------------------------------------------------------------------------

type FrameHandler = Arc<dyn Fn(&InboundFrame) + Send + Sync>;

struct Listener {
    id: u64,
    kind: FrameKind,
    handler: FrameHandler,
}

/// Per-instance listener table. Owned by exactly one connection generation.
struct ListenerRegistry {
    generation: Generation,
    next_id: AtomicU64,
    listeners: Mutex<Vec<Listener>>,
}

impl ListenerRegistry {
    fn new(generation: Generation) -> Self {
        ListenerRegistry {
            generation,
            next_id: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, kind: FrameKind, handler: FrameHandler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Listener { id, kind, handler });
        id
    }

    fn remove(&self, id: u64) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|l| l.id != id);
    }

    fn len(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Call every handler registered for the frame's kind. Handlers run
    /// outside the lock so they may register or drop guards themselves.
    fn dispatch(&self, frame: &InboundFrame) {
        let kind = frame.kind();
        let matching: Vec<FrameHandler> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|l| l.kind == kind)
            .map(|l| l.handler.clone())
            .collect();
        for handler in matching {
            handler(frame);
        }
    }
}

/// What other consumers of the push channel get: they can send and listen,
/// never close or replace the connection.
#[derive(Clone)]
pub struct ConnectionView {
    generation: Generation,
    outbound: mpsc::Sender<String>,
    listeners: Arc<ListenerRegistry>,
}

impl fmt::Debug for ConnectionView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionView")
            .field("generation", &self.generation)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl ConnectionView {
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Queue a text frame on this connection.
    pub fn send(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.outbound.try_send(text.into()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                TransportError::Send("outbound queue is full".into())
            }
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// Register `handler` for frames of `kind`. The listener lives as long as
    /// the returned guard.
    pub fn on_message<F>(&self, kind: FrameKind, handler: F) -> ListenerGuard
    where
        F: Fn(&InboundFrame) + Send + Sync + 'static,
    {
        let id = self.listeners.add(kind, Arc::new(handler));
        ListenerGuard {
            generation: self.generation,
            id,
            registry: Arc::downgrade(&self.listeners),
        }
    }
}

/// Removes its listener on drop. It only ever points at the registry of the
/// generation it was created on.
#[must_use = "dropping the guard removes the listener"]
pub struct ListenerGuard {
    generation: Generation,
    id: u64,
    registry: Weak<ListenerRegistry>,
}

impl ListenerGuard {
    pub fn generation(&self) -> Generation {
        self.generation
    }
}

impl fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerGuard")
            .field("generation", &self.generation)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            debug_assert_eq!(registry.generation, self.generation);
            registry.remove(self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// Connection instances
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct CloseRequest {
    code: u16,
    reason: String,
}

struct ActiveConnection {
    generation: Generation,
    sink: EventSink,
    view: ConnectionView,
    close: Option<oneshot::Sender<CloseRequest>>,
    task: JoinHandle<()>,
}

impl ActiveConnection {
    /// Ask the task to close its transport. Later calls are no-ops.
    fn request_close(&mut self, code: u16, reason: &str) {
        if let Some(close) = self.close.take() {
            // The task may have ended by itself already.
            let _ = close.send(CloseRequest {
                code,
                reason: reason.to_owned(),
            });
        }
    }
}

/// Outcome of [`ConnectionManager::sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Target unchanged and the connection is connecting or open.
    Unchanged,
    /// A new instance was started.
    Opened(Generation),
    /// The previous instance was torn down and nothing replaced it.
    Closed,
    /// Nothing to connect and nothing open.
    Idle,
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

pub struct ConnectionManager<C> {
    connector: Arc<C>,
    base: Url,
    events: mpsc::Sender<TransportEvent>,
    generation: Generation,
    target: Option<SessionIdentity>,
    endpoint: Option<Url>,
    phase: ConnectionPhase,
    active: Option<ActiveConnection>,
    retired: Vec<ActiveConnection>,
}

impl<C> fmt::Debug for ConnectionManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("generation", &self.generation)
            .field("phase", &self.phase)
            .field("endpoint", &self.endpoint.as_ref().map(redacted_endpoint))
            .field("retired", &self.retired.len())
            .finish()
    }
}

impl<C: Connector> ConnectionManager<C> {
    /// `base` is the lobby endpoint without query; `events` receives every
    /// instance's events.
    pub fn new(connector: C, base: Url, events: mpsc::Sender<TransportEvent>) -> Self {
        ConnectionManager {
            connector: Arc::new(connector),
            base,
            events,
            generation: 0,
            target: None,
            endpoint: None,
            phase: ConnectionPhase::Idle,
            active: None,
            retired: Vec::new(),
        }
    }

    /// Bring the connection in line with `identity`.
    ///
    /// `None` (identity incomplete) closes whatever is open. A matching
    /// target that is connecting or open is left alone; anything else closes
    /// the current instance before opening a new one.
    pub fn sync(&mut self, identity: Option<&SessionIdentity>) -> SyncOutcome {
        self.prune_retired();

        let Some(identity) = identity else {
            self.target = None;
            self.endpoint = None;
            let had_connection = self.retire_active();
            self.phase = ConnectionPhase::Idle;
            return if had_connection {
                SyncOutcome::Closed
            } else {
                SyncOutcome::Idle
            };
        };

        if self.target.as_ref() == Some(identity) && self.phase.is_live() {
            return SyncOutcome::Unchanged;
        }

        self.retire_active();
        self.generation += 1;
        let generation = self.generation;
        let endpoint = identity.endpoint(&self.base);
        info!(
            generation,
            endpoint = %redacted_endpoint(&endpoint),
            "opening lobby connection"
        );

        let sink = EventSink::new(generation, self.events.clone());
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (close_tx, close_rx) = oneshot::channel();
        let task = tokio::spawn(drive(
            self.connector.clone(),
            endpoint.clone(),
            sink.clone(),
            outbound_rx,
            close_rx,
        ));

        self.active = Some(ActiveConnection {
            generation,
            sink,
            view: ConnectionView {
                generation,
                outbound: outbound_tx,
                listeners: Arc::new(ListenerRegistry::new(generation)),
            },
            close: Some(close_tx),
            task,
        });
        self.target = Some(identity.clone());
        self.endpoint = Some(endpoint);
        self.phase = ConnectionPhase::Connecting;
        SyncOutcome::Opened(generation)
    }

    /// Tear everything down and forget the target.
    pub fn dispose(&mut self) {
        self.sync(None);
    }

    /// Filter and apply one event. Returns true when it came from the current
    /// instance and the caller should act on it.
    pub fn accept(&mut self, event: &TransportEvent) -> bool {
        let current = self
            .active
            .as_ref()
            .is_some_and(|a| a.generation == event.generation);
        if !current {
            debug!(
                event_generation = event.generation,
                current_generation = self.generation,
                "discarding event from stale connection"
            );
            self.force_close_stale(event.generation);
            return false;
        }

        match &event.kind {
            TransportEventKind::Opened => self.phase = ConnectionPhase::Open,
            TransportEventKind::Frame(_) => {}
            TransportEventKind::Error(_) => self.phase = ConnectionPhase::ClosedWithError,
            TransportEventKind::Closed { code, .. } => {
                if self.phase != ConnectionPhase::ClosedWithError {
                    self.phase = if is_clean_close(*code) {
                        ConnectionPhase::ClosedClean
                    } else {
                        ConnectionPhase::ClosedWithError
                    };
                }
            }
        }
        true
    }

    /// Deliver a parsed frame to the current instance's listeners.
    pub fn deliver(&self, frame: &InboundFrame) {
        if let Some(active) = &self.active {
            active.view.listeners.dispatch(frame);
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Endpoint of the current target, credential included.
    pub fn endpoint(&self) -> Option<&Url> {
        self.endpoint.as_ref()
    }

    pub fn target(&self) -> Option<&SessionIdentity> {
        self.target.as_ref()
    }

    pub fn current_generation(&self) -> Generation {
        self.generation
    }

    /// A fresh view of the current instance, if any.
    pub fn view(&self) -> Option<ConnectionView> {
        self.active.as_ref().map(|a| a.view.clone())
    }

    /// Detach first, then close. Returns whether there was an instance.
    fn retire_active(&mut self) -> bool {
        let Some(mut active) = self.active.take() else {
            return false;
        };
        active.sink.detach();
        active.request_close(NORMAL_CLOSURE, REINITIALIZING);
        debug!(generation = active.generation, "retired lobby connection");
        self.retired.push(active);
        true
    }

    fn force_close_stale(&mut self, generation: Generation) {
        if let Some(stale) = self.retired.iter_mut().find(|r| r.generation == generation) {
            stale.sink.detach();
            stale.request_close(NORMAL_CLOSURE, REINITIALIZING);
        }
    }

    fn prune_retired(&mut self) {
        self.retired.retain(|r| !r.task.is_finished());
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

/// Own one transport from connect to close, forwarding everything through
/// `sink`.
async fn drive<C: Connector>(
    connector: Arc<C>,
    endpoint: Url,
    sink: EventSink,
    mut outbound: mpsc::Receiver<String>,
    mut close_rx: oneshot::Receiver<CloseRequest>,
) {
    let generation = sink.generation;

    let connected = tokio::select! {
        result = connector.connect(&endpoint) => result,
        _ = &mut close_rx => {
            debug!(generation, "connection abandoned before it opened");
            return;
        }
    };
    let mut transport = match connected {
        Ok(transport) => transport,
        Err(e) => {
            warn!(generation, error = %e, "lobby connection failed");
            sink.emit(TransportEventKind::Error(e.to_string())).await;
            sink.emit(TransportEventKind::Closed {
                code: None,
                reason: String::new(),
            })
            .await;
            return;
        }
    };

    if !sink.emit(TransportEventKind::Opened).await {
        finish(transport.as_mut(), &mut close_rx, generation).await;
        return;
    }
    info!(generation, "lobby connection open");

    loop {
        tokio::select! {
            request = &mut close_rx => {
                let request = request.unwrap_or(CloseRequest {
                    code: GOING_AWAY,
                    reason: REINITIALIZING.to_owned(),
                });
                close_transport(transport.as_mut(), &request, generation).await;
                sink.emit(TransportEventKind::Closed {
                    code: Some(request.code),
                    reason: request.reason,
                })
                .await;
                return;
            }

            Some(text) = outbound.recv() => {
                if let Err(e) = transport.send(text).await {
                    warn!(generation, error = %e, "failed to send lobby frame");
                    sink.emit(TransportEventKind::Error(e.to_string())).await;
                    sink.emit(TransportEventKind::Closed { code: None, reason: String::new() }).await;
                    return;
                }
            }

            incoming = transport.recv() => match incoming {
                Some(Ok(TransportMessage::Text(text))) => {
                    if !sink.emit(TransportEventKind::Frame(text)).await {
                        finish(transport.as_mut(), &mut close_rx, generation).await;
                        return;
                    }
                }
                Some(Ok(TransportMessage::Close { code, reason })) => {
                    info!(generation, ?code, reason = %reason, "lobby connection closed by server");
                    sink.emit(TransportEventKind::Closed { code, reason }).await;
                    return;
                }
                Some(Err(e)) => {
                    warn!(generation, error = %e, "lobby connection error");
                    sink.emit(TransportEventKind::Error(e.to_string())).await;
                    sink.emit(TransportEventKind::Closed { code: None, reason: String::new() }).await;
                    return;
                }
                None => {
                    info!(generation, "lobby connection ended without a close frame");
                    sink.emit(TransportEventKind::Closed { code: None, reason: String::new() }).await;
                    return;
                }
            },
        }
    }
}

/// The sink refused an event: either the instance was retired (a close
/// request is already waiting) or the session loop is gone.
async fn finish(
    transport: &mut dyn Transport,
    close_rx: &mut oneshot::Receiver<CloseRequest>,
    generation: Generation,
) {
    let request = close_rx.try_recv().unwrap_or(CloseRequest {
        code: GOING_AWAY,
        reason: REINITIALIZING.to_owned(),
    });
    close_transport(transport, &request, generation).await;
}

async fn close_transport(transport: &mut dyn Transport, request: &CloseRequest, generation: Generation) {
    debug!(generation, code = request.code, reason = %request.reason, "closing lobby connection");
    if let Err(e) = transport.close(request.code, &request.reason).await {
        debug!(generation, error = %e, "close handshake failed");
    }
}
