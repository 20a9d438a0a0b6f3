//! Realtime channel: typed live events over a [`Fabric`] session.
//!
//! Broadcasts issued while the session is not connected wait in an in-memory FIFO and are flushed,
//! in call order, as soon as the fabric reports `Connected` again. Presence is re-tracked on every
//! (re)connection and the connected-device count is recomputed from each membership snapshot.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::fabric::{Fabric, FabricSignal, PresenceRecord, SessionId};
use crate::identity::lock;
use crate::live_state::LiveStatePatch;
use crate::model::VoterType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteEvent {
    pub reel_id: String,
    pub score: i32,
    pub voter_type: VoterType,
    pub voter_id: i32,
}

/// Everything that travels over the live channel. On the wire this is
/// `{"event": "<kind>", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum LiveEvent {
    ReelChange(LiveStatePatch),
    Vote(VoteEvent),
    #[serde(rename_all = "camelCase")]
    StateRequest {
        requester_id: String,
        timestamp: i64,
    },
    StateSync(LiveStatePatch),
    CategoryChange {
        category: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ReelChange,
    Vote,
    StateRequest,
    StateSync,
    CategoryChange,
}

impl LiveEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            LiveEvent::ReelChange(_) => EventKind::ReelChange,
            LiveEvent::Vote(_) => EventKind::Vote,
            LiveEvent::StateRequest { .. } => EventKind::StateRequest,
            LiveEvent::StateSync(_) => EventKind::StateSync,
            LiveEvent::CategoryChange { .. } => EventKind::CategoryChange,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&LiveEvent) + Send + Sync>;
pub type StatusHandler = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;
pub type DeviceCountHandler = Arc<dyn Fn(usize) + Send + Sync>;

/// Returned by every `on*` registration; pass it back to remove that handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct Handlers {
    next_id: u64,
    events: HashMap<EventKind, Vec<(HandlerId, EventHandler)>>,
    status: Vec<(HandlerId, StatusHandler)>,
    device_count: Vec<(HandlerId, DeviceCountHandler)>,
}

impl Handlers {
    fn next_id(&mut self) -> HandlerId {
        self.next_id += 1;
        HandlerId(self.next_id)
    }
}

struct ChannelState {
    status: ConnectionStatus,
    pending: VecDeque<LiveEvent>,
    presence: Option<PresenceRecord>,
    connected_devices: usize,
}

struct ChannelInner {
    fabric: Arc<dyn Fabric>,
    session: SessionId,
    state: Mutex<ChannelState>,
    handlers: Mutex<Handlers>,
}

impl ChannelInner {
    fn handle(&self, signal: FabricSignal) {
        match signal {
            FabricSignal::Status(status) => self.handle_status(status),
            FabricSignal::Broadcast(event) => self.dispatch(&event),
            FabricSignal::PresenceSync(records) => self.handle_presence(&records),
        }
    }

    fn handle_status(&self, status: ConnectionStatus) {
        {
            let mut state = lock(&self.state);
            state.status = status;
            if status == ConnectionStatus::Connected {
                let queued = state.pending.len();
                self.flush(&mut state);
                if queued > 0 {
                    info!(
                        "{} flushed {} queued broadcasts ({} left)",
                        self.session,
                        queued - state.pending.len(),
                        state.pending.len()
                    );
                }
                if let Some(record) = state.presence.clone() {
                    if let Err(e) = self.fabric.track(self.session, record) {
                        warn!("{} failed to re-track presence: {e}", self.session);
                    }
                }
            }
        }
        info!("{} is {:?}", self.session, status);

        let listeners: Vec<StatusHandler> = lock(&self.handlers)
            .status
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for listener in listeners {
            listener(status);
        }
    }

    // Sends queued broadcasts front to back, stopping at the first failure so order is kept.
    fn flush(&self, state: &mut ChannelState) {
        while let Some(event) = state.pending.front() {
            if let Err(e) = self.fabric.send(self.session, event) {
                debug!("{} flush interrupted: {e}", self.session);
                break;
            }
            state.pending.pop_front();
        }
    }

    fn dispatch(&self, event: &LiveEvent) {
        let handlers: Vec<EventHandler> = lock(&self.handlers)
            .events
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(event);
        }
    }

    fn handle_presence(&self, records: &[PresenceRecord]) {
        let count = records
            .iter()
            .filter(|record| record.page_role.counts_as_device())
            .count();
        lock(&self.state).connected_devices = count;
        debug!("{} sees {count} connected devices", self.session);

        let listeners: Vec<DeviceCountHandler> = lock(&self.handlers)
            .device_count
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for listener in listeners {
            listener(count);
        }
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        self.fabric.close(self.session);
    }
}

/// A client's handle on the live channel. Cheap to clone; the session closes when the last clone
/// is dropped.
#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<ChannelInner>,
}

impl RealtimeChannel {
    /// Opens a session on `fabric` and starts processing its signals. Must be called from within a
    /// tokio runtime.
    pub fn connect(fabric: Arc<dyn Fabric>) -> Self {
        let (session, rx) = fabric.open();
        let inner = Arc::new(ChannelInner {
            fabric,
            session,
            state: Mutex::new(ChannelState {
                status: ConnectionStatus::Connecting,
                pending: VecDeque::new(),
                presence: None,
                connected_devices: 0,
            }),
            handlers: Mutex::new(Handlers::default()),
        });
        tokio::spawn(drive(Arc::downgrade(&inner), rx));
        Self { inner }
    }

    pub fn session(&self) -> SessionId {
        self.inner.session
    }

    pub fn status(&self) -> ConnectionStatus {
        lock(&self.inner.state).status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Broadcasts published while disconnected that are still waiting to be sent.
    pub fn pending_broadcasts(&self) -> usize {
        lock(&self.inner.state).pending.len()
    }

    /// Sends `event` to every session, or queues it until the next connection. Never fails.
    pub fn broadcast(&self, event: LiveEvent) {
        let mut state = lock(&self.inner.state);
        if state.status == ConnectionStatus::Connected && state.pending.is_empty() {
            match self.inner.fabric.send(self.inner.session, &event) {
                Ok(()) => return,
                Err(e) => debug!("{} queueing broadcast: {e}", self.inner.session),
            }
        }
        state.pending.push_back(event);
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&LiveEvent) + Send + Sync + 'static,
    {
        let mut handlers = lock(&self.inner.handlers);
        let id = handlers.next_id();
        handlers
            .events
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Removes an event handler. Returns whether it was registered for `kind`.
    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        let mut handlers = lock(&self.inner.handlers);
        let Some(list) = handlers.events.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(handler_id, _)| *handler_id != id);
        before != list.len()
    }

    pub fn on_status<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        let mut handlers = lock(&self.inner.handlers);
        let id = handlers.next_id();
        handlers.status.push((id, Arc::new(handler)));
        id
    }

    /// Registers a device-count listener. It is called right away when devices are already known.
    pub fn on_device_count_change<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let handler: DeviceCountHandler = Arc::new(handler);
        let id = {
            let mut handlers = lock(&self.inner.handlers);
            let id = handlers.next_id();
            handlers.device_count.push((id, handler.clone()));
            id
        };
        let current = self.connected_devices();
        if current > 0 {
            handler(current);
        }
        id
    }

    /// Removes a status or device-count listener.
    pub fn off_listener(&self, id: HandlerId) -> bool {
        let mut handlers = lock(&self.inner.handlers);
        let before = handlers.status.len() + handlers.device_count.len();
        handlers.status.retain(|(handler_id, _)| *handler_id != id);
        handlers.device_count.retain(|(handler_id, _)| *handler_id != id);
        before != handlers.status.len() + handlers.device_count.len()
    }

    /// Connected sessions, not counting control panels.
    pub fn connected_devices(&self) -> usize {
        lock(&self.inner.state).connected_devices
    }

    /// Publishes this client's presence now if connected, and again after every reconnection.
    pub fn track(&self, record: PresenceRecord) {
        let mut state = lock(&self.inner.state);
        state.presence = Some(record.clone());
        if state.status == ConnectionStatus::Connected {
            if let Err(e) = self.inner.fabric.track(self.inner.session, record) {
                debug!("{} presence deferred: {e}", self.inner.session);
            }
        }
    }

    pub fn untrack(&self) {
        let mut state = lock(&self.inner.state);
        state.presence = None;
        if state.status == ConnectionStatus::Connected {
            if let Err(e) = self.inner.fabric.untrack(self.inner.session) {
                debug!("{} untrack failed: {e}", self.inner.session);
            }
        }
    }
}

async fn drive(inner: Weak<ChannelInner>, mut rx: mpsc::UnboundedReceiver<FabricSignal>) {
    while let Some(signal) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle(signal);
    }
}
