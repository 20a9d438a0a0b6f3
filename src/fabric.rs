//! The pub/sub primitive underneath the realtime channel.
//!
//! A fabric hands every opened session a stream of [`FabricSignal`]s: connection status changes,
//! broadcasts from any session (the sender included) and full presence snapshots. Delivery is
//! at-least-once with no persistence; a session that is offline simply misses traffic.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::identity::lock;
use crate::model::PageRole;
use crate::realtime::{ConnectionStatus, LiveEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// One live session's presence entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub device_id: String,
    pub page_role: PageRole,
    pub joined_at: DateTime<Utc>,
}

impl PresenceRecord {
    pub fn new(device_id: impl Into<String>, page_role: PageRole) -> Self {
        Self {
            device_id: device_id.into(),
            page_role,
            joined_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FabricSignal {
    Status(ConnectionStatus),
    Broadcast(LiveEvent),
    /// The complete current membership, sent after every join or leave.
    PresenceSync(Vec<PresenceRecord>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FabricError {
    #[error("{0} is not connected")]
    Offline(SessionId),
    #[error("unknown {0}")]
    UnknownSession(SessionId),
}

pub trait Fabric: Send + Sync {
    fn open(&self) -> (SessionId, mpsc::UnboundedReceiver<FabricSignal>);
    fn send(&self, session: SessionId, event: &LiveEvent) -> Result<(), FabricError>;
    fn track(&self, session: SessionId, record: PresenceRecord) -> Result<(), FabricError>;
    fn untrack(&self, session: SessionId) -> Result<(), FabricError>;
    fn close(&self, session: SessionId);
}

struct Session {
    tx: mpsc::UnboundedSender<FabricSignal>,
    online: bool,
    presence: Option<PresenceRecord>,
}

#[derive(Default)]
struct Sessions {
    next_id: u64,
    sessions: BTreeMap<SessionId, Session>,
}

impl Sessions {
    fn get_online(&self, id: SessionId) -> Result<&Session, FabricError> {
        match self.sessions.get(&id) {
            Some(session) if session.online => Ok(session),
            Some(_) => Err(FabricError::Offline(id)),
            None => Err(FabricError::UnknownSession(id)),
        }
    }

    fn presence(&self) -> Vec<PresenceRecord> {
        self.sessions
            .values()
            .filter(|s| s.online)
            .filter_map(|s| s.presence.clone())
            .collect()
    }

    fn publish_presence(&self) {
        let snapshot = self.presence();
        for session in self.sessions.values().filter(|s| s.online) {
            let _ = session.tx.send(FabricSignal::PresenceSync(snapshot.clone()));
        }
    }
}

/// In-process fabric: every session of the same `LocalFabric` is on one channel. Tests use
/// `disconnect`/`reconnect` to simulate the network dropping a single session.
#[derive(Default)]
pub struct LocalFabric {
    inner: Mutex<Sessions>,
}

impl LocalFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the session off the network. Its presence vanishes for everyone else.
    pub fn disconnect(&self, id: SessionId) {
        let mut inner = lock(&self.inner);
        let Some(session) = inner.sessions.get_mut(&id) else {
            return;
        };
        if !session.online {
            return;
        }
        session.online = false;
        let _ = session
            .tx
            .send(FabricSignal::Status(ConnectionStatus::Reconnecting));
        debug!("{id} disconnected");
        inner.publish_presence();
    }

    /// Brings the session back. The client is expected to track itself again.
    pub fn reconnect(&self, id: SessionId) {
        let mut inner = lock(&self.inner);
        let Some(session) = inner.sessions.get_mut(&id) else {
            return;
        };
        if session.online {
            return;
        }
        session.online = true;
        let tx = session.tx.clone();
        let _ = tx.send(FabricSignal::Status(ConnectionStatus::Connected));
        let _ = tx.send(FabricSignal::PresenceSync(inner.presence()));
        debug!("{id} reconnected");
    }

    pub fn session_count(&self) -> usize {
        lock(&self.inner).sessions.len()
    }
}

impl Fabric for LocalFabric {
    fn open(&self) -> (SessionId, mpsc::UnboundedReceiver<FabricSignal>) {
        let mut inner = lock(&self.inner);
        inner.next_id += 1;
        let id = SessionId(inner.next_id);
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(FabricSignal::Status(ConnectionStatus::Connecting));
        let _ = tx.send(FabricSignal::Status(ConnectionStatus::Connected));
        let _ = tx.send(FabricSignal::PresenceSync(inner.presence()));
        inner.sessions.insert(
            id,
            Session {
                tx,
                online: true,
                presence: None,
            },
        );
        (id, rx)
    }

    fn send(&self, session: SessionId, event: &LiveEvent) -> Result<(), FabricError> {
        let inner = lock(&self.inner);
        inner.get_online(session)?;
        for target in inner.sessions.values().filter(|s| s.online) {
            let _ = target.tx.send(FabricSignal::Broadcast(event.clone()));
        }
        Ok(())
    }

    fn track(&self, session: SessionId, record: PresenceRecord) -> Result<(), FabricError> {
        let mut inner = lock(&self.inner);
        inner.get_online(session)?;
        if let Some(entry) = inner.sessions.get_mut(&session) {
            entry.presence = Some(record);
        }
        inner.publish_presence();
        Ok(())
    }

    fn untrack(&self, session: SessionId) -> Result<(), FabricError> {
        let mut inner = lock(&self.inner);
        inner.get_online(session)?;
        if let Some(entry) = inner.sessions.get_mut(&session) {
            entry.presence = None;
        }
        inner.publish_presence();
        Ok(())
    }

    fn close(&self, session: SessionId) {
        let mut inner = lock(&self.inner);
        if let Some(closed) = inner.sessions.remove(&session) {
            let _ = closed
                .tx
                .send(FabricSignal::Status(ConnectionStatus::Disconnected));
            inner.publish_presence();
        }
    }
}
