//! Each client's view of what is currently showing.
//!
//! The control panel owns the authoritative [`LiveState`]; everybody else holds a replica that is
//! refreshed by `reel-change` broadcasts and, after joining or reconnecting, by asking the control
//! panel for a `state-sync`. Merges are shallow and last-write-wins per field.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::identity::lock;
use crate::model::{PageRole, ShowStatus};
use crate::realtime::{ConnectionStatus, EventKind, HandlerId, LiveEvent, RealtimeChannel};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveState {
    pub reel_id: Option<String>,
    pub reel_index: Option<usize>,
    pub status: ShowStatus,
    pub category: Option<String>,
}

/// Partial live state. Absent fields leave the receiver's value alone.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveStatePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reel_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ShowStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl LiveState {
    pub fn apply(&mut self, patch: &LiveStatePatch) {
        if let Some(reel_id) = &patch.reel_id {
            self.reel_id = Some(reel_id.clone());
        }
        if let Some(index) = patch.reel_index {
            self.reel_index = Some(index);
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(category) = &patch.category {
            self.category = Some(category.clone());
        }
    }

    /// The whole state as a patch, for answering state requests.
    pub fn to_patch(&self) -> LiveStatePatch {
        LiveStatePatch {
            reel_id: self.reel_id.clone(),
            reel_index: self.reel_index,
            status: Some(self.status),
            category: self.category.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Unsynced,
    Synced,
    /// Was synced, then lost the connection.
    Stale,
}

type ChangeListener = Arc<dyn Fn(&LiveState) + Send + Sync>;

struct ReconcilerInner {
    channel: RealtimeChannel,
    role: PageRole,
    device_id: String,
    request_delay: Duration,
    state: Mutex<LiveState>,
    phase: Mutex<SyncPhase>,
    listeners: Mutex<Vec<ChangeListener>>,
    subscriptions: Mutex<Vec<(Option<EventKind>, HandlerId)>>,
}

impl ReconcilerInner {
    fn on_status(self: &Arc<Self>, status: ConnectionStatus) {
        match status {
            ConnectionStatus::Connected => self.on_connected(),
            ConnectionStatus::Reconnecting | ConnectionStatus::Disconnected => {
                let mut phase = lock(&self.phase);
                if *phase == SyncPhase::Synced {
                    *phase = SyncPhase::Stale;
                    debug!("Live state is stale");
                }
            }
            ConnectionStatus::Connecting => {}
        }
    }

    fn on_connected(self: &Arc<Self>) {
        {
            let mut phase = lock(&self.phase);
            if *phase == SyncPhase::Synced {
                return;
            }
            *phase = SyncPhase::Synced;
        }
        if self.role == PageRole::Control {
            return;
        }

        // Give the control panel a moment to finish subscribing before asking it.
        let weak = Arc::downgrade(self);
        let delay = self.request_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                info!("Requesting current state from the control panel");
                inner.channel.broadcast(LiveEvent::StateRequest {
                    requester_id: inner.device_id.clone(),
                    timestamp: Utc::now().timestamp_millis(),
                });
            }
        });
    }

    fn merge(&self, patch: &LiveStatePatch) {
        let snapshot = {
            let mut state = lock(&self.state);
            state.apply(patch);
            state.clone()
        };
        debug!("Live state now {:?}", snapshot);

        let listeners: Vec<ChangeListener> = lock(&self.listeners).clone();
        for listener in listeners {
            listener(&snapshot);
        }
    }

    fn answer_state_request(&self, requester_id: &str) {
        if self.role != PageRole::Control {
            return;
        }
        let patch = lock(&self.state).to_patch();
        debug!("Answering state request from {requester_id}");
        self.channel.broadcast(LiveEvent::StateSync(patch));
    }
}

impl Drop for ReconcilerInner {
    fn drop(&mut self) {
        for (kind, id) in lock(&self.subscriptions).drain(..) {
            match kind {
                Some(kind) => {
                    self.channel.off(kind, id);
                }
                None => {
                    self.channel.off_listener(id);
                }
            }
        }
    }
}

/// Keeps one client's [`LiveState`] in step with the control panel.
#[derive(Clone)]
pub struct LiveStateReconciler {
    inner: Arc<ReconcilerInner>,
}

impl LiveStateReconciler {
    /// Hooks the reconciler onto `channel`. `initial` is what a client shows until it hears from the
    /// control panel, and stays in place if the control panel never answers.
    pub fn attach(
        channel: RealtimeChannel,
        role: PageRole,
        device_id: impl Into<String>,
        request_delay: Duration,
        initial: LiveState,
    ) -> Self {
        let inner = Arc::new(ReconcilerInner {
            channel: channel.clone(),
            role,
            device_id: device_id.into(),
            request_delay,
            state: Mutex::new(initial),
            phase: Mutex::new(SyncPhase::Unsynced),
            listeners: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
        });

        let mut subscriptions = Vec::new();
        let weak = Arc::downgrade(&inner);
        subscriptions.push((
            None,
            channel.on_status(move |status| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_status(status);
                }
            }),
        ));
        for kind in [EventKind::ReelChange, EventKind::StateSync] {
            let weak: Weak<ReconcilerInner> = Arc::downgrade(&inner);
            subscriptions.push((
                Some(kind),
                channel.on(kind, move |event| {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    match event {
                        LiveEvent::ReelChange(patch) | LiveEvent::StateSync(patch) => {
                            inner.merge(patch)
                        }
                        _ => {}
                    }
                }),
            ));
        }
        let weak = Arc::downgrade(&inner);
        subscriptions.push((
            Some(EventKind::StateRequest),
            channel.on(EventKind::StateRequest, move |event| {
                if let (Some(inner), LiveEvent::StateRequest { requester_id, .. }) =
                    (weak.upgrade(), event)
                {
                    inner.answer_state_request(requester_id);
                }
            }),
        ));
        *lock(&inner.subscriptions) = subscriptions;

        // The channel may have connected before we started listening.
        if channel.is_connected() {
            inner.on_connected();
        }

        Self { inner }
    }

    pub fn role(&self) -> PageRole {
        self.inner.role
    }

    pub fn phase(&self) -> SyncPhase {
        *lock(&self.inner.phase)
    }

    pub fn state(&self) -> LiveState {
        lock(&self.inner.state).clone()
    }

    pub fn current_reel_id(&self) -> Option<String> {
        lock(&self.inner.state).reel_id.clone()
    }

    /// Called with the merged state after every applied `reel-change` or `state-sync`.
    pub fn on_change<F>(&self, listener: F)
    where
        F: Fn(&LiveState) + Send + Sync + 'static,
    {
        lock(&self.inner.listeners).push(Arc::new(listener));
    }

    /// Applies `patch` to the authoritative state and broadcasts it as a `reel-change`.
    pub fn publish(&self, patch: LiveStatePatch) -> Result<()> {
        if self.inner.role != PageRole::Control {
            return Err(AppError::NotControlPanel);
        }
        lock(&self.inner.state).apply(&patch);
        self.inner.channel.broadcast(LiveEvent::ReelChange(patch));
        Ok(())
    }

    pub fn show_reel(&self, reel_id: &str, reel_index: usize) -> Result<()> {
        self.publish(LiveStatePatch {
            reel_id: Some(reel_id.to_string()),
            reel_index: Some(reel_index),
            status: Some(ShowStatus::Live),
            category: None,
        })
    }

    pub fn set_status(&self, status: ShowStatus) -> Result<()> {
        self.publish(LiveStatePatch {
            status: Some(status),
            ..Default::default()
        })
    }

    /// Switches the control panel's category and tells the other clients. Receivers treat this as
    /// a UI notification and do not merge it.
    pub fn change_category(&self, category: &str) -> Result<()> {
        if self.inner.role != PageRole::Control {
            return Err(AppError::NotControlPanel);
        }
        lock(&self.inner.state).category = Some(category.to_string());
        self.inner.channel.broadcast(LiveEvent::CategoryChange {
            category: category.to_string(),
        });
        Ok(())
    }
}
