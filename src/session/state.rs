//! Session state definitions and the per-resource state store

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{ResourceId, StreamId};

/// Lifecycle state of the generation session for one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum SessionState {
    /// No record exists
    Absent,

    /// A stream handle is registered and producing output
    Running,

    /// Stop was acknowledged or the engine completed
    Stopped,

    /// The engine failed to start or failed mid-stream
    Error(String),
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Absent => "absent",
            SessionState::Running => "running",
            SessionState::Stopped => "stopped",
            SessionState::Error(_) => "error",
        }
    }

    /// `Stopped` or `Error`
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Error(_))
    }

    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Running)
    }

    pub fn error_reason(&self) -> Option<&str> {
        match self {
            SessionState::Error(reason) => Some(reason),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct StateRecord {
    state: SessionState,
    /// Handle that wrote or owns this state, if any
    owner: Option<StreamId>,
    updated_at: DateTime<Utc>,
}

impl StateRecord {
    fn new(state: SessionState, owner: Option<StreamId>) -> Self {
        Self {
            state,
            owner,
            updated_at: Utc::now(),
        }
    }
}

/// Read-only projection served to status pollers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusView {
    pub resource_id: ResourceId,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<StreamId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Authoritative per-resource session state
///
/// Each resource lives in its own map entry; all updates for one resource go
/// through that entry and are atomic.
#[derive(Debug, Default)]
pub struct SessionStateStore {
    records: DashMap<ResourceId, StateRecord>,
}

impl SessionStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state; unknown resources are `Absent`
    pub fn get(&self, resource_id: &ResourceId) -> SessionState {
        self.records
            .get(resource_id)
            .map(|record| record.state.clone())
            .unwrap_or(SessionState::Absent)
    }

    /// Record a state for a resource that has no live stream
    ///
    /// `Running` is only entered by registering a stream handle, so it is
    /// refused here, as is overwriting a `Running` record. Returns `false`
    /// when the write was refused.
    pub fn set(&self, resource_id: &ResourceId, state: SessionState) -> bool {
        if state.is_running() {
            warn!(resource_id = %resource_id, "Running is only entered by registering a stream");
            return false;
        }

        match self.records.entry(resource_id.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().state.is_running() {
                    warn!(resource_id = %resource_id, "refusing to overwrite a running session");
                    return false;
                }
                if state == SessionState::Absent {
                    occupied.remove();
                    debug!(resource_id = %resource_id, "cleared session state");
                } else {
                    occupied.insert(StateRecord::new(state, None));
                }
            }
            Entry::Vacant(vacant) => {
                if state != SessionState::Absent {
                    vacant.insert(StateRecord::new(state, None));
                }
            }
        }
        true
    }

    /// Return an idle resource to `Absent`; refused while it is `Running`
    pub fn clear(&self, resource_id: &ResourceId) -> bool {
        self.set(resource_id, SessionState::Absent)
    }

    /// Project the record for the status surface
    pub fn view(&self, resource_id: &ResourceId) -> StatusView {
        match self.records.get(resource_id) {
            Some(record) => StatusView {
                resource_id: resource_id.clone(),
                state: record.state.as_str().to_string(),
                error_reason: record.state.error_reason().map(str::to_string),
                stream_id: record.owner,
                updated_at: Some(record.updated_at),
            },
            None => StatusView {
                resource_id: resource_id.clone(),
                state: SessionState::Absent.as_str().to_string(),
                error_reason: None,
                stream_id: None,
                updated_at: None,
            },
        }
    }

    /// Drop the record whatever it holds; used when force-clearing a resource
    pub(crate) fn reset(&self, resource_id: &ResourceId) {
        if self.records.remove(resource_id).is_some() {
            debug!(resource_id = %resource_id, "reset session state");
        }
    }

    /// Enter `Running` on behalf of `stream_id`
    pub(crate) fn begin_running(&self, resource_id: &ResourceId, stream_id: StreamId) -> bool {
        match self.records.entry(resource_id.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().state.is_running() {
                    return false;
                }
                occupied.insert(StateRecord::new(SessionState::Running, Some(stream_id)));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StateRecord::new(SessionState::Running, Some(stream_id)));
            }
        }
        debug!(resource_id = %resource_id, stream_id = %stream_id, "session running");
        true
    }

    /// Write a terminal state, but only while `stream_id` still owns a running record
    pub(crate) fn finish(
        &self,
        resource_id: &ResourceId,
        stream_id: StreamId,
        terminal: SessionState,
    ) -> bool {
        debug_assert!(terminal.is_terminal());
        match self.records.get_mut(resource_id) {
            Some(mut record) if record.owner == Some(stream_id) && record.state.is_running() => {
                *record = StateRecord::new(terminal, Some(stream_id));
                true
            }
            _ => false,
        }
    }
}
