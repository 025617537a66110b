//! Stream registry: at most one live handle per resource

use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use super::handle::StreamHandle;
use super::state::{SessionState, SessionStateStore};
use crate::types::{ResourceId, StreamId};

/// Registry of live stream handles
///
/// Injected into the coordinator and every handle so tests can substitute
/// their own implementation.
pub trait StreamRegistry: Send + Sync {
    /// Store `handle` iff no handle is registered for its resource
    ///
    /// Must be a single atomic check-and-set.
    fn try_register(&self, handle: Arc<StreamHandle>) -> bool;

    /// The live handle for a resource, if any
    fn lookup(&self, resource_id: &ResourceId) -> Option<Arc<StreamHandle>>;

    /// Remove the entry owned by `stream_id` and record its terminal state
    ///
    /// Returns `false` when the entry no longer belongs to `stream_id`.
    fn remove(&self, resource_id: &ResourceId, stream_id: StreamId, terminal: SessionState)
        -> bool;

    /// Drop whatever entry exists for a resource and reset it to `Absent`
    fn force_clear(&self, resource_id: &ResourceId) -> Option<Arc<StreamHandle>>;

    /// Number of registered handles
    fn active_count(&self) -> usize;
}

/// In-process registry backed by a sharded concurrent map
///
/// Registration and removal update the session state inside the same map
/// entry lock, so a resource is `Running` exactly while it has a handle.
pub struct InMemoryStreamRegistry {
    handles: DashMap<ResourceId, Arc<StreamHandle>>,
    states: Arc<SessionStateStore>,
}

impl InMemoryStreamRegistry {
    pub fn new(states: Arc<SessionStateStore>) -> Self {
        Self {
            handles: DashMap::new(),
            states,
        }
    }
}

impl StreamRegistry for InMemoryStreamRegistry {
    fn try_register(&self, handle: Arc<StreamHandle>) -> bool {
        let resource_id = handle.resource_id().clone();
        match self.handles.entry(resource_id.clone()) {
            Entry::Occupied(occupied) => {
                debug!(
                    resource_id = %resource_id,
                    existing = %occupied.get().id(),
                    "registration refused, resource already has a live stream"
                );
                false
            }
            Entry::Vacant(vacant) => {
                if !self.states.begin_running(&resource_id, handle.id()) {
                    warn!(resource_id = %resource_id, "registration refused, state is already running");
                    return false;
                }
                vacant.insert(handle);
                true
            }
        }
    }

    fn lookup(&self, resource_id: &ResourceId) -> Option<Arc<StreamHandle>> {
        self.handles.get(resource_id).map(|entry| Arc::clone(entry.value()))
    }

    fn remove(
        &self,
        resource_id: &ResourceId,
        stream_id: StreamId,
        terminal: SessionState,
    ) -> bool {
        match self.handles.entry(resource_id.clone()) {
            Entry::Occupied(occupied) if occupied.get().id() == stream_id => {
                self.states.finish(resource_id, stream_id, terminal);
                occupied.remove();
                true
            }
            _ => false,
        }
    }

    fn force_clear(&self, resource_id: &ResourceId) -> Option<Arc<StreamHandle>> {
        match self.handles.entry(resource_id.clone()) {
            Entry::Occupied(occupied) => {
                self.states.reset(resource_id);
                Some(occupied.remove())
            }
            Entry::Vacant(_) => {
                self.states.reset(resource_id);
                None
            }
        }
    }

    fn active_count(&self) -> usize {
        self.handles.len()
    }
}

impl fmt::Debug for InMemoryStreamRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryStreamRegistry")
            .field("active", &self.handles.len())
            .finish()
    }
}
