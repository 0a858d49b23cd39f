use crate::remote::{CursorHandle, PlanHandle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RemoteResource {
    Cursor(CursorHandle),
    Plan(PlanHandle),
}

#[derive(Debug, Clone)]
pub struct OutstandingResource {
    pub resource: RemoteResource,
    pub age: Duration,
}

/// Remote handles a session has handed out and not yet released.
///
/// Whoever removes a handle from the table owns its remote release, so a
/// plan or cursor outliving its session never releases a handle twice.
#[derive(Debug, Default)]
pub(crate) struct ResourceTable {
    open: Mutex<HashMap<RemoteResource, Instant>>,
}

impl ResourceTable {
    pub(crate) fn register(&self, resource: RemoteResource) {
        self.open.lock().insert(resource, Instant::now());
    }

    /// Returns whether the caller still owned the handle.
    pub(crate) fn release(&self, resource: RemoteResource) -> bool {
        self.open.lock().remove(&resource).is_some()
    }

    /// Takes every outstanding handle, cursors before plans.
    pub(crate) fn drain(&self) -> Vec<RemoteResource> {
        let mut all: Vec<RemoteResource> = self.open.lock().drain().map(|(r, _)| r).collect();
        all.sort();
        all
    }

    pub(crate) fn outstanding(&self) -> Vec<OutstandingResource> {
        let now = Instant::now();
        let mut out: Vec<OutstandingResource> = self
            .open
            .lock()
            .iter()
            .map(|(resource, opened_at)| OutstandingResource {
                resource: *resource,
                age: now.saturating_duration_since(*opened_at),
            })
            .collect();
        out.sort_by_key(|r| r.resource);
        out
    }
}
