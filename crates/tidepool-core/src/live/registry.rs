// ── Live query registry ──
//
// Per-model index of executed live queries: by handle for routing server
// pushes, and by canonical query string for dedup.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::query::LiveQuery;
use crate::error::CoreError;
use crate::query::QueryDescriptor;

/// Correlation key between a live query and the server, 1-based and
/// never reused within a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(u64);

impl Handle {
    pub fn get(self) -> u64 {
        self.0
    }

    pub(crate) fn from_wire(value: &Value) -> Option<Self> {
        value.as_u64().filter(|n| *n > 0).map(Self)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Handle> for Value {
    fn from(handle: Handle) -> Self {
        Value::from(handle.0)
    }
}

pub(crate) enum Registered {
    /// A live, non-stopped query with the same descriptor already exists.
    Existing(LiveQuery),
    /// The candidate was registered under a fresh handle.
    Fresh(Handle),
}

#[derive(Default)]
pub struct LiveQueryRegistry {
    last_handle: AtomicU64,
    by_handle: DashMap<Handle, LiveQuery>,
    by_query: DashMap<String, LiveQuery>,
}

impl LiveQueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `candidate`, or return the live query already serving the
    /// same descriptor. A stopped or interrupted entry is replaced.
    pub(crate) fn register(&self, candidate: &LiveQuery) -> Registered {
        let key = candidate.query().canonical();
        match self.by_query.entry(key.clone()) {
            Entry::Occupied(existing) if !existing.get().is_stopped() => {
                Registered::Existing(existing.get().clone())
            }
            entry => {
                let handle = Handle(self.last_handle.fetch_add(1, Ordering::Relaxed) + 1);
                candidate.assign(handle, key);
                self.by_handle.insert(handle, candidate.clone());
                match entry {
                    Entry::Occupied(mut stale) => {
                        stale.insert(candidate.clone());
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(candidate.clone());
                    }
                }
                Registered::Fresh(handle)
            }
        }
    }

    /// Remove `live_query` from both indices. Idempotent, but the query
    /// must have been executed.
    pub fn unregister(&self, live_query: &LiveQuery) -> Result<(), CoreError> {
        let handle = live_query.handle().ok_or_else(|| {
            CoreError::invalid_state("live query has no handle; it was never executed")
        })?;
        self.by_handle.remove(&handle);
        self.by_query
            .remove_if(&live_query.query().canonical(), |_, current| {
                current.ptr_eq(live_query)
            });
        Ok(())
    }

    pub fn get(&self, handle: Handle) -> Option<LiveQuery> {
        self.by_handle.get(&handle).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.by_handle.contains_key(&handle)
    }

    /// The live query currently serving `query`, if it is not stopped.
    pub fn lookup(&self, query: &QueryDescriptor) -> Option<LiveQuery> {
        self.by_query
            .get(&query.canonical())
            .map(|entry| entry.value().clone())
            .filter(|lq| !lq.is_stopped())
    }

    /// Registered handles in ascending order.
    pub fn handles(&self) -> Vec<Handle> {
        let mut handles: Vec<Handle> = self.by_handle.iter().map(|e| *e.key()).collect();
        handles.sort_unstable();
        handles
    }

    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }
}

impl fmt::Debug for LiveQueryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQueryRegistry")
            .field("handles", &self.handles())
            .field("queries", &self.by_query.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::session::Session;
    use crate::testing::ScriptedRpc;

    fn query(owner: &str) -> QueryDescriptor {
        QueryDescriptor::builder()
            .find(json!({ "owner": owner }))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn handles_are_monotonic_and_dedup_by_query() {
        let rpc = ScriptedRpc::new();
        let session = Session::with_channel(rpc, "MR");
        let model = session.model("task");
        let registry = model.registry();

        let a = model.live_query(query("ann"));
        let b = model.live_query(query("bob"));
        let a2 = model.live_query(query("ann"));

        assert!(matches!(registry.register(&a), Registered::Fresh(h) if h.get() == 1));
        assert!(matches!(registry.register(&b), Registered::Fresh(h) if h.get() == 2));
        match registry.register(&a2) {
            Registered::Existing(existing) => assert!(existing.ptr_eq(&a)),
            Registered::Fresh(_) => panic!("identical query must be deduplicated"),
        }

        assert_eq!(registry.handles(), vec![Handle(1), Handle(2)]);
        assert!(registry.lookup(&query("ann")).unwrap().ptr_eq(&a));
        assert!(a2.handle().is_none());
    }

    #[tokio::test]
    async fn unregister_requires_handle_and_is_idempotent() {
        let rpc = ScriptedRpc::new();
        let session = Session::with_channel(rpc, "MR");
        let model = session.model("task");
        let registry = model.registry();

        let lq = model.live_query(query("ann"));
        assert!(matches!(
            registry.unregister(&lq),
            Err(CoreError::InvalidState { .. })
        ));

        registry.register(&lq);
        registry.unregister(&lq).unwrap();
        registry.unregister(&lq).unwrap();
        assert!(registry.is_empty());
        assert!(registry.lookup(&query("ann")).is_none());

        // Handles are never reused.
        let again = model.live_query(query("ann"));
        assert!(matches!(registry.register(&again), Registered::Fresh(h) if h.get() == 2));
    }

    #[test]
    fn handle_from_wire_rejects_zero_and_negatives() {
        assert_eq!(Handle::from_wire(&json!(3)), Some(Handle(3)));
        assert_eq!(Handle::from_wire(&json!(0)), None);
        assert_eq!(Handle::from_wire(&json!(-1)), None);
        assert_eq!(Handle::from_wire(&json!("3")), None);
    }
}
