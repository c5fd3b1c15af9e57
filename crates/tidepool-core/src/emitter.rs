// ── Typed event emitter ──
//
// Listener registry keyed by event kind, plus "any" listeners that see
// every emission. Handlers are snapshotted before dispatch, so a handler
// that subscribes or unsubscribes during an emit only affects later
// emissions.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

type Handler<P> = Arc<dyn Fn(&P) + Send + Sync>;
type AnyHandler<K, P> = Arc<dyn Fn(&K, &P) + Send + Sync>;

/// Identifies one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

/// Outcome of [`Emitter::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub id: ListenerId,
    /// Listeners registered for the kind, this one included.
    pub listeners: usize,
}

/// Removes a listener when [`unsubscribe`](Self::unsubscribe) is called.
/// Dropping it leaves the listener registered.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

pub struct Emitter<K, P> {
    listeners: DashMap<K, Vec<(ListenerId, Handler<P>)>>,
    any: DashMap<ListenerId, AnyHandler<K, P>>,
    next_id: AtomicU64,
}

impl<K, P> Emitter<K, P>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            listeners: DashMap::new(),
            any: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Append a handler for `kind`. Handlers fire in registration order.
    pub fn on<F>(&self, kind: K, handler: F) -> Registration
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        let id = self.next_id();
        let mut entry = self.listeners.entry(kind).or_default();
        entry.push((id, Arc::new(handler)));
        Registration {
            id,
            listeners: entry.len(),
        }
    }

    /// Remove one handler (`Some(id)`) or every handler (`None`) for `kind`.
    ///
    /// Returns the number of handlers left for the kind. An unknown id
    /// leaves the list untouched.
    pub fn off(&self, kind: &K, id: Option<ListenerId>) -> usize {
        let remaining = match self.listeners.get_mut(kind) {
            Some(mut entry) => {
                match id {
                    Some(id) => entry.retain(|(existing, _)| *existing != id),
                    None => entry.clear(),
                }
                entry.len()
            }
            None => return 0,
        };
        if remaining == 0 {
            self.listeners.remove_if(kind, |_, handlers| handlers.is_empty());
        }
        remaining
    }

    pub fn listener_count(&self, kind: &K) -> usize {
        self.listeners.get(kind).map_or(0, |entry| entry.len())
    }

    /// Register a handler that receives every emission after the
    /// kind-specific handlers have run.
    pub fn on_any<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&K, &P) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.any.insert(id, Arc::new(handler));
        id
    }

    pub fn off_any(&self, id: ListenerId) -> bool {
        self.any.remove(&id).is_some()
    }

    /// Invoke the handlers registered for `kind`, then the any-handlers.
    pub fn emit(&self, kind: &K, payload: &P) {
        let handlers: Vec<Handler<P>> = self
            .listeners
            .get(kind)
            .map(|entry| entry.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        let mut any: Vec<(ListenerId, AnyHandler<K, P>)> = self
            .any
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        any.sort_by_key(|(id, _)| *id);

        for handler in handlers {
            handler(payload);
        }
        for (_, handler) in any {
            handler(kind, payload);
        }
    }
}

impl<K, P> Default for Emitter<K, P>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, P> fmt::Debug for Emitter<K, P>
where
    K: Eq + Hash + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("kinds", &self.listeners.len())
            .field("any", &self.any.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) + Clone) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        (log, move |entry: &str| sink.lock().unwrap().push(entry.to_owned()))
    }

    #[test]
    fn handlers_fire_in_order_then_any() {
        let emitter: Emitter<&'static str, i32> = Emitter::new();
        let (log, record) = recorder();

        let r = record.clone();
        emitter.on_any(move |kind, p| r(&format!("any:{kind}:{p}")));
        let r = record.clone();
        emitter.on("add", move |p| r(&format!("first:{p}")));
        let r = record.clone();
        emitter.on("add", move |p| r(&format!("second:{p}")));

        emitter.emit(&"add", &7);
        emitter.emit(&"remove", &1);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:7", "second:7", "any:add:7", "any:remove:1"]
        );
    }

    #[test]
    fn off_reports_remaining_listeners() {
        let emitter: Emitter<&'static str, ()> = Emitter::new();
        let a = emitter.on("x", |_| {});
        let b = emitter.on("x", |_| {});
        assert_eq!(a.listeners, 1);
        assert_eq!(b.listeners, 2);

        assert_eq!(emitter.off(&"x", Some(a.id)), 1);
        assert_eq!(emitter.off(&"x", Some(a.id)), 1);
        assert_eq!(emitter.off(&"x", Some(b.id)), 0);
        assert_eq!(emitter.off(&"missing", None), 0);
    }

    #[test]
    fn off_without_id_clears_kind() {
        let emitter: Emitter<&'static str, ()> = Emitter::new();
        emitter.on("x", |_| {});
        emitter.on("x", |_| {});
        assert_eq!(emitter.off(&"x", None), 0);
        assert_eq!(emitter.listener_count(&"x"), 0);
    }

    #[test]
    fn subscribing_during_emit_takes_effect_next_round() {
        let emitter: Arc<Emitter<&'static str, ()>> = Arc::new(Emitter::new());
        let (log, record) = recorder();

        let inner = Arc::clone(&emitter);
        let r = record.clone();
        emitter.on("tick", move |_| {
            r("outer");
            let r = r.clone();
            inner.on("tick", move |_| r("late"));
        });

        emitter.emit(&"tick", &());
        assert_eq!(*log.lock().unwrap(), vec!["outer"]);

        emitter.emit(&"tick", &());
        assert_eq!(*log.lock().unwrap(), vec!["outer", "outer", "late"]);
    }

    #[test]
    fn unsubscribing_during_emit_still_delivers_current_round() {
        let emitter: Arc<Emitter<&'static str, ()>> = Arc::new(Emitter::new());
        let (log, record) = recorder();

        let victim = Arc::new(Mutex::new(None));
        let inner = Arc::clone(&emitter);
        let target = Arc::clone(&victim);
        emitter.on("tick", move |_| {
            if let Some(id) = *target.lock().unwrap() {
                inner.off(&"tick", Some(id));
            }
        });
        let r = record.clone();
        let reg = emitter.on("tick", move |_| r("victim"));
        *victim.lock().unwrap() = Some(reg.id);

        emitter.emit(&"tick", &());
        emitter.emit(&"tick", &());
        assert_eq!(*log.lock().unwrap(), vec!["victim"]);
    }

    #[test]
    fn off_any_stops_delivery() {
        let emitter: Emitter<&'static str, ()> = Emitter::new();
        let (log, record) = recorder();
        let id = emitter.on_any(move |_, _| record("any"));
        emitter.emit(&"x", &());
        assert!(emitter.off_any(id));
        assert!(!emitter.off_any(id));
        emitter.emit(&"x", &());
        assert_eq!(log.lock().unwrap().len(), 1);
    }
}
