//! Named-event fan-out used by every layer of the client.
//!
//! Transports, the engine session, the manager and the sockets all publish
//! events through an [`Observable`]. Callers compose by registration rather
//! than inheritance; the [`Handle`] returned from a registration is the unit
//! of removal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// A registered event callback.
pub type Callback<A> = Arc<dyn Fn(&A) + Send + Sync>;

struct Listener<A> {
    id: u64,
    once: bool,
    cb: Callback<A>,
}

struct Inner<A> {
    listeners: Mutex<HashMap<String, Vec<Listener<A>>>>,
    next_id: AtomicU64,
}

/// Maps an event name to an ordered list of callbacks.
///
/// Emission iterates a snapshot of the list, so callbacks may register or
/// remove listeners (including themselves) without poisoning the iteration.
/// A `once` listener is deregistered *before* it is invoked, so re-emitting
/// the same event from within the callback does not re-enter it.
pub struct Observable<A> {
    inner: Arc<Inner<A>>,
}

impl<A> Clone for Observable<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A> Default for Observable<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Observable<A> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                listeners: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register a callback invoked every time `event` is emitted.
    pub fn on(&self, event: &str, cb: impl Fn(&A) + Send + Sync + 'static) -> Handle<A> {
        self.register(event, false, Arc::new(cb))
    }

    /// Register a callback invoked at most once. The listener is removed
    /// before the callback runs.
    pub fn once(&self, event: &str, cb: impl Fn(&A) + Send + Sync + 'static) -> Handle<A> {
        self.register(event, true, Arc::new(cb))
    }

    fn register(&self, event: &str, once: bool, cb: Callback<A>) -> Handle<A> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut map = self.inner.listeners.lock().unwrap();
        map.entry(event.to_owned())
            .or_default()
            .push(Listener { id, once, cb });
        Handle {
            inner: Arc::downgrade(&self.inner),
            event: event.to_owned(),
            id,
        }
    }

    /// Notify every listener of `event`, passing `arg` to each.
    pub fn emit(&self, event: &str, arg: &A) {
        let snapshot: Vec<Callback<A>> = {
            let mut map = self.inner.listeners.lock().unwrap();
            match map.get_mut(event) {
                Some(list) => {
                    let snap = list.iter().map(|l| l.cb.clone()).collect();
                    list.retain(|l| !l.once);
                    snap
                }
                None => return,
            }
        };
        for cb in snapshot {
            cb(arg);
        }
    }

    /// Remove the listener a handle refers to. Equivalent to
    /// [`Handle::remove`].
    pub fn remove_listener(&self, handle: &Handle<A>) {
        let mut map = self.inner.listeners.lock().unwrap();
        if let Some(list) = map.get_mut(&handle.event) {
            list.retain(|l| l.id != handle.id);
        }
    }

    /// Remove every listener registered for `event`.
    pub fn remove_all_for_event(&self, event: &str) {
        self.inner.listeners.lock().unwrap().remove(event);
    }

    /// Remove every listener for every event.
    pub fn remove_all(&self) {
        self.inner.listeners.lock().unwrap().clear();
    }

    /// Number of listeners currently registered for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap()
            .get(event)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// Identifies one registration on an [`Observable`].
///
/// `remove` is idempotent, and a handle outliving its observable is inert.
pub struct Handle<A> {
    inner: Weak<Inner<A>>,
    event: String,
    id: u64,
}

impl<A> Handle<A> {
    /// Remove the callback this handle wraps.
    pub fn remove(&self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut map = inner.listeners.lock().unwrap();
            if let Some(list) = map.get_mut(&self.event) {
                list.retain(|l| l.id != self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emit_passes_args_in_registration_order() {
        let obs: Observable<i32> = Observable::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = seen.clone();
        obs.on("ev", move |v| s1.lock().unwrap().push(("a", *v)));
        let s2 = seen.clone();
        obs.on("ev", move |v| s2.lock().unwrap().push(("b", *v)));

        obs.emit("ev", &7);
        assert_eq!(*seen.lock().unwrap(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn emit_without_listeners_is_a_noop() {
        let obs: Observable<()> = Observable::new();
        obs.emit("nothing", &());
    }

    #[test]
    fn once_fires_exactly_once() {
        let obs: Observable<()> = Observable::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        obs.once("ev", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(obs.listener_count("ev"), 1);

        obs.emit("ev", &());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(obs.listener_count("ev"), 0);

        obs.emit("ev", &());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn once_is_removed_before_invocation() {
        // Re-emitting the same event from within the callback must not
        // re-enter the once listener.
        let obs: Observable<()> = Observable::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let obs2 = obs.clone();
        obs.once("ev", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            obs2.emit("ev", &());
        });

        obs.emit("ev", &());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handle_remove_is_idempotent() {
        let obs: Observable<()> = Observable::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let handle = obs.on("ev", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        handle.remove();
        handle.remove();
        obs.emit("ev", &());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn remove_all_variants() {
        let obs: Observable<()> = Observable::new();
        obs.on("a", |_| {});
        obs.on("a", |_| {});
        obs.on("b", |_| {});

        obs.remove_all_for_event("a");
        assert_eq!(obs.listener_count("a"), 0);
        assert_eq!(obs.listener_count("b"), 1);

        obs.remove_all();
        assert_eq!(obs.listener_count("b"), 0);
    }

    #[test]
    fn mutation_during_emit_is_safe() {
        let obs: Observable<()> = Observable::new();
        let count = Arc::new(AtomicUsize::new(0));

        let obs2 = obs.clone();
        let c = count.clone();
        obs.on("ev", move |_| {
            // Registering from inside a callback must not fire this emit.
            let c2 = c.clone();
            obs2.on("ev", move |_| {
                c2.fetch_add(1, Ordering::SeqCst);
            });
        });

        obs.emit("ev", &());
        assert_eq!(count.load(Ordering::SeqCst), 0);
        obs.emit("ev", &());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
