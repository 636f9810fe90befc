//! Load-time hook registry.
//!
//! Each watched target moves through `Pending → Resolving → Fired`. A target
//! with no entry is unwatched. `Fired` is permanent and is set before any
//! callback runs, so a callback that loads its own target cannot fire twice.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::errors::HookError;
use crate::module::{Module, ModuleCache};

/// Callback fired with the loaded module.
///
/// May run on any thread: whichever one completed the load.
pub type HookCallback = Arc<dyn Fn(&Arc<Module>) -> Result<(), HookError> + Send + Sync>;

enum HookState {
    Pending(Vec<HookCallback>),
    Resolving(Vec<HookCallback>),
    Fired,
}

/// Observable state of a watched target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookStatus {
    /// Waiting for the target to load.
    Pending { callbacks: usize },
    /// The interceptor is forcing the load right now.
    Resolving { callbacks: usize },
    /// Callbacks have been delivered; later registrations fire immediately.
    Fired,
}

/// Registry of callbacks waiting for modules to load.
pub struct HookRegistry {
    cache: Arc<ModuleCache>,
    table: Mutex<HashMap<String, HookState>>,
    failures: AtomicU64,
}

impl HookRegistry {
    /// Create a registry bound to a module cache (and therefore to its load
    /// lock).
    pub fn new(cache: Arc<ModuleCache>) -> Self {
        Self {
            cache,
            table: Mutex::new(HashMap::new()),
            failures: AtomicU64::new(0),
        }
    }

    /// Register a callback for `target`.
    ///
    /// Fires synchronously if the target is already loaded; otherwise the
    /// callback waits, in registration order, for the target's load. A
    /// target whose initializer is still running counts as not loaded.
    pub fn register<F>(&self, target: &str, callback: F) -> Result<(), HookError>
    where
        F: Fn(&Arc<Module>) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.register_callback(target, Arc::new(callback))
    }

    pub fn register_callback(&self, target: &str, callback: HookCallback) -> Result<(), HookError> {
        if target.is_empty() {
            return Err(HookError::EmptyTarget);
        }

        // Held across the loaded check and the insert so a concurrent load
        // cannot complete in between.
        let _load = self.cache.lock();

        let ready = {
            let mut table = self.table.lock();
            match table.get_mut(target) {
                Some(HookState::Pending(callbacks) | HookState::Resolving(callbacks)) => {
                    callbacks.push(callback);
                    debug!(module = target, pending = callbacks.len(), "queued load hook");
                    None
                }
                Some(state @ HookState::Fired) => match self.cache.get_loaded(target) {
                    Some(module) => Some((module, callback)),
                    None => {
                        *state = HookState::Pending(vec![callback]);
                        debug!(module = target, "fired target is no longer loaded, watching again");
                        None
                    }
                },
                // A module whose initializer is still running is cached but
                // not loaded; its hooks wait for the load to complete.
                None => match self.cache.get_loaded(target) {
                    Some(module) => {
                        let _ = table.insert(target.to_string(), HookState::Fired);
                        Some((module, callback))
                    }
                    None => {
                        let _ = table.insert(target.to_string(), HookState::Pending(vec![callback]));
                        debug!(module = target, "watching target");
                        None
                    }
                },
            }
        };

        if let Some((module, callback)) = ready {
            debug!(module = target, "target already loaded, firing hook immediately");
            self.invoke(target, &callback, &module);
        }
        Ok(())
    }

    /// Deliver a completed load.
    ///
    /// Marks the target fired and runs its pending callbacks in order.
    /// Returns how many callbacks ran; `0` for unwatched or already fired
    /// targets.
    pub fn notify(&self, target: &str, module: &Arc<Module>) -> usize {
        let _load = self.cache.lock();

        let callbacks = {
            let mut table = self.table.lock();
            match table.get_mut(target) {
                Some(state) => match std::mem::replace(state, HookState::Fired) {
                    HookState::Pending(callbacks) | HookState::Resolving(callbacks) => callbacks,
                    HookState::Fired => return 0,
                },
                None => return 0,
            }
        };

        debug!(module = target, callbacks = callbacks.len(), "firing load hooks");
        for callback in &callbacks {
            self.invoke(target, callback, module);
        }
        callbacks.len()
    }

    /// `Pending → Resolving`. Returns `false` (decline) for any other state.
    pub(crate) fn begin_resolving(&self, target: &str) -> bool {
        let mut table = self.table.lock();
        let Some(state) = table.get_mut(target) else {
            return false;
        };
        match std::mem::replace(state, HookState::Fired) {
            HookState::Pending(callbacks) => {
                *state = HookState::Resolving(callbacks);
                true
            }
            other => {
                *state = other;
                false
            }
        }
    }

    /// `Resolving → Pending`, after a failed forced load.
    pub(crate) fn abort_resolving(&self, target: &str) {
        let mut table = self.table.lock();
        if let Some(state) = table.get_mut(target) {
            *state = match std::mem::replace(state, HookState::Fired) {
                HookState::Resolving(callbacks) => HookState::Pending(callbacks),
                other => other,
            };
        }
    }

    fn invoke(&self, target: &str, callback: &HookCallback, module: &Arc<Module>) {
        match catch_unwind(AssertUnwindSafe(|| callback(module))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(module = target, error = %e, "load hook failed");
            }
            Err(_panic) => {
                let _ = self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(module = target, "load hook panicked");
            }
        }
    }

    pub fn status(&self, target: &str) -> Option<HookStatus> {
        self.table.lock().get(target).map(|state| match state {
            HookState::Pending(c) => HookStatus::Pending { callbacks: c.len() },
            HookState::Resolving(c) => HookStatus::Resolving { callbacks: c.len() },
            HookState::Fired => HookStatus::Fired,
        })
    }

    pub fn is_fired(&self, target: &str) -> bool {
        matches!(self.status(target), Some(HookStatus::Fired))
    }

    /// Sorted targets still waiting to load.
    pub fn pending_targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self
            .table
            .lock()
            .iter()
            .filter(|(_, s)| !matches!(s, HookState::Fired))
            .map(|(t, _)| t.clone())
            .collect();
        targets.sort();
        targets
    }

    /// Callbacks that returned an error or panicked.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Drop every entry, pending callbacks included.
    pub fn clear(&self) {
        let _load = self.cache.lock();
        let mut table = self.table.lock();
        debug!(entries = table.len(), "clearing hook registry");
        table.clear();
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("targets", &self.table.lock().len())
            .field("failures", &self.failure_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> HookCallback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        let make = move |label: &str| -> HookCallback {
            let l = Arc::clone(&l);
            let label = label.to_string();
            Arc::new(move |m: &Arc<Module>| -> Result<(), HookError> {
                l.lock().push(format!("{label}:{}", m.name()));
                Ok(())
            })
        };
        (log, make)
    }

    #[test]
    fn empty_target_rejected() {
        let registry = HookRegistry::new(Arc::new(ModuleCache::new()));
        let err = registry.register("", |_| Ok(())).unwrap_err();
        assert!(matches!(err, HookError::EmptyTarget));
    }

    #[test]
    fn pending_callbacks_fire_in_order_once() {
        let cache = Arc::new(ModuleCache::new());
        let registry = HookRegistry::new(Arc::clone(&cache));
        let (log, make) = recorder();
        registry.register_callback("t", make("first")).unwrap();
        registry.register_callback("t", make("second")).unwrap();
        registry.register_callback("t", make("third")).unwrap();
        assert_eq!(registry.status("t"), Some(HookStatus::Pending { callbacks: 3 }));

        let module = Arc::new(Module::new("t"));
        cache.insert(Arc::clone(&module));
        assert_eq!(registry.notify("t", &module), 3);
        assert_eq!(registry.notify("t", &module), 0);

        assert_eq!(*log.lock(), vec!["first:t", "second:t", "third:t"]);
        assert!(registry.is_fired("t"));
    }

    #[test]
    fn already_loaded_fires_synchronously() {
        let cache = Arc::new(ModuleCache::new());
        cache.insert(Arc::new(Module::new("loaded")));
        let registry = HookRegistry::new(Arc::clone(&cache));
        let (log, make) = recorder();

        registry.register_callback("loaded", make("a")).unwrap();
        assert_eq!(*log.lock(), vec!["a:loaded"]);

        registry.register_callback("loaded", make("b")).unwrap();
        assert_eq!(log.lock().len(), 2);
        assert!(registry.is_fired("loaded"));
    }

    #[test]
    fn initializing_target_queues_instead_of_firing() {
        let cache = Arc::new(ModuleCache::new());
        let module = Arc::new(Module::new("t"));
        cache.insert(Arc::clone(&module));
        cache.begin_init("t");
        let registry = HookRegistry::new(Arc::clone(&cache));
        let (log, make) = recorder();

        registry.register_callback("t", make("early")).unwrap();
        assert!(log.lock().is_empty());
        assert_eq!(registry.status("t"), Some(HookStatus::Pending { callbacks: 1 }));

        cache.end_init("t");
        assert_eq!(registry.notify("t", &module), 1);
        assert_eq!(*log.lock(), vec!["early:t"]);
    }

    #[test]
    fn fired_target_missing_from_cache_is_watched_again() {
        let cache = Arc::new(ModuleCache::new());
        let module = Arc::new(Module::new("t"));
        cache.insert(Arc::clone(&module));
        let registry = HookRegistry::new(Arc::clone(&cache));
        let (log, make) = recorder();
        registry.register_callback("t", make("first")).unwrap();
        assert!(registry.is_fired("t"));

        let _ = cache.remove("t");
        registry.register_callback("t", make("second")).unwrap();
        assert_eq!(registry.status("t"), Some(HookStatus::Pending { callbacks: 1 }));

        cache.insert(Arc::clone(&module));
        assert_eq!(registry.notify("t", &module), 1);
        assert_eq!(*log.lock(), vec!["first:t", "second:t"]);
    }

    #[test]
    fn same_callback_twice_fires_twice() {
        let cache = Arc::new(ModuleCache::new());
        let registry = HookRegistry::new(Arc::clone(&cache));
        let (log, make) = recorder();
        let cb = make("dup");
        registry.register_callback("t", Arc::clone(&cb)).unwrap();
        registry.register_callback("t", cb).unwrap();

        let module = Arc::new(Module::new("t"));
        cache.insert(Arc::clone(&module));
        let _ = registry.notify("t", &module);
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn notify_unwatched_is_noop() {
        let registry = HookRegistry::new(Arc::new(ModuleCache::new()));
        let module = Arc::new(Module::new("x"));
        assert_eq!(registry.notify("x", &module), 0);
        assert_eq!(registry.status("x"), None);
    }

    #[test]
    fn failing_and_panicking_callbacks_are_contained() {
        let cache = Arc::new(ModuleCache::new());
        let registry = HookRegistry::new(Arc::clone(&cache));
        let (log, make) = recorder();
        registry
            .register("t", |_| Err(HookError::Callback("nope".into())))
            .unwrap();
        registry.register("t", |_| panic!("hook exploded")).unwrap();
        registry.register_callback("t", make("after")).unwrap();

        let module = Arc::new(Module::new("t"));
        cache.insert(Arc::clone(&module));
        assert_eq!(registry.notify("t", &module), 3);
        assert_eq!(registry.failure_count(), 2);
        assert_eq!(*log.lock(), vec!["after:t"]);
    }

    #[test]
    fn resolving_transitions() {
        let registry = HookRegistry::new(Arc::new(ModuleCache::new()));
        assert!(!registry.begin_resolving("t"));

        registry.register("t", |_| Ok(())).unwrap();
        assert!(registry.begin_resolving("t"));
        assert!(!registry.begin_resolving("t"));
        assert_eq!(registry.status("t"), Some(HookStatus::Resolving { callbacks: 1 }));

        registry.register("t", |_| Ok(())).unwrap();
        registry.abort_resolving("t");
        assert_eq!(registry.status("t"), Some(HookStatus::Pending { callbacks: 2 }));
    }

    #[test]
    fn clear_drops_pending() {
        let registry = HookRegistry::new(Arc::new(ModuleCache::new()));
        registry.register("a", |_| Ok(())).unwrap();
        registry.register("b", |_| Ok(())).unwrap();
        assert_eq!(registry.pending_targets(), vec!["a", "b"]);
        registry.clear();
        assert!(registry.pending_targets().is_empty());
    }
}
