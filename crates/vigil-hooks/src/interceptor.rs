//! The import finder that turns loads of watched targets into hook firings.

use std::sync::Arc;

use tracing::debug;

use crate::errors::LoadError;
use crate::module::Module;
use crate::registry::HookRegistry;
use crate::system::{ImportFinder, ModuleSystem};

/// Resolution-chain participant backed by a [`HookRegistry`].
///
/// For a pending target it marks the target resolving, re-enters
/// [`ModuleSystem::import`] to force the real load (declining on that inner
/// pass), then notifies the registry. Unwatched, resolving and fired targets
/// are declined.
///
/// Every completed load is also delivered, so hooks queued by a module's own
/// initializer fire once that initializer has finished.
pub struct HookInterceptor {
    registry: Arc<HookRegistry>,
}

impl HookInterceptor {
    pub fn new(registry: Arc<HookRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<HookRegistry> {
        &self.registry
    }
}

/// Reverts `Resolving → Pending` unless disarmed, including on unwind.
struct ResolvingGuard<'a> {
    registry: &'a HookRegistry,
    target: &'a str,
    armed: bool,
}

impl ResolvingGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ResolvingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.abort_resolving(self.target);
        }
    }
}

impl ImportFinder for HookInterceptor {
    fn name(&self) -> &str {
        "hook-interceptor"
    }

    fn find_module(
        &self,
        name: &str,
        system: &ModuleSystem,
    ) -> Result<Option<Arc<Module>>, LoadError> {
        if !self.registry.begin_resolving(name) {
            return Ok(None);
        }

        let guard = ResolvingGuard {
            registry: &self.registry,
            target: name,
            armed: true,
        };
        let module = system.import(name)?;
        guard.disarm();

        let fired = self.registry.notify(name, &module);
        debug!(module = name, fired, "intercepted load");
        Ok(Some(module))
    }

    fn module_loaded(&self, name: &str, module: &Arc<Module>) {
        let fired = self.registry.notify(name, module);
        if fired > 0 {
            debug!(module = name, fired, "delivered hooks after load");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::HookError;
    use crate::registry::HookStatus;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (ModuleSystem, Arc<HookRegistry>) {
        let system = ModuleSystem::new();
        let registry = Arc::new(HookRegistry::new(Arc::clone(system.cache())));
        let _ = system.install_finder(Arc::new(HookInterceptor::new(Arc::clone(&registry))));
        (system, registry)
    }

    #[test]
    fn import_fires_pending_hooks_after_load() {
        let (system, registry) = setup();
        system.define("app", |_, m| {
            m.define("ready", true);
            Ok(())
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = Arc::clone(&seen);
            registry
                .register("app", move |m| {
                    assert!(m.contains("ready"));
                    seen.lock().push(i);
                    Ok(())
                })
                .unwrap();
        }

        system.import("app").unwrap();
        system.import("app").unwrap();
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
        assert!(registry.is_fired("app"));
    }

    #[test]
    fn unwatched_targets_load_normally() {
        let (system, registry) = setup();
        system.define("plain", |_, _| Ok(()));
        system.import("plain").unwrap();
        assert_eq!(registry.status("plain"), None);
    }

    #[test]
    fn failed_load_fires_nothing_and_stays_pending() {
        let (system, registry) = setup();
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&attempts);
        system.define("flaky", move |_, _| {
            if a.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(LoadError::init("flaky", "first attempt fails"))
            } else {
                Ok(())
            }
        });
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        registry
            .register("flaky", move |_| {
                let _ = f.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let err = system.import("flaky").unwrap_err();
        assert_eq!(err, LoadError::init("flaky", "first attempt fails"));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(registry.status("flaky"), Some(HookStatus::Pending { callbacks: 1 }));

        system.import("flaky").unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_target_error_propagates_unchanged() {
        let (system, registry) = setup();
        registry.register("ghost", |_| Ok(())).unwrap();
        assert_eq!(
            system.import("ghost").unwrap_err(),
            LoadError::NotFound("ghost".into())
        );
        assert_eq!(registry.status("ghost"), Some(HookStatus::Pending { callbacks: 1 }));
    }

    #[test]
    fn hook_importing_its_own_target_does_not_refire() {
        let (system, registry) = setup();
        system.define("self_ref", |_, _| Ok(()));
        let system = Arc::new(system);
        let fired = Arc::new(AtomicUsize::new(0));
        let (s, f) = (Arc::clone(&system), Arc::clone(&fired));
        registry
            .register("self_ref", move |_| {
                let _ = f.fetch_add(1, Ordering::SeqCst);
                let _ = s.import("self_ref")?;
                Ok(())
            })
            .unwrap();

        system.import("self_ref").unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn initializer_importing_watched_target_is_bounded() {
        let (system, registry) = setup();
        system.define("cyclic", |sys, _| {
            let _ = sys.import("cyclic")?;
            Ok(())
        });
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        registry
            .register("cyclic", move |_| {
                let _ = f.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        system.import("cyclic").unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    fn counting_hook(
        count: &Arc<AtomicUsize>,
    ) -> impl Fn(&Arc<Module>) -> Result<(), HookError> + Send + Sync + 'static {
        let count = Arc::clone(count);
        move |_: &Arc<Module>| {
            let _ = count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn hook_registered_by_failing_initializer_waits_for_a_good_load() {
        let (system, registry) = setup();
        let fired = Arc::new(AtomicUsize::new(0));
        let attempts = Arc::new(AtomicUsize::new(0));
        let (r, f, a) = (Arc::clone(&registry), Arc::clone(&fired), Arc::clone(&attempts));
        system.define("plugin", move |_, m| {
            r.register("plugin", counting_hook(&f)).unwrap();
            if a.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(LoadError::init("plugin", "first attempt fails"));
            }
            m.define("ready", true);
            Ok(())
        });

        assert!(system.import("plugin").is_err());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!system.is_loaded("plugin"));
        assert_eq!(registry.status("plugin"), Some(HookStatus::Pending { callbacks: 1 }));

        registry.register("plugin", counting_hook(&fired)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        system.import("plugin").unwrap();
        // Two from the initializer (one per attempt) plus the late one.
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(registry.is_fired("plugin"));
    }

    #[test]
    fn hook_registered_by_own_initializer_sees_finished_module() {
        let (system, registry) = setup();
        let seen = Arc::new(Mutex::new(None));
        let (r, s) = (Arc::clone(&registry), Arc::clone(&seen));
        system.define("late", move |_, m| {
            let s2 = Arc::clone(&s);
            r.register("late", move |m| {
                *s2.lock() = Some(m.contains("defined_after"));
                Ok(())
            })
            .unwrap();
            assert!(s.lock().is_none());
            m.define("defined_after", 1u8);
            Ok(())
        });

        system.import("late").unwrap();
        assert_eq!(*seen.lock(), Some(true));
        assert!(registry.is_fired("late"));
    }
}
