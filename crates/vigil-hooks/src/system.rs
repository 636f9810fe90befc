//! The module system: definitions, the resolution chain, and import.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::errors::LoadError;
use crate::module::{Module, ModuleCache};

/// Builds a module's contents on first import.
///
/// Receives the system so it can import its own dependencies.
pub type Initializer = Arc<dyn Fn(&ModuleSystem, &Module) -> Result<(), LoadError> + Send + Sync>;

/// A participant in module resolution, queried before default loading.
///
/// Returning `Ok(None)` declines and lets the next participant (and finally
/// default loading) handle the name.
pub trait ImportFinder: Send + Sync {
    fn name(&self) -> &str;

    fn find_module(
        &self,
        name: &str,
        system: &ModuleSystem,
    ) -> Result<Option<Arc<Module>>, LoadError>;

    /// Called after a module's initializer has completed successfully,
    /// still under the load lock.
    fn module_loaded(&self, _name: &str, _module: &Arc<Module>) {}
}

/// Handle for removing an installed finder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FinderId(u64);

/// Registry of loadable modules.
pub struct ModuleSystem {
    cache: Arc<ModuleCache>,
    definitions: RwLock<HashMap<String, Initializer>>,
    finders: RwLock<Vec<(FinderId, Arc<dyn ImportFinder>)>>,
    next_finder: AtomicU64,
}

impl ModuleSystem {
    pub fn new() -> Self {
        Self::with_cache(Arc::new(ModuleCache::new()))
    }

    pub fn with_cache(cache: Arc<ModuleCache>) -> Self {
        Self {
            cache,
            definitions: RwLock::new(HashMap::new()),
            finders: RwLock::new(Vec::new()),
            next_finder: AtomicU64::new(1),
        }
    }

    pub fn cache(&self) -> &Arc<ModuleCache> {
        &self.cache
    }

    /// Make `name` loadable. The initializer runs on first import.
    pub fn define<F>(&self, name: &str, init: F)
    where
        F: Fn(&ModuleSystem, &Module) -> Result<(), LoadError> + Send + Sync + 'static,
    {
        let _ = self
            .definitions
            .write()
            .insert(name.to_string(), Arc::new(init));
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.definitions.read().contains_key(name)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.cache.is_loaded(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Module>> {
        self.cache.get(name)
    }

    /// Add a finder at the front of the resolution chain.
    pub fn install_finder(&self, finder: Arc<dyn ImportFinder>) -> FinderId {
        let id = FinderId(self.next_finder.fetch_add(1, Ordering::Relaxed));
        debug!(finder = finder.name(), ?id, "installing import finder");
        self.finders.write().insert(0, (id, finder));
        id
    }

    /// Remove a finder. Returns `false` if it was not installed.
    pub fn uninstall_finder(&self, id: FinderId) -> bool {
        let mut finders = self.finders.write();
        let before = finders.len();
        finders.retain(|(fid, _)| *fid != id);
        let removed = finders.len() < before;
        if removed {
            debug!(?id, "uninstalled import finder");
        }
        removed
    }

    pub fn finder_count(&self) -> usize {
        self.finders.read().len()
    }

    /// Import a module, loading it on first use.
    ///
    /// Holds the load lock for the whole resolution. Finders are consulted
    /// in chain order; the first to return a module wins.
    pub fn import(&self, name: &str) -> Result<Arc<Module>, LoadError> {
        let _load = self.cache.lock();

        if let Some(module) = self.cache.get(name) {
            return Ok(module);
        }

        for finder in self.finder_chain() {
            if let Some(module) = finder.find_module(name, self)? {
                return Ok(module);
            }
        }

        self.load_default(name)
    }

    fn finder_chain(&self) -> Vec<Arc<dyn ImportFinder>> {
        self.finders
            .read()
            .iter()
            .map(|(_, f)| Arc::clone(f))
            .collect()
    }

    /// Default resolution: run the definition's initializer.
    ///
    /// The module is visible in the cache while its initializer runs, so
    /// circular imports see the partially built module instead of recursing.
    /// It only counts as loaded once the initializer succeeds; finders are
    /// then told through [`ImportFinder::module_loaded`].
    fn load_default(&self, name: &str) -> Result<Arc<Module>, LoadError> {
        let init = self
            .definitions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| LoadError::NotFound(name.to_string()))?;

        let module = Arc::new(Module::new(name));
        self.cache.insert(Arc::clone(&module));
        self.cache.begin_init(name);
        let mut guard = InitGuard {
            cache: &self.cache,
            name,
            succeeded: false,
        };
        debug!(module = name, "loading module");

        if let Err(e) = init(self, &module) {
            warn!(module = name, error = %e, "module failed to load");
            return Err(e);
        }
        guard.succeeded = true;
        drop(guard);

        for finder in self.finder_chain() {
            finder.module_loaded(name, &module);
        }
        Ok(module)
    }
}

/// Ends the initializing window; evicts the module unless the initializer
/// succeeded, including on unwind.
struct InitGuard<'a> {
    cache: &'a ModuleCache,
    name: &'a str,
    succeeded: bool,
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        self.cache.end_init(self.name);
        if !self.succeeded {
            let _ = self.cache.remove(self.name);
        }
    }
}

impl Default for ModuleSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ModuleSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleSystem")
            .field("cache", &self.cache)
            .field("finders", &self.finder_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Declining {
        calls: AtomicUsize,
        loaded: AtomicUsize,
    }

    impl ImportFinder for Declining {
        fn name(&self) -> &str {
            "declining"
        }
        fn find_module(
            &self,
            _name: &str,
            _system: &ModuleSystem,
        ) -> Result<Option<Arc<Module>>, LoadError> {
            let _ = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
        fn module_loaded(&self, _name: &str, _module: &Arc<Module>) {
            let _ = self.loaded.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn import_runs_initializer_once() {
        let system = ModuleSystem::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&runs);
        system.define("a", move |_, m| {
            let _ = r.fetch_add(1, Ordering::SeqCst);
            m.define("x", 1i32);
            Ok(())
        });

        let first = system.import("a").unwrap();
        let second = system.import("a").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(*first.get::<i32>("x").unwrap(), 1);
    }

    #[test]
    fn unknown_module_not_found() {
        let system = ModuleSystem::new();
        assert_eq!(
            system.import("nope").unwrap_err(),
            LoadError::NotFound("nope".into())
        );
    }

    #[test]
    fn failed_initializer_leaves_nothing_cached() {
        let system = ModuleSystem::new();
        system.define("bad", |_, _| Err(LoadError::init("bad", "boom")));
        assert!(system.import("bad").is_err());
        assert!(!system.is_loaded("bad"));
    }

    #[test]
    fn module_is_not_loaded_while_initializing() {
        let system = ModuleSystem::new();
        system.define("slow", |sys, _| {
            assert!(sys.cache().is_initializing("slow"));
            assert!(!sys.is_loaded("slow"));
            Ok(())
        });
        system.import("slow").unwrap();
        assert!(system.is_loaded("slow"));
        assert!(!system.cache().is_initializing("slow"));
    }

    #[test]
    fn panicking_initializer_is_evicted() {
        let system = ModuleSystem::new();
        system.define("boom", |_, _| panic!("initializer exploded"));
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = system.import("boom");
        }));
        assert!(outcome.is_err());
        assert!(system.get("boom").is_none());
        assert!(!system.cache().is_initializing("boom"));
    }

    #[test]
    fn failed_load_does_not_notify_finders() {
        let system = ModuleSystem::new();
        system.define("bad", |_, _| Err(LoadError::init("bad", "boom")));
        let finder = Arc::new(Declining {
            calls: AtomicUsize::new(0),
            loaded: AtomicUsize::new(0),
        });
        let _ = system.install_finder(finder.clone());
        assert!(system.import("bad").is_err());
        assert_eq!(finder.loaded.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn initializer_can_import_dependencies() {
        let system = ModuleSystem::new();
        system.define("dep", |_, m| {
            m.define("v", 7u8);
            Ok(())
        });
        system.define("top", |sys, m| {
            let dep = sys.import("dep")?;
            m.define("v", *dep.get::<u8>("v").unwrap_or_default() + 1);
            Ok(())
        });
        let top = system.import("top").unwrap();
        assert_eq!(*top.get::<u8>("v").unwrap(), 8);
        assert!(system.is_loaded("dep"));
    }

    #[test]
    fn circular_import_sees_partial_module() {
        let system = ModuleSystem::new();
        system.define("loop", |sys, m| {
            let again = sys.import("loop")?;
            assert!(!again.contains("done"));
            m.define("done", true);
            Ok(())
        });
        let module = system.import("loop").unwrap();
        assert!(module.contains("done"));
    }

    #[test]
    fn finders_consulted_and_removable() {
        let system = ModuleSystem::new();
        system.define("a", |_, _| Ok(()));
        system.define("b", |_, _| Ok(()));
        let finder = Arc::new(Declining {
            calls: AtomicUsize::new(0),
            loaded: AtomicUsize::new(0),
        });
        let id = system.install_finder(finder.clone());
        assert_eq!(system.finder_count(), 1);

        system.import("a").unwrap();
        assert_eq!(finder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(finder.loaded.load(Ordering::SeqCst), 1);

        assert!(system.uninstall_finder(id));
        assert!(!system.uninstall_finder(id));
        system.import("b").unwrap();
        assert_eq!(finder.calls.load(Ordering::SeqCst), 1);
    }
}
