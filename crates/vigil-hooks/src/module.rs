//! Loaded modules, the module cache, and the load lock.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard, RwLock};

use crate::errors::HookError;

/// Type-erased module symbol.
pub type Symbol = Arc<dyn Any + Send + Sync>;

/// A named loaded unit with a mutable symbol table.
///
/// Hooks patch a module by replacing its symbols, usually with a wrapped
/// function (see [`crate::wrap`]).
pub struct Module {
    name: String,
    symbols: RwLock<HashMap<String, Symbol>>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            symbols: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Define (or overwrite) a symbol.
    pub fn define<T: Any + Send + Sync>(&self, symbol: &str, value: T) {
        let _ = self
            .symbols
            .write()
            .insert(symbol.to_string(), Arc::new(value));
    }

    /// Typed lookup. `None` if missing or of another type.
    pub fn get<T: Any + Send + Sync>(&self, symbol: &str) -> Option<Arc<T>> {
        let raw = self.symbols.read().get(symbol).cloned()?;
        raw.downcast::<T>().ok()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.read().contains_key(symbol)
    }

    /// Sorted symbol names.
    pub fn symbols(&self) -> Vec<String> {
        let mut names: Vec<String> = self.symbols.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Replace a symbol with a value derived from its current one.
    ///
    /// The write lock is held across `patch`, so concurrent patches of the
    /// same module apply one after another. `patch` must not access this
    /// module's symbols.
    pub fn replace<T, F>(&self, symbol: &str, patch: F) -> Result<(), HookError>
    where
        T: Any + Send + Sync,
        F: FnOnce(Arc<T>) -> Result<T, HookError>,
    {
        let mut symbols = self.symbols.write();
        let current = symbols
            .get(symbol)
            .cloned()
            .ok_or_else(|| HookError::MissingSymbol {
                module: self.name.clone(),
                symbol: symbol.to_string(),
            })?;
        let current = current
            .downcast::<T>()
            .map_err(|_| HookError::SymbolType {
                module: self.name.clone(),
                symbol: symbol.to_string(),
            })?;
        let patched = patch(current)?;
        let _ = symbols.insert(symbol.to_string(), Arc::new(patched));
        Ok(())
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("symbols", &self.symbols())
            .finish()
    }
}

/// The global module-loading lock.
///
/// Re-entrant: a hook callback or module initializer running under the lock
/// may import or register further targets on the same thread.
#[derive(Default)]
pub struct LoadLock(ReentrantMutex<()>);

impl LoadLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> ReentrantMutexGuard<'_, ()> {
        self.0.lock()
    }
}

/// Loaded modules by name, plus the lock that serializes loading.
///
/// A module whose initializer is still running is cached (so circular
/// imports see it) but is not yet *loaded*.
pub struct ModuleCache {
    lock: Arc<LoadLock>,
    modules: RwLock<HashMap<String, Arc<Module>>>,
    initializing: RwLock<HashSet<String>>,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::with_lock(Arc::new(LoadLock::new()))
    }

    /// Share an existing load lock, e.g. one owned by the embedding host.
    pub fn with_lock(lock: Arc<LoadLock>) -> Self {
        Self {
            lock,
            modules: RwLock::new(HashMap::new()),
            initializing: RwLock::new(HashSet::new()),
        }
    }

    pub fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.lock.acquire()
    }

    pub fn load_lock(&self) -> &Arc<LoadLock> {
        &self.lock
    }

    pub fn get(&self, name: &str) -> Option<Arc<Module>> {
        self.modules.read().get(name).cloned()
    }

    /// Fully initialized module, if any. Skips modules whose initializer
    /// is still running.
    pub fn get_loaded(&self, name: &str) -> Option<Arc<Module>> {
        if self.is_initializing(name) {
            return None;
        }
        self.get(name)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.modules.read().contains_key(name) && !self.is_initializing(name)
    }

    pub fn is_initializing(&self, name: &str) -> bool {
        self.initializing.read().contains(name)
    }

    /// Sorted names of loaded modules.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn insert(&self, module: Arc<Module>) {
        let _ = self
            .modules
            .write()
            .insert(module.name().to_string(), module);
    }

    pub(crate) fn remove(&self, name: &str) -> Option<Arc<Module>> {
        self.modules.write().remove(name)
    }

    pub(crate) fn begin_init(&self, name: &str) {
        let _ = self.initializing.write().insert(name.to_string());
    }

    pub(crate) fn end_init(&self, name: &str) {
        let _ = self.initializing.write().remove(name);
    }
}

impl Default for ModuleCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ModuleCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleCache")
            .field("modules", &self.names())
            .finish()
    }
}
