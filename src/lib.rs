//! # vigil
//!
//! Wires the instrumentation core together: a [`ModuleSystem`] with the
//! hook interceptor installed, the [`HookRegistry`] behind it, and the
//! [`Application`] that transactions report into.
//!
//! Load-time hooks patch module symbols as modules are first imported;
//! [`Agent::trace_function`] is the common case of wrapping a handler so
//! every call runs inside a [`Transaction`].

#![deny(unsafe_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};
use vigil_core::RequestMetadata;
use vigil_hooks::{
    FinderId, Func, HookError, HookInterceptor, HookRegistry, LoadError, Module, ModuleSystem,
};
use vigil_settings::{AgentSettings, SettingsError};
use vigil_telemetry::{init_telemetry, TelemetryConfig, TelemetryError, TelemetryGuard};
use vigil_transaction::{Application, Transaction, TransactionError};

/// Errors surfaced by the agent facade.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// The assembled agent.
pub struct Agent {
    settings: AgentSettings,
    modules: Arc<ModuleSystem>,
    hooks: Arc<HookRegistry>,
    application: Arc<Application>,
    finder: Mutex<Option<FinderId>>,
}

impl Agent {
    pub fn new(settings: AgentSettings) -> Self {
        Self::with_module_system(settings, Arc::new(ModuleSystem::new()))
    }

    /// Attach to an existing module system, sharing its cache and load
    /// lock.
    pub fn with_module_system(settings: AgentSettings, modules: Arc<ModuleSystem>) -> Self {
        let hooks = Arc::new(HookRegistry::new(Arc::clone(modules.cache())));
        let finder = modules.install_finder(Arc::new(HookInterceptor::new(Arc::clone(&hooks))));
        let application = Arc::new(Application::from_settings(&settings));
        info!(
            app = application.name(),
            enabled = application.enabled(),
            namespace = application.namespace(),
            "agent initialized"
        );
        Self {
            settings,
            modules,
            hooks,
            application,
            finder: Mutex::new(Some(finder)),
        }
    }

    /// Initialize logging from the settings, then build the agent.
    ///
    /// The returned guard controls log levels at runtime.
    pub fn start(settings: AgentSettings) -> Result<(Self, TelemetryGuard)> {
        let telemetry = init_telemetry(TelemetryConfig::from_settings(&settings.logging)?)?;
        Ok((Self::new(settings), telemetry))
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn modules(&self) -> &Arc<ModuleSystem> {
        &self.modules
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    pub fn application(&self) -> &Arc<Application> {
        &self.application
    }

    pub fn import(&self, name: &str) -> Result<Arc<Module>> {
        Ok(self.modules.import(name)?)
    }

    /// Run `callback` once `target` has loaded.
    pub fn register_hook<F>(&self, target: &str, callback: F) -> Result<()>
    where
        F: Fn(&Arc<Module>) -> std::result::Result<(), HookError> + Send + Sync + 'static,
    {
        Ok(self.hooks.register(target, callback)?)
    }

    /// New inactive transaction for this agent's application.
    pub fn transaction(&self, metadata: &RequestMetadata) -> Arc<Transaction> {
        Transaction::new(Arc::clone(&self.application), metadata)
    }

    /// Once `target` loads, wrap its `symbol` (a [`Func<A, R>`]) so each call
    /// runs inside a transaction built from `metadata(&args)`.
    ///
    /// Calls made while the context already has a current transaction run
    /// untraced.
    pub fn trace_function<A, R, M>(&self, target: &str, symbol: &str, metadata: M) -> Result<()>
    where
        A: 'static,
        R: 'static,
        M: Fn(&A) -> RequestMetadata + Send + Sync + 'static,
    {
        let application = Arc::clone(&self.application);
        let metadata = Arc::new(metadata);
        let symbol = symbol.to_string();

        self.register_hook(target, move |module| {
            let application = Arc::clone(&application);
            let metadata = Arc::clone(&metadata);
            module.replace::<Func<A, R>, _>(&symbol, move |original| {
                let original = Arc::clone(&*original);
                let traced: Func<A, R> = Arc::new(move |args: A| {
                    let txn = Transaction::new(Arc::clone(&application), &metadata(&args));
                    match txn.guard() {
                        Ok(_guard) => original(args),
                        Err(e) => {
                            debug!(error = %e, "calling untraced");
                            original(args)
                        }
                    }
                });
                Ok(traced)
            })?;
            debug!(module = module.name(), symbol = %symbol, "traced function installed");
            Ok(())
        })
    }

    /// Stop intercepting imports and drop every pending hook.
    pub fn shutdown(&self) {
        if let Some(id) = self.finder.lock().take() {
            let _ = self.modules.uninstall_finder(id);
        }
        self.hooks.clear();
        info!(
            finished = self.application.finished_count(),
            "agent shut down"
        );
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("application", &self.application)
            .field("modules", &self.modules)
            .field("hooks", &self.hooks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> Agent {
        Agent::new(AgentSettings {
            app_name: "unit".into(),
            ..AgentSettings::default()
        })
    }

    #[test]
    fn built_from_settings() {
        let agent = agent();
        assert_eq!(agent.application().name(), "unit");
        assert_eq!(agent.settings().namespace, "vigil");
        assert_eq!(agent.modules().finder_count(), 1);
    }

    #[test]
    fn shutdown_uninstalls_interceptor() {
        let agent = agent();
        agent.register_hook("later", |_| Ok(())).unwrap();
        agent.shutdown();
        assert_eq!(agent.modules().finder_count(), 0);
        assert!(agent.hooks().pending_targets().is_empty());
        agent.shutdown();
    }

    #[test]
    fn errors_convert() {
        let err: AgentError = LoadError::NotFound("x".into()).into();
        assert_eq!(err.to_string(), "no module named 'x'");
        assert!(matches!(agent().import("missing"), Err(AgentError::Load(_))));
    }
}
