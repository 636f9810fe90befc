//! Hook and module-loading error types.

use thiserror::Error;

/// Failure to load a module.
///
/// Passed through the interceptor unchanged, so callers see exactly what
/// the underlying load raised.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LoadError {
    /// Nothing is defined under this name.
    #[error("no module named '{0}'")]
    NotFound(String),

    /// The module's initializer failed.
    #[error("module '{name}' failed to initialize: {message}")]
    Init {
        /// Module being initialized.
        name: String,
        /// Failure reported by the initializer.
        message: String,
    },
}

impl LoadError {
    pub fn init(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Init {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Errors raised by the hook registry and by hook callbacks.
#[derive(Debug, Error)]
pub enum HookError {
    /// Hook registered against an empty target name.
    #[error("hook target must not be empty")]
    EmptyTarget,

    /// Pass function built without any transformer.
    #[error("pass function needs an inbound or outbound transformer")]
    InvalidWrapper,

    /// Symbol lookup failed while patching a module.
    #[error("module '{module}' has no symbol '{symbol}'")]
    MissingSymbol {
        /// Module being patched.
        module: String,
        /// Symbol that was looked up.
        symbol: String,
    },

    /// Symbol exists but holds a different type than requested.
    #[error("symbol '{symbol}' in module '{module}' has an unexpected type")]
    SymbolType {
        /// Module being patched.
        module: String,
        /// Symbol that was looked up.
        symbol: String,
    },

    /// A callback tried to load another module and failed.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// A callback reported a failure of its own.
    #[error("hook callback failed: {0}")]
    Callback(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_error_display() {
        assert_eq!(
            LoadError::NotFound("shop.views".into()).to_string(),
            "no module named 'shop.views'"
        );
        assert_eq!(
            LoadError::init("shop.views", "boom").to_string(),
            "module 'shop.views' failed to initialize: boom"
        );
    }

    #[test]
    fn load_error_converts_transparently() {
        let err: HookError = LoadError::NotFound("x".into()).into();
        assert_eq!(err.to_string(), "no module named 'x'");
    }
}
