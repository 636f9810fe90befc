//! Pass-through function wrappers used to patch module symbols.

use std::fmt;
use std::sync::Arc;

use crate::errors::HookError;
use crate::module::Module;

/// A shareable function stored as a module symbol.
pub type Func<A, R> = Arc<dyn Fn(A) -> R + Send + Sync>;

/// Rewrites arguments before the wrapped call.
pub type InFn<A> = Arc<dyn Fn(A) -> A + Send + Sync>;

/// Rewrites the result after the wrapped call.
pub type OutFn<R> = Arc<dyn Fn(R) -> R + Send + Sync>;

/// Calls `wrapped` with arguments passed through `in_fn` and returns the
/// result passed through `out_fn`. At least one of the two must be set.
pub struct PassFunction<A, R> {
    wrapped: Func<A, R>,
    in_fn: Option<InFn<A>>,
    out_fn: Option<OutFn<R>>,
}

impl<A: 'static, R: 'static> PassFunction<A, R> {
    pub fn new(
        wrapped: Func<A, R>,
        in_fn: Option<InFn<A>>,
        out_fn: Option<OutFn<R>>,
    ) -> Result<Self, HookError> {
        if in_fn.is_none() && out_fn.is_none() {
            return Err(HookError::InvalidWrapper);
        }
        Ok(Self {
            wrapped,
            in_fn,
            out_fn,
        })
    }

    pub fn call(&self, args: A) -> R {
        let args = match &self.in_fn {
            Some(f) => f(args),
            None => args,
        };
        let result = (self.wrapped)(args);
        match &self.out_fn {
            Some(f) => f(result),
            None => result,
        }
    }

    /// The wrapped function this wrapper delegates to.
    pub fn wrapped(&self) -> &Func<A, R> {
        &self.wrapped
    }

    pub fn into_func(self) -> Func<A, R> {
        Arc::new(move |args| self.call(args))
    }
}

impl<A, R> fmt::Debug for PassFunction<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassFunction")
            .field("in_fn", &self.in_fn.is_some())
            .field("out_fn", &self.out_fn.is_some())
            .finish()
    }
}

/// Replace the [`Func`] stored under `symbol` with a [`PassFunction`]
/// around it.
pub fn wrap_pass_function<A: 'static, R: 'static>(
    module: &Module,
    symbol: &str,
    in_fn: Option<InFn<A>>,
    out_fn: Option<OutFn<R>>,
) -> Result<(), HookError> {
    module.replace::<Func<A, R>, _>(symbol, |original| {
        let wrapper = PassFunction::new(Arc::clone(&*original), in_fn, out_fn)?;
        Ok(wrapper.into_func())
    })
}
