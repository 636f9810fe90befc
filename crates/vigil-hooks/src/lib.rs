//! # vigil-hooks
//!
//! Fire instrumentation callbacks exactly once, the first time a named
//! module becomes available.
//!
//! ## Pieces
//!
//! - [`ModuleSystem`](system::ModuleSystem): named loadable units, a
//!   resolution chain of [`ImportFinder`](system::ImportFinder) participants,
//!   and a process-wide re-entrant [`LoadLock`](module::LoadLock).
//! - [`HookRegistry`](registry::HookRegistry): per-target callback lists with
//!   a `Pending → Resolving → Fired` state machine.
//! - [`HookInterceptor`](interceptor::HookInterceptor): the finder that forces
//!   a watched target to load and then notifies the registry.
//! - [`PassFunction`](wrap::PassFunction): the wrapper hooks use to patch
//!   module symbols.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use vigil_hooks::{HookInterceptor, HookRegistry, ModuleSystem};
//!
//! let system = ModuleSystem::new();
//! system.define("shop.views", |_system, module| {
//!     module.define("version", 3u32);
//!     Ok(())
//! });
//!
//! let registry = Arc::new(HookRegistry::new(Arc::clone(system.cache())));
//! let _finder = system.install_finder(Arc::new(HookInterceptor::new(Arc::clone(&registry))));
//!
//! registry
//!     .register("shop.views", |module| {
//!         assert_eq!(*module.get::<u32>("version").unwrap(), 3);
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! system.import("shop.views").unwrap();
//! assert!(registry.is_fired("shop.views"));
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod interceptor;
pub mod module;
pub mod registry;
pub mod system;
pub mod wrap;

pub use errors::{HookError, LoadError};
pub use interceptor::HookInterceptor;
pub use module::{LoadLock, Module, ModuleCache};
pub use registry::{HookCallback, HookRegistry, HookStatus};
pub use system::{FinderId, ImportFinder, ModuleSystem};
pub use wrap::{wrap_pass_function, Func, PassFunction};
