//! Module lifecycle management for the Portico service host.
//!
//! Every network service the host offers lives in a loadable unit implementing
//! [`Module`]. The [`ModuleRegistry`] is the single owner of the table of units:
//! it loads them through a chain of [`ModuleLoader`]s, tracks their lifecycle
//! state, and counts the references other components hold on them.
//!
//! # Reference counting
//!
//! A [`ModuleHandle`] identifies a module without keeping it loaded. Calling
//! [`ModuleHandle::acquire`] produces a [`ModuleRef`], which does: while any
//! `ModuleRef` for a module exists, that module can be neither unloaded nor
//! reloaded. Listener machinery acquires one for every accepted connection, and
//! modules that depend on each other acquire them through
//! [`ModuleContext::require_module`].
//!
//! # Deferred reloads
//!
//! A reload requested while a module is referenced can be queued instead of
//! refused (see [`ModuleRegistry::reload`]). The queued reload runs on whichever
//! thread drops the last reference, before that drop returns.

pub mod error;
pub use error::*;

mod module;
pub use module::*;

mod record;
pub use record::*;

mod context;
pub use context::*;

mod loader;
pub use loader::*;

mod registry;
pub use registry::*;

#[doc(hidden)]
pub use inventory;
