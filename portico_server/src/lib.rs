//! The Portico service host.
//!
//! Ties the module registry and the listener collection together into a
//! daemon: configuration, logging, the built-in service modules, an operator
//! console on a Unix socket, and the process lifecycle in [`run::run_server`].

pub mod config;

mod host;
pub use host::*;

pub mod console;
pub mod modules;
pub mod run;

mod tracing_config;

pub use tracing_config::build_subscriber;
