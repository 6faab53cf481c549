//! Network listeners for Portico service modules.
//!
//! A module registers one [`ListenerSpec`] (up to three cooperating ports and
//! the service name each one carries) with the host's [`ListenerCollection`].
//! Each listener gets its own accept thread, which multiplexes its sockets
//! with `poll` and hands every accepted connection to the module's handler
//! on a dedicated thread. For the duration of that handler the owning module
//! is referenced, so it cannot be unloaded underneath a live connection.
//!
//! The [`socket`] module holds the lower-level primitives the accept loop is
//! built from, and [`DelimitedReader`] parses line- or token-delimited input
//! out of a fixed buffer.

pub mod id;
pub use id::*;

pub mod error;
pub use error::*;

pub mod socket;
pub use socket::{AcceptOutcome, IpFilter};

mod readline;
pub use readline::*;

mod protocols;
pub use protocols::*;

mod connection;
pub use connection::*;

mod listener_collection;
pub use listener_collection::*;

mod internal
{
    pub mod listener;
    pub use listener::*;
    pub mod connection_task;
    pub use connection_task::*;
}
