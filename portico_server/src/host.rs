use crate::config::ServerConfig;

use service_listener::{ListenerCollection, ListenerSettings};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

/// Services the host process offers to its modules, reachable from module
/// callbacks through `ModuleContext::host::<Host>()`.
pub struct Host {
    pub server_name: String,
    pub listeners: ListenerCollection,
    started: Instant,
}

impl Host {
    pub fn new(server_name: impl Into<String>, settings: ListenerSettings) -> Self {
        Self {
            server_name: server_name.into(),
            listeners: ListenerCollection::new(settings),
            started: Instant::now(),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Arc<Self> {
        let settings = ListenerSettings {
            bind_address: config.listen_address,
            poll_interval: Duration::from_millis(config.accept_poll_ms),
        };
        Arc::new(Self::new(config.server_name.clone(), settings))
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}
