//! Shared, process-wide state passed into every request handler.
//!
//! Built once at startup and handed to axum as the router's `State`, rather
//! than reached for as ambient globals, so tests can construct a context
//! with substitute dependencies.

use std::sync::Arc;

use crate::config::ProxyConfig;
use crate::dashboard::broadcaster::Broadcaster;
use crate::identity::registry::ConversationRegistry;
use crate::store::db::{EventSink, NoopSink, Store};

pub struct AppContext {
    pub client: reqwest::Client,
    pub registry: ConversationRegistry,
    pub config: ProxyConfig,
    pub dashboard: Broadcaster,
    pub store: Option<Store>,
    pub event_sink: Arc<dyn EventSink>,
}

impl AppContext {
    pub fn new(client: reqwest::Client, config: ProxyConfig, store: Option<Store>) -> Arc<Self> {
        let registry = ConversationRegistry::new(std::time::Duration::from_secs(config.conversation_ttl_seconds));
        let event_sink: Arc<dyn EventSink> = match &store {
            Some(store) => Arc::new(store.clone()),
            None => Arc::new(NoopSink),
        };
        Arc::new(Self {
            client,
            registry,
            config,
            dashboard: Broadcaster::new(),
            store,
            event_sink,
        })
    }
}
