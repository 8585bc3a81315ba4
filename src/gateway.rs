//! The gateway aggregate
//!
//! One `Gateway` owns every subsystem handle: session store, OAuth halves,
//! outbound connection manager, aggregator, inbound sessions, and the config
//! watcher. `main` constructs it and passes it around explicitly.

use crate::auth::{AuthorizationServer, OAuthRendezvous, SessionStore};
use crate::config::{
    load_servers_config, log_snapshot_summary, ConfigWatcher, GatewayOptions, PresetStore,
    ServersSnapshot,
};
use crate::error::Result;
use crate::mcp::aggregator::{CapabilityAggregator, TemplateEngine};
use crate::mcp::manager::{OutboundManager, RetryPolicy};
use crate::mcp::session::SessionManager;
use std::sync::Arc;
use tracing::{error, info};

/// Process-scoped gateway state
pub struct Gateway {
    pub options: GatewayOptions,
    pub store: Arc<SessionStore>,
    pub rendezvous: Arc<OAuthRendezvous>,
    pub manager: Arc<OutboundManager>,
    pub aggregator: Arc<CapabilityAggregator>,
    pub sessions: Arc<SessionManager>,
    pub auth_server: Arc<AuthorizationServer>,
    pub presets: Arc<PresetStore>,
    watcher: std::sync::Mutex<Option<ConfigWatcher>>,
}

impl Gateway {
    /// Wire the subsystems together. Does not start any connection.
    pub fn new(options: GatewayOptions, template: Option<Arc<dyn TemplateEngine>>) -> Result<Arc<Self>> {
        let store = Arc::new(SessionStore::new(options.session_storage_dir())?);
        let rendezvous = Arc::new(OAuthRendezvous::new());
        let callback_base = format!("http://{}:{}", options.host, options.port);
        let manager = OutboundManager::new(
            Arc::clone(&store),
            Arc::clone(&rendezvous),
            callback_base,
            RetryPolicy::default(),
        );
        let aggregator = Arc::new(CapabilityAggregator::new(Arc::clone(&manager), template));
        let presets = Arc::new(PresetStore::new(&options.config_dir()));
        let sessions = SessionManager::new(
            Arc::clone(&manager),
            Arc::clone(&aggregator),
            Arc::clone(&presets),
        );
        let auth_server = Arc::new(AuthorizationServer::new(Arc::clone(&store)));

        Ok(Arc::new(Self {
            options,
            store,
            rendezvous,
            manager,
            aggregator,
            sessions,
            auth_server,
            presets,
            watcher: std::sync::Mutex::new(None),
        }))
    }

    /// Load config, start outbound connections, the store sweeper, and the
    /// config watcher
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let snapshot = match load_servers_config(&self.options.config_path) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Config load failed, starting with no outbound servers: {}", e);
                ServersSnapshot::new()
            }
        };
        log_snapshot_summary(&snapshot);

        self.store.spawn_sweeper();
        self.manager.start(&snapshot).await;

        match ConfigWatcher::spawn(&self.options.config_path, snapshot) {
            Ok((watcher, mut changes)) => {
                *self.watcher.lock().unwrap() = Some(watcher);
                let manager = Arc::clone(&self.manager);
                tokio::spawn(async move {
                    while let Some(change) = changes.recv().await {
                        manager.apply_reload(&change.diff, &change.snapshot).await;
                    }
                });
            }
            Err(e) => error!("Config watching disabled: {}", e),
        }

        info!("Gateway started");
        Ok(())
    }

    /// Orderly teardown: sweeper, rendezvous waiters, outbound connections
    pub async fn shutdown(&self) {
        info!("Gateway shutting down");
        if let Some(watcher) = self.watcher.lock().unwrap().take() {
            watcher.shutdown();
        }
        self.rendezvous.cancel_all();
        self.manager.shutdown().await;
        self.store.shutdown();
    }
}
