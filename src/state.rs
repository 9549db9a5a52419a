//! Single composed application value, built once at startup and threaded
//! into every handler and background task. No global singletons.

use std::sync::Arc;
use std::time::Instant;

use crate::auth::AuthService;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::payments::PaymentEngine;
use crate::registry::NodeRegistry;
use crate::scheduler::Scheduler;
use crate::workspace::WorkspaceDirectory;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub auth: AuthService,
    pub payments: PaymentEngine,
    pub registry: NodeRegistry,
    pub scheduler: Scheduler,
    pub workspaces: WorkspaceDirectory,
    pub metrics: Arc<Metrics>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let registry = NodeRegistry::new(config.node_heartbeat_timeout_seconds);
        let payments = PaymentEngine::new(config.platform_fee_bps);
        let scheduler = Scheduler::new(registry.clone(), payments.clone(), config.max_pending_jobs);
        let auth = AuthService::new(config.jwt_secret.clone(), config.token_ttl_seconds);
        let workspaces = WorkspaceDirectory::new(config.workspaces_file.clone().into());

        Self {
            config: Arc::new(config),
            auth,
            payments,
            registry,
            scheduler,
            workspaces,
            metrics: Arc::new(Metrics::new()),
            started_at: Instant::now(),
        }
    }
}
