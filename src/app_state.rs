//! Shared state for the Actix-web server.

use std::sync::Arc;

use crate::browser::BrowserPool;
use crate::config::Config;
use crate::orchestrator::Orchestrator;
use crate::scheduler::DownloadScheduler;

/// Wrapped in `web::Data` and shared across all HTTP handlers.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub scheduler: Arc<DownloadScheduler>,
    pub pool: Arc<BrowserPool>,
    pub config: Config,
}
