pub mod cache;
pub mod chain;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod oracle;
pub mod policies;
pub mod pool;
pub mod quotes;

use std::sync::Arc;

use chain::tx::TransactionEngine;
use config::Config;
use db::Database;
use metrics::Metrics;
use policies::PolicyOrchestrator;
use quotes::QuoteEngine;

pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub metrics: Metrics,
    pub quotes: QuoteEngine,
    pub engine: TransactionEngine,
    pub orchestrator: Arc<PolicyOrchestrator>,
}
