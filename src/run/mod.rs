//! Runs: the orchestrator, its per-run context, events and durable records.

pub mod context;
pub mod error;
pub mod events;
pub mod model;
pub mod orchestrator;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

pub use context::{RunContext, Services};
pub use error::{RunError, SubmitError};
pub use events::{CandidateStatus, Citation, EventEmitter, Phase, RunEvent, RunEventStream};
pub use model::{
    Artifact, Check, Pass, PassId, PassStatus, PassType, Run, RunId, RunStatus, RunView, Usage,
};
pub use orchestrator::Orchestrator;
pub use store::{PassCompletion, RunFinish, RunStore, SqliteRunStore, StoreError};

use crate::cache::{CacheError, CacheStore, SqliteResponseCache};
use crate::config::{ConfigError, HarnessConfig};
use crate::gateway::{ProviderError, ProviderGateway, TracingUsageSink};
use crate::ledger::{LedgerError, SqliteLedger};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("gateway: {0}")]
    Gateway(#[from] ProviderError),
    #[error("response cache: {0}")]
    Cache(#[from] CacheError),
    #[error("run store: {0}")]
    Store(#[from] StoreError),
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
}

/// Wire the production stack described by `config`: OpenRouter gateway,
/// SQLite response cache, run store and ledger.
pub fn open(config: &HarnessConfig) -> Result<Orchestrator, StartupError> {
    let lanes = config.lane_registry()?;
    let gateway = ProviderGateway::from_settings(&config.gateway, Arc::new(TracingUsageSink))?;
    let cache = SqliteResponseCache::new(&config.cache.path)?;
    let store = SqliteRunStore::new(&config.store.path)?;
    let ledger = SqliteLedger::new(config.ledger_path())?;

    let services = Services {
        gateway: Arc::new(gateway),
        cache: CacheStore::new(Arc::new(cache)),
        ledger: Arc::new(ledger),
        store: Arc::new(store),
        settings: config.run.clone(),
        default_cache_ttl: Duration::from_secs(config.cache.default_ttl_secs),
    };
    Ok(Orchestrator::new(services, lanes))
}
