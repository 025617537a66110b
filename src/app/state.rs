//! Application state

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::{Config, EngineKind, LedgerKind};
use crate::db::Database;
use crate::engine::{EchoEngine, GenerationEngine, HttpEngine};
use crate::ledger::{CreditLedger, InMemoryCreditLedger, SqliteCreditLedger};
use crate::session::{GenerationCoordinator, InMemoryStreamRegistry, SessionStateStore};

pub struct AppState {
    pub config: Config,
    pub coordinator: Arc<GenerationCoordinator>,
}

impl AppState {
    /// Build the ledger, engine, registry and coordinator described by `config`
    pub fn from_config(config: Config) -> Result<Self> {
        let ledger = build_ledger(&config)?;
        let engine = build_engine(&config)?;
        let coordinator = Self::assemble(&config, ledger, engine);

        Ok(Self {
            config,
            coordinator,
        })
    }

    /// Wire a coordinator around explicit collaborators
    pub fn assemble(
        config: &Config,
        ledger: Arc<dyn CreditLedger>,
        engine: Arc<dyn GenerationEngine>,
    ) -> Arc<GenerationCoordinator> {
        let states = Arc::new(SessionStateStore::new());
        let registry = Arc::new(InMemoryStreamRegistry::new(Arc::clone(&states)));

        Arc::new(GenerationCoordinator::new(
            config.coordinator.to_coordinator_config(),
            registry,
            states,
            ledger,
            engine,
        ))
    }
}

fn build_ledger(config: &Config) -> Result<Arc<dyn CreditLedger>> {
    match config.ledger.kind {
        LedgerKind::Memory => {
            info!("Using in-memory credit ledger");
            Ok(Arc::new(InMemoryCreditLedger::new(config.ledger.initial_balance)))
        }
        LedgerKind::Sqlite => {
            let path = config.ledger.resolve_db_path()?;
            let db = Database::new(&path)?;
            info!("Using SQLite credit ledger at {:?}", path);
            Ok(Arc::new(SqliteCreditLedger::new(db, config.ledger.initial_balance)))
        }
    }
}

fn build_engine(config: &Config) -> Result<Arc<dyn GenerationEngine>> {
    match config.engine.kind {
        EngineKind::Echo => Ok(Arc::new(EchoEngine::new(Duration::from_millis(
            config.engine.chunk_delay_ms,
        )))),
        EngineKind::Http => {
            let url = config
                .engine
                .url
                .clone()
                .context("engine.url is required for the http engine")?;
            info!("Using upstream generation engine at {}", url);
            Ok(Arc::new(HttpEngine::new(url)?))
        }
    }
}
