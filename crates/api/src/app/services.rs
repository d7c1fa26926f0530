use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;

use tally_infra::{
    AccountDirectory, AppConfig, InMemoryAccountDirectory, InMemoryLedgerStore, LedgerService,
    LedgerSettings, LedgerStore, PostgresAccountDirectory, PostgresLedgerStore, db,
};

/// Ledger service over type-erased backends, so both wirings share one handler set.
pub type DynLedgerService = LedgerService<Arc<dyn LedgerStore>, Arc<dyn AccountDirectory>>;

/// Everything the handlers need.
pub struct AppServices {
    pub ledger: DynLedgerService,
    pool: Option<PgPool>,
}

impl AppServices {
    /// In-memory wiring (dev/test).
    pub fn in_memory(settings: LedgerSettings) -> Self {
        let ledger_store = InMemoryLedgerStore::new();
        let directory: Arc<dyn AccountDirectory> =
            Arc::new(InMemoryAccountDirectory::linked_to(&ledger_store));
        let store: Arc<dyn LedgerStore> = Arc::new(ledger_store);
        Self {
            ledger: LedgerService::new(store, directory, settings),
            pool: None,
        }
    }

    /// Postgres wiring: one shared pool for the store and the account directory.
    pub async fn postgres(config: &AppConfig) -> anyhow::Result<Self> {
        let db_config = config
            .database
            .as_ref()
            .context("DATABASE_URL is not set")?;

        let pool = db::connect(db_config).await.context("failed to connect to postgres")?;
        db::migrate(&pool).await.context("failed to apply ledger schema")?;

        let store: Arc<dyn LedgerStore> = Arc::new(PostgresLedgerStore::new(pool.clone()));
        let directory: Arc<dyn AccountDirectory> = Arc::new(PostgresAccountDirectory::new(pool.clone()));
        Ok(Self {
            ledger: LedgerService::new(store, directory, config.ledger_settings()),
            pool: Some(pool),
        })
    }

    /// Release the connection pool, if any.
    pub async fn shutdown(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
            tracing::info!("connection pool closed");
        }
    }
}

/// Pick the backend from configuration.
pub async fn build_services(config: &AppConfig) -> anyhow::Result<AppServices> {
    if config.database.is_some() {
        AppServices::postgres(config).await
    } else {
        tracing::warn!("DATABASE_URL not set; using in-memory ledger (data is lost on exit)");
        Ok(AppServices::in_memory(config.ledger_settings()))
    }
}
