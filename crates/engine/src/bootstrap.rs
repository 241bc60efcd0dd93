use std::sync::Arc;

use signoff_core::config::{AppConfig, ConfigError, LoadOptions};
use signoff_db::repositories::{
    SqlCommentRepository, SqlDirectory, SqlProcessRepository, SqlRequestRepository,
};
use signoff_db::{connect_from_config, migrations, DbPool};
use thiserror::Error;
use tracing::info;

use crate::engine::ApprovalEngine;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub engine: ApprovalEngine,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

/// Connects, migrates and wires the engine over the SQL repositories.
pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        database_url = %config.database.url,
        administrators = config.engine.administrators.len(),
        "starting signoff bootstrap"
    );

    let db_pool =
        connect_from_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "system.bootstrap.database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let engine = sql_engine(db_pool.clone(), &config.engine.administrators);

    Ok(Application { config, db_pool, engine })
}

pub fn sql_engine(pool: DbPool, administrators: &[String]) -> ApprovalEngine {
    ApprovalEngine::new(
        Arc::new(SqlProcessRepository::new(pool.clone())),
        Arc::new(SqlRequestRepository::new(pool.clone())),
        Arc::new(SqlCommentRepository::new(pool.clone())),
        Arc::new(SqlDirectory::new(pool)),
    )
    .with_administrators(administrators.iter().cloned())
}
