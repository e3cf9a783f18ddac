//! Backend connections for the storage layer.

use std::time::Duration;

use redis::aio::ConnectionManager;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;

use crate::config::Config;
use crate::error::{Result, StorageError};

/// Handle to both storage backends. Cheap to clone; safe to use from any
/// task concurrently.
#[derive(Clone)]
pub struct Storage {
    pg: PgPool,
    redis: ConnectionManager,
    session_ttl: Duration,
    scheduler_interval: Duration,
}

impl Storage {
    /// Connect to PostgreSQL and Redis and run pending migrations.
    pub async fn connect(config: &Config) -> Result<Self> {
        let pg = PgPoolOptions::new()
            .max_connections(config.postgres.max_open_connections)
            .connect(&config.postgres.dsn)
            .await
            .map_err(|e| StorageError::Backend(format!("connect postgres: {e}")))?;

        sqlx::migrate!("./migrations")
            .run(&pg)
            .await
            .map_err(|e| StorageError::Backend(format!("migrate postgres: {e}")))?;

        let redis_client = redis::Client::open(config.redis.url.as_str())
            .map_err(|e| StorageError::Backend(format!("parse redis url: {e}")))?;
        let redis = ConnectionManager::new(redis_client)
            .await
            .map_err(|e| StorageError::Backend(format!("connect redis: {e}")))?;

        info!("Storage backends connected");

        Ok(Self {
            pg,
            redis,
            session_ttl: config.device_session_ttl(),
            scheduler_interval: config.scheduler_interval(),
        })
    }

    /// Begin a PostgreSQL transaction. Dropping it without commit rolls back.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pg.begin().await?)
    }

    /// Get a reference to the PostgreSQL connection pool.
    pub const fn pg(&self) -> &PgPool {
        &self.pg
    }

    /// A Redis connection handle for one operation.
    pub(crate) fn redis(&self) -> ConnectionManager {
        self.redis.clone()
    }

    /// TTL applied to all device-session related keys.
    pub(crate) const fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    /// Tick interval of the class-B/C scheduler.
    pub(crate) const fn scheduler_interval(&self) -> Duration {
        self.scheduler_interval
    }
}
