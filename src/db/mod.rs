//! Database connection pool, migrations, and health check.
//!
//! One Postgres pool backs everything: task/run persistence, the event
//! audit trail, the dedup ledger, resource locks, and the pgmq lanes.
//! Every mutating operation that spans rows runs in a single transaction.

pub mod events;
pub mod idempotency;
pub mod lanes;
pub mod locks;
pub mod runs;
pub mod tasks;

use crate::error::Result;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Database handle. Owns the connection pool shared across all modules.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| crate::error::Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check — run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Get a reference to the connection pool (for submodules and the
    /// consumer loops' LISTEN connections).
    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}
