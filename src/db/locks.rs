//! Per-resource mutual exclusion with a post-release cooldown.
//!
//! Locks live in Postgres, not process memory — a crashed holder leaves a
//! recoverable lease for the janitor instead of a lock leaked forever.
//! Fails open: if the lock store is unreachable, processing proceeds. A
//! missed exclusion causes wasteful-but-correct reprocessing; silently
//! dropped work would not be recoverable.

use crate::error::Result;
use std::time::Duration;
use tracing::warn;

const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(250);

enum Acquire {
    Acquired,
    /// An active holder has it; worth waiting.
    Held,
    /// Released too recently; re-entry must not race still-settling
    /// persistence writes. Not worth waiting; fail now.
    Cooldown,
}

impl super::Db {
    /// Take the lock for `resource_id`, waiting up to `timeout` for an
    /// active holder. A resource inside its post-release cooldown is
    /// refused immediately; the cooldown window is never waited out.
    pub async fn acquire_resource(
        &self,
        resource_id: &str,
        holder: &str,
        timeout: Duration,
        cooldown: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.try_acquire(resource_id, holder, cooldown).await {
                Ok(Acquire::Acquired) => return true,
                Ok(Acquire::Cooldown) => return false,
                Ok(Acquire::Held) => {
                    if tokio::time::Instant::now() >= deadline {
                        return false;
                    }
                    tokio::time::sleep(ACQUIRE_POLL_INTERVAL).await;
                }
                Err(e) => {
                    warn!(resource_id, "lock store unavailable, failing open: {e}");
                    return true;
                }
            }
        }
    }

    async fn try_acquire(
        &self,
        resource_id: &str,
        holder: &str,
        cooldown: Duration,
    ) -> Result<Acquire> {
        // Atomic insert-or-steal: a fresh resource, or one whose release
        // has aged past the cooldown, is taken in one statement.
        let taken = sqlx::query(
            "INSERT INTO resource_locks (resource_id, holder, locked_at, released_at)
             VALUES ($1, $2, now(), NULL)
             ON CONFLICT (resource_id) DO UPDATE
                 SET holder = $2, locked_at = now(), released_at = NULL
                 WHERE resource_locks.released_at IS NOT NULL
                   AND resource_locks.released_at <= now() - make_interval(secs => $3)",
        )
        .bind(resource_id)
        .bind(holder)
        .bind(cooldown.as_secs_f64())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if taken > 0 {
            return Ok(Acquire::Acquired);
        }

        // Refused. Look at the row to tell an active holder (worth
        // waiting) from a cooldown (not).
        let row: Option<(bool,)> = sqlx::query_as(
            "SELECT released_at IS NULL FROM resource_locks WHERE resource_id = $1",
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((true,)) => Ok(Acquire::Held),
            Some((false,)) => Ok(Acquire::Cooldown),
            // Row vanished between the two statements; the poll retries.
            None => Ok(Acquire::Held),
        }
    }

    /// Idempotent: releasing a lock that isn't held is a no-op. Release
    /// failures are logged, not raised; the lease cleanup recovers them.
    pub async fn release_resource(&self, resource_id: &str) {
        let res = sqlx::query(
            "UPDATE resource_locks SET released_at = now()
             WHERE resource_id = $1 AND released_at IS NULL",
        )
        .bind(resource_id)
        .execute(&self.pool)
        .await;

        if let Err(e) = res {
            warn!(resource_id, "lock release failed: {e}");
        }
    }

    /// Is an active holder on this resource right now?
    pub async fn resource_is_locked(&self, resource_id: &str) -> Result<bool> {
        let row: Option<(bool,)> = sqlx::query_as(
            "SELECT released_at IS NULL FROM resource_locks WHERE resource_id = $1",
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(held,)| held).unwrap_or(false))
    }

    /// Recover leases whose holder crashed without releasing. Marks them
    /// released (their cooldown then applies as usual) and returns the
    /// number reclaimed.
    pub async fn cleanup_stale_locks(&self, max_age: Duration) -> Result<u64> {
        let reclaimed = sqlx::query(
            "UPDATE resource_locks SET released_at = now()
             WHERE released_at IS NULL AND locked_at <= now() - make_interval(secs => $1)",
        )
        .bind(max_age.as_secs_f64())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(reclaimed)
    }
}
