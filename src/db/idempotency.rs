//! TTL-bounded dedup ledger.
//!
//! Two tiers: coarse keys built from the upstream delivery id catch plain
//! redelivery; fine keys built from a payload content hash catch
//! same-content-different-id races. Expiry means "not yet seen" — the
//! schema's unique constraints are the real correctness backstop, so this
//! store fails open: unavailability is logged, never raised, and never
//! blocks real processing.

use crate::error::Result;
use std::time::Duration;
use tracing::warn;

/// Coarse key for the delivery-id tier.
pub fn delivery_key(source: &str, delivery_id: &str) -> String {
    format!("delivery:{source}:{delivery_id}")
}

/// Fine key for the content-hash tier.
pub fn payload_key(resource_id: &str, event_type: &str, payload_hash: &str) -> String {
    format!("payload:{resource_id}:{event_type}:{payload_hash}")
}

impl super::Db {
    /// True if this key was recorded within its retention window.
    /// Ledger unavailability answers false: process it.
    pub async fn is_processed(&self, event_key: &str) -> bool {
        let found: std::result::Result<Option<(i32,)>, sqlx::Error> = sqlx::query_as(
            "SELECT 1 FROM processed_events WHERE event_key = $1 AND expires_at > now()",
        )
        .bind(event_key)
        .fetch_optional(&self.pool)
        .await;

        match found {
            Ok(row) => row.is_some(),
            Err(e) => {
                warn!(event_key, "dedup ledger unavailable, failing open: {e}");
                false
            }
        }
    }

    /// Record a processed key. Fails soft: a write failure is logged and
    /// swallowed so it cannot block the processing that already happened.
    pub async fn mark_processed(&self, event_key: &str, result_summary: &str, ttl: Duration) {
        let expires_at = chrono::Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1));

        let res = sqlx::query(
            "INSERT INTO processed_events (event_key, result_summary, processed_at, expires_at)
             VALUES ($1, $2, now(), $3)
             ON CONFLICT (event_key) DO UPDATE SET
                 result_summary = $2, processed_at = now(), expires_at = $3",
        )
        .bind(event_key)
        .bind(result_summary)
        .bind(expires_at)
        .execute(&self.pool)
        .await;

        if let Err(e) = res {
            warn!(event_key, "failed to record dedup key: {e}");
        }
    }

    /// Secondary dedup on content hash: distinct event ids describing the
    /// same underlying change.
    pub async fn is_duplicate_payload(
        &self,
        resource_id: &str,
        event_type: &str,
        payload_hash: &str,
    ) -> bool {
        self.is_processed(&payload_key(resource_id, event_type, payload_hash))
            .await
    }

    /// Drop expired ledger rows. Returns the number purged.
    pub async fn purge_expired_dedup_keys(&self) -> Result<u64> {
        let purged = sqlx::query("DELETE FROM processed_events WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(purged)
    }
}
