//! CRUD and lifecycle operations for the `ingestions` hierarchy.
//!
//! [`IngestionStore`] is a cheap value (engine identity + retry policy)
//! whose async methods take a `&PgPool`. Every operation runs through the
//! transactional retry wrapper; multi-key operations chunk their bind lists
//! below the backend's parameter ceiling.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use choreo_core::{DbError, IngestionError};

use crate::engine::{decode_cursor, encode_cursor, DatabaseEngine};
use crate::records::{IngestionRecord, MarkRecord, OPEN_TICKET};
use crate::retry::{run_in_transaction, RetryPolicy};

/// Column list shared by every `ingestions` SELECT/RETURNING.
const INGESTION_COLUMNS: &str = "id, provider_name, status, next_action, next_action_at, \
     attempts, last_error, completion_ticket, ingestion_completed_at, \
     rest_completed_at, created_at";

const MARK_COLUMNS: &str = "id, ingestion_id, sequence, cursor, created_at";

/// Cap applied to `last_error` before it reaches fixed-width storage.
const MAX_ERROR_LEN: usize = 2000;
const TRUNCATION_MARKER: &str = "… (truncated)";

/// Truncate an error message to [`MAX_ERROR_LEN`] characters, appending a
/// marker when anything was cut.
pub fn truncate_error(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_LEN {
        return message.to_string();
    }
    let kept: String = message
        .chars()
        .take(MAX_ERROR_LEN - TRUNCATION_MARKER.chars().count())
        .collect();
    format!("{}{}", kept, TRUNCATION_MARKER)
}

/// A provider with more than one open ingestion row (health signal).
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct DuplicateActive {
    pub provider_name: String,
    pub open_count: i64,
}

/// Per-kind entity count under one ingestion's marks.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct KindCount {
    pub kind: String,
    pub count: i64,
}

#[derive(Debug, Clone)]
pub struct IngestionStore {
    engine: DatabaseEngine,
    policy: RetryPolicy,
}

impl IngestionStore {
    pub fn new(engine: DatabaseEngine) -> Self {
        Self {
            engine,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn engine(&self) -> DatabaseEngine {
        self.engine
    }

    pub(crate) fn policy_ref(&self) -> &RetryPolicy {
        &self.policy
    }

    // ── Ingestion records ─────────────────────────────────────

    /// Create the provider's active run: `bursting`, `open`, ready to ingest.
    pub async fn create_provider_ingestion_record(
        &self,
        pool: &PgPool,
        provider: &str,
    ) -> Result<IngestionRecord, DbError> {
        let sql = format!(
            "INSERT INTO ingestions (id, provider_name, status, next_action, next_action_at)
             VALUES ($1, $2, 'bursting', 'ingest', now())
             RETURNING {}",
            INGESTION_COLUMNS
        );
        let provider = provider.to_string();
        run_in_transaction(pool, "create_provider_ingestion_record", &self.policy, move |tx| {
            let sql = sql.clone();
            let provider = provider.clone();
            Box::pin(async move {
                sqlx::query_as::<_, IngestionRecord>(&sql)
                    .bind(Uuid::new_v4())
                    .bind(provider)
                    .fetch_one(&mut **tx)
                    .await
            })
        })
        .await
    }

    /// The provider's open (active) ingestion row, if any.
    pub async fn get_current_ingestion_record(
        &self,
        pool: &PgPool,
        provider: &str,
    ) -> Result<Option<IngestionRecord>, DbError> {
        let sql = format!(
            "SELECT {} FROM ingestions
             WHERE provider_name = $1 AND completion_ticket = $2",
            INGESTION_COLUMNS
        );
        let provider = provider.to_string();
        run_in_transaction(pool, "get_current_ingestion_record", &self.policy, move |tx| {
            let sql = sql.clone();
            let provider = provider.clone();
            Box::pin(async move {
                sqlx::query_as::<_, IngestionRecord>(&sql)
                    .bind(provider)
                    .bind(OPEN_TICKET)
                    .fetch_optional(&mut **tx)
                    .await
            })
        })
        .await
    }

    /// The most recent completed run, kept around for removal diffing.
    pub async fn get_previous_ingestion_record(
        &self,
        pool: &PgPool,
        provider: &str,
    ) -> Result<Option<IngestionRecord>, DbError> {
        let sql = format!(
            "SELECT {} FROM ingestions
             WHERE provider_name = $1 AND completion_ticket <> $2
             ORDER BY created_at DESC
             LIMIT 1",
            INGESTION_COLUMNS
        );
        let provider = provider.to_string();
        run_in_transaction(pool, "get_previous_ingestion_record", &self.policy, move |tx| {
            let sql = sql.clone();
            let provider = provider.clone();
            Box::pin(async move {
                sqlx::query_as::<_, IngestionRecord>(&sql)
                    .bind(provider)
                    .bind(OPEN_TICKET)
                    .fetch_optional(&mut **tx)
                    .await
            })
        })
        .await
    }

    /// All ingestion rows for a provider, newest first.
    pub async fn list_ingestions(
        &self,
        pool: &PgPool,
        provider: &str,
    ) -> Result<Vec<IngestionRecord>, DbError> {
        let sql = format!(
            "SELECT {} FROM ingestions
             WHERE provider_name = $1
             ORDER BY created_at DESC",
            INGESTION_COLUMNS
        );
        let provider = provider.to_string();
        run_in_transaction(pool, "list_ingestions", &self.policy, move |tx| {
            let sql = sql.clone();
            let provider = provider.clone();
            Box::pin(async move {
                sqlx::query_as::<_, IngestionRecord>(&sql)
                    .bind(provider)
                    .fetch_all(&mut **tx)
                    .await
            })
        })
        .await
    }

    // ── Lifecycle transitions ─────────────────────────────────
    //
    // Each transition updates the provider's open row and returns whether a
    // row was touched, so a transition against a closed run is a no-op
    // rather than an error.

    pub async fn set_provider_ingesting(
        &self,
        pool: &PgPool,
        provider: &str,
    ) -> Result<bool, DbError> {
        self.update_open_row(
            pool,
            "set_provider_ingesting",
            "next_action = 'ingest', next_action_at = now()",
            provider,
        )
        .await
    }

    pub async fn set_provider_bursting(
        &self,
        pool: &PgPool,
        provider: &str,
    ) -> Result<bool, DbError> {
        self.update_open_row(pool, "set_provider_bursting", "status = 'bursting'", provider)
            .await
    }

    /// Between-bursts pause inside one cycle; resets the attempt counter.
    pub async fn set_provider_interstitial(
        &self,
        pool: &PgPool,
        provider: &str,
    ) -> Result<bool, DbError> {
        self.update_open_row(
            pool,
            "set_provider_interstitial",
            "status = 'interstitial', attempts = 0",
            provider,
        )
        .await
    }

    pub async fn set_provider_resting(
        &self,
        pool: &PgPool,
        provider: &str,
        rest_length: Duration,
    ) -> Result<bool, DbError> {
        let until = deadline(rest_length);
        let sql = "UPDATE ingestions
             SET next_action = 'rest', next_action_at = $3, status = 'resting',
                 ingestion_completed_at = now()
             WHERE provider_name = $1 AND completion_ticket = $2";
        let provider = provider.to_string();
        run_in_transaction(pool, "set_provider_resting", &self.policy, move |tx| {
            let provider = provider.clone();
            Box::pin(async move {
                let result = sqlx::query(sql)
                    .bind(provider)
                    .bind(OPEN_TICKET)
                    .bind(until)
                    .execute(&mut **tx)
                    .await?;
                Ok(result.rows_affected() > 0)
            })
        })
        .await
    }

    /// Close the run successfully. Writing a fresh completion ticket is what
    /// releases the provider's single-active-run slot.
    pub async fn set_provider_complete(
        &self,
        pool: &PgPool,
        provider: &str,
    ) -> Result<bool, DbError> {
        self.close_open_row(pool, "set_provider_complete", "nothing (done)", provider)
            .await
    }

    /// Close the run as canceled, releasing the slot.
    pub async fn set_provider_canceled(
        &self,
        pool: &PgPool,
        provider: &str,
    ) -> Result<bool, DbError> {
        self.close_open_row(pool, "set_provider_canceled", "nothing (canceled)", provider)
            .await
    }

    pub async fn set_provider_canceling(
        &self,
        pool: &PgPool,
        provider: &str,
        message: &str,
    ) -> Result<bool, DbError> {
        let message = truncate_error(message);
        let sql = "UPDATE ingestions
             SET next_action = 'cancel', status = 'canceling', last_error = $3
             WHERE provider_name = $1 AND completion_ticket = $2";
        let provider = provider.to_string();
        run_in_transaction(pool, "set_provider_canceling", &self.policy, move |tx| {
            let message = message.clone();
            let provider = provider.clone();
            Box::pin(async move {
                let result = sqlx::query(sql)
                    .bind(provider)
                    .bind(OPEN_TICKET)
                    .bind(message)
                    .execute(&mut **tx)
                    .await?;
                Ok(result.rows_affected() > 0)
            })
        })
        .await
    }

    /// Record a failed burst: bump attempts, schedule the retry.
    pub async fn set_provider_backoff(
        &self,
        pool: &PgPool,
        provider: &str,
        error: &str,
        backoff_length: Duration,
    ) -> Result<bool, DbError> {
        let until = deadline(backoff_length);
        let message = truncate_error(error);
        let sql = "UPDATE ingestions
             SET next_action = 'backoff', attempts = attempts + 1,
                 next_action_at = $3, status = 'backing off', last_error = $4
             WHERE provider_name = $1 AND completion_ticket = $2";
        let provider = provider.to_string();
        run_in_transaction(pool, "set_provider_backoff", &self.policy, move |tx| {
            let message = message.clone();
            let provider = provider.clone();
            Box::pin(async move {
                let result = sqlx::query(sql)
                    .bind(provider)
                    .bind(OPEN_TICKET)
                    .bind(until)
                    .bind(message)
                    .execute(&mut **tx)
                    .await?;
                Ok(result.rows_affected() > 0)
            })
        })
        .await
    }

    /// Pull `next_action_at` to now so the next scheduler tick acts
    /// immediately. Used by push notifications to shortcut a rest period.
    pub async fn trigger_next_provider_action(
        &self,
        pool: &PgPool,
        provider: &str,
    ) -> Result<bool, DbError> {
        self.update_open_row(
            pool,
            "trigger_next_provider_action",
            "next_action_at = now()",
            provider,
        )
        .await
    }

    async fn update_open_row(
        &self,
        pool: &PgPool,
        operation: &'static str,
        set_clause: &'static str,
        provider: &str,
    ) -> Result<bool, DbError> {
        let sql = format!(
            "UPDATE ingestions SET {} WHERE provider_name = $1 AND completion_ticket = $2",
            set_clause
        );
        let provider = provider.to_string();
        run_in_transaction(pool, operation, &self.policy, move |tx| {
            let sql = sql.clone();
            let provider = provider.clone();
            Box::pin(async move {
                let result = sqlx::query(&sql)
                    .bind(provider)
                    .bind(OPEN_TICKET)
                    .execute(&mut **tx)
                    .await?;
                Ok(result.rows_affected() > 0)
            })
        })
        .await
    }

    async fn close_open_row(
        &self,
        pool: &PgPool,
        operation: &'static str,
        next_action: &'static str,
        provider: &str,
    ) -> Result<bool, DbError> {
        let sql = "UPDATE ingestions
             SET next_action = $3, rest_completed_at = now(), status = 'complete',
                 completion_ticket = $4
             WHERE provider_name = $1 AND completion_ticket = $2";
        let provider = provider.to_string();
        run_in_transaction(pool, operation, &self.policy, move |tx| {
            let provider = provider.clone();
            Box::pin(async move {
                let result = sqlx::query(sql)
                    .bind(provider)
                    .bind(OPEN_TICKET)
                    .bind(next_action)
                    .bind(Uuid::new_v4().to_string())
                    .execute(&mut **tx)
                    .await?;
                Ok(result.rows_affected() > 0)
            })
        })
        .await
    }

    // ── Marks ─────────────────────────────────────────────────

    /// Append a traversal checkpoint; sequence is allocated inside the
    /// transaction so it stays strictly increasing per ingestion.
    pub async fn create_mark(
        &self,
        pool: &PgPool,
        ingestion_id: Uuid,
        cursor: &serde_json::Value,
    ) -> Result<MarkRecord, DbError> {
        let stored = encode_cursor(self.engine, cursor);
        let sql = format!(
            "INSERT INTO ingestion_marks (id, ingestion_id, sequence, cursor)
             VALUES ($1, $2, $3, $4)
             RETURNING {}",
            MARK_COLUMNS
        );
        run_in_transaction(pool, "create_mark", &self.policy, move |tx| {
            let sql = sql.clone();
            let stored = stored.clone();
            Box::pin(async move {
                let sequence: i64 = sqlx::query_scalar(
                    "SELECT COALESCE(MAX(sequence), 0) + 1 FROM ingestion_marks
                     WHERE ingestion_id = $1",
                )
                .bind(ingestion_id)
                .fetch_one(&mut **tx)
                .await?;

                sqlx::query_as::<_, MarkRecord>(&sql)
                    .bind(Uuid::new_v4())
                    .bind(ingestion_id)
                    .bind(sequence)
                    .bind(stored)
                    .fetch_one(&mut **tx)
                    .await
            })
        })
        .await
    }

    /// Latest mark by sequence — the resume point.
    pub async fn last_mark(
        &self,
        pool: &PgPool,
        ingestion_id: Uuid,
    ) -> Result<Option<MarkRecord>, DbError> {
        self.mark_by_order(pool, "last_mark", "DESC", ingestion_id).await
    }

    /// Earliest mark by sequence.
    pub async fn first_mark(
        &self,
        pool: &PgPool,
        ingestion_id: Uuid,
    ) -> Result<Option<MarkRecord>, DbError> {
        self.mark_by_order(pool, "first_mark", "ASC", ingestion_id).await
    }

    async fn mark_by_order(
        &self,
        pool: &PgPool,
        operation: &'static str,
        order: &'static str,
        ingestion_id: Uuid,
    ) -> Result<Option<MarkRecord>, DbError> {
        let sql = format!(
            "SELECT {} FROM ingestion_marks
             WHERE ingestion_id = $1
             ORDER BY sequence {}
             LIMIT 1",
            MARK_COLUMNS, order
        );
        run_in_transaction(pool, operation, &self.policy, move |tx| {
            let sql = sql.clone();
            Box::pin(async move {
                sqlx::query_as::<_, MarkRecord>(&sql)
                    .bind(ingestion_id)
                    .fetch_optional(&mut **tx)
                    .await
            })
        })
        .await
    }

    /// All marks for an ingestion in sequence order.
    pub async fn list_marks(
        &self,
        pool: &PgPool,
        ingestion_id: Uuid,
    ) -> Result<Vec<MarkRecord>, DbError> {
        let sql = format!(
            "SELECT {} FROM ingestion_marks
             WHERE ingestion_id = $1
             ORDER BY sequence ASC",
            MARK_COLUMNS
        );
        run_in_transaction(pool, "list_marks", &self.policy, move |tx| {
            let sql = sql.clone();
            Box::pin(async move {
                sqlx::query_as::<_, MarkRecord>(&sql)
                    .bind(ingestion_id)
                    .fetch_all(&mut **tx)
                    .await
            })
        })
        .await
    }

    /// Decode a mark's stored cursor through the backend codec.
    pub fn decode_mark_cursor(&self, mark: &MarkRecord) -> Result<serde_json::Value, IngestionError> {
        decode_cursor(self.engine, mark.cursor.clone())
    }

    // ── Mark entities ─────────────────────────────────────────

    /// Attach observed refs to a mark: refs already tracked anywhere are
    /// re-pointed to this mark, new refs are inserted. Chunked below the
    /// backend's bind-parameter ceiling (3 binds per row).
    pub async fn upsert_mark_entities(
        &self,
        pool: &PgPool,
        mark_id: Uuid,
        refs: &[String],
    ) -> Result<(), DbError> {
        if refs.is_empty() {
            return Ok(());
        }
        let batch = self.engine.batch_size(3);
        let refs = Arc::<[String]>::from(refs);
        run_in_transaction(pool, "upsert_mark_entities", &self.policy, move |tx| {
            let refs = refs.clone();
            Box::pin(async move {
                for chunk in refs.chunks(batch) {
                    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                        "INSERT INTO ingestion_mark_entities (id, ingestion_mark_id, ref) ",
                    );
                    qb.push_values(chunk, |mut row, entity_ref| {
                        row.push_bind(Uuid::new_v4())
                            .push_bind(mark_id)
                            .push_bind(entity_ref);
                    });
                    qb.push(
                        " ON CONFLICT (ref) DO UPDATE
                          SET ingestion_mark_id = EXCLUDED.ingestion_mark_id",
                    );
                    qb.build().execute(&mut **tx).await?;
                }
                Ok(())
            })
        })
        .await
    }

    /// Every entity ref attached (via marks) to an ingestion.
    pub async fn ingestion_entity_refs(
        &self,
        pool: &PgPool,
        ingestion_id: Uuid,
    ) -> Result<Vec<String>, DbError> {
        run_in_transaction(pool, "ingestion_entity_refs", &self.policy, move |tx| {
            Box::pin(async move {
                sqlx::query_scalar::<_, String>(
                    "SELECT me.ref
                     FROM ingestion_mark_entities me
                     JOIN ingestion_marks m ON me.ingestion_mark_id = m.id
                     WHERE m.ingestion_id = $1
                     ORDER BY me.ref",
                )
                .bind(ingestion_id)
                .fetch_all(&mut **tx)
                .await
            })
        })
        .await
    }

    /// Per-kind counts of an ingestion's tracked refs (`kind:` prefix).
    pub async fn mark_entity_counts(
        &self,
        pool: &PgPool,
        ingestion_id: Uuid,
    ) -> Result<Vec<KindCount>, DbError> {
        run_in_transaction(pool, "mark_entity_counts", &self.policy, move |tx| {
            Box::pin(async move {
                sqlx::query_as::<_, KindCount>(
                    "SELECT split_part(me.ref, ':', 1) AS kind, COUNT(*) AS count
                     FROM ingestion_mark_entities me
                     JOIN ingestion_marks m ON me.ingestion_mark_id = m.id
                     WHERE m.ingestion_id = $1
                     GROUP BY 1
                     ORDER BY 1",
                )
                .bind(ingestion_id)
                .fetch_all(&mut **tx)
                .await
            })
        })
        .await
    }

    // ── Cleanup & safety ──────────────────────────────────────

    /// Remove stray open rows left behind by racing initializations: open,
    /// not the row we decided to keep, and older than `max_age`. Marks and
    /// mark entities go with them via FK cascade.
    pub async fn clear_duplicate_ingestions(
        &self,
        pool: &PgPool,
        provider: &str,
        keep_id: Uuid,
        max_age: Duration,
    ) -> Result<u64, DbError> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(max_age).unwrap_or_else(|_| ChronoDuration::seconds(60));
        let provider = provider.to_string();
        run_in_transaction(pool, "clear_duplicate_ingestions", &self.policy, move |tx| {
            let provider = provider.clone();
            Box::pin(async move {
                let result = sqlx::query(
                    "DELETE FROM ingestions
                     WHERE provider_name = $1 AND completion_ticket = $2
                       AND id <> $3 AND created_at < $4",
                )
                .bind(provider)
                .bind(OPEN_TICKET)
                .bind(keep_id)
                .bind(cutoff)
                .execute(&mut **tx)
                .await?;
                Ok(result.rows_affected())
            })
        })
        .await
    }

    /// Wipe a provider's history and leave a single paused row so the next
    /// cycle cannot start before the cooldown expires.
    pub async fn purge_and_reset_provider(
        &self,
        pool: &PgPool,
        provider: &str,
        cooldown: Duration,
    ) -> Result<IngestionRecord, DbError> {
        let until = deadline(cooldown);
        let sql = format!(
            "INSERT INTO ingestions (id, provider_name, status, next_action, next_action_at)
             VALUES ($1, $2, 'resting', 'rest', $3)
             RETURNING {}",
            INGESTION_COLUMNS
        );
        let provider = provider.to_string();
        run_in_transaction(pool, "purge_and_reset_provider", &self.policy, move |tx| {
            let sql = sql.clone();
            let provider = provider.clone();
            Box::pin(async move {
                sqlx::query("DELETE FROM ingestions WHERE provider_name = $1")
                    .bind(provider.as_str())
                    .execute(&mut **tx)
                    .await?;

                sqlx::query_as::<_, IngestionRecord>(&sql)
                    .bind(Uuid::new_v4())
                    .bind(provider)
                    .bind(until)
                    .fetch_one(&mut **tx)
                    .await
            })
        })
        .await
    }

    /// Delete every completed run except the most recent, which the next
    /// removal computation diffs against.
    pub async fn clear_finished_ingestions(
        &self,
        pool: &PgPool,
        provider: &str,
    ) -> Result<u64, DbError> {
        let provider = provider.to_string();
        run_in_transaction(pool, "clear_finished_ingestions", &self.policy, move |tx| {
            let provider = provider.clone();
            Box::pin(async move {
                let result = sqlx::query(
                    "DELETE FROM ingestions
                     WHERE provider_name = $1 AND completion_ticket <> $2
                       AND id <> (
                           SELECT id FROM ingestions
                           WHERE provider_name = $1 AND completion_ticket <> $2
                           ORDER BY created_at DESC
                           LIMIT 1
                       )",
                )
                .bind(provider)
                .bind(OPEN_TICKET)
                .execute(&mut **tx)
                .await?;
                Ok(result.rows_affected())
            })
        })
        .await
    }

    /// Providers holding more than one open row — should always be empty.
    pub async fn find_duplicate_active(
        &self,
        pool: &PgPool,
    ) -> Result<Vec<DuplicateActive>, DbError> {
        run_in_transaction(pool, "find_duplicate_active", &self.policy, move |tx| {
            Box::pin(async move {
                sqlx::query_as::<_, DuplicateActive>(
                    "SELECT provider_name, COUNT(*) AS open_count
                     FROM ingestions
                     WHERE completion_ticket = $1
                     GROUP BY provider_name
                     HAVING COUNT(*) > 1",
                )
                .bind(OPEN_TICKET)
                .fetch_all(&mut **tx)
                .await
            })
        })
        .await
    }
}

fn deadline(length: Duration) -> DateTime<Utc> {
    Utc::now() + ChronoDuration::from_std(length).unwrap_or_else(|_| ChronoDuration::seconds(0))
}

// ── Tests ─────────────────────────────────────────────────────
