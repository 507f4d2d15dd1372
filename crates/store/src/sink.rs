//! The entity sink boundary.
//!
//! The collector produces entity batches; the sink is where they land. The
//! default implementation mirrors them into the `catalog_entities` table,
//! which is also what the removal pass sweeps.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};

use choreo_core::{CatalogEntity, DbError};

use crate::engine::DatabaseEngine;
use crate::retry::{run_in_transaction, RetryPolicy};

#[async_trait]
pub trait EntitySink: Send + Sync {
    /// Upsert a batch of entities observed by one collector invocation.
    async fn apply(&self, provider: &str, entities: &[CatalogEntity]) -> Result<(), DbError>;

    /// Delete entities whose refs the removal pass reported.
    async fn remove(&self, refs: &[String]) -> Result<u64, DbError>;
}

/// Postgres-backed sink over `catalog_entities`.
pub struct PgEntitySink {
    pool: PgPool,
    engine: DatabaseEngine,
    policy: RetryPolicy,
}

impl PgEntitySink {
    pub fn new(pool: PgPool, engine: DatabaseEngine) -> Self {
        Self {
            pool,
            engine,
            policy: RetryPolicy::default(),
        }
    }
}

#[async_trait]
impl EntitySink for PgEntitySink {
    async fn apply(&self, provider: &str, entities: &[CatalogEntity]) -> Result<(), DbError> {
        if entities.is_empty() {
            return Ok(());
        }
        let rows: Vec<(String, serde_json::Value)> = entities
            .iter()
            .map(|e| (e.entity_ref(), e.to_stored_json(provider)))
            .collect();
        let batch = self.engine.batch_size(3);
        let rows = Arc::new(rows);
        let provider = Arc::<str>::from(provider);

        run_in_transaction(&self.pool, "sink_apply", &self.policy, move |tx| {
            let rows = rows.clone();
            let provider = provider.clone();
            Box::pin(async move {
                for chunk in rows.chunks(batch) {
                    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                        "INSERT INTO catalog_entities (ref, entity_json, tracked_by) ",
                    );
                    qb.push_values(chunk, |mut row, (entity_ref, payload)| {
                        row.push_bind(entity_ref)
                            .push_bind(payload)
                            .push_bind(provider.as_ref());
                    });
                    qb.push(
                        " ON CONFLICT (ref) DO UPDATE
                          SET entity_json = EXCLUDED.entity_json,
                              tracked_by = EXCLUDED.tracked_by,
                              updated_at = now()",
                    );
                    qb.build().execute(&mut **tx).await?;
                }
                Ok(())
            })
        })
        .await
    }

    async fn remove(&self, refs: &[String]) -> Result<u64, DbError> {
        if refs.is_empty() {
            return Ok(0);
        }
        let batch = self.engine.batch_size(1);
        let refs = Arc::<[String]>::from(refs);
        run_in_transaction(&self.pool, "sink_remove", &self.policy, move |tx| {
            let refs = refs.clone();
            Box::pin(async move {
                let mut deleted = 0u64;
                for chunk in refs.chunks(batch) {
                    let mut qb: QueryBuilder<Postgres> =
                        QueryBuilder::new("DELETE FROM catalog_entities WHERE ref IN (");
                    let mut sep = qb.separated(", ");
                    for entity_ref in chunk {
                        sep.push_bind(entity_ref);
                    }
                    qb.push(")");
                    let result = qb.build().execute(&mut **tx).await?;
                    deleted += result.rows_affected();
                }
                Ok(deleted)
            })
        })
        .await
    }
}
