//! Burst/rest orchestration engine.
//!
//! The external scheduler invokes [`IngestionEngine::tick`] per provider on
//! a fixed cadence. The tick is a no-op until the persisted
//! `next_action_at` passes, then dispatches on the record's `next_action`:
//! run a burst, come back from rest, or finalize a cancellation. All
//! progress lives in the state store, so a tick killed at any point between
//! two persisted marks resumes correctly on the next one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use indexmap::IndexMap;
use sqlx::PgPool;
use tracing::{error, info, warn};

use choreo_collector::{CatalogCollector, TraversalCursor};
use choreo_core::config::IngestionConfig;
use choreo_core::DbError;
use choreo_store::{EntitySink, IngestionRecord, IngestionStore, NextAction};

use crate::bus::InProcessBus;
use crate::scheduler::TaskScheduler;
use crate::state::ReadySignal;

/// Margin added to the scheduler timeout so a burst still inside its budget
/// is never killed by the scheduler itself.
pub const SCHEDULE_TIMEOUT_MARGIN: Duration = Duration::from_secs(60);

pub struct ProviderEntry {
    pub name: String,
    pub collector: CatalogCollector,
}

pub struct IngestionEngine {
    pool: PgPool,
    store: IngestionStore,
    sink: Arc<dyn EntitySink>,
    config: IngestionConfig,
    providers: IndexMap<String, Arc<ProviderEntry>>,
    ready: ReadySignal,
}

impl IngestionEngine {
    pub fn new(
        pool: PgPool,
        store: IngestionStore,
        sink: Arc<dyn EntitySink>,
        config: IngestionConfig,
    ) -> Self {
        Self {
            pool,
            store,
            sink,
            config,
            providers: IndexMap::new(),
            ready: ReadySignal::new(),
        }
    }

    /// Register a provider before [`start`](Self::start) is called.
    pub fn add_provider(&mut self, name: impl Into<String>, collector: CatalogCollector) {
        let name = name.into();
        self.ready.register();
        self.providers.insert(
            name.clone(),
            Arc::new(ProviderEntry { name, collector }),
        );
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn has_provider(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn ready(&self) -> &ReadySignal {
        &self.ready
    }

    pub fn ingestion_config(&self) -> &IngestionConfig {
        &self.config
    }

    fn duplicate_age(&self) -> Duration {
        Duration::from_secs(self.config.duplicate_age_secs)
    }

    /// Connect every provider (ensuring it has an active ingestion record),
    /// register its scheduled task, and wire its push-event wakeup.
    pub async fn start(
        self: &Arc<Self>,
        scheduler: &TaskScheduler,
        bus: &InProcessBus,
    ) -> Result<(), DbError> {
        let frequency = Duration::from_secs(self.config.frequency_secs);
        let timeout = Duration::from_secs(self.config.burst_length_secs) + SCHEDULE_TIMEOUT_MARGIN;

        for entry in self.providers.values() {
            let provider = entry.name.clone();
            self.ensure_ingestion_record(&provider).await?;
            self.ready.mark_connected();
            info!(provider = %provider, "provider connected");

            let engine = self.clone();
            let task_provider = provider.clone();
            scheduler.schedule_task(
                format!("incremental-ingestion-{}", provider),
                frequency,
                timeout,
                move || {
                    let engine = engine.clone();
                    let provider = task_provider.clone();
                    async move {
                        engine.tick(&provider).await;
                    }
                },
            );

            let engine = self.clone();
            let event_provider = provider.clone();
            let _subscription = bus.subscribe(
                vec![format!("choreo.push.{}", provider)],
                format!("incremental-ingestion-{}", provider),
                move |event| {
                    let engine = engine.clone();
                    let provider = event_provider.clone();
                    tokio::spawn(async move {
                        info!(provider = %provider, topic = %event.topic, "push event — pre-empting rest");
                        if let Err(e) = engine
                            .store
                            .trigger_next_provider_action(&engine.pool, &provider)
                            .await
                        {
                            warn!(provider = %provider, error = %e, "failed to trigger next action");
                        }
                    });
                },
            );
        }
        self.ready.resolve_if_idle();
        Ok(())
    }

    async fn ensure_ingestion_record(&self, provider: &str) -> Result<IngestionRecord, DbError> {
        let record = match self
            .store
            .get_current_ingestion_record(&self.pool, provider)
            .await?
        {
            Some(record) => record,
            None => {
                self.store
                    .create_provider_ingestion_record(&self.pool, provider)
                    .await?
            }
        };
        let cleared = self
            .store
            .clear_duplicate_ingestions(&self.pool, provider, record.id, self.duplicate_age())
            .await?;
        if cleared > 0 {
            warn!(provider = %provider, cleared, "removed stale duplicate ingestion rows");
        }
        Ok(record)
    }

    /// One scheduled invocation for one provider.
    pub async fn tick(&self, provider: &str) {
        if let Err(e) = self.tick_inner(provider).await {
            error!(provider = %provider, error = %e, "ingestion tick failed");
        }
    }

    async fn tick_inner(&self, provider: &str) -> Result<(), DbError> {
        let entry = match self.providers.get(provider) {
            Some(entry) => entry.clone(),
            None => return Ok(()),
        };

        let record = self.ensure_ingestion_record(provider).await?;
        if record.next_action_at > Utc::now() {
            return Ok(());
        }

        match record.next_action() {
            Some(NextAction::Ingest) | Some(NextAction::Backoff) => {
                if let Err(message) = self.run_burst(&entry, &record).await {
                    let backoff =
                        backoff_length(&self.config.backoff_schedule_secs, record.attempts);
                    warn!(
                        provider = %provider,
                        error = %message,
                        attempts = record.attempts + 1,
                        backoff_secs = backoff.as_secs(),
                        "burst failed — backing off"
                    );
                    self.store
                        .set_provider_backoff(&self.pool, provider, &message, backoff)
                        .await?;
                }
            }
            Some(NextAction::Rest) => self.finish_rest(provider, &record).await?,
            Some(NextAction::Cancel) => {
                info!(provider = %provider, "finalizing canceled ingestion");
                self.store.set_provider_canceled(&self.pool, provider).await?;
            }
            // Closed record, or an action string from a newer schema.
            _ => {}
        }
        Ok(())
    }

    /// The rest period ended: close out the finished run and open the next
    /// cycle. A paused placeholder row (no completed ingestion behind it,
    /// e.g. after a purge) is re-armed in place instead.
    async fn finish_rest(&self, provider: &str, record: &IngestionRecord) -> Result<(), DbError> {
        if record.ingestion_completed_at.is_some() {
            self.store.set_provider_complete(&self.pool, provider).await?;
            self.store.clear_finished_ingestions(&self.pool, provider).await?;
            let fresh = self
                .store
                .create_provider_ingestion_record(&self.pool, provider)
                .await?;
            self.store
                .clear_duplicate_ingestions(&self.pool, provider, fresh.id, self.duplicate_age())
                .await?;
            info!(provider = %provider, "rest complete — starting next full cycle");
        } else {
            self.store.set_provider_bursting(&self.pool, provider).await?;
            self.store.set_provider_ingesting(&self.pool, provider).await?;
            info!(provider = %provider, "paused record re-armed for ingestion");
        }
        Ok(())
    }

    /// Drive the collector until it signals done or the wall-clock budget is
    /// spent, persisting entities and a mark after every page.
    async fn run_burst(
        &self,
        entry: &ProviderEntry,
        record: &IngestionRecord,
    ) -> Result<(), String> {
        let provider = entry.name.as_str();
        let pool = &self.pool;
        let budget = Duration::from_secs(self.config.burst_length_secs);
        let started = Instant::now();

        self.store
            .set_provider_bursting(pool, provider)
            .await
            .map_err(stringify)?;

        let mut cursor: Option<TraversalCursor> =
            match self.store.last_mark(pool, record.id).await.map_err(stringify)? {
                Some(mark) => match self
                    .store
                    .decode_mark_cursor(&mark)
                    .and_then(TraversalCursor::from_json)
                {
                    Ok(cursor) => Some(cursor),
                    Err(e) => {
                        warn!(
                            provider = %provider,
                            error = %e,
                            "persisted cursor is undecodable — restarting traversal"
                        );
                        None
                    }
                },
                None => None,
            };

        loop {
            let page = entry.collector.next(cursor.take()).await.map_err(stringify)?;

            if !page.entities.is_empty() {
                self.sink
                    .apply(provider, &page.entities)
                    .await
                    .map_err(stringify)?;
            }

            let mark_cursor = match &page.cursor {
                Some(next) => next.to_json().map_err(stringify)?,
                None => serde_json::Value::Null,
            };
            let mark = self
                .store
                .create_mark(pool, record.id, &mark_cursor)
                .await
                .map_err(stringify)?;
            let refs: Vec<String> = page.entities.iter().map(|e| e.entity_ref()).collect();
            self.store
                .upsert_mark_entities(pool, mark.id, &refs)
                .await
                .map_err(stringify)?;

            if page.done {
                let outcome = self
                    .store
                    .compute_removed(pool, provider, record.id)
                    .await
                    .map_err(stringify)?;
                if !outcome.removed.is_empty() {
                    let deleted = self.sink.remove(&outcome.removed).await.map_err(stringify)?;
                    info!(provider = %provider, deleted, "swept removed entities");
                }
                info!(
                    provider = %provider,
                    total = outcome.total,
                    removed = outcome.removed.len(),
                    "full pass complete — resting"
                );
                self.store
                    .set_provider_resting(
                        pool,
                        provider,
                        Duration::from_secs(self.config.rest_length_secs),
                    )
                    .await
                    .map_err(stringify)?;
                return Ok(());
            }

            // A cancellation or purge can land between pages; observe it
            // before spending more of the budget.
            match self
                .store
                .get_current_ingestion_record(pool, provider)
                .await
                .map_err(stringify)?
            {
                Some(current) if current.next_action() == Some(NextAction::Cancel) => {
                    info!(provider = %provider, "cancellation requested — abandoning burst");
                    self.store
                        .set_provider_canceled(pool, provider)
                        .await
                        .map_err(stringify)?;
                    return Ok(());
                }
                Some(_) => {}
                None => return Ok(()),
            }

            if started.elapsed() >= budget {
                self.store
                    .set_provider_interstitial(pool, provider)
                    .await
                    .map_err(stringify)?;
                self.store
                    .set_provider_ingesting(pool, provider)
                    .await
                    .map_err(stringify)?;
                return Ok(());
            }

            cursor = page.cursor;
        }
    }
}

fn stringify(e: impl std::fmt::Display) -> String {
    e.to_string()
}

/// Backoff length for the given attempt count; the last schedule entry
/// repeats once attempts run past the end.
fn backoff_length(schedule_secs: &[u64], attempts: i32) -> Duration {
    let index = (attempts.max(0) as usize).min(schedule_secs.len().saturating_sub(1));
    Duration::from_secs(schedule_secs.get(index).copied().unwrap_or(24))
}

// ── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule_indexing() {
        let schedule = [24, 600, 10_800, 86_400];
        assert_eq!(backoff_length(&schedule, 0), Duration::from_secs(24));
        assert_eq!(backoff_length(&schedule, 1), Duration::from_secs(600));
        assert_eq!(backoff_length(&schedule, 3), Duration::from_secs(86_400));
        // Past the end the last entry repeats.
        assert_eq!(backoff_length(&schedule, 17), Duration::from_secs(86_400));
        assert_eq!(backoff_length(&schedule, -1), Duration::from_secs(24));
        assert_eq!(backoff_length(&[], 2), Duration::from_secs(24));
    }

    #[test]
    fn test_schedule_timeout_margin() {
        assert_eq!(SCHEDULE_TIMEOUT_MARGIN, Duration::from_secs(60));
    }
}
