//! Mark-and-sweep removal computation.
//!
//! Removals come from two sources that are reconciled together:
//! 1. the previous completed run's refs minus the current run's refs, and
//! 2. stored catalog rows no tracking key owns, whose managed-by annotation
//!    names this provider — these recover entities orphaned by a crash
//!    between bursts, when the explicit bookkeeping was never written.

use std::collections::HashSet;

use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use choreo_core::{managed_by_of, DbError};

use crate::retry::run_in_transaction;
use crate::store::IngestionStore;

/// Result of a removal computation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RemovalOutcome {
    /// Number of refs tracked by the current ingestion.
    pub total: usize,
    /// De-duplicated refs that disappeared since the last full pass.
    pub removed: Vec<String>,
}

/// Refs present before but absent now, sorted for stable output.
pub fn diff_removed(previous: &HashSet<String>, current: &HashSet<String>) -> Vec<String> {
    let mut removed: Vec<String> = previous.difference(current).cloned().collect();
    removed.sort();
    removed
}

/// Filter untracked stored rows down to removal candidates: the payload must
/// name this provider as its manager and the ref must be absent from the
/// current run. Malformed payloads are skipped with a diagnostic.
pub fn orphan_candidates(
    rows: &[(String, serde_json::Value)],
    provider: &str,
    current: &HashSet<String>,
) -> Vec<String> {
    let mut candidates = Vec::new();
    for (entity_ref, payload) in rows {
        if !payload.is_object() {
            warn!(
                entity_ref = %entity_ref,
                "skipping malformed stored entity payload in orphan scan"
            );
            continue;
        }
        match managed_by_of(payload) {
            Some(owner) if owner == provider => {
                if !current.contains(entity_ref) {
                    candidates.push(entity_ref.clone());
                }
            }
            // Another provider's row, or no/ambiguous annotation: never
            // fabricate a removal we cannot attribute to this provider.
            _ => {}
        }
    }
    candidates
}

impl IngestionStore {
    /// Compute the current total and the removal list for a provider's
    /// just-finished ingestion.
    pub async fn compute_removed(
        &self,
        pool: &PgPool,
        provider: &str,
        ingestion_id: Uuid,
    ) -> Result<RemovalOutcome, DbError> {
        let current: HashSet<String> = self
            .ingestion_entity_refs(pool, ingestion_id)
            .await?
            .into_iter()
            .collect();

        let mut removed = match self.get_previous_ingestion_record(pool, provider).await? {
            Some(previous) => {
                let previous_refs: HashSet<String> = self
                    .ingestion_entity_refs(pool, previous.id)
                    .await?
                    .into_iter()
                    .collect();
                diff_removed(&previous_refs, &current)
            }
            None => Vec::new(),
        };

        let untracked = self.untracked_entities(pool).await?;
        let seen: HashSet<String> = removed.iter().cloned().collect();
        for candidate in orphan_candidates(&untracked, provider, &current) {
            if !seen.contains(&candidate) {
                removed.push(candidate);
            }
        }

        Ok(RemovalOutcome {
            total: current.len(),
            removed,
        })
    }

    /// Stored catalog rows not owned by any tracking key.
    async fn untracked_entities(
        &self,
        pool: &PgPool,
    ) -> Result<Vec<(String, serde_json::Value)>, DbError> {
        run_in_transaction(pool, "untracked_entities", self.policy_ref(), move |tx| {
            Box::pin(async move {
                sqlx::query_as::<_, (String, serde_json::Value)>(
                    "SELECT ref, entity_json FROM catalog_entities WHERE tracked_by IS NULL",
                )
                .fetch_all(&mut **tx)
                .await
            })
        })
        .await
    }
}

// ── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn refs(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_diff_removed_basic() {
        // Previous {A,B,C}, current {B,C,D} → removed {A}.
        let previous = refs(&["component:a", "component:b", "component:c"]);
        let current = refs(&["component:b", "component:c", "component:d"]);
        assert_eq!(diff_removed(&previous, &current), vec!["component:a"]);
        assert_eq!(current.len(), 3);
    }

    #[test]
    fn test_diff_removed_never_removes_present_refs() {
        let previous = refs(&["api:x", "api:y"]);
        let current = refs(&["api:x", "api:y", "api:z"]);
        assert!(diff_removed(&previous, &current).is_empty());
    }

    #[test]
    fn test_diff_removed_empty_previous() {
        let previous = HashSet::new();
        let current = refs(&["organization:acme"]);
        assert!(diff_removed(&previous, &current).is_empty());
    }

    fn stored(provider: &str) -> serde_json::Value {
        json!({
            "kind": "component",
            "metadata": {
                "annotations": { "choreo.dev/managed-by": provider }
            }
        })
    }

    #[test]
    fn test_orphan_candidates_matches_provider_and_absence() {
        let rows = vec![
            ("component:acme/p/gone".to_string(), stored("choreo-prod")),
            ("component:acme/p/still-here".to_string(), stored("choreo-prod")),
            ("component:other/p/x".to_string(), stored("someone-else")),
        ];
        let current = refs(&["component:acme/p/still-here"]);
        assert_eq!(
            orphan_candidates(&rows, "choreo-prod", &current),
            vec!["component:acme/p/gone"]
        );
    }

    #[test]
    fn test_orphan_candidates_skips_malformed_payloads() {
        let rows = vec![
            ("component:weird".to_string(), json!("not an object")),
            ("component:no-annotation".to_string(), json!({"metadata": {}})),
        ];
        let current = HashSet::new();
        assert!(orphan_candidates(&rows, "choreo-prod", &current).is_empty());
    }
}
