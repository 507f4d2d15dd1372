//! Administrative surface for the incremental ingestion engine.
//!
//! Every response is wrapped in `{"success": true, "data": …}` or
//! `{"success": false, "error": …}`. Unknown providers get a 404. Errors
//! surface the stored `last_error` text (already truncated by the store),
//! never a stack trace.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use choreo_core::DbError;
use choreo_store::{IngestionRecord, KindCount};

use crate::bus::BusEvent;
use crate::state::AppState;

// ── Envelope helpers ──────────────────────────────────────────

type ApiResult = Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)>;

fn success<T: Serialize>(data: T) -> ApiResult {
    Ok(Json(json!({ "success": true, "data": data })))
}

fn error_body(
    status: StatusCode,
    message: impl Into<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    (
        status,
        Json(json!({ "success": false, "error": message.into() })),
    )
}

fn db_failure(e: DbError) -> (StatusCode, Json<serde_json::Value>) {
    error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn require_provider(
    state: &AppState,
    name: &str,
) -> Result<(), (StatusCode, Json<serde_json::Value>)> {
    if state.engine.has_provider(name) {
        Ok(())
    } else {
        Err(error_body(
            StatusCode::NOT_FOUND,
            format!("unknown provider: {}", name),
        ))
    }
}

// ── Response payloads ─────────────────────────────────────────

#[derive(Serialize, utoipa::ToSchema)]
pub struct ProviderStatus {
    pub provider: String,
    pub ingestion_id: Option<Uuid>,
    pub status: Option<String>,
    pub next_action: Option<String>,
    pub next_action_at: Option<DateTime<Utc>>,
    pub attempts: Option<i32>,
    pub last_error: Option<String>,
}

impl ProviderStatus {
    fn from_record(provider: &str, record: Option<&IngestionRecord>) -> Self {
        Self {
            provider: provider.to_string(),
            ingestion_id: record.map(|r| r.id),
            status: record.map(|r| r.status.clone()),
            next_action: record.map(|r| r.next_action.clone()),
            next_action_at: record.map(|r| r.next_action_at),
            attempts: record.map(|r| r.attempts),
            last_error: record.and_then(|r| r.last_error.clone()),
        }
    }
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct MarkSummary {
    pub id: Uuid,
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct MarksData {
    pub marks: Vec<MarkSummary>,
    #[schema(value_type = Vec<Object>)]
    pub entity_counts: Vec<KindCount>,
}

// ── Handlers ──────────────────────────────────────────────────

/// Detect providers holding more than one active ingestion row.
#[utoipa::path(
    get,
    path = "/incremental/health",
    tag = "Incremental",
    responses(
        (status = 200, description = "Duplicate-active-ingestion report", body = Object),
        (status = 500, description = "Store error", body = Object)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> ApiResult {
    let duplicates = state
        .store
        .find_duplicate_active(&state.pool)
        .await
        .map_err(db_failure)?;
    success(json!({
        "healthy": duplicates.is_empty(),
        "duplicate_ingestions": duplicates,
    }))
}

/// Status of every registered provider.
#[utoipa::path(
    get,
    path = "/incremental/providers",
    tag = "Incremental",
    responses(
        (status = 200, description = "Provider statuses", body = Object),
        (status = 500, description = "Store error", body = Object)
    )
)]
pub async fn providers_list(State(state): State<Arc<AppState>>) -> ApiResult {
    let mut statuses = Vec::new();
    for provider in state.engine.provider_names() {
        let record = state
            .store
            .get_current_ingestion_record(&state.pool, &provider)
            .await
            .map_err(db_failure)?;
        statuses.push(ProviderStatus::from_record(&provider, record.as_ref()));
    }
    success(statuses)
}

/// Detailed status for one provider.
#[utoipa::path(
    get,
    path = "/incremental/providers/{name}",
    tag = "Incremental",
    params(("name" = String, Path, description = "Provider name")),
    responses(
        (status = 200, description = "Provider status", body = ProviderStatus),
        (status = 404, description = "Unknown provider", body = Object)
    )
)]
pub async fn provider_get(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult {
    require_provider(&state, &name)?;
    let record = state
        .store
        .get_current_ingestion_record(&state.pool, &name)
        .await
        .map_err(db_failure)?;
    success(ProviderStatus::from_record(&name, record.as_ref()))
}

/// Pull the provider's next action to now, pre-empting a rest period.
#[utoipa::path(
    post,
    path = "/incremental/providers/{name}/trigger",
    tag = "Incremental",
    params(("name" = String, Path, description = "Provider name")),
    responses(
        (status = 200, description = "Trigger outcome", body = Object),
        (status = 404, description = "Unknown provider", body = Object)
    )
)]
pub async fn provider_trigger(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult {
    require_provider(&state, &name)?;
    let triggered = state
        .store
        .trigger_next_provider_action(&state.pool, &name)
        .await
        .map_err(db_failure)?;
    success(json!({ "triggered": triggered }))
}

/// Forced restart: wipe the provider's history and arm a fresh run now.
#[utoipa::path(
    post,
    path = "/incremental/providers/{name}/start",
    tag = "Incremental",
    params(("name" = String, Path, description = "Provider name")),
    responses(
        (status = 200, description = "Restarted provider status", body = ProviderStatus),
        (status = 404, description = "Unknown provider", body = Object)
    )
)]
pub async fn provider_start(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult {
    require_provider(&state, &name)?;
    let record = state
        .store
        .purge_and_reset_provider(&state.pool, &name, Duration::ZERO)
        .await
        .map_err(db_failure)?;
    state
        .store
        .set_provider_ingesting(&state.pool, &name)
        .await
        .map_err(db_failure)?;
    success(ProviderStatus::from_record(&name, Some(&record)))
}

/// Request cancellation of the provider's active run.
#[utoipa::path(
    post,
    path = "/incremental/providers/{name}/cancel",
    tag = "Incremental",
    params(("name" = String, Path, description = "Provider name")),
    responses(
        (status = 200, description = "Cancellation outcome", body = Object),
        (status = 404, description = "Unknown provider", body = Object)
    )
)]
pub async fn provider_cancel(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult {
    require_provider(&state, &name)?;
    let canceling = state
        .store
        .set_provider_canceling(&state.pool, &name, "cancellation requested by operator")
        .await
        .map_err(db_failure)?;
    success(json!({ "canceling": canceling }))
}

/// Purge the provider's history and leave it paused on a long cooldown.
#[utoipa::path(
    delete,
    path = "/incremental/providers/{name}",
    tag = "Incremental",
    params(("name" = String, Path, description = "Provider name")),
    responses(
        (status = 200, description = "Paused provider status", body = ProviderStatus),
        (status = 404, description = "Unknown provider", body = Object)
    )
)]
pub async fn provider_purge(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult {
    require_provider(&state, &name)?;
    let cooldown = Duration::from_secs(state.config.ingestion.purge_cooldown_secs);
    let record = state
        .store
        .purge_and_reset_provider(&state.pool, &name, cooldown)
        .await
        .map_err(db_failure)?;
    success(ProviderStatus::from_record(&name, Some(&record)))
}

/// Inspect the active run's marks and per-kind entity counts.
#[utoipa::path(
    get,
    path = "/incremental/providers/{name}/marks",
    tag = "Incremental",
    params(("name" = String, Path, description = "Provider name")),
    responses(
        (status = 200, description = "Marks for the active ingestion", body = MarksData),
        (status = 404, description = "Unknown provider", body = Object)
    )
)]
pub async fn provider_marks(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult {
    require_provider(&state, &name)?;
    let record = match state
        .store
        .get_current_ingestion_record(&state.pool, &name)
        .await
        .map_err(db_failure)?
    {
        Some(record) => record,
        None => {
            return success(MarksData {
                marks: Vec::new(),
                entity_counts: Vec::new(),
            })
        }
    };

    let marks = state
        .store
        .list_marks(&state.pool, record.id)
        .await
        .map_err(db_failure)?
        .into_iter()
        .map(|m| MarkSummary {
            id: m.id,
            sequence: m.sequence,
            created_at: m.created_at,
        })
        .collect();
    let entity_counts = state
        .store
        .mark_entity_counts(&state.pool, record.id)
        .await
        .map_err(db_failure)?;

    success(MarksData {
        marks,
        entity_counts,
    })
}

/// Accept a push notification and fan it out on the event bus. A provider
/// subscribed to the topic wakes immediately instead of resting out its
/// full period.
#[utoipa::path(
    post,
    path = "/incremental/events",
    tag = "Incremental",
    request_body = BusEvent,
    responses(
        (status = 200, description = "Delivery count", body = Object)
    )
)]
pub async fn publish_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<BusEvent>,
) -> ApiResult {
    let delivered = state.bus.publish(event);
    success(json!({ "delivered": delivered }))
}

// ── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_envelope_shape() {
        let Json(body) = success(json!({"triggered": true})).unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["triggered"], true);
    }

    #[test]
    fn test_error_envelope_shape() {
        let (status, Json(body)) = error_body(StatusCode::NOT_FOUND, "unknown provider: nope");
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }

    #[test]
    fn test_provider_status_from_missing_record() {
        let status = ProviderStatus::from_record("choreo-prod", None);
        assert_eq!(status.provider, "choreo-prod");
        assert!(status.ingestion_id.is_none());
        assert!(status.status.is_none());
    }
}
