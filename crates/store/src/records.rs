//! Persisted row types for the `ingestions` hierarchy.
//!
//! Status and next-action values are stored as their exact wire strings
//! (`"backing off"`, `"nothing (done)"`, ...); the row structs keep the raw
//! text and expose typed accessors, so an unknown value read from an older
//! or newer schema never fails row decoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sentinel `completion_ticket` value of the provider's active run.
pub const OPEN_TICKET: &str = "open";

// ── Lifecycle enums ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    Bursting,
    #[serde(rename = "backing off")]
    BackingOff,
    Interstitial,
    Canceling,
    Resting,
    Complete,
}

impl IngestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStatus::Bursting => "bursting",
            IngestionStatus::BackingOff => "backing off",
            IngestionStatus::Interstitial => "interstitial",
            IngestionStatus::Canceling => "canceling",
            IngestionStatus::Resting => "resting",
            IngestionStatus::Complete => "complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bursting" => Some(IngestionStatus::Bursting),
            "backing off" => Some(IngestionStatus::BackingOff),
            "interstitial" => Some(IngestionStatus::Interstitial),
            "canceling" => Some(IngestionStatus::Canceling),
            "resting" => Some(IngestionStatus::Resting),
            "complete" => Some(IngestionStatus::Complete),
            _ => None,
        }
    }
}

/// What the orchestrator should do on its next invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    Ingest,
    Backoff,
    Rest,
    Cancel,
    #[serde(rename = "nothing (done)")]
    NothingDone,
    #[serde(rename = "nothing (canceled)")]
    NothingCanceled,
}

impl NextAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            NextAction::Ingest => "ingest",
            NextAction::Backoff => "backoff",
            NextAction::Rest => "rest",
            NextAction::Cancel => "cancel",
            NextAction::NothingDone => "nothing (done)",
            NextAction::NothingCanceled => "nothing (canceled)",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ingest" => Some(NextAction::Ingest),
            "backoff" => Some(NextAction::Backoff),
            "rest" => Some(NextAction::Rest),
            "cancel" => Some(NextAction::Cancel),
            "nothing (done)" => Some(NextAction::NothingDone),
            "nothing (canceled)" => Some(NextAction::NothingCanceled),
            _ => None,
        }
    }
}

// ── Rows ──────────────────────────────────────────────────────

/// Row from the `ingestions` table.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct IngestionRecord {
    pub id: Uuid,
    pub provider_name: String,
    pub status: String,
    pub next_action: String,
    pub next_action_at: DateTime<Utc>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub completion_ticket: String,
    pub ingestion_completed_at: Option<DateTime<Utc>>,
    pub rest_completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl IngestionRecord {
    pub fn status(&self) -> Option<IngestionStatus> {
        IngestionStatus::parse(&self.status)
    }

    pub fn next_action(&self) -> Option<NextAction> {
        NextAction::parse(&self.next_action)
    }

    /// Whether this row is the provider's active run.
    pub fn is_open(&self) -> bool {
        self.completion_ticket == OPEN_TICKET
    }
}

/// Row from the `ingestion_marks` table. The cursor is stored in its
/// backend-encoded form; callers decode through the cursor codec.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MarkRecord {
    pub id: Uuid,
    pub ingestion_id: Uuid,
    pub sequence: i64,
    pub cursor: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ── Tests ─────────────────────────────────────────────────────
