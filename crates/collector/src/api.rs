//! Upstream catalog API contract.
//!
//! Everything the collector needs from upstream sits behind [`UpstreamApi`]
//! so tests can script responses without a network.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Paging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    /// Opaque continuation token from the previous page, if any.
    pub cursor: Option<String>,
    pub limit: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

// ── Resource records ──────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationRecord {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRecord {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Component kinds the upstream declares. Closed set: adding a kind means
/// touching the translation table, checked at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentKind {
    Service,
    WebApplication,
    Worker,
    ScheduledTask,
    #[serde(rename = "APIProxy")]
    ApiProxy,
    /// Kinds introduced upstream after this build.
    #[serde(other)]
    Other,
}

impl ComponentKind {
    /// Kinds that declare network endpoints and need a detail fetch.
    pub fn is_service_like(&self) -> bool {
        matches!(self, ComponentKind::Service | ComponentKind::ApiProxy)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ComponentKind,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EndpointType {
    Http,
    Grpc,
    Graphql,
    Websocket,
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub endpoint_type: EndpointType,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub base_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDetail {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ComponentKind,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub endpoints: Vec<EndpointRecord>,
}

// ── Failure modes ─────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The continuation token aged out upstream; recoverable per phase.
    #[error("continuation token expired (token prefix: {preview})")]
    CursorExpired { preview: String },

    #[error("not found: {path}")]
    NotFound { path: String },

    #[error("unexpected status {status} from {path}")]
    Status { status: u16, path: String },

    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream protocol error: {0}")]
    Protocol(String),
}

impl UpstreamError {
    pub fn is_cursor_expiry(&self) -> bool {
        matches!(self, UpstreamError::CursorExpired { .. })
    }

    /// Connection-level failures abort the burst instead of skipping a
    /// subtree.
    pub fn is_fatal(&self) -> bool {
        matches!(self, UpstreamError::Http(_))
    }
}

/// Bounded prefix of a continuation token, safe to log.
pub fn token_preview(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    if token.chars().count() > 8 {
        format!("{}…", prefix)
    } else {
        prefix
    }
}

/// Whether an upstream error body describes an expired continuation token.
pub fn message_names_expired_cursor(message: &str) -> bool {
    let lower = message.to_lowercase();
    let stale = lower.contains("expired") || lower.contains("too old");
    let token = lower.contains("continue")
        || lower.contains("continuation")
        || lower.contains("cursor");
    stale && token
}

// ── Contract ──────────────────────────────────────────────────

#[async_trait]
pub trait UpstreamApi: Send + Sync {
    /// One-time capability check: does the upstream paginate at all?
    async fn probe_pagination(&self) -> Result<bool, UpstreamError>;

    async fn list_organizations(
        &self,
        page: &PageRequest,
    ) -> Result<Page<OrganizationRecord>, UpstreamError>;

    async fn list_projects(
        &self,
        org: &str,
        page: &PageRequest,
    ) -> Result<Page<ProjectRecord>, UpstreamError>;

    async fn list_components(
        &self,
        org: &str,
        project: &str,
        page: &PageRequest,
    ) -> Result<Page<ComponentRecord>, UpstreamError>;

    async fn get_component(
        &self,
        org: &str,
        project: &str,
        name: &str,
    ) -> Result<ComponentDetail, UpstreamError>;
}

// ── Tests ─────────────────────────────────────────────────────
