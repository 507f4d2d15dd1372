//! Resumable traversal cursor.
//!
//! The cursor combines the upstream continuation tokens with the local
//! queue/index state, so a cold restart resumes at the exact `(org, project)`
//! position the last persisted mark recorded.

use serde::{Deserialize, Serialize};

use choreo_core::IngestionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraversalPhase {
    Orgs,
    Projects,
    Components,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectKey {
    pub org: String,
    pub project: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraversalCursor {
    pub phase: TraversalPhase,
    #[serde(default)]
    pub org_api_cursor: Option<String>,
    #[serde(default)]
    pub project_api_cursor: Option<String>,
    #[serde(default)]
    pub component_api_cursor: Option<String>,
    #[serde(default)]
    pub org_queue: Vec<String>,
    #[serde(default)]
    pub current_org_index: usize,
    #[serde(default)]
    pub project_queue: Vec<ProjectKey>,
    #[serde(default)]
    pub current_project_index: usize,
}

impl TraversalCursor {
    /// Start-of-traversal cursor: first organization page.
    pub fn initial() -> Self {
        Self {
            phase: TraversalPhase::Orgs,
            org_api_cursor: None,
            project_api_cursor: None,
            component_api_cursor: None,
            org_queue: Vec::new(),
            current_org_index: 0,
            project_queue: Vec::new(),
            current_project_index: 0,
        }
    }

    /// The organization whose projects are currently being listed.
    pub fn current_org(&self) -> Option<&str> {
        self.org_queue.get(self.current_org_index).map(String::as_str)
    }

    /// The `(org, project)` pair whose components are currently being listed.
    pub fn current_project(&self) -> Option<&ProjectKey> {
        self.project_queue.get(self.current_project_index)
    }

    pub fn to_json(&self) -> Result<serde_json::Value, IngestionError> {
        serde_json::to_value(self).map_err(IngestionError::from)
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self, IngestionError> {
        serde_json::from_value(value).map_err(IngestionError::from)
    }
}

// ── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn mid_projects_cursor() -> TraversalCursor {
        TraversalCursor {
            phase: TraversalPhase::Projects,
            org_api_cursor: None,
            project_api_cursor: Some("proj-page-2".to_string()),
            component_api_cursor: None,
            org_queue: vec!["acme".to_string(), "globex".to_string()],
            current_org_index: 1,
            project_queue: vec![ProjectKey {
                org: "acme".to_string(),
                project: "billing".to_string(),
            }],
            current_project_index: 0,
        }
    }

    #[test]
    fn test_json_roundtrip_preserves_position() {
        let cursor = mid_projects_cursor();
        let restored = TraversalCursor::from_json(cursor.to_json().unwrap()).unwrap();
        assert_eq!(restored, cursor);
        assert_eq!(restored.current_org(), Some("globex"));
        assert_eq!(
            restored.project_api_cursor.as_deref(),
            Some("proj-page-2")
        );
    }

    #[test]
    fn test_missing_fields_default() {
        let value = serde_json::json!({"phase": "components"});
        let cursor = TraversalCursor::from_json(value).unwrap();
        assert_eq!(cursor.phase, TraversalPhase::Components);
        assert!(cursor.org_queue.is_empty());
        assert_eq!(cursor.current_project_index, 0);
        assert!(cursor.current_project().is_none());
    }

    #[test]
    fn test_phase_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&TraversalPhase::Components).unwrap(),
            r#""components""#
        );
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(TraversalCursor::from_json(serde_json::json!({"phase": "galaxies"})).is_err());
    }
}
