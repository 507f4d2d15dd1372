//! Catalog entity model.
//!
//! Every mirrored record becomes a [`CatalogEntity`] with a stable string
//! ref (`kind:org/project/name`) used for mark tracking and removal diffing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Annotation naming the provider that manages a stored entity.
pub const MANAGED_BY_ANNOTATION: &str = "choreo.dev/managed-by";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Organization,
    Project,
    Component,
    Api,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Organization => write!(f, "organization"),
            EntityKind::Project => write!(f, "project"),
            EntityKind::Component => write!(f, "component"),
            EntityKind::Api => write!(f, "api"),
        }
    }
}

/// One mirrored catalog record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntity {
    pub kind: EntityKind,
    pub name: String,
    pub org: Option<String>,
    pub project: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Kind-specific payload (endpoints, build info, ...).
    #[serde(default)]
    pub spec: serde_json::Value,
}

impl CatalogEntity {
    pub fn new(kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            org: None,
            project: None,
            description: None,
            annotations: BTreeMap::new(),
            spec: serde_json::Value::Null,
        }
    }

    pub fn with_org(mut self, org: impl Into<String>) -> Self {
        self.org = Some(org.into());
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    /// Stable identifier: `kind:` followed by the present path segments.
    pub fn entity_ref(&self) -> String {
        let mut path = String::new();
        if let Some(org) = &self.org {
            path.push_str(org);
            path.push('/');
        }
        if let Some(project) = &self.project {
            path.push_str(project);
            path.push('/');
        }
        path.push_str(&self.name);
        format!("{}:{}", self.kind, path)
    }

    /// The `kind` prefix of a ref string, if well-formed.
    pub fn kind_of_ref(entity_ref: &str) -> Option<&str> {
        entity_ref.split_once(':').map(|(kind, _)| kind)
    }

    /// Shape persisted into the entity store (`catalog_entities.entity_json`).
    pub fn to_stored_json(&self, provider: &str) -> serde_json::Value {
        let mut annotations = self.annotations.clone();
        annotations.insert(MANAGED_BY_ANNOTATION.to_string(), provider.to_string());
        serde_json::json!({
            "kind": self.kind,
            "metadata": {
                "name": self.name,
                "org": self.org,
                "project": self.project,
                "description": self.description,
                "annotations": annotations,
            },
            "spec": self.spec,
        })
    }
}

/// Read the managing provider out of a stored entity payload.
///
/// Returns `None` for payloads that are malformed or carry no annotation;
/// the caller decides whether that is worth a diagnostic.
pub fn managed_by_of(payload: &serde_json::Value) -> Option<&str> {
    payload
        .get("metadata")?
        .get("annotations")?
        .get(MANAGED_BY_ANNOTATION)?
        .as_str()
}

// ── Tests ─────────────────────────────────────────────────────
