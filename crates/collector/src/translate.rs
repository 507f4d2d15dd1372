//! Upstream records → catalog entities.
//!
//! Translation is a closed dispatch on [`ComponentKind`]: service-like kinds
//! fan out into one component entity plus one API entity per declared
//! endpoint; every other kind translates 1:1.

use serde_json::json;

use choreo_core::{CatalogEntity, EntityKind};

use crate::api::{
    ComponentDetail, ComponentKind, ComponentRecord, EndpointRecord, EndpointType,
    OrganizationRecord, ProjectRecord,
};

pub fn translate_org(org: &OrganizationRecord) -> CatalogEntity {
    let mut entity = CatalogEntity::new(EntityKind::Organization, &org.name);
    entity.description = org.description.clone();
    if let Some(display) = &org.display_name {
        entity
            .annotations
            .insert("choreo.dev/display-name".to_string(), display.clone());
    }
    entity
}

pub fn translate_project(org: &str, project: &ProjectRecord) -> CatalogEntity {
    let mut entity = CatalogEntity::new(EntityKind::Project, &project.name).with_org(org);
    entity.description = project.description.clone();
    entity
}

/// 1:1 translation used for non-service kinds and as the degraded form when
/// a detail fetch fails.
pub fn translate_component_basic(
    org: &str,
    project: &str,
    component: &ComponentRecord,
) -> CatalogEntity {
    let mut entity = CatalogEntity::new(EntityKind::Component, &component.name)
        .with_org(org)
        .with_project(project);
    entity.description = component.description.clone();
    entity.spec = json!({ "component_kind": component.kind });
    entity
}

/// Full translation of a fetched detail: the component entity plus one API
/// entity per declared endpoint.
pub fn translate_component_detail(
    org: &str,
    project: &str,
    detail: &ComponentDetail,
) -> Vec<CatalogEntity> {
    let mut component = CatalogEntity::new(EntityKind::Component, &detail.name)
        .with_org(org)
        .with_project(project);
    component.description = detail.description.clone();
    component.spec = json!({
        "component_kind": detail.kind,
        "endpoints": detail.endpoints,
    });

    let mut entities = vec![component];
    for endpoint in &detail.endpoints {
        entities.push(translate_endpoint(org, project, &detail.name, endpoint));
    }
    entities
}

fn translate_endpoint(
    org: &str,
    project: &str,
    component: &str,
    endpoint: &EndpointRecord,
) -> CatalogEntity {
    let mut entity = CatalogEntity::new(
        EntityKind::Api,
        format!("{}-{}", component, endpoint.name),
    )
    .with_org(org)
    .with_project(project);
    entity.spec = json!({
        "api_type": api_type_of(endpoint.endpoint_type),
        "component": component,
        "port": endpoint.port,
        "base_path": endpoint.base_path,
    });
    entity
}

/// Endpoint type → API entity type.
fn api_type_of(endpoint_type: EndpointType) -> &'static str {
    match endpoint_type {
        EndpointType::Http => "rest",
        EndpointType::Grpc => "grpc",
        EndpointType::Graphql => "graphql",
        EndpointType::Websocket => "websocket",
        EndpointType::Tcp => "tcp",
        EndpointType::Udp => "udp",
    }
}

// ── Tests ─────────────────────────────────────────────────────
