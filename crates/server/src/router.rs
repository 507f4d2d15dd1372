//! HTTP router construction.
//!
//! Assembles the incremental ingestion admin routes, CORS, and OpenAPI docs
//! into a single Axum `Router`.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

use crate::incremental_api;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "choreo-sync incremental ingestion",
        description = "Operational control surface for the incremental catalog mirror"
    ),
    paths(
        incremental_api::health,
        incremental_api::providers_list,
        incremental_api::provider_get,
        incremental_api::provider_trigger,
        incremental_api::provider_start,
        incremental_api::provider_cancel,
        incremental_api::provider_purge,
        incremental_api::provider_marks,
        incremental_api::publish_event,
    ),
    components(schemas(
        incremental_api::ProviderStatus,
        incremental_api::MarkSummary,
        incremental_api::MarksData,
        crate::bus::BusEvent,
    ))
)]
pub struct ApiDoc;

/// Build the complete application router with all routes and middleware.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/incremental/health", get(incremental_api::health))
        .route(
            "/incremental/providers",
            get(incremental_api::providers_list),
        )
        .route(
            "/incremental/providers/{name}",
            get(incremental_api::provider_get).delete(incremental_api::provider_purge),
        )
        .route(
            "/incremental/providers/{name}/trigger",
            post(incremental_api::provider_trigger),
        )
        .route(
            "/incremental/providers/{name}/start",
            post(incremental_api::provider_start),
        )
        .route(
            "/incremental/providers/{name}/cancel",
            post(incremental_api::provider_cancel),
        )
        .route(
            "/incremental/providers/{name}/marks",
            get(incremental_api::provider_marks),
        )
        .route("/incremental/events", post(incremental_api::publish_event))
        .merge(Scalar::with_url("/docs", ApiDoc::openapi()))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
