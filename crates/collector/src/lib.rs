//! Cursor-driven collector for the upstream catalog hierarchy.
//!
//! - [`api`]: the upstream API contract, wire types, and failure modes
//! - [`client`]: the HTTP implementation of that contract
//! - [`cursor`]: the resumable traversal cursor
//! - [`translate`]: upstream records → catalog entities
//! - [`collector`]: the phase state machine yielding one page per call

pub mod api;
pub mod client;
pub mod collector;
pub mod cursor;
pub mod translate;

pub use api::{ComponentKind, Page, PageRequest, UpstreamApi, UpstreamError};
pub use client::UpstreamClient;
pub use collector::{CatalogCollector, CollectorOptions, CollectorPage};
pub use cursor::{ProjectKey, TraversalCursor, TraversalPhase};
