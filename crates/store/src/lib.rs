//! Ingestion state store — the relational persistence layer behind
//! resumable ingestion.
//!
//! - [`engine`]: backend identity, bind-parameter ceilings, cursor codec
//! - [`retry`]: failure classification and the transactional retry wrapper
//! - [`records`]: persisted row types and lifecycle enums
//! - [`store`]: [`IngestionStore`] operations over `&PgPool`
//! - [`removal`]: mark-and-sweep removal computation
//! - [`sink`]: the entity sink boundary and its Postgres implementation

pub mod engine;
pub mod records;
pub mod removal;
pub mod retry;
pub mod sink;
pub mod store;

pub use engine::DatabaseEngine;
pub use records::*;
pub use removal::RemovalOutcome;
pub use retry::RetryPolicy;
pub use sink::{EntitySink, PgEntitySink};
pub use store::{truncate_error, DuplicateActive, IngestionStore, KindCount};
