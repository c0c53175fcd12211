//! Core types and traits for docmodel.
//!
//! This crate provides the foundations shared by the query builder and the
//! session:
//!
//! - `Document` - JSON object with freeze and copy-on-write snapshots
//! - `Entity` trait and the process-wide entity metadata table
//! - `Conventions` for naming, key generation and default timeouts
//! - `IndexQuery` and the server result types
//! - `Transport` trait for the wire collaborator
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod constants;
pub mod conventions;
pub mod document;
pub mod entity;
pub mod error;
pub mod index_query;
pub mod results;
pub mod transport;

pub use conventions::{Conventions, OrderingType};
pub use document::{Document, Etag};
pub use entity::{
    Entity, EntityInfo, IdentityProperty, entity_from_json, entity_info, entity_to_json,
    identity_is_unset, write_identity,
};
pub use error::{
    ConversionError, Error, FrozenError, IdentityConflictError, IdentityConflictKind,
    QueryStateError, QueryStateErrorKind, Result, TimeoutError, TransportError,
    TransportErrorKind,
};
pub use index_query::{IndexQuery, Parameters};
pub use results::{
    BatchResult, Facet, FacetResult, FacetResults, FacetValue, MultiLoadResult, QueryResult,
};
pub use transport::{BatchCommand, Command, Response, Transport};
