//! docmodel - client-side sessions for document databases.
//!
//! docmodel keeps the client half of a document-database conversation:
//!
//! - Identity map with one entity instance per document key
//! - Change tracking against frozen server snapshots
//! - Fluent query builder with parameterized query text
//! - Staleness and authority checks on every server answer
//! - Lazy operations batched into a single round trip
//!
//! The wire itself is someone else's problem: implement [`Transport`] for
//! your client and hand it to a [`Session`].
//!
//! # Quick Start
//!
//! ```ignore
//! use docmodel::prelude::*;
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct User {
//!     id: Option<String>,
//!     name: String,
//!     age: u32,
//! }
//!
//! impl Entity for User {}
//!
//! async fn main_example(cx: &Cx, transport: impl Transport) {
//!     let mut session = Session::new(transport, Arc::new(Conventions::default()));
//!
//!     // Store
//!     let user = session.store(User { id: None, name: "Oren".into(), age: 30 }).unwrap();
//!     session.save_changes(cx).await.unwrap();
//!
//!     // Load (no round trip: already tracked)
//!     let key = session.key_for(&user).unwrap();
//!     let same = session.load::<User>(cx, &key).await.unwrap();
//!
//!     // Query
//!     let mut query = session.query::<User>().where_greater_than("age", 18).unwrap();
//!     let adults = session.to_list(cx, &mut query).await.unwrap();
//!
//!     // Lazy loads share one request
//!     let a = session.lazy_load::<User>("users/1");
//!     let b = session.lazy_load::<User>("users/2");
//!     session.execute_all_pending_lazy_operations(cx).await.unwrap();
//!     let a = a.value(cx, &mut session).await.unwrap();
//! }
//! ```
//!
//! # Crates
//!
//! - `docmodel-core`: documents, entities, conventions, errors, transport
//! - `docmodel-query`: query tokens, builder and the staleness resolver
//! - `docmodel-session`: identity map, snapshot cache, multi-load and lazy
//!   scheduling

// Re-export asupersync primitives
pub use asupersync::{Cx, Outcome};

// Core
pub use docmodel_core::{
    BatchCommand, BatchResult, Command, ConversionError, Conventions, Document, Entity,
    EntityInfo, Error, Etag, Facet, FacetResult, FacetResults, FacetValue, FrozenError,
    IdentityConflictError, IdentityConflictKind, IdentityProperty, IndexQuery, MultiLoadResult,
    OrderingType, Parameters, QueryResult, QueryStateError, QueryStateErrorKind, Response,
    Result, TimeoutError, Transport, TransportError, TransportErrorKind, entity_info,
};
pub use docmodel_core::{constants, conventions, document, entity, error, index_query, results};

// Query building
pub use docmodel_query::{
    DocumentQuery, OrderByToken, OrderDirection, QueryOperation, QueryOperator, QueryStatistics,
    QueryToken, QueryVerdict, SearchOperator, SelectToken, ShapeToken, SpatialCriteria,
    SpatialRelation, SpatialShape, SpatialUnits, WhereKind, WhereToken, escape_field,
};

// Session
pub use docmodel_session::{
    CachingScope, ChangeKind, DocumentChange, EntityReadGuard, EntityRef, EntityWriteGuard,
    IdentityMap, Lazy, LazyOperation, LazyStep, LoadVerdict, MultiLoadOperation, Positions,
    Session, SessionConfig, SnapshotCache, TrackedEntry,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use docmodel::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // asupersync
        Cx,
        // Core traits and types
        Conventions,
        Document,
        // Query building
        DocumentQuery,
        Entity,
        EntityRef,
        Error,
        Etag,
        Facet,
        IdentityProperty,
        Lazy,
        OrderDirection,
        Outcome,
        Result,
        // Session
        Session,
        SessionConfig,
        Transport,
    };
    pub use serde::{Deserialize, Serialize};
    pub use std::sync::Arc;
}
