//! Document query construction for docmodel.
//!
//! `docmodel-query` is the **query construction layer**. It turns fluent
//! predicate, ordering and projection calls into query text plus a parameter
//! table, and decides what to do with each server response.
//!
//! # Role In The Architecture
//!
//! - **Tokens**: every builder call becomes a `QueryToken`, rendered in
//!   insertion order.
//! - **Builder**: `DocumentQuery<T>` validates call order (subclauses,
//!   operators, negation, raw text) and renders `FROM ... WHERE ...` text.
//! - **Resolver**: `QueryOperation` accepts, retries or fails a query based on
//!   staleness and authority of the results.
//!
//! The session in `docmodel-session` drives a `QueryOperation` against a
//! `Transport` from `docmodel-core`. Most users access these types via the
//! `docmodel` facade crate.

pub mod builder;
pub mod clause;
pub mod operation;
pub mod token;

pub use builder::DocumentQuery;
pub use clause::{
    DEFAULT_DISTANCE_ERROR_PCT, OrderDirection, QueryOperator, SearchOperator, SpatialCriteria,
    SpatialRelation, SpatialShape, SpatialUnits,
};
pub use operation::{QueryOperation, QueryStatistics, QueryVerdict};
pub use token::{
    OrderByToken, QueryToken, SelectToken, ShapeToken, WhereKind, WhereToken, escape_field,
};
