//! The transport collaborator.
//!
//! The session never talks to the network itself. Every round trip goes
//! through a [`Transport`], which turns a [`Command`] into a [`Response`].
//! Read commands must be safe to repeat: the session re-sends them while it
//! waits for fresh or authoritative results.
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`
//! for cancellation.

use asupersync::{Cx, Outcome};

use crate::document::{Document, Etag};
use crate::index_query::IndexQuery;
use crate::results::{BatchResult, Facet, FacetResults, MultiLoadResult, QueryResult};

/// A request the session needs the server to run.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a query against an index or a dynamic collection.
    Query {
        index_name: String,
        query: IndexQuery,
    },
    /// Fetch documents by key, plus the documents referenced by `includes`.
    Load {
        ids: Vec<String>,
        includes: Vec<String>,
    },
    /// Fetch documents whose key starts with a prefix.
    LoadStartingWith {
        prefix: String,
        matches: Option<String>,
        start: usize,
        page_size: usize,
    },
    /// Compute facets over the results of a query.
    Facets {
        index_name: String,
        query: IndexQuery,
        facets: Vec<Facet>,
    },
    /// Apply puts and deletes in one transaction.
    Batch(Vec<BatchCommand>),
    /// Several independent read commands in one round trip.
    Multi(Vec<Command>),
}

impl Command {
    /// Short name for logging.
    pub const fn kind(&self) -> &'static str {
        match self {
            Command::Query { .. } => "query",
            Command::Load { .. } => "load",
            Command::LoadStartingWith { .. } => "load_starting_with",
            Command::Facets { .. } => "facets",
            Command::Batch(_) => "batch",
            Command::Multi(_) => "multi",
        }
    }

    /// Whether repeating the command has no side effects.
    pub fn is_read(&self) -> bool {
        match self {
            Command::Batch(_) => false,
            Command::Multi(fragments) => fragments.iter().all(Command::is_read),
            _ => true,
        }
    }
}

/// One write inside a [`Command::Batch`].
#[derive(Debug, Clone, PartialEq)]
pub enum BatchCommand {
    Put {
        key: String,
        document: Document,
        /// Expected current etag when optimistic concurrency is on.
        etag: Option<Etag>,
    },
    Delete {
        key: String,
        etag: Option<Etag>,
    },
}

impl BatchCommand {
    pub fn key(&self) -> &str {
        match self {
            BatchCommand::Put { key, .. } | BatchCommand::Delete { key, .. } => key,
        }
    }
}

/// The server's answer to a [`Command`].
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Query(QueryResult),
    Load(MultiLoadResult),
    Facets(FacetResults),
    Batch(Vec<BatchResult>),
    /// Fragments of a [`Command::Multi`], in request order.
    Multi(Vec<Response>),
    /// A fragment of a multi request that failed on the server.
    Error { status: u16, message: String },
}

impl Response {
    /// Short name for logging.
    pub const fn kind(&self) -> &'static str {
        match self {
            Response::Query(_) => "query",
            Response::Load(_) => "load",
            Response::Facets(_) => "facets",
            Response::Batch(_) => "batch",
            Response::Multi(_) => "multi",
            Response::Error { .. } => "error",
        }
    }
}

/// Executes commands against a document server.
pub trait Transport: Send + Sync {
    /// Run one command.
    ///
    /// Transport failures are reported as `Outcome::Err` and reach the caller
    /// unchanged.
    fn execute(
        &self,
        cx: &Cx,
        command: &Command,
    ) -> impl Future<Output = Outcome<Response, crate::Error>> + Send;

    /// Identifier of the server or database, used in log fields.
    fn identifier(&self) -> &str {
        "default"
    }
}
