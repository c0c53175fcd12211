//! Error types for docmodel operations.

use std::fmt;
use std::time::Duration;

/// The primary error type for all docmodel operations.
#[derive(Debug)]
pub enum Error {
    /// Failure reported by the transport collaborator, passed through unchanged
    Transport(TransportError),
    /// Structural misuse of the query builder
    InvalidQueryState(QueryStateError),
    /// Index results stayed stale past the allowed wait
    StalenessTimeout(TimeoutError),
    /// Server kept answering with non-authoritative data past the allowed wait
    NonAuthoritativeTimeout(TimeoutError),
    /// Entity could not be reduced to or rebuilt from a document
    Conversion(ConversionError),
    /// Caller misuse of the identity map (deleted/modified/re-stored ids)
    IdentityConflict(IdentityConflictError),
    /// Mutation attempted on a frozen document
    Frozen(FrozenError),
    /// Session used in a state that does not allow the operation
    InvalidSessionState(String),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    /// Status code reported by the server, if any
    pub status: Option<u16>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Could not reach the server
    Unreachable,
    /// Server answered with an error status
    Server,
    /// Response did not have the shape the command expects
    UnexpectedResponse,
    /// Optimistic concurrency check failed on the server
    Concurrency,
    /// Request timed out in the transport layer
    Timeout,
}

#[derive(Debug, Clone)]
pub struct QueryStateError {
    pub kind: QueryStateErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStateErrorKind {
    /// Raw query text mixed with structured builder calls
    RawQueryMixed,
    /// Open/close subclause counts differ
    UnbalancedSubclause,
    /// Negation requested with nothing to apply it to
    NothingToNegate,
    /// Operator placed where it cannot apply
    MisplacedOperator,
    /// Parameter name already in use
    DuplicateParameter,
    /// Argument outside its allowed range
    InvalidArgument,
    /// Dynamic query asking for a document by id
    QueryById,
    /// Query already finished with an error
    Failed,
}

/// Elapsed-time diagnostics for a freshness wait that ran out.
#[derive(Debug, Clone)]
pub struct TimeoutError {
    pub elapsed: Duration,
    pub timeout: Duration,
    /// Query text or id list being waited on
    pub target: String,
    pub index_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConversionError {
    /// Document key, if known
    pub key: Option<String>,
    pub type_name: &'static str,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct IdentityConflictError {
    pub kind: IdentityConflictKind,
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityConflictKind {
    /// Delete by id of an entity carrying unsaved modifications
    DeleteModified,
    /// Store of an id deleted earlier in the same session
    StoreDeleted,
    /// Load of an id marked deleted in the session
    LoadDeleted,
    /// Key already tracked by a different entity instance or type
    KeyTaken,
}

#[derive(Debug, Clone)]
pub struct FrozenError {
    /// Property the caller tried to change
    pub property: String,
}

impl Error {
    /// Is this a transient failure that may succeed on a later attempt?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(e) => matches!(
                e.kind,
                TransportErrorKind::Unreachable | TransportErrorKind::Timeout
            ),
            Error::StalenessTimeout(_) | Error::NonAuthoritativeTimeout(_) => true,
            _ => false,
        }
    }

    /// Time spent waiting, for the freshness timeout errors.
    pub fn elapsed(&self) -> Option<Duration> {
        match self {
            Error::StalenessTimeout(e) | Error::NonAuthoritativeTimeout(e) => Some(e.elapsed),
            _ => None,
        }
    }

    /// Convenience constructor for builder misuse.
    pub fn query_state(kind: QueryStateErrorKind, message: impl Into<String>) -> Self {
        Error::InvalidQueryState(QueryStateError {
            kind,
            message: message.into(),
        })
    }

    /// Convenience constructor for identity map misuse.
    pub fn identity_conflict(kind: IdentityConflictKind, key: impl Into<String>) -> Self {
        Error::IdentityConflict(IdentityConflictError {
            kind,
            key: key.into(),
        })
    }

    /// Convenience constructor for conversion failures.
    pub fn conversion(
        key: Option<&str>,
        type_name: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Error::Conversion(ConversionError {
            key: key.map(str::to_string),
            type_name,
            message: message.into(),
        })
    }

    /// The builder error kind, if this is an `InvalidQueryState` error.
    pub fn query_state_kind(&self) -> Option<QueryStateErrorKind> {
        match self {
            Error::InvalidQueryState(e) => Some(e.kind),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "Transport error: {}", e),
            Error::InvalidQueryState(e) => write!(f, "Invalid query state: {}", e.message),
            Error::StalenessTimeout(e) => write!(
                f,
                "Waited for {:?} for the query to return non stale result (timeout {:?}): {}",
                e.elapsed, e.timeout, e.target
            ),
            Error::NonAuthoritativeTimeout(e) => write!(
                f,
                "Waited for {:?} for the request to return authoritative result (timeout {:?}): {}",
                e.elapsed, e.timeout, e.target
            ),
            Error::Conversion(e) => write!(f, "Conversion error: {}", e),
            Error::IdentityConflict(e) => write!(f, "Identity conflict: {}", e),
            Error::Frozen(e) => write!(
                f,
                "Cannot modify property '{}' of a frozen document",
                e.property
            ),
            Error::InvalidSessionState(msg) => write!(f, "Invalid session state: {}", msg),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (status {})", self.message, status),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for ConversionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(key) = &self.key {
            write!(
                f,
                "document '{}' as {}: {}",
                key, self.type_name, self.message
            )
        } else {
            write!(f, "{}: {}", self.type_name, self.message)
        }
    }
}

impl fmt::Display for IdentityConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            IdentityConflictKind::DeleteModified => write!(
                f,
                "Can't delete changed entity '{}' using its identifier, delete the entity instead",
                self.key
            ),
            IdentityConflictKind::StoreDeleted => write!(
                f,
                "Can't store object '{}', it was already deleted in this session",
                self.key
            ),
            IdentityConflictKind::LoadDeleted => write!(
                f,
                "Document '{}' is marked for deletion in this session",
                self.key
            ),
            IdentityConflictKind::KeyTaken => write!(
                f,
                "Key '{}' is already tracked by a different entity",
                self.key
            ),
        }
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::Transport(err)
    }
}

impl From<QueryStateError> for Error {
    fn from(err: QueryStateError) -> Self {
        Error::InvalidQueryState(err)
    }
}

impl From<ConversionError> for Error {
    fn from(err: ConversionError) -> Self {
        Error::Conversion(err)
    }
}

impl From<IdentityConflictError> for Error {
    fn from(err: IdentityConflictError) -> Self {
        Error::IdentityConflict(err)
    }
}

impl From<FrozenError> for Error {
    fn from(err: FrozenError) -> Self {
        Error::Frozen(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for docmodel operations.
pub type Result<T> = std::result::Result<T, Error>;
