//! Query execution state machine.
//!
//! A [`QueryOperation`] represents one logical query call. The session asks it
//! for the request to send, hands every response to [`QueryOperation::evaluate`]
//! and re-sends the same request while the verdict is [`QueryVerdict::Retry`].
//! Once the operation is accepted or has failed, the outcome is terminal and
//! later reads replay it.

use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime};

use docmodel_core::constants::{METADATA_ID, PROJECTED_ID_FIELD_NAME};
use docmodel_core::{
    Command, Conventions, Document, Error, Etag, IndexQuery, QueryResult, QueryStateErrorKind,
    Result, TimeoutError, identity_is_unset, write_identity,
};
use regex::Regex;
use serde_json::{Map, Value as JsonValue};

/// What the caller should do with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryVerdict {
    /// The result is final and available through [`QueryOperation::result`].
    Accepted,
    /// Send the same request again.
    Retry,
}

/// Why a query gave up.
#[derive(Debug, Clone)]
enum Failure {
    Stale(TimeoutError),
    NonAuthoritative(TimeoutError),
}

impl Failure {
    fn to_error(&self) -> Error {
        match self {
            Failure::Stale(e) => Error::StalenessTimeout(e.clone()),
            Failure::NonAuthoritative(e) => Error::NonAuthoritativeTimeout(e.clone()),
        }
    }
}

#[derive(Debug)]
enum State {
    Idle,
    Issued,
    Done(QueryResult),
    Failed(Failure),
}

/// Facts about the last accepted result.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryStatistics {
    pub is_stale: bool,
    pub total_results: u64,
    pub skipped_results: u64,
    pub index_name: String,
    pub result_etag: Option<Etag>,
    pub duration_ms: u64,
    /// When the result was accepted.
    pub timestamp: SystemTime,
}

/// Resolver for one logical query call.
#[derive(Debug)]
pub struct QueryOperation {
    index_name: String,
    index_query: IndexQuery,
    timeout: Duration,
    allow_non_authoritative: bool,
    non_authoritative_timeout: Duration,
    disable_tracking: bool,
    projection_fields: Vec<String>,
    identity_property: String,
    started_at: Option<Instant>,
    attempts: u32,
    accepted_at: Option<SystemTime>,
    state: State,
}

fn query_by_id_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"(?i)^\s*FROM\s+\S+(\s+AS\s+\S+)?\s+WHERE\s+id\(\)\s*=\s*\$(\w+)\s*$").ok()
        })
        .as_ref()
}

impl QueryOperation {
    /// Create the resolver, rejecting dynamic queries that only look up an id.
    pub fn new(
        index_name: impl Into<String>,
        index_query: IndexQuery,
        conventions: &Conventions,
        is_dynamic: bool,
        disable_tracking: bool,
        projection_fields: Vec<String>,
    ) -> Result<Self> {
        if is_dynamic && !conventions.allow_queries_on_id {
            assert_not_query_by_id(&index_query)?;
        }
        let timeout = index_query
            .wait_for_non_stale_results_timeout
            .unwrap_or(conventions.default_query_timeout);
        Ok(Self {
            index_name: index_name.into(),
            index_query,
            timeout,
            allow_non_authoritative: false,
            non_authoritative_timeout: conventions.non_authoritative_timeout,
            disable_tracking,
            projection_fields,
            identity_property: conventions.identity_property_name.clone(),
            started_at: None,
            attempts: 0,
            accepted_at: None,
            state: State::Idle,
        })
    }

    /// Accept non-authoritative results instead of waiting them out.
    #[must_use]
    pub fn allow_non_authoritative(mut self, allow: bool) -> Self {
        self.allow_non_authoritative = allow;
        self
    }

    #[must_use]
    pub fn non_authoritative_timeout(mut self, timeout: Duration) -> Self {
        self.non_authoritative_timeout = timeout;
        self
    }

    /// The request to send. Starts the clock on the first call.
    pub fn create_request(&mut self) -> Result<Command> {
        if let Some(err) = self.terminal_error() {
            return Err(err);
        }
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
        self.attempts += 1;
        self.state = State::Issued;
        tracing::debug!(
            index = %self.index_name,
            query = %self.index_query.query,
            attempt = self.attempts,
            wait_for_non_stale = self.index_query.wait_for_non_stale_results,
            "Issuing query"
        );
        Ok(Command::Query {
            index_name: self.index_name.clone(),
            query: self.index_query.clone(),
        })
    }

    /// Decide whether `result` is final.
    ///
    /// Fails with `StalenessTimeout` or `NonAuthoritativeTimeout` once the
    /// elapsed time since the first request reaches the relevant timeout.
    /// Authority is checked before staleness.
    pub fn evaluate(&mut self, mut result: QueryResult) -> Result<QueryVerdict> {
        match &self.state {
            State::Done(_) => {
                return Err(Error::query_state(
                    QueryStateErrorKind::Failed,
                    "query was already accepted",
                ));
            }
            State::Failed(failure) => return Err(failure.to_error()),
            State::Idle | State::Issued => {}
        }

        let elapsed = self.elapsed();

        if result.non_authoritative && !self.allow_non_authoritative {
            if elapsed >= self.non_authoritative_timeout {
                let failure = Failure::NonAuthoritative(
                    self.timeout_error(elapsed, self.non_authoritative_timeout),
                );
                let err = failure.to_error();
                self.state = State::Failed(failure);
                return Err(err);
            }
            tracing::debug!(
                index = %self.index_name,
                elapsed_ms = elapsed.as_millis() as u64,
                "Non-authoritative results, retrying"
            );
            return Ok(QueryVerdict::Retry);
        }

        if self.index_query.wait_for_non_stale_results && result.is_stale {
            if elapsed >= self.timeout {
                let failure = Failure::Stale(self.timeout_error(elapsed, self.timeout));
                tracing::debug!(
                    index = %self.index_name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    attempts = self.attempts,
                    "Stale results past timeout"
                );
                let err = failure.to_error();
                self.state = State::Failed(failure);
                return Err(err);
            }
            tracing::debug!(
                index = %self.index_name,
                elapsed_ms = elapsed.as_millis() as u64,
                attempts = self.attempts,
                "Stale results, retrying"
            );
            return Ok(QueryVerdict::Retry);
        }

        result.ensure_snapshot();
        tracing::debug!(
            index = %self.index_name,
            results = result.results.len(),
            total = result.total_results,
            is_stale = result.is_stale,
            attempts = self.attempts,
            "Query accepted"
        );
        self.accepted_at = Some(SystemTime::now());
        self.state = State::Done(result);
        Ok(QueryVerdict::Accepted)
    }

    /// The accepted result, `None` while still in flight, or the replayed
    /// failure.
    pub fn result(&self) -> Result<Option<&QueryResult>> {
        match &self.state {
            State::Done(result) => Ok(Some(result)),
            State::Failed(failure) => Err(failure.to_error()),
            State::Idle | State::Issued => Ok(None),
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::Done(_) | State::Failed(_))
    }

    pub fn statistics(&self) -> Option<QueryStatistics> {
        let State::Done(result) = &self.state else {
            return None;
        };
        Some(QueryStatistics {
            is_stale: result.is_stale,
            total_results: result.total_results,
            skipped_results: result.skipped_results,
            index_name: result.index_name.clone(),
            result_etag: result.result_etag,
            duration_ms: result.duration_ms,
            timestamp: self.accepted_at.unwrap_or_else(SystemTime::now),
        })
    }

    /// Key under which a returned document should be tracked, if any.
    ///
    /// Projections and untracked queries never track; otherwise a document
    /// carrying `@metadata.@id` is tracked under that key.
    pub fn tracking_key<'a>(&self, document: &'a Document) -> Option<&'a str> {
        if self.disable_tracking || !self.projection_fields.is_empty() {
            return None;
        }
        document.id()
    }

    /// Entity body of a returned document with the identity property
    /// back-filled from `@metadata.@id` or the projected document id.
    pub fn entity_body(&self, document: &Document) -> Map<String, JsonValue> {
        let mut body = document.body();
        let projected_id = body.remove(PROJECTED_ID_FIELD_NAME);
        if identity_is_unset(&body, &self.identity_property) {
            let key = document
                .metadata_value(METADATA_ID)
                .and_then(JsonValue::as_str)
                .map(str::to_string)
                .or_else(|| projected_id.as_ref().and_then(JsonValue::as_str).map(str::to_string));
            if let Some(key) = key {
                if !self.projection_fields.is_empty()
                    && !self.projection_fields.contains(&self.identity_property)
                {
                    return body;
                }
                write_identity(&mut body, &self.identity_property, &key);
            }
        }
        body
    }

    fn terminal_error(&self) -> Option<Error> {
        match &self.state {
            State::Failed(failure) => Some(failure.to_error()),
            State::Done(_) => Some(Error::query_state(
                QueryStateErrorKind::Failed,
                "query was already accepted",
            )),
            State::Idle | State::Issued => None,
        }
    }

    fn timeout_error(&self, elapsed: Duration, timeout: Duration) -> TimeoutError {
        TimeoutError {
            elapsed,
            timeout,
            target: self.index_query.query.clone(),
            index_name: Some(self.index_name.clone()),
        }
    }

    /// Time since the first request.
    pub fn elapsed(&self) -> Duration {
        self.started_at.map_or(Duration::ZERO, |start| start.elapsed())
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn index_query(&self) -> &IndexQuery {
        &self.index_query
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_tracking_disabled(&self) -> bool {
        self.disable_tracking
    }

    pub fn projection_fields(&self) -> &[String] {
        &self.projection_fields
    }
}

fn assert_not_query_by_id(index_query: &IndexQuery) -> Result<()> {
    let Some(pattern) = query_by_id_pattern() else {
        return Ok(());
    };
    let Some(captures) = pattern.captures(&index_query.query) else {
        return Ok(());
    };
    let id = captures
        .get(2)
        .and_then(|name| index_query.query_parameters.get(name.as_str()))
        .map_or_else(|| "<id>".to_string(), |value| match value {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        });
    Err(Error::query_state(
        QueryStateErrorKind::QueryById,
        format!(
            "Attempt to query by id only is blocked, use session.load(\"{id}\") instead of \
             querying where id() equals \"{id}\"; enable Conventions::allow_queries_on_id to \
             turn this check off"
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stale_query(timeout: Duration) -> IndexQuery {
        IndexQuery {
            wait_for_non_stale_results: true,
            wait_for_non_stale_results_timeout: Some(timeout),
            ..IndexQuery::new("FROM Users WHERE Age > $p0")
        }
    }

    fn operation(query: IndexQuery) -> QueryOperation {
        QueryOperation::new(
            "dynamic/Users",
            query,
            &Conventions::default(),
            true,
            false,
            Vec::new(),
        )
        .unwrap()
    }

    fn stale(stale: bool) -> QueryResult {
        QueryResult {
            is_stale: stale,
            total_results: 1,
            results: vec![Some(
                Document::from_json(json!({"Name": "a", "@metadata": {"@id": "users/1"}}))
                    .unwrap(),
            )],
            ..QueryResult::default()
        }
    }

    #[test]
    fn zero_timeout_fails_on_first_stale_response() {
        let mut op = operation(stale_query(Duration::ZERO));
        op.create_request().unwrap();
        let err = op.evaluate(stale(true)).unwrap_err();
        match err {
            Error::StalenessTimeout(e) => {
                assert_eq!(e.timeout, Duration::ZERO);
                assert_eq!(e.index_name.as_deref(), Some("dynamic/Users"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // Terminal: replayed on every later read.
        assert!(matches!(op.result(), Err(Error::StalenessTimeout(_))));
        assert!(op.create_request().is_err());
    }

    #[test]
    fn stale_then_fresh_is_accepted_on_second_attempt() {
        let mut op = operation(stale_query(Duration::from_secs(15)));
        let first = op.create_request().unwrap();
        assert_eq!(op.evaluate(stale(true)).unwrap(), QueryVerdict::Retry);
        let second = op.create_request().unwrap();
        assert_eq!(first, second);
        assert_eq!(op.evaluate(stale(false)).unwrap(), QueryVerdict::Accepted);
        assert_eq!(op.attempts(), 2);

        let result = op.result().unwrap().unwrap();
        assert!(result.results[0].as_ref().unwrap().is_frozen());
        let stats = op.statistics().unwrap();
        assert!(!stats.is_stale);
        assert_eq!(stats.total_results, 1);
    }

    #[test]
    fn stale_results_accepted_without_wait() {
        let mut op = operation(IndexQuery::new("FROM Users"));
        op.create_request().unwrap();
        assert_eq!(op.evaluate(stale(true)).unwrap(), QueryVerdict::Accepted);
    }

    #[test]
    fn non_authoritative_results_time_out() {
        let mut op = operation(IndexQuery::new("FROM Users"))
            .non_authoritative_timeout(Duration::ZERO);
        op.create_request().unwrap();
        let result = QueryResult {
            non_authoritative: true,
            ..QueryResult::default()
        };
        assert!(matches!(
            op.evaluate(result.clone()),
            Err(Error::NonAuthoritativeTimeout(_))
        ));

        let mut lenient = operation(IndexQuery::new("FROM Users")).allow_non_authoritative(true);
        lenient.create_request().unwrap();
        assert_eq!(lenient.evaluate(result).unwrap(), QueryVerdict::Accepted);
    }

    #[test]
    fn authority_is_checked_before_staleness() {
        let mut op = operation(stale_query(Duration::ZERO)).non_authoritative_timeout(Duration::ZERO);
        op.create_request().unwrap();
        let result = QueryResult {
            non_authoritative: true,
            ..stale(true)
        };
        assert!(matches!(
            op.evaluate(result),
            Err(Error::NonAuthoritativeTimeout(_))
        ));
        assert!(matches!(op.result(), Err(Error::NonAuthoritativeTimeout(_))));
    }

    #[test]
    fn query_by_id_is_blocked_on_dynamic_queries() {
        let mut query = IndexQuery::new("FROM Users WHERE id() = $p0");
        query.query_parameters.add(json!("users/1"));
        let err = QueryOperation::new(
            "dynamic/Users",
            query.clone(),
            &Conventions::default(),
            true,
            false,
            Vec::new(),
        )
        .unwrap_err();
        assert_eq!(err.query_state_kind(), Some(QueryStateErrorKind::QueryById));
        assert!(err.to_string().contains("users/1"));

        let allowed = Conventions::default().allow_queries_on_id(true);
        assert!(
            QueryOperation::new("dynamic/Users", query.clone(), &allowed, true, false, Vec::new())
                .is_ok()
        );
        assert!(
            QueryOperation::new(
                "Users/ById",
                query,
                &Conventions::default(),
                false,
                false,
                Vec::new()
            )
            .is_ok()
        );
    }

    #[test]
    fn compound_id_queries_are_not_blocked() {
        let query = IndexQuery::new("FROM Users WHERE id() = $p0 AND Name = $p1");
        assert!(
            QueryOperation::new(
                "dynamic/Users",
                query,
                &Conventions::default(),
                true,
                false,
                Vec::new()
            )
            .is_ok()
        );
    }

    #[test]
    fn identity_is_backfilled_from_metadata_or_projection() {
        let op = operation(IndexQuery::new("FROM Users"));
        let doc = Document::from_json(json!({"Name": "a", "@metadata": {"@id": "users/1"}})).unwrap();
        assert_eq!(op.tracking_key(&doc), Some("users/1"));
        let body = op.entity_body(&doc);
        assert_eq!(body.get("id"), Some(&json!("users/1")));
        assert!(!body.contains_key("@metadata"));

        let projected = QueryOperation::new(
            "dynamic/Users",
            IndexQuery::new("FROM Users SELECT Name, id() AS id"),
            &Conventions::default(),
            true,
            false,
            vec!["Name".into(), "id".into()],
        )
        .unwrap();
        let doc = Document::from_json(json!({"Name": "a", "__document_id": "users/2"})).unwrap();
        assert_eq!(projected.tracking_key(&doc), None);
        let body = projected.entity_body(&doc);
        assert_eq!(body.get("id"), Some(&json!("users/2")));
        assert!(!body.contains_key("__document_id"));
    }
}
