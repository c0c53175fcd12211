//! Deferred reads executed in one round trip.
//!
//! Every `lazy_*` call queues a [`LazyOperation`] on the session and returns a
//! [`Lazy`] handle without touching the network. Reading any pending handle
//! sends all queued operations as one [`Command::Multi`] and hands each
//! response fragment back to its operation, in queue order.
//!
//! A failed fragment, or a fragment that cannot be decoded, fails only its own
//! handle. Operations that ask for a retry (stale or non-authoritative
//! answers) are sent again in a follow-up batch until their timeouts expire.

use std::sync::{Arc, Mutex};

use asupersync::{Cx, Outcome};
use docmodel_core::{
    Command, Entity, Error, Facet, FacetResults, Response, Result, Transport, TransportError,
    TransportErrorKind,
};
use docmodel_query::{DocumentQuery, QueryOperation, QueryVerdict};

use crate::identity_map::EntityRef;
use crate::multi_load::{LoadVerdict, MultiLoadOperation, expect_load, unexpected_response};
use crate::query::{accepted_result, expect_query, facets_command};
use crate::{Session, try_outcome};

/// Page size of lazy starts-with loads when none is given.
pub const DEFAULT_STARTS_WITH_PAGE_SIZE: usize = 25;

/// What happened to an operation after it saw its response fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LazyStep {
    /// The handle is fulfilled.
    Done,
    /// Send the operation again in the next batch.
    RequiresRetry,
}

/// One deferred read.
pub trait LazyOperation<Tr: Transport>: Send {
    /// The fragment to send in the next batch.
    fn create_request(&mut self) -> Result<Command>;

    /// Consume the operation's response fragment.
    fn handle_response(&mut self, session: &mut Session<Tr>, response: Response) -> Result<LazyStep>;

    /// Fail the handle without a response.
    fn fail(&mut self, error: Error);
}

enum Slot<T> {
    Pending,
    Ready(Result<T>),
    Taken,
}

type Continuation<T> = Box<dyn FnOnce(&T) + Send>;

struct Cell<T> {
    slot: Slot<T>,
    on_eval: Option<Continuation<T>>,
}

type SharedCell<T> = Arc<Mutex<Cell<T>>>;

fn lock<T>(cell: &SharedCell<T>) -> std::sync::MutexGuard<'_, Cell<T>> {
    cell.lock().unwrap_or_else(|e| e.into_inner())
}

fn fulfill<T>(cell: &SharedCell<T>, result: Result<T>) {
    let continuation = {
        let mut guard = lock(cell);
        guard.slot = Slot::Ready(result);
        guard.on_eval.take()
    };
    if let Some(continuation) = continuation {
        with_value(cell, continuation);
    }
}

/// Calls `f` with a ready value. The lock is not held during the call.
fn with_value<T>(cell: &SharedCell<T>, f: impl FnOnce(&T)) {
    let slot = std::mem::replace(&mut lock(cell).slot, Slot::Taken);
    if let Slot::Ready(Ok(value)) = &slot {
        f(value);
    }
    let mut guard = lock(cell);
    if matches!(guard.slot, Slot::Taken) {
        guard.slot = slot;
    }
}

/// Handle to the value of a deferred read.
pub struct Lazy<T> {
    cell: SharedCell<T>,
    session_id: u64,
}

impl<T> std::fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lazy")
            .field("session_id", &self.session_id)
            .field("is_value_created", &self.is_value_created())
            .finish()
    }
}

impl<T> Lazy<T> {
    fn pending(session_id: u64) -> (Self, SharedCell<T>) {
        let cell = Arc::new(Mutex::new(Cell {
            slot: Slot::Pending,
            on_eval: None,
        }));
        (
            Self {
                cell: Arc::clone(&cell),
                session_id,
            },
            cell,
        )
    }

    fn ready(session_id: u64, result: Result<T>) -> Self {
        Self {
            cell: Arc::new(Mutex::new(Cell {
                slot: Slot::Ready(result),
                on_eval: None,
            })),
            session_id,
        }
    }

    /// Run `continuation` with the value once it is available. Runs at once
    /// when the value already is.
    #[must_use]
    pub fn on_eval(self, continuation: impl FnOnce(&T) + Send + 'static) -> Self {
        let ready = {
            let mut guard = lock(&self.cell);
            if matches!(guard.slot, Slot::Pending) {
                guard.on_eval = Some(Box::new(continuation));
                None
            } else if matches!(guard.slot, Slot::Ready(Ok(_))) {
                Some(continuation)
            } else {
                None
            }
        };
        if let Some(continuation) = ready {
            with_value(&self.cell, continuation);
        }
        self
    }

    /// Whether the value (or its error) is available without a round trip.
    pub fn is_value_created(&self) -> bool {
        matches!(lock(&self.cell).slot, Slot::Ready(_))
    }

    /// The value, executing every pending lazy operation of `session` first
    /// when needed.
    pub async fn value<Tr: Transport + 'static>(
        self,
        cx: &Cx,
        session: &mut Session<Tr>,
    ) -> Outcome<T, Error> {
        if self.session_id != session.id() {
            return Outcome::Err(Error::InvalidSessionState(
                "lazy value belongs to another session".to_string(),
            ));
        }
        if !self.is_value_created() {
            try_outcome!(session.execute_all_pending_lazy_operations(cx).await);
        }
        let mut cell = lock(&self.cell);
        match std::mem::replace(&mut cell.slot, Slot::Taken) {
            Slot::Ready(Ok(value)) => Outcome::Ok(value),
            Slot::Ready(Err(err)) => Outcome::Err(err),
            Slot::Pending => Outcome::Err(Error::InvalidSessionState(
                "lazy operation was discarded before it ran".to_string(),
            )),
            Slot::Taken => Outcome::Err(Error::InvalidSessionState(
                "lazy value was already taken".to_string(),
            )),
        }
    }
}

// ============================================================================
// Operations
// ============================================================================

enum Decoded<T> {
    Value(T),
    Retry,
}

type RequestFn<S> = fn(&mut S) -> Result<Command>;
type DecodeFn<S, T, Tr> = fn(&mut S, &mut Session<Tr>, Response) -> Result<Decoded<T>>;

/// A lazy operation built from per-variant state and two functions over it.
struct Deferred<S, T, Tr: Transport> {
    state: S,
    request: RequestFn<S>,
    decode: DecodeFn<S, T, Tr>,
    cell: SharedCell<T>,
}

impl<S, T, Tr> LazyOperation<Tr> for Deferred<S, T, Tr>
where
    S: Send,
    T: Send,
    Tr: Transport,
{
    fn create_request(&mut self) -> Result<Command> {
        (self.request)(&mut self.state)
    }

    fn handle_response(&mut self, session: &mut Session<Tr>, response: Response) -> Result<LazyStep> {
        match (self.decode)(&mut self.state, session, response)? {
            Decoded::Value(value) => {
                fulfill(&self.cell, Ok(value));
                Ok(LazyStep::Done)
            }
            Decoded::Retry => Ok(LazyStep::RequiresRetry),
        }
    }

    fn fail(&mut self, error: Error) {
        fulfill(&self.cell, Err(error));
    }
}

struct LoadState {
    operation: MultiLoadOperation,
    command: Command,
}

fn load_request(state: &mut LoadState) -> Result<Command> {
    state.operation.enter_load_context();
    Ok(state.command.clone())
}

fn decode_load<T: Entity, Tr: Transport>(
    state: &mut LoadState,
    session: &mut Session<Tr>,
    response: Response,
) -> Result<Decoded<Vec<Option<EntityRef<T>>>>> {
    let result = expect_load(response)?;
    match state.operation.set_result(result)? {
        LoadVerdict::Requery => Ok(Decoded::Retry),
        LoadVerdict::Done => session.complete_load::<T>(&state.operation).map(Decoded::Value),
    }
}

fn decode_single<T: Entity, Tr: Transport>(
    state: &mut LoadState,
    session: &mut Session<Tr>,
    response: Response,
) -> Result<Decoded<Option<EntityRef<T>>>> {
    Ok(match decode_load::<T, Tr>(state, session, response)? {
        Decoded::Value(mut loaded) => Decoded::Value(loaded.pop().flatten()),
        Decoded::Retry => Decoded::Retry,
    })
}

fn decode_positional<T: Entity, Tr: Transport>(
    state: &mut LoadState,
    session: &mut Session<Tr>,
    response: Response,
) -> Result<Decoded<Vec<EntityRef<T>>>> {
    Ok(match decode_load::<T, Tr>(state, session, response)? {
        Decoded::Value(loaded) => Decoded::Value(loaded.into_iter().flatten().collect()),
        Decoded::Retry => Decoded::Retry,
    })
}

fn query_request(operation: &mut QueryOperation) -> Result<Command> {
    operation.create_request()
}

fn decode_query<T: Entity, Tr: Transport>(
    operation: &mut QueryOperation,
    session: &mut Session<Tr>,
    response: Response,
) -> Result<Decoded<Vec<EntityRef<T>>>> {
    match operation.evaluate(expect_query(response)?)? {
        QueryVerdict::Retry => Ok(Decoded::Retry),
        QueryVerdict::Accepted => session.materialize_query::<T>(operation).map(Decoded::Value),
    }
}

fn decode_count<Tr: Transport>(
    operation: &mut QueryOperation,
    _session: &mut Session<Tr>,
    response: Response,
) -> Result<Decoded<u64>> {
    match operation.evaluate(expect_query(response)?)? {
        QueryVerdict::Retry => Ok(Decoded::Retry),
        QueryVerdict::Accepted => {
            accepted_result(Some(&*operation)).map(|result| Decoded::Value(result.total_results))
        }
    }
}

fn facets_request(command: &mut Command) -> Result<Command> {
    Ok(command.clone())
}

fn decode_facets<Tr: Transport>(
    _command: &mut Command,
    _session: &mut Session<Tr>,
    response: Response,
) -> Result<Decoded<FacetResults>> {
    match response {
        Response::Facets(results) => Ok(Decoded::Value(results)),
        other => Err(unexpected_response("facets", &other)),
    }
}

/// Error handed to every operation of a batch that failed as a whole.
fn batch_failure(err: &Error) -> Error {
    match err {
        Error::Transport(e) => Error::Transport(TransportError {
            kind: e.kind,
            message: e.message.clone(),
            status: e.status,
            source: None,
        }),
        Error::InvalidSessionState(message) => Error::InvalidSessionState(message.clone()),
        Error::Cancelled => Error::Cancelled,
        other => Error::Custom(other.to_string()),
    }
}

// ============================================================================
// Session surface
// ============================================================================

impl<Tr: Transport + 'static> Session<Tr> {
    fn enqueue<S, T>(
        &mut self,
        state: S,
        request: RequestFn<S>,
        decode: DecodeFn<S, T, Tr>,
    ) -> Lazy<T>
    where
        S: Send + 'static,
        T: Send + 'static,
    {
        let (lazy, cell) = Lazy::pending(self.id());
        self.lazy_operations.push(Box::new(Deferred {
            state,
            request,
            decode,
            cell,
        }));
        tracing::trace!(queued = self.lazy_operations.len(), "Queued lazy operation");
        lazy
    }

    /// Queue a custom lazy operation.
    pub fn add_lazy_operation(&mut self, operation: Box<dyn LazyOperation<Tr>>) {
        self.lazy_operations.push(operation);
    }

    /// Number of queued lazy operations.
    pub fn pending_lazy_operations(&self) -> usize {
        self.lazy_operations.len()
    }

    fn lazy_load_state<T: Entity>(&mut self, ids: Vec<Option<String>>) -> Result<Option<LoadState>> {
        let fetch = self.plan_load::<T>(&ids)?;
        let operation = self.new_load_operation(MultiLoadOperation::by_ids(ids));
        if fetch.is_empty() {
            return Ok(None);
        }
        Ok(Some(LoadState {
            operation,
            command: Command::Load {
                ids: fetch,
                includes: Vec::new(),
            },
        }))
    }

    /// Deferred [`load`](Self::load). Resolves at once when the key is
    /// already loaded or known to be missing.
    pub fn lazy_load<T: Entity>(&mut self, id: &str) -> Lazy<Option<EntityRef<T>>> {
        let ids = vec![Some(id.to_string())];
        match self.lazy_load_state::<T>(ids.clone()) {
            Ok(Some(state)) => self.enqueue(state, load_request, decode_single::<T, Tr>),
            Ok(None) => {
                let operation = MultiLoadOperation::by_ids(ids);
                let resolved = self
                    .complete_load::<T>(&operation)
                    .map(|mut loaded| loaded.pop().flatten());
                Lazy::ready(self.id(), resolved)
            }
            Err(err) => Lazy::ready(self.id(), Err(err)),
        }
    }

    /// Deferred [`load_many`](Self::load_many).
    pub fn lazy_load_many<T: Entity, S: AsRef<str>>(
        &mut self,
        ids: &[S],
    ) -> Lazy<Vec<Option<EntityRef<T>>>> {
        let ids: Vec<Option<String>> = ids.iter().map(|id| Some(id.as_ref().to_string())).collect();
        match self.lazy_load_state::<T>(ids.clone()) {
            Ok(Some(state)) => self.enqueue(state, load_request, decode_load::<T, Tr>),
            Ok(None) => {
                let operation = MultiLoadOperation::by_ids(ids);
                let resolved = self.complete_load::<T>(&operation);
                Lazy::ready(self.id(), resolved)
            }
            Err(err) => Lazy::ready(self.id(), Err(err)),
        }
    }

    /// Deferred [`load_starting_with`](Self::load_starting_with); `page_size`
    /// defaults to [`DEFAULT_STARTS_WITH_PAGE_SIZE`].
    pub fn lazy_load_starting_with<T: Entity>(
        &mut self,
        prefix: &str,
        matches: Option<&str>,
        start: usize,
        page_size: Option<usize>,
    ) -> Lazy<Vec<EntityRef<T>>> {
        let state = LoadState {
            operation: self.new_load_operation(MultiLoadOperation::positional()),
            command: Command::LoadStartingWith {
                prefix: prefix.to_string(),
                matches: matches.map(str::to_string),
                start,
                page_size: page_size.unwrap_or(DEFAULT_STARTS_WITH_PAGE_SIZE),
            },
        };
        self.enqueue(state, load_request, decode_positional::<T, Tr>)
    }

    fn lazy_operation_for<T>(&self, query: &DocumentQuery<T>) -> Result<QueryOperation> {
        Ok(query
            .create_operation()?
            .allow_non_authoritative(self.config().allow_non_authoritative)
            .non_authoritative_timeout(self.non_authoritative_timeout()))
    }

    /// Deferred [`to_list`](Self::to_list). The query itself is not changed.
    pub fn lazy_query<T: Entity>(&mut self, query: &DocumentQuery<T>) -> Lazy<Vec<EntityRef<T>>> {
        match self.lazy_operation_for(query) {
            Ok(operation) => self.enqueue(operation, query_request, decode_query::<T, Tr>),
            Err(err) => Lazy::ready(self.id(), Err(err)),
        }
    }

    /// Deferred [`count`](Self::count).
    pub fn lazy_count<T: Entity>(&mut self, query: &DocumentQuery<T>) -> Lazy<u64> {
        match self.lazy_operation_for(&query.clone().take(0)) {
            Ok(operation) => self.enqueue(operation, query_request, decode_count::<Tr>),
            Err(err) => Lazy::ready(self.id(), Err(err)),
        }
    }

    /// Deferred [`facets`](Self::facets).
    pub fn lazy_facets<T: Entity>(
        &mut self,
        query: &DocumentQuery<T>,
        facets: &[Facet],
    ) -> Lazy<FacetResults> {
        match facets_command(query, facets) {
            Ok(command) => self.enqueue(command, facets_request, decode_facets::<Tr>),
            Err(err) => Lazy::ready(self.id(), Err(err)),
        }
    }

    /// Send every queued lazy operation, one batch per round, until none
    /// asks for a retry. Returns the number of round trips.
    ///
    /// When the batch itself fails, every operation in it fails and the
    /// error is returned.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(session = self.id()))]
    pub async fn execute_all_pending_lazy_operations(&mut self, cx: &Cx) -> Outcome<usize, Error> {
        let mut pending = std::mem::take(&mut self.lazy_operations);
        let mut round_trips = 0;

        while !pending.is_empty() {
            let mut batch = Vec::with_capacity(pending.len());
            let mut fragments = Vec::with_capacity(pending.len());
            for mut operation in pending {
                match operation.create_request() {
                    Ok(request) => {
                        fragments.push(request);
                        batch.push(operation);
                    }
                    Err(err) => operation.fail(err),
                }
            }
            if batch.is_empty() {
                break;
            }

            tracing::debug!(
                operations = batch.len(),
                round = round_trips + 1,
                "Executing lazy operations"
            );
            let command = Command::Multi(fragments);
            let sent = if round_trips == 0 {
                self.send(cx, &command).await
            } else {
                self.resend(cx, &command).await
            };
            let response = match sent {
                Outcome::Ok(response) => response,
                Outcome::Err(err) => {
                    for mut operation in batch {
                        operation.fail(batch_failure(&err));
                    }
                    return Outcome::Err(err);
                }
                Outcome::Cancelled(reason) => {
                    for mut operation in batch {
                        operation.fail(Error::Cancelled);
                    }
                    return Outcome::Cancelled(reason);
                }
                Outcome::Panicked(payload) => {
                    for mut operation in batch {
                        operation.fail(Error::Custom("lazy batch panicked".to_string()));
                    }
                    return Outcome::Panicked(payload);
                }
            };
            round_trips += 1;

            let responses = match response {
                Response::Multi(responses) if responses.len() == batch.len() => responses,
                other => {
                    let err = unexpected_response("multi", &other);
                    for mut operation in batch {
                        operation.fail(batch_failure(&err));
                    }
                    return Outcome::Err(err);
                }
            };

            pending = Vec::new();
            for (mut operation, response) in batch.into_iter().zip(responses) {
                let step = match response {
                    Response::Error { status, message } => Err(Error::Transport(TransportError {
                        kind: TransportErrorKind::Server,
                        message,
                        status: Some(status),
                        source: None,
                    })),
                    response => operation.handle_response(self, response),
                };
                match step {
                    Ok(LazyStep::Done) => {}
                    Ok(LazyStep::RequiresRetry) => pending.push(operation),
                    Err(err) => {
                        tracing::warn!(error = %err, "Lazy operation failed");
                        operation.fail(err);
                    }
                }
            }
        }

        Outcome::Ok(round_trips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockState, MockTransport, expect_err, unwrap_outcome};
    use asupersync::runtime::RuntimeBuilder;
    use docmodel_core::{Conventions, Document, QueryResult};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        id: Option<String>,
        name: String,
        age: u32,
    }

    impl Entity for User {}

    fn seeded() -> Arc<Mutex<MockState>> {
        let state = Arc::new(Mutex::new(MockState::default()));
        {
            let mut guard = state.lock().unwrap();
            guard.put("users/1", json!({"name": "A", "age": 1}));
            guard.put("users/2", json!({"name": "B", "age": 2}));
            guard.put("users/3", json!({"name": "C", "age": 3}));
            guard.put("users/bad", json!({"name": 5, "age": "x"}));
        }
        state
    }

    fn session_with(state: &Arc<Mutex<MockState>>) -> Session<MockTransport> {
        Session::new(
            MockTransport::new(Arc::clone(state)),
            Arc::new(Conventions::default()),
        )
    }

    fn multi_sizes(state: &Arc<Mutex<MockState>>) -> Vec<usize> {
        state
            .lock()
            .unwrap()
            .commands
            .iter()
            .map(|command| match command {
                Command::Multi(fragments) => fragments.len(),
                _ => 0,
            })
            .collect()
    }

    #[test]
    fn test_three_lazy_loads_share_one_round_trip() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = seeded();
        let mut session = session_with(&state);

        let first = session.lazy_load::<User>("users/1");
        let second = session.lazy_load::<User>("users/2");
        let third = session.lazy_load::<User>("users/3");
        assert_eq!(state.lock().unwrap().execute_calls, 0);
        assert_eq!(session.pending_lazy_operations(), 3);
        assert!(!third.is_value_created());

        rt.block_on(async {
            let b = unwrap_outcome(second.value(&cx, &mut session).await).unwrap();
            assert_eq!(b.read().unwrap().name, "B");
            assert!(first.is_value_created());
            assert!(third.is_value_created());
            let a = unwrap_outcome(first.value(&cx, &mut session).await).unwrap();
            assert_eq!(a.read().unwrap().name, "A");
            unwrap_outcome(third.value(&cx, &mut session).await).unwrap();
        });

        assert_eq!(multi_sizes(&state), vec![3]);
        assert_eq!(session.pending_lazy_operations(), 0);
    }

    #[test]
    fn test_loaded_and_missing_keys_resolve_without_fragment() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = seeded();
        let mut session = session_with(&state);

        rt.block_on(async {
            let loaded = unwrap_outcome(session.load::<User>(&cx, "users/1").await).unwrap();
            assert!(unwrap_outcome(session.load::<User>(&cx, "users/404").await).is_none());

            let again = session.lazy_load::<User>("users/1");
            let missing = session.lazy_load::<User>("users/404");
            assert!(again.is_value_created());
            assert!(missing.is_value_created());
            assert_eq!(session.pending_lazy_operations(), 0);

            let again = unwrap_outcome(again.value(&cx, &mut session).await).unwrap();
            assert!(Arc::ptr_eq(&again, &loaded));
            assert!(unwrap_outcome(missing.value(&cx, &mut session).await).is_none());
        });
        assert_eq!(state.lock().unwrap().execute_calls, 2);
    }

    #[test]
    fn test_failed_fragment_only_fails_its_handle() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = seeded();
        state.lock().unwrap().failing_keys.push("users/2".into());
        let mut session = session_with(&state);

        let good = session.lazy_load::<User>("users/1");
        let failing = session.lazy_load::<User>("users/2");
        let undecodable = session.lazy_load::<User>("users/bad");

        rt.block_on(async {
            let err = expect_err(failing.value(&cx, &mut session).await);
            assert!(matches!(err, Error::Transport(ref e) if e.status == Some(500)));
            let err = expect_err(undecodable.value(&cx, &mut session).await);
            assert!(matches!(err, Error::Conversion(_)));
            let user = unwrap_outcome(good.value(&cx, &mut session).await).unwrap();
            assert_eq!(user.read().unwrap().name, "A");
        });
        assert_eq!(multi_sizes(&state), vec![3]);
    }

    #[test]
    fn test_non_authoritative_fragment_is_rebatched() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = seeded();
        state.lock().unwrap().non_authoritative_loads = 1;
        let mut session = session_with(&state);

        let user = session.lazy_load::<User>("users/1");
        rt.block_on(async {
            let user = unwrap_outcome(user.value(&cx, &mut session).await).unwrap();
            assert_eq!(user.read().unwrap().name, "A");
        });
        assert_eq!(multi_sizes(&state), vec![1, 1]);
        assert_eq!(session.number_of_requests(), 1);
    }

    #[test]
    fn test_mixed_batch_with_continuation() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = seeded();
        {
            let mut guard = state.lock().unwrap();
            let doc = Document::from_json(json!({
                "name": "Q", "age": 9, "@metadata": {"@id": "users/9"}
            }))
            .unwrap();
            guard.query_results.push_back(QueryResult {
                results: vec![Some(doc)],
                total_results: 1,
                ..QueryResult::default()
            });
            guard.query_results.push_back(QueryResult {
                total_results: 42,
                ..QueryResult::default()
            });
        }
        let mut session = session_with(&state);
        let seen = Arc::new(AtomicU64::new(0));

        let query = session.query::<User>().where_greater_than("age", 5).unwrap();
        let listed = session.lazy_query(&query);
        let counted = {
            let seen = Arc::clone(&seen);
            session
                .lazy_count(&query)
                .on_eval(move |count| seen.store(*count, Ordering::SeqCst))
        };
        let facets = session.lazy_facets(&query, &[Facet::new("age")]);
        let many = session.lazy_load_many::<User, _>(&["users/1", "users/1", "users/404"]);
        let prefixed = session.lazy_load_starting_with::<User>("users/", None, 0, None);

        rt.block_on(async {
            let total = unwrap_outcome(counted.value(&cx, &mut session).await);
            assert_eq!(total, 42);
            assert_eq!(seen.load(Ordering::SeqCst), 42);

            let listed = unwrap_outcome(listed.value(&cx, &mut session).await);
            assert_eq!(listed[0].read().unwrap().name, "Q");
            unwrap_outcome(facets.value(&cx, &mut session).await);

            let many = unwrap_outcome(many.value(&cx, &mut session).await);
            assert!(Arc::ptr_eq(
                many[0].as_ref().unwrap(),
                many[1].as_ref().unwrap()
            ));
            assert!(many[2].is_none());

            let prefixed = prefixed.value(&cx, &mut session).await;
            assert!(matches!(prefixed, Outcome::Err(Error::Conversion(_))));
        });

        assert_eq!(multi_sizes(&state), vec![5]);
        let guard = state.lock().unwrap();
        let Command::Multi(fragments) = &guard.commands[0] else {
            panic!("expected a multi command");
        };
        assert!(matches!(
            &fragments[4],
            Command::LoadStartingWith { page_size, .. } if *page_size == DEFAULT_STARTS_WITH_PAGE_SIZE
        ));
    }

    #[test]
    fn test_transport_failure_fails_whole_batch() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = seeded();
        state.lock().unwrap().fail_next = true;
        let mut session = session_with(&state);

        let first = session.lazy_load::<User>("users/1");
        let second = session.lazy_load::<User>("users/2");
        rt.block_on(async {
            let err = expect_err(first.value(&cx, &mut session).await);
            assert!(matches!(err, Error::Transport(_)));
            assert!(second.is_value_created());
            let err = expect_err(second.value(&cx, &mut session).await);
            assert!(matches!(
                err,
                Error::Transport(ref e) if e.kind == TransportErrorKind::Unreachable
            ));
        });
    }

    #[test]
    fn test_deleted_key_fails_on_first_read() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = seeded();
        let mut session = session_with(&state);
        session.delete_by_id("users/1").unwrap();

        let lazy = session.lazy_load::<User>("users/1");
        rt.block_on(async {
            let err = expect_err(lazy.value(&cx, &mut session).await);
            assert!(matches!(
                err,
                Error::IdentityConflict(ref e)
                    if e.kind == docmodel_core::IdentityConflictKind::LoadDeleted
            ));
        });
        assert_eq!(state.lock().unwrap().execute_calls, 0);
    }

    #[test]
    fn test_handle_from_other_session_is_rejected() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = seeded();
        let mut first = session_with(&state);
        let mut second = session_with(&state);

        let lazy = first.lazy_load::<User>("users/1");
        rt.block_on(async {
            let err = expect_err(lazy.value(&cx, &mut second).await);
            assert!(matches!(err, Error::InvalidSessionState(_)));
        });
        assert_eq!(first.pending_lazy_operations(), 1);
    }

    #[test]
    fn test_continuation_runs_without_holding_the_handle_lock() {
        let (lazy, cell) = Lazy::<u64>::pending(1);
        let observed = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&observed);
        let inner = Arc::clone(&cell);
        let lazy = lazy.on_eval(move |value| {
            let unlocked = inner.try_lock().is_ok();
            seen.store(if unlocked { *value } else { u64::MAX }, Ordering::SeqCst);
        });

        fulfill(&cell, Ok(7));
        assert_eq!(observed.load(Ordering::SeqCst), 7);
        assert!(lazy.is_value_created());
    }

    #[test]
    fn test_continuation_on_ready_value_runs_unlocked_and_keeps_value() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = seeded();
        let mut session = session_with(&state);

        let lazy = Lazy::ready(session.id(), Ok(3_u64));
        let inner = Arc::clone(&lazy.cell);
        let observed = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&observed);
        let lazy = lazy.on_eval(move |value| {
            let unlocked = inner.try_lock().is_ok();
            seen.store(if unlocked { *value } else { u64::MAX }, Ordering::SeqCst);
        });
        assert_eq!(observed.load(Ordering::SeqCst), 3);

        rt.block_on(async {
            assert_eq!(unwrap_outcome(lazy.value(&cx, &mut session).await), 3);
        });
        assert_eq!(state.lock().unwrap().execute_calls, 0);
    }
}
