//! In-memory transport for session unit tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use docmodel_core::constants::{METADATA_ETAG, METADATA_NON_AUTHORITATIVE};
use docmodel_core::{
    BatchCommand, BatchResult, Command, Cx, Document, Error, Etag, FacetResults, MultiLoadResult,
    Outcome, QueryResult, Response, Transport,
};
use serde_json::{Value as JsonValue, json};

#[derive(Debug, Default)]
pub(crate) struct MockState {
    /// Stored documents keyed by lower-cased key.
    pub documents: BTreeMap<String, Document>,
    pub commands: Vec<Command>,
    pub execute_calls: usize,
    /// Answers for query commands, in order; empty results once drained.
    pub query_results: VecDeque<QueryResult>,
    pub facet_results: FacetResults,
    /// Number of load answers still flagged non-authoritative.
    pub non_authoritative_loads: usize,
    /// Keys whose load fragment fails inside a multi request.
    pub failing_keys: Vec<String>,
    /// Fail the next call at the transport level.
    pub fail_next: bool,
    next_etag: u64,
}

impl MockState {
    pub fn put(&mut self, key: &str, body: JsonValue) {
        self.next_etag += 1;
        let mut document = Document::from_json(body).expect("object body");
        document.set_metadata("@id", json!(key)).expect("mutable");
        document
            .set_metadata(METADATA_ETAG, json!(self.next_etag))
            .expect("mutable");
        self.documents.insert(key.to_lowercase(), document.frozen());
    }

    fn answer(&mut self, command: &Command) -> Response {
        match command {
            Command::Load { ids, includes } => {
                if ids
                    .iter()
                    .any(|id| self.failing_keys.iter().any(|k| k.eq_ignore_ascii_case(id)))
                {
                    return Response::Error {
                        status: 500,
                        message: "load failed".into(),
                    };
                }
                let flagged = self.non_authoritative_loads > 0;
                self.non_authoritative_loads = self.non_authoritative_loads.saturating_sub(1);
                let results: Vec<Option<Document>> = ids
                    .iter()
                    .map(|id| {
                        self.documents.get(&id.to_lowercase()).map(|doc| {
                            let mut doc = doc.snapshot();
                            if flagged {
                                doc.set_metadata(METADATA_NON_AUTHORITATIVE, json!(true))
                                    .expect("mutable");
                            }
                            doc.frozen()
                        })
                    })
                    .collect();
                let included = results
                    .iter()
                    .flatten()
                    .flat_map(|doc| {
                        includes
                            .iter()
                            .filter_map(|path| doc.get(path).and_then(JsonValue::as_str))
                            .filter_map(|key| self.documents.get(&key.to_lowercase()).cloned())
                            .collect::<Vec<_>>()
                    })
                    .collect();
                Response::Load(MultiLoadResult {
                    results,
                    includes: included,
                    non_authoritative: false,
                })
            }
            Command::LoadStartingWith {
                prefix,
                start,
                page_size,
                ..
            } => {
                let prefix = prefix.to_lowercase();
                let results = self
                    .documents
                    .iter()
                    .filter(|(key, _)| key.starts_with(&prefix))
                    .skip(*start)
                    .take(*page_size)
                    .map(|(_, doc)| Some(doc.clone()))
                    .collect();
                Response::Load(MultiLoadResult {
                    results,
                    ..MultiLoadResult::default()
                })
            }
            Command::Query { .. } => {
                Response::Query(self.query_results.pop_front().unwrap_or_default())
            }
            Command::Facets { .. } => Response::Facets(self.facet_results.clone()),
            Command::Batch(commands) => {
                let mut results = Vec::new();
                for command in commands {
                    match command {
                        BatchCommand::Put { key, document, .. } => {
                            self.next_etag += 1;
                            let mut stored = document.snapshot();
                            stored
                                .set_metadata(METADATA_ETAG, json!(self.next_etag))
                                .expect("mutable");
                            self.documents.insert(key.to_lowercase(), stored.frozen());
                            results.push(BatchResult {
                                key: key.clone(),
                                etag: Some(Etag(self.next_etag)),
                                deleted: false,
                            });
                        }
                        BatchCommand::Delete { key, .. } => {
                            self.documents.remove(&key.to_lowercase());
                            results.push(BatchResult {
                                key: key.clone(),
                                etag: None,
                                deleted: true,
                            });
                        }
                    }
                }
                Response::Batch(results)
            }
            Command::Multi(fragments) => {
                Response::Multi(fragments.iter().map(|f| self.answer(f)).collect())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MockTransport {
    pub state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new(state: Arc<Mutex<MockState>>) -> Self {
        Self { state }
    }
}

impl Transport for MockTransport {
    fn execute(
        &self,
        _cx: &Cx,
        command: &Command,
    ) -> impl Future<Output = Outcome<Response, Error>> + Send {
        let state = Arc::clone(&self.state);
        let command = command.clone();
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            guard.execute_calls += 1;
            guard.commands.push(command.clone());
            if guard.fail_next {
                guard.fail_next = false;
                return Outcome::Err(Error::Transport(docmodel_core::TransportError {
                    kind: docmodel_core::TransportErrorKind::Unreachable,
                    message: "connection refused".into(),
                    status: None,
                    source: None,
                }));
            }
            Outcome::Ok(guard.answer(&command))
        }
    }
}

pub(crate) fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
    }
}

pub(crate) fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => std::panic::panic_any(format!("expected an error, got: {other:?}")),
    }
}
