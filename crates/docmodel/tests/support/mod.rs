//! In-memory document server shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use docmodel::constants::METADATA_ETAG;
use docmodel::{
    BatchCommand, BatchResult, Command, Cx, Document, Error, Etag, MultiLoadResult, Outcome,
    QueryResult, Response, Transport,
};
use serde_json::{Value as JsonValue, json};

#[derive(Debug, Default)]
pub struct Server {
    documents: BTreeMap<String, Document>,
    pub queries: VecDeque<QueryResult>,
    pub commands: Vec<Command>,
    next_etag: u64,
}

impl Server {
    pub fn shared() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::default()))
    }

    pub fn put(&mut self, key: &str, body: JsonValue) {
        self.next_etag += 1;
        let mut document = Document::from_json(body).expect("object body");
        document.set_metadata("@id", json!(key)).expect("mutable");
        document
            .set_metadata(METADATA_ETAG, json!(self.next_etag))
            .expect("mutable");
        self.documents.insert(key.to_lowercase(), document.frozen());
    }

    pub fn get(&self, key: &str) -> Option<&Document> {
        self.documents.get(&key.to_lowercase())
    }

    pub fn requests(&self) -> usize {
        self.commands.len()
    }

    fn answer(&mut self, command: &Command) -> Response {
        match command {
            Command::Load { ids, .. } => Response::Load(MultiLoadResult {
                results: ids
                    .iter()
                    .map(|id| self.documents.get(&id.to_lowercase()).cloned())
                    .collect(),
                ..MultiLoadResult::default()
            }),
            Command::Query { .. } => {
                Response::Query(self.queries.pop_front().unwrap_or_default())
            }
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
            other => Response::Error {
                status: 501,
                message: format!("unsupported command: {}", other.kind()),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryTransport {
    pub server: Arc<Mutex<Server>>,
}

impl Transport for InMemoryTransport {
    fn execute(
        &self,
        _cx: &Cx,
        command: &Command,
    ) -> impl Future<Output = Outcome<Response, Error>> + Send {
        let server = Arc::clone(&self.server);
        let command = command.clone();
        async move {
            let mut guard = server.lock().expect("lock poisoned");
            guard.commands.push(command.clone());
            Outcome::Ok(guard.answer(&command))
        }
    }
}

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        Outcome::Ok(_) => panic!("expected an error, got a value"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}
