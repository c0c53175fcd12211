//! Multi-load merge engine.
//!
//! A load request may name the same id several times, or not at all (`None`
//! slots). The server answers with an unordered, possibly sparse list of
//! documents. [`MultiLoadOperation`] maps every requested id to its positions
//! and rebuilds a positional result: duplicate positions share one tracked
//! entity, ids the server did not return become `None` and are remembered as
//! confirmed missing.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use asupersync::{Cx, Outcome};
use docmodel_core::{
    Command, Document, Entity, Error, MultiLoadResult, Response, Result, TimeoutError, Transport,
    TransportError, TransportErrorKind,
};

use crate::identity_map::{EntityRef, normalize_key};
use crate::{Session, try_outcome, try_result};

/// Positions of one id in the requested list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Positions {
    Single(usize),
    Multiple(Vec<usize>),
}

impl Positions {
    pub fn as_slice(&self) -> &[usize] {
        match self {
            Positions::Single(position) => std::slice::from_ref(position),
            Positions::Multiple(positions) => positions,
        }
    }

    fn push(&mut self, position: usize) {
        match self {
            Positions::Single(first) => *self = Positions::Multiple(vec![*first, position]),
            Positions::Multiple(positions) => positions.push(position),
        }
    }
}

/// What to do after a load response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadVerdict {
    Done,
    /// Send the same request again.
    Requery,
}

/// State of one load-by-ids or load-starting-with call.
#[derive(Debug)]
pub struct MultiLoadOperation {
    /// Requested ids; `None` for loads without an id list.
    ids: Option<Vec<Option<String>>>,
    positions: HashMap<String, Positions>,
    allow_non_authoritative: bool,
    non_authoritative_timeout: Duration,
    started_at: Option<Instant>,
    attempts: u32,
    result: Option<MultiLoadResult>,
}

impl MultiLoadOperation {
    /// Load by ids, possibly duplicated or `None`.
    pub fn by_ids(ids: Vec<Option<String>>) -> Self {
        let mut positions: HashMap<String, Positions> = HashMap::new();
        for (index, id) in ids.iter().enumerate() {
            let Some(id) = id else { continue };
            positions
                .entry(normalize_key(id))
                .and_modify(|p| p.push(index))
                .or_insert(Positions::Single(index));
        }
        Self {
            ids: Some(ids),
            positions,
            allow_non_authoritative: false,
            non_authoritative_timeout: Duration::from_secs(5),
            started_at: None,
            attempts: 0,
            result: None,
        }
    }

    /// Load without an id list; results are positional.
    pub fn positional() -> Self {
        Self {
            ids: None,
            positions: HashMap::new(),
            allow_non_authoritative: false,
            non_authoritative_timeout: Duration::from_secs(5),
            started_at: None,
            attempts: 0,
            result: None,
        }
    }

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

    pub fn ids(&self) -> Option<&[Option<String>]> {
        self.ids.as_deref()
    }

    pub fn positions(&self, id: &str) -> Option<&Positions> {
        self.positions.get(&normalize_key(id))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Mark a request as sent. The clock starts on the first one.
    pub fn enter_load_context(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
        self.attempts += 1;
        if let Some(ids) = &self.ids {
            tracing::debug!(
                ids = ?ids.iter().flatten().collect::<Vec<_>>(),
                attempt = self.attempts,
                "Bulk loading ids"
            );
        }
    }

    /// Take a response. Asks for a requery while non-authoritative documents
    /// keep arriving and the non-authoritative timeout has not run out.
    pub fn set_result(&mut self, result: MultiLoadResult) -> Result<LoadVerdict> {
        if !self.allow_non_authoritative && result.has_non_authoritative() {
            let elapsed = self.started_at.map_or(Duration::ZERO, |start| start.elapsed());
            if elapsed >= self.non_authoritative_timeout {
                return Err(Error::NonAuthoritativeTimeout(TimeoutError {
                    elapsed,
                    timeout: self.non_authoritative_timeout,
                    target: self
                        .ids
                        .as_ref()
                        .map(|ids| {
                            ids.iter()
                                .flatten()
                                .map(String::as_str)
                                .collect::<Vec<_>>()
                                .join(", ")
                        })
                        .unwrap_or_default(),
                    index_name: None,
                }));
            }
            tracing::debug!(
                elapsed_ms = elapsed.as_millis() as u64,
                attempt = self.attempts,
                "Non-authoritative documents, requerying"
            );
            return Ok(LoadVerdict::Requery);
        }
        self.result = Some(result);
        Ok(LoadVerdict::Done)
    }

    pub fn result(&self) -> Option<&MultiLoadResult> {
        self.result.as_ref()
    }

    /// For every requested position, the index of the returned document that
    /// fills it. Independent of the order of `documents`.
    pub fn assign(&self, documents: &[Option<Document>]) -> Vec<Option<usize>> {
        let Some(ids) = &self.ids else {
            return documents
                .iter()
                .enumerate()
                .map(|(index, doc)| doc.as_ref().map(|_| index))
                .collect();
        };
        let mut assigned = vec![None; ids.len()];
        for (index, document) in documents.iter().enumerate() {
            let Some(id) = document.as_ref().and_then(Document::id) else {
                continue;
            };
            if let Some(positions) = self.positions(id) {
                for &position in positions.as_slice() {
                    assigned[position] = Some(index);
                }
            }
        }
        assigned
    }
}

impl<Tr: Transport> Session<Tr> {
    /// Load one document by key.
    ///
    /// Returns the tracked instance without a round trip when the key is
    /// already loaded, and `None` without a round trip when the key is known
    /// to be missing.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn load<T: Entity>(&mut self, cx: &Cx, id: &str) -> Outcome<Option<EntityRef<T>>, Error> {
        let mut loaded = try_outcome!(self.load_internal::<T>(cx, vec![Some(id.to_string())], &[]).await);
        Outcome::Ok(loaded.pop().flatten())
    }

    /// Load documents by key. The result has one slot per requested id, in
    /// request order; duplicate ids share one instance.
    #[tracing::instrument(level = "debug", skip(self, cx, ids))]
    pub async fn load_many<T: Entity, S: AsRef<str>>(
        &mut self,
        cx: &Cx,
        ids: &[S],
    ) -> Outcome<Vec<Option<EntityRef<T>>>, Error> {
        let ids = ids.iter().map(|id| Some(id.as_ref().to_string())).collect();
        self.load_internal::<T>(cx, ids, &[]).await
    }

    /// Load documents by key, with `None` slots kept as `None`.
    pub async fn load_many_optional<T: Entity>(
        &mut self,
        cx: &Cx,
        ids: &[Option<&str>],
    ) -> Outcome<Vec<Option<EntityRef<T>>>, Error> {
        let ids = ids.iter().map(|id| id.map(str::to_string)).collect();
        self.load_internal::<T>(cx, ids, &[]).await
    }

    /// Load documents and ask the server to return the documents referenced
    /// by `includes` in the same round trip.
    #[tracing::instrument(level = "debug", skip(self, cx, ids))]
    pub async fn load_with_includes<T: Entity, S: AsRef<str>>(
        &mut self,
        cx: &Cx,
        ids: &[S],
        includes: &[&str],
    ) -> Outcome<Vec<Option<EntityRef<T>>>, Error> {
        let ids = ids.iter().map(|id| Some(id.as_ref().to_string())).collect();
        self.load_internal::<T>(cx, ids, includes).await
    }

    /// Load documents whose key starts with `prefix`.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn load_starting_with<T: Entity>(
        &mut self,
        cx: &Cx,
        prefix: &str,
        matches: Option<&str>,
        start: usize,
        page_size: usize,
    ) -> Outcome<Vec<EntityRef<T>>, Error> {
        let command = Command::LoadStartingWith {
            prefix: prefix.to_string(),
            matches: matches.map(str::to_string),
            start,
            page_size,
        };
        let mut operation = self.new_load_operation(MultiLoadOperation::positional());
        try_outcome!(self.run_load(cx, &command, &mut operation).await);
        let loaded = try_result!(self.complete_load::<T>(&operation));
        Outcome::Ok(loaded.into_iter().flatten().collect())
    }

    async fn load_internal<T: Entity>(
        &mut self,
        cx: &Cx,
        ids: Vec<Option<String>>,
        includes: &[&str],
    ) -> Outcome<Vec<Option<EntityRef<T>>>, Error> {
        let fetch = try_result!(self.plan_load::<T>(&ids));
        let mut operation = self.new_load_operation(MultiLoadOperation::by_ids(ids));
        if !fetch.is_empty() {
            let command = Command::Load {
                ids: fetch,
                includes: includes.iter().map(|path| (*path).to_string()).collect(),
            };
            try_outcome!(self.run_load(cx, &command, &mut operation).await);
        }
        Outcome::Ok(try_result!(self.complete_load::<T>(&operation)))
    }

    /// Ids that need a round trip: neither tracked, included nor known to be
    /// missing. Fails for ids marked for deletion.
    pub(crate) fn plan_load<T: Entity>(&mut self, ids: &[Option<String>]) -> Result<Vec<String>> {
        self.ensure_not_deleted(ids.iter().flatten())?;
        let mut fetch: Vec<String> = Vec::new();
        for id in ids.iter().flatten() {
            if self.resolve_locally::<T>(id)?.is_some() || self.identity_map().is_missing(id) {
                continue;
            }
            if !fetch.iter().any(|queued| queued.eq_ignore_ascii_case(id)) {
                fetch.push(id.clone());
            }
        }
        Ok(fetch)
    }

    pub(crate) fn new_load_operation(&self, operation: MultiLoadOperation) -> MultiLoadOperation {
        operation
            .allow_non_authoritative(self.config().allow_non_authoritative)
            .non_authoritative_timeout(self.non_authoritative_timeout())
    }

    async fn run_load(
        &mut self,
        cx: &Cx,
        command: &Command,
        operation: &mut MultiLoadOperation,
    ) -> Outcome<(), Error> {
        loop {
            operation.enter_load_context();
            let response = if operation.attempts() > 1 {
                try_outcome!(self.resend(cx, command).await)
            } else {
                try_outcome!(self.send(cx, command).await)
            };
            let result = try_result!(expect_load(response));
            match try_result!(operation.set_result(result)) {
                LoadVerdict::Done => return Outcome::Ok(()),
                LoadVerdict::Requery => continue,
            }
        }
    }

    /// Turn the accepted result of `operation` into tracked entities.
    ///
    /// Includes are registered first; positions whose id the server did not
    /// return are `None` and their ids become confirmed missing.
    pub(crate) fn complete_load<T: Entity>(
        &mut self,
        operation: &MultiLoadOperation,
    ) -> Result<Vec<Option<EntityRef<T>>>> {
        let empty = MultiLoadResult::default();
        let result = operation.result().unwrap_or(&empty);

        for include in &result.includes {
            self.identity_map_mut().register_included(include.clone());
        }

        let assigned = operation.assign(&result.results);
        let mut tracked: HashMap<usize, EntityRef<T>> = HashMap::new();
        let mut finished = Vec::with_capacity(assigned.len());
        for (position, slot) in assigned.iter().enumerate() {
            let entity = match slot {
                Some(index) => match tracked.get(index) {
                    Some(entity) => Some(entity.clone()),
                    None => {
                        let Some(document) = result.results[*index].as_ref() else {
                            finished.push(None);
                            continue;
                        };
                        let key = document.id().unwrap_or_default().to_string();
                        let entity = self.track_document::<T>(&key, document)?;
                        tracked.insert(*index, entity.clone());
                        Some(entity)
                    }
                },
                None => match operation.ids().and_then(|ids| ids[position].as_deref()) {
                    Some(id) => self.resolve_locally::<T>(id)?,
                    None => None,
                },
            };
            finished.push(entity);
        }

        if let Some(ids) = operation.ids() {
            for (id, entity) in ids.iter().zip(&finished) {
                if let (Some(id), None) = (id, entity) {
                    self.identity_map_mut().register_missing(id);
                }
            }
        }
        Ok(finished)
    }

    /// Entity for `id` from the identity map or the included documents.
    pub(crate) fn resolve_locally<T: Entity>(&mut self, id: &str) -> Result<Option<EntityRef<T>>> {
        if let Some(entity) = self.identity_map().get::<T>(id)? {
            return Ok(Some(entity));
        }
        match self.identity_map_mut().take_included(id) {
            Some(document) => {
                tracing::trace!(key = id, "Materializing included document");
                self.track_document::<T>(id, &document).map(Some)
            }
            None => Ok(None),
        }
    }
}

pub(crate) fn expect_load(response: Response) -> Result<MultiLoadResult> {
    match response {
        Response::Load(result) => Ok(result),
        other => Err(unexpected_response("load", &other)),
    }
}

pub(crate) fn unexpected_response(expected: &str, response: &Response) -> Error {
    Error::Transport(TransportError {
        kind: TransportErrorKind::UnexpectedResponse,
        message: format!("expected a {} response, got {}", expected, response.kind()),
        status: None,
        source: None,
    })
}
