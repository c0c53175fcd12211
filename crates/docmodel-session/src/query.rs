//! Query execution against the session's transport.
//!
//! The session drives a [`QueryOperation`] until it accepts a result or gives
//! up, then turns the accepted documents into entities. Documents with a key
//! are tracked unless the query is a projection or untracked.

use std::sync::{Arc, RwLock};

use asupersync::{Cx, Outcome};
use docmodel_core::{
    Command, Entity, Error, Facet, FacetResults, QueryResult, QueryStateErrorKind, Response,
    Result, Transport, entity_from_json,
};
use docmodel_query::{DocumentQuery, QueryOperation, QueryVerdict};

use crate::identity_map::EntityRef;
use crate::multi_load::unexpected_response;
use crate::{Session, try_outcome, try_result};

impl<Tr: Transport> Session<Tr> {
    /// Dynamic query over the collection of `T`.
    pub fn query<T: Entity>(&self) -> DocumentQuery<T> {
        self.prepare_query(DocumentQuery::for_collection(Arc::clone(self.conventions())))
    }

    /// Query against a static index.
    pub fn query_index<T: Entity>(&self, index_name: &str) -> DocumentQuery<T> {
        self.prepare_query(DocumentQuery::for_index(
            Arc::clone(self.conventions()),
            index_name,
        ))
    }

    /// Dynamic query across every collection.
    pub fn query_all<T: Entity>(&self) -> DocumentQuery<T> {
        self.prepare_query(DocumentQuery::for_all_documents(Arc::clone(
            self.conventions(),
        )))
    }

    fn prepare_query<T>(&self, mut query: DocumentQuery<T>) -> DocumentQuery<T> {
        if !self.config().caching_enabled {
            query = query.no_caching();
        }
        if !self.config().tracking_enabled {
            query = query.no_tracking();
        }
        query
    }

    /// Run a query and return its entities.
    ///
    /// Re-sends the query while results are stale (when waiting for non-stale
    /// results) or non-authoritative, within the respective timeouts. Once the
    /// query has finished, later calls replay the same outcome without a
    /// round trip.
    #[tracing::instrument(level = "debug", skip(self, cx, query), fields(target = %query.target_name()))]
    pub async fn to_list<T: Entity>(
        &mut self,
        cx: &Cx,
        query: &mut DocumentQuery<T>,
    ) -> Outcome<Vec<EntityRef<T>>, Error> {
        try_outcome!(self.execute_query(cx, query).await);
        let Some(operation) = query.operation() else {
            return Outcome::Err(not_executed());
        };
        Outcome::Ok(try_result!(self.materialize_query::<T>(operation)))
    }

    /// First entity of the query, if any. Does not change `query`.
    pub async fn first<T: Entity>(
        &mut self,
        cx: &Cx,
        query: &DocumentQuery<T>,
    ) -> Outcome<Option<EntityRef<T>>, Error> {
        let mut single = query.clone().take(1);
        let list = try_outcome!(self.to_list(cx, &mut single).await);
        Outcome::Ok(list.into_iter().next())
    }

    /// Total number of matches, without fetching documents.
    pub async fn count<T: Entity>(
        &mut self,
        cx: &Cx,
        query: &DocumentQuery<T>,
    ) -> Outcome<u64, Error> {
        let mut counting = query.clone().take(0);
        try_outcome!(self.execute_query(cx, &mut counting).await);
        let result = try_result!(accepted_result(counting.operation()));
        Outcome::Ok(result.total_results)
    }

    /// Facet counts over the query's matches.
    #[tracing::instrument(level = "debug", skip(self, cx, query, facets))]
    pub async fn facets<T: Entity>(
        &mut self,
        cx: &Cx,
        query: &DocumentQuery<T>,
        facets: &[Facet],
    ) -> Outcome<FacetResults, Error> {
        let command = try_result!(facets_command(query, facets));
        match try_outcome!(self.send(cx, &command).await) {
            Response::Facets(results) => Outcome::Ok(results),
            other => Outcome::Err(unexpected_response("facets", &other)),
        }
    }

    pub(crate) async fn execute_query<T>(
        &mut self,
        cx: &Cx,
        query: &mut DocumentQuery<T>,
    ) -> Outcome<(), Error> {
        let allow = self.config().allow_non_authoritative;
        let timeout = self.non_authoritative_timeout();
        try_result!(query.init_operation_with(|operation| {
            operation
                .allow_non_authoritative(allow)
                .non_authoritative_timeout(timeout)
        }));

        loop {
            let operation = try_result!(query.init_operation());
            if operation.is_finished() {
                return Outcome::Ok(());
            }
            let retry = operation.attempts() > 0;
            let command = try_result!(operation.create_request());
            let response = if retry {
                try_outcome!(self.resend(cx, &command).await)
            } else {
                try_outcome!(self.send(cx, &command).await)
            };
            let result = try_result!(expect_query(response));
            let operation = try_result!(query.init_operation());
            match try_result!(operation.evaluate(result)) {
                QueryVerdict::Accepted => return Outcome::Ok(()),
                QueryVerdict::Retry => continue,
            }
        }
    }

    /// Entities for the accepted result of `operation`; replays its failure.
    pub(crate) fn materialize_query<T: Entity>(
        &mut self,
        operation: &QueryOperation,
    ) -> Result<Vec<EntityRef<T>>> {
        let result = accepted_result(Some(operation))?;
        for include in &result.includes {
            self.identity_map_mut().register_included(include.clone());
        }

        let mut entities = Vec::with_capacity(result.results.len());
        for document in result.results.iter().flatten() {
            let entity = match operation.tracking_key(document) {
                Some(key) => self.track_document::<T>(key, document)?,
                None => {
                    let entity: T = entity_from_json(operation.entity_body(document), document.id())?;
                    Arc::new(RwLock::new(entity))
                }
            };
            entities.push(entity);
        }
        tracing::debug!(
            index = operation.index_name(),
            results = entities.len(),
            attempts = operation.attempts(),
            "Query materialized"
        );
        Ok(entities)
    }
}

pub(crate) fn facets_command<T>(query: &DocumentQuery<T>, facets: &[Facet]) -> Result<Command> {
    Ok(Command::Facets {
        index_name: query.target_name(),
        query: query.index_query()?,
        facets: facets.to_vec(),
    })
}

pub(crate) fn expect_query(response: Response) -> Result<QueryResult> {
    match response {
        Response::Query(result) => Ok(result),
        other => Err(unexpected_response("query", &other)),
    }
}

pub(crate) fn accepted_result(operation: Option<&QueryOperation>) -> Result<&QueryResult> {
    operation
        .map(QueryOperation::result)
        .transpose()?
        .flatten()
        .ok_or_else(not_executed)
}

fn not_executed() -> Error {
    Error::query_state(QueryStateErrorKind::Failed, "query has not been executed")
}
