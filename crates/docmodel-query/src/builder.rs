//! Fluent document query builder.
//!
//! [`DocumentQuery`] accumulates predicate, ordering, grouping and projection
//! calls as [`QueryToken`]s and renders them into query text plus a
//! [`Parameters`] table. One builder type serves every result type; projection
//! with [`DocumentQuery::select_fields`] moves the state into a builder over the
//! projected type.
//!
//! # Example
//!
//! ```ignore
//! let query = DocumentQuery::<User>::for_collection(conventions)
//!     .where_equals("Name", "Ayende")?
//!     .where_greater_than("Age", 30)?
//!     .order_by_descending("Age")?;
//!
//! assert_eq!(
//!     query.to_query_text()?,
//!     "FROM Users WHERE Name = $p0 AND Age > $p1 ORDER BY Age DESC"
//! );
//! ```

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use docmodel_core::constants::{ALL_DOCUMENTS_COLLECTION, DOCUMENT_ID_FIELD_NAME};
use docmodel_core::{
    Conventions, Entity, Error, Etag, IndexQuery, OrderingType, Parameters, QueryStateErrorKind,
    Result,
};
use serde_json::Value as JsonValue;

use crate::clause::{
    OrderDirection, QueryOperator, SearchOperator, SpatialCriteria, SpatialRelation, SpatialShape,
    SpatialUnits,
};
use crate::operation::{QueryOperation, QueryStatistics};
use crate::token::{
    OrderByToken, QueryToken, SelectToken, ShapeToken, WhereKind, WhereToken, escape_field,
};

/// A query over documents of type `T`.
#[derive(Debug)]
pub struct DocumentQuery<T> {
    conventions: Arc<Conventions>,
    index_name: Option<String>,
    collection_name: Option<String>,
    alias: Option<String>,
    identity_property: Option<String>,
    where_tokens: Vec<QueryToken>,
    order_by_tokens: Vec<QueryToken>,
    group_by_tokens: Vec<QueryToken>,
    select_tokens: Vec<QueryToken>,
    load_tokens: Vec<QueryToken>,
    includes: Vec<String>,
    parameters: Parameters,
    default_operator: QueryOperator,
    negate: bool,
    clause_depth: i32,
    is_intersect: bool,
    is_group_by: bool,
    raw_query: Option<String>,
    start: usize,
    page_size: Option<usize>,
    wait_for_non_stale: bool,
    cutoff_etag: Option<Etag>,
    timeout: Option<Duration>,
    disable_tracking: bool,
    disable_caching: bool,
    projection_fields: Vec<String>,
    operation: Option<QueryOperation>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> DocumentQuery<T> {
    /// Dynamic query over the collection conventions assign to `T`.
    pub fn for_collection(conventions: Arc<Conventions>) -> Self {
        let collection = conventions.collection_name::<T>();
        Self::new(conventions, None, Some(collection))
    }

    /// Query against a named static index.
    pub fn for_index(conventions: Arc<Conventions>, index_name: impl Into<String>) -> Self {
        Self::new(conventions, Some(index_name.into()), None)
    }

    /// Dynamic query spanning every collection.
    pub fn for_all_documents(conventions: Arc<Conventions>) -> Self {
        Self::new(conventions, None, None)
    }

    fn new(
        conventions: Arc<Conventions>,
        index_name: Option<String>,
        collection_name: Option<String>,
    ) -> Self {
        let identity_property = conventions.identity_property::<T>();
        Self {
            conventions,
            index_name,
            collection_name,
            alias: None,
            identity_property,
            where_tokens: Vec::new(),
            order_by_tokens: Vec::new(),
            group_by_tokens: Vec::new(),
            select_tokens: Vec::new(),
            load_tokens: Vec::new(),
            includes: Vec::new(),
            parameters: Parameters::new(),
            default_operator: QueryOperator::And,
            negate: false,
            clause_depth: 0,
            is_intersect: false,
            is_group_by: false,
            raw_query: None,
            start: 0,
            page_size: None,
            wait_for_non_stale: false,
            cutoff_etag: None,
            timeout: None,
            disable_tracking: false,
            disable_caching: false,
            projection_fields: Vec::new(),
            operation: None,
            _marker: PhantomData,
        }
    }

    /// Project results into another type, keeping every other setting.
    ///
    /// Fields that name the identity property of `T` select the document key.
    pub fn select_fields<P: Entity>(self, fields: &[&str]) -> Result<DocumentQuery<P>> {
        let pairs: Vec<(&str, &str)> = fields.iter().map(|field| (*field, *field)).collect();
        self.select_fields_as(&pairs)
    }

    /// Project `(field, projected name)` pairs into another type.
    pub fn select_fields_as<P: Entity>(mut self, fields: &[(&str, &str)]) -> Result<DocumentQuery<P>> {
        self.assert_no_raw_query()?;
        for (field, projection) in fields {
            let name = self.ensure_valid_field_name(field);
            let alias = (name != *projection).then(|| (*projection).to_string());
            self.select_tokens
                .push(QueryToken::Select(SelectToken::Field { name, alias }));
            self.projection_fields.push((*projection).to_string());
        }
        Ok(self.retype())
    }
}

impl<T> DocumentQuery<T> {
    fn retype<P: Entity>(self) -> DocumentQuery<P> {
        DocumentQuery {
            conventions: self.conventions,
            index_name: self.index_name,
            collection_name: self.collection_name,
            alias: self.alias,
            identity_property: self.identity_property,
            where_tokens: self.where_tokens,
            order_by_tokens: self.order_by_tokens,
            group_by_tokens: self.group_by_tokens,
            select_tokens: self.select_tokens,
            load_tokens: self.load_tokens,
            includes: self.includes,
            parameters: self.parameters,
            default_operator: self.default_operator,
            negate: self.negate,
            clause_depth: self.clause_depth,
            is_intersect: self.is_intersect,
            is_group_by: self.is_group_by,
            raw_query: self.raw_query,
            start: self.start,
            page_size: self.page_size,
            wait_for_non_stale: self.wait_for_non_stale,
            cutoff_etag: self.cutoff_etag,
            timeout: self.timeout,
            disable_tracking: self.disable_tracking,
            disable_caching: self.disable_caching,
            projection_fields: self.projection_fields,
            operation: None,
            _marker: PhantomData,
        }
    }

    // ------------------------------------------------------------------
    // Equality and ranges
    // ------------------------------------------------------------------

    /// Case-insensitive equality.
    pub fn where_equals(self, field: &str, value: impl Into<JsonValue>) -> Result<Self> {
        self.where_equality(field, value.into(), false, false)
    }

    /// Case-sensitive equality.
    pub fn where_equals_exact(self, field: &str, value: impl Into<JsonValue>) -> Result<Self> {
        self.where_equality(field, value.into(), true, false)
    }

    /// Negated equality, rendered as `field != $p`.
    pub fn where_not_equals(self, field: &str, value: impl Into<JsonValue>) -> Result<Self> {
        self.where_equality(field, value.into(), false, true)
    }

    fn where_equality(
        mut self,
        field: &str,
        value: JsonValue,
        exact: bool,
        not_equals: bool,
    ) -> Result<Self> {
        self.assert_no_raw_query()?;
        let field = self.ensure_valid_field_name(field);
        // A pending negation flips the comparison instead of emitting NOT.
        let not_equals = if self.negate {
            self.negate = false;
            !not_equals
        } else {
            not_equals
        };
        self.append_operator_if_needed();
        let param = self.parameters.add(value);
        let kind = if not_equals {
            WhereKind::NotEquals(param)
        } else {
            WhereKind::Equals(param)
        };
        self.where_tokens
            .push(QueryToken::Where(WhereToken::new(field, kind).exact(exact)));
        Ok(self)
    }

    /// Matches values above `value`. A null bound becomes `*`.
    pub fn where_greater_than(self, field: &str, value: impl Into<JsonValue>) -> Result<Self> {
        let value = range_value(value.into(), "*");
        self.push_predicate(field, false, |p| WhereKind::GreaterThan(p.add(value)))
    }

    /// Matches values at or above `value`.
    pub fn where_greater_than_or_equal(
        self,
        field: &str,
        value: impl Into<JsonValue>,
    ) -> Result<Self> {
        let value = range_value(value.into(), "*");
        self.push_predicate(field, false, |p| WhereKind::GreaterThanOrEqual(p.add(value)))
    }

    /// Matches values below `value`.
    pub fn where_less_than(self, field: &str, value: impl Into<JsonValue>) -> Result<Self> {
        let value = range_value(value.into(), "NULL");
        self.push_predicate(field, false, |p| WhereKind::LessThan(p.add(value)))
    }

    /// Matches values at or below `value`.
    pub fn where_less_than_or_equal(self, field: &str, value: impl Into<JsonValue>) -> Result<Self> {
        let value = range_value(value.into(), "NULL");
        self.push_predicate(field, false, |p| WhereKind::LessThanOrEqual(p.add(value)))
    }

    /// Inclusive range; a null bound leaves that side open.
    pub fn where_between(
        self,
        field: &str,
        from: impl Into<JsonValue>,
        to: impl Into<JsonValue>,
    ) -> Result<Self> {
        let from = range_value(from.into(), "*");
        let to = range_value(to.into(), "NULL");
        self.push_predicate(field, false, |p| WhereKind::Between {
            from: p.add(from),
            to: p.add(to),
        })
    }

    // ------------------------------------------------------------------
    // Membership and text
    // ------------------------------------------------------------------

    /// Matches when the field equals any of `values`.
    pub fn where_in(self, field: &str, values: Vec<JsonValue>) -> Result<Self> {
        self.push_predicate(field, false, |p| WhereKind::In(p.add(JsonValue::Array(values))))
    }

    /// Matches when the collection field holds any of `values`.
    pub fn contains_any(self, field: &str, values: Vec<JsonValue>) -> Result<Self> {
        if values.is_empty() {
            return self.where_true();
        }
        self.push_predicate(field, false, |p| WhereKind::In(p.add(JsonValue::Array(values))))
    }

    /// Matches when the collection field holds all of `values`.
    pub fn contains_all(self, field: &str, values: Vec<JsonValue>) -> Result<Self> {
        if values.is_empty() {
            return self.where_true();
        }
        self.push_predicate(field, false, |p| {
            WhereKind::AllIn(p.add(JsonValue::Array(values)))
        })
    }

    /// Prefix match via `startsWith`.
    pub fn where_starts_with(self, field: &str, prefix: impl Into<JsonValue>) -> Result<Self> {
        let prefix = prefix.into();
        self.push_predicate(field, false, |p| WhereKind::StartsWith(p.add(prefix)))
    }

    /// Suffix match via `endsWith`.
    pub fn where_ends_with(self, field: &str, suffix: impl Into<JsonValue>) -> Result<Self> {
        let suffix = suffix.into();
        self.push_predicate(field, false, |p| WhereKind::EndsWith(p.add(suffix)))
    }

    /// Matches documents that have the field at all.
    pub fn where_exists(self, field: &str) -> Result<Self> {
        self.push_predicate(field, false, |_| WhereKind::Exists)
    }

    /// Raw Lucene syntax against a single field.
    pub fn where_lucene(self, field: &str, clause: &str) -> Result<Self> {
        let clause = JsonValue::String(clause.to_string());
        self.push_predicate(field, false, |p| WhereKind::Lucene(p.add(clause)))
    }

    /// Full-text search. A predicate following a search defaults to OR.
    pub fn search(self, field: &str, terms: &str, operator: SearchOperator) -> Result<Self> {
        let terms = JsonValue::String(terms.to_string());
        self.push_predicate(field, false, |p| WhereKind::Search {
            param: p.add(terms),
            operator,
        })
    }

    /// Always-true predicate.
    pub fn where_true(mut self) -> Result<Self> {
        self.assert_no_raw_query()?;
        self.append_operator_if_needed();
        self.negate_if_needed(None);
        self.where_tokens.push(QueryToken::True);
        Ok(self)
    }

    // ------------------------------------------------------------------
    // Spatial
    // ------------------------------------------------------------------

    /// Documents whose shape lies within `radius` of a point.
    pub fn within_radius_of(
        self,
        field: &str,
        radius: f64,
        latitude: f64,
        longitude: f64,
        units: Option<SpatialUnits>,
    ) -> Result<Self> {
        let criteria = SpatialCriteria::new(
            SpatialRelation::Within,
            SpatialShape::Circle {
                radius,
                latitude,
                longitude,
                units,
            },
        );
        self.spatial(field, criteria)
    }

    /// Documents whose shape relates to a WKT shape.
    pub fn relates_to_shape(
        self,
        field: &str,
        wkt: &str,
        relation: SpatialRelation,
    ) -> Result<Self> {
        self.spatial(
            field,
            SpatialCriteria::new(relation, SpatialShape::Wkt(wkt.to_string())),
        )
    }

    /// Spatial predicate over a point or shape field.
    pub fn spatial(self, field: &str, criteria: SpatialCriteria) -> Result<Self> {
        self.push_predicate(field, false, |p| {
            let shape = match criteria.shape {
                SpatialShape::Circle {
                    radius,
                    latitude,
                    longitude,
                    units,
                } => ShapeToken::Circle {
                    radius: p.add(JsonValue::from(radius)),
                    latitude: p.add(JsonValue::from(latitude)),
                    longitude: p.add(JsonValue::from(longitude)),
                    units,
                },
                SpatialShape::Wkt(wkt) => ShapeToken::Wkt(p.add(JsonValue::String(wkt))),
            };
            WhereKind::Spatial {
                relation: criteria.relation,
                shape,
                distance_error_pct: criteria.distance_error_pct,
            }
        })
    }

    // ------------------------------------------------------------------
    // Structure
    // ------------------------------------------------------------------

    /// Open a parenthesized group. Must be closed before the query runs.
    pub fn open_subclause(mut self) -> Result<Self> {
        self.assert_no_raw_query()?;
        self.clause_depth += 1;
        self.append_operator_if_needed();
        self.negate_if_needed(None);
        self.where_tokens.push(QueryToken::OpenSubclause);
        Ok(self)
    }

    /// Close the innermost open group.
    pub fn close_subclause(mut self) -> Result<Self> {
        self.assert_no_raw_query()?;
        self.clause_depth -= 1;
        self.where_tokens.push(QueryToken::CloseSubclause);
        Ok(self)
    }

    /// Join the next predicate with `and`.
    pub fn and_also(self) -> Result<Self> {
        self.push_operator(QueryOperator::And)
    }

    /// Join the next predicate with `or`.
    pub fn or_else(self) -> Result<Self> {
        self.push_operator(QueryOperator::Or)
    }

    fn push_operator(mut self, operator: QueryOperator) -> Result<Self> {
        self.assert_no_raw_query()?;
        match self.where_tokens.last() {
            None => return Ok(self),
            Some(QueryToken::Operator(_)) => {
                return Err(Error::query_state(
                    QueryStateErrorKind::MisplacedOperator,
                    format!(
                        "Cannot add {} after another operator",
                        operator.as_str()
                    ),
                ));
            }
            Some(_) => {}
        }
        self.where_tokens.push(QueryToken::Operator(operator));
        Ok(self)
    }

    /// Negate the next predicate or subclause.
    pub fn negate_next(mut self) -> Self {
        self.negate = !self.negate;
        self
    }

    /// Combine the preceding predicate with the next one as `intersect(...)`.
    pub fn intersect(mut self) -> Result<Self> {
        self.assert_no_raw_query()?;
        match self.where_tokens.last() {
            Some(QueryToken::Where(_) | QueryToken::CloseSubclause) => {
                self.is_intersect = true;
                self.where_tokens.push(QueryToken::IntersectMarker);
                Ok(self)
            }
            _ => Err(Error::query_state(
                QueryStateErrorKind::MisplacedOperator,
                "Cannot add INTERSECT at this point",
            )),
        }
    }

    /// Operator placed between predicates that have no explicit one.
    pub fn using_default_operator(mut self, operator: QueryOperator) -> Result<Self> {
        if !self.where_tokens.is_empty() {
            return Err(Error::query_state(
                QueryStateErrorKind::MisplacedOperator,
                "Default operator can only be set before any where clause is added",
            ));
        }
        self.default_operator = operator;
        Ok(self)
    }

    // ------------------------------------------------------------------
    // Decorations of the last predicate
    // ------------------------------------------------------------------

    /// Weight the last predicate. A boost of 1 leaves it unchanged.
    pub fn boost(mut self, boost: f64) -> Result<Self> {
        if (boost - 1.0).abs() < f64::EPSILON {
            return Ok(self);
        }
        if boost <= 0.0 {
            return Err(invalid_argument("Boost factor must be a positive number"));
        }
        self.last_where_token()?.boost = Some(boost);
        Ok(self)
    }

    /// Fuzzy match on the last predicate, `fuzzy` in `0..=1`.
    pub fn fuzzy(mut self, fuzzy: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&fuzzy) {
            return Err(invalid_argument("Fuzzy distance must be between 0.0 and 1.0"));
        }
        self.last_where_token()?.fuzzy = Some(fuzzy);
        Ok(self)
    }

    /// Proximity of the terms of the last search predicate, at least 1.
    pub fn proximity(mut self, proximity: u32) -> Result<Self> {
        if proximity < 1 {
            return Err(invalid_argument("Proximity distance must be a positive number"));
        }
        self.last_where_token()?.proximity = Some(proximity);
        Ok(self)
    }

    fn last_where_token(&mut self) -> Result<&mut WhereToken> {
        match self.where_tokens.last_mut() {
            Some(QueryToken::Where(token)) => Ok(token),
            _ => Err(Error::query_state(
                QueryStateErrorKind::MisplacedOperator,
                "Missing where clause",
            )),
        }
    }

    // ------------------------------------------------------------------
    // Ordering
    // ------------------------------------------------------------------

    /// Ascending lexical ordering.
    pub fn order_by(self, field: &str) -> Result<Self> {
        self.push_order(field, OrderDirection::Asc, OrderingType::String)
    }

    /// Descending lexical ordering.
    pub fn order_by_descending(self, field: &str) -> Result<Self> {
        self.push_order(field, OrderDirection::Desc, OrderingType::String)
    }

    /// Ordering with an explicit direction and comparison type.
    pub fn order_by_as(
        self,
        field: &str,
        direction: OrderDirection,
        ordering: OrderingType,
    ) -> Result<Self> {
        self.push_order(field, direction, ordering)
    }

    /// Sort with the ordering conventions assign to values like `sample`.
    pub fn order_by_value_type(
        self,
        field: &str,
        direction: OrderDirection,
        sample: &JsonValue,
    ) -> Result<Self> {
        let ordering = self.conventions.default_ordering(sample);
        self.push_order(field, direction, ordering)
    }

    fn push_order(
        mut self,
        field: &str,
        direction: OrderDirection,
        ordering: OrderingType,
    ) -> Result<Self> {
        self.assert_no_raw_query()?;
        let field = self.ensure_valid_field_name(field);
        self.order_by_tokens
            .push(QueryToken::OrderBy(OrderByToken::Field {
                field,
                direction,
                ordering,
            }));
        Ok(self)
    }

    /// Order by relevance score, lowest first.
    pub fn order_by_score(self) -> Result<Self> {
        self.push_order_token(OrderByToken::Score(OrderDirection::Asc))
    }

    /// Order by relevance score, highest first.
    pub fn order_by_score_descending(self) -> Result<Self> {
        self.push_order_token(OrderByToken::Score(OrderDirection::Desc))
    }

    /// Random ordering, repeatable when `seed` is given.
    pub fn random_ordering(self, seed: Option<&str>) -> Result<Self> {
        self.push_order_token(OrderByToken::Random(seed.map(str::to_string)))
    }

    /// Order by distance from a point.
    pub fn order_by_distance(
        mut self,
        field: &str,
        latitude: f64,
        longitude: f64,
        direction: OrderDirection,
    ) -> Result<Self> {
        self.assert_no_raw_query()?;
        let field = self.ensure_valid_field_name(field);
        let latitude = self.parameters.add(JsonValue::from(latitude));
        let longitude = self.parameters.add(JsonValue::from(longitude));
        self.push_order_token(OrderByToken::Distance {
            field,
            latitude,
            longitude,
            direction,
        })
    }

    fn push_order_token(mut self, token: OrderByToken) -> Result<Self> {
        self.assert_no_raw_query()?;
        self.order_by_tokens.push(QueryToken::OrderBy(token));
        Ok(self)
    }

    // ------------------------------------------------------------------
    // Grouping and projection
    // ------------------------------------------------------------------

    /// Group a dynamic query by one or more fields.
    pub fn group_by(mut self, fields: &[&str]) -> Result<Self> {
        self.assert_no_raw_query()?;
        if !self.is_dynamic() {
            return Err(invalid_argument("GroupBy only works with dynamic queries"));
        }
        self.is_group_by = true;
        for field in fields {
            let field = self.ensure_valid_field_name(field);
            self.group_by_tokens.push(QueryToken::GroupBy(field));
        }
        Ok(self)
    }

    /// Select the group key (or one of its fields).
    pub fn select_key(mut self, field: Option<&str>, alias: Option<&str>) -> Result<Self> {
        self.assert_no_raw_query()?;
        let field = field.map(|f| self.ensure_valid_field_name(f));
        self.select_tokens.push(QueryToken::Select(SelectToken::Key {
            field,
            alias: alias.map(str::to_string),
        }));
        Ok(self)
    }

    /// Project the sum of `field` as `alias`.
    pub fn select_sum(mut self, field: &str, alias: &str) -> Result<Self> {
        self.assert_no_raw_query()?;
        let field = self.ensure_valid_field_name(field);
        self.select_tokens.push(QueryToken::Select(SelectToken::Sum {
            field,
            alias: alias.to_string(),
        }));
        Ok(self)
    }

    /// Project the match count as `alias`.
    pub fn select_count(mut self, alias: &str) -> Result<Self> {
        self.assert_no_raw_query()?;
        self.select_tokens.push(QueryToken::Select(SelectToken::Count {
            alias: alias.to_string(),
        }));
        Ok(self)
    }

    /// Return distinct projections. Fails when already distinct.
    pub fn distinct(mut self) -> Result<Self> {
        self.assert_no_raw_query()?;
        if self.is_distinct() {
            return Err(Error::query_state(
                QueryStateErrorKind::InvalidArgument,
                "This is already a distinct query",
            ));
        }
        self.select_tokens.insert(0, QueryToken::Distinct);
        Ok(self)
    }

    pub fn is_distinct(&self) -> bool {
        matches!(self.select_tokens.first(), Some(QueryToken::Distinct))
    }

    /// Alias for the root collection, referenced by LOAD paths.
    pub fn alias(mut self, alias: &str) -> Result<Self> {
        self.assert_no_raw_query()?;
        self.alias = Some(alias.to_string());
        Ok(self)
    }

    /// Load a related document into the projection scope.
    pub fn load(mut self, path: &str, alias: &str) -> Result<Self> {
        self.assert_no_raw_query()?;
        self.load_tokens.push(QueryToken::Load {
            path: path.to_string(),
            alias: alias.to_string(),
        });
        Ok(self)
    }

    /// Return documents referenced by `path` alongside the results.
    pub fn include(mut self, path: &str) -> Result<Self> {
        self.assert_no_raw_query()?;
        self.includes.push(path.to_string());
        Ok(self)
    }

    // ------------------------------------------------------------------
    // Paging, freshness, tracking
    // ------------------------------------------------------------------

    /// Skip the first `count` results.
    pub fn skip(mut self, count: usize) -> Self {
        self.start = count;
        self
    }

    /// Return at most `count` results.
    pub fn take(mut self, count: usize) -> Self {
        self.page_size = Some(count);
        self
    }

    /// Wait until the index is not stale, up to `timeout` (conventions default
    /// when `None`).
    pub fn wait_for_non_stale_results(mut self, timeout: Option<Duration>) -> Self {
        self.wait_for_non_stale = true;
        self.timeout = timeout;
        self
    }

    /// Wait until the index has caught up with `etag`.
    pub fn wait_for_non_stale_results_as_of(mut self, etag: Etag, timeout: Option<Duration>) -> Self {
        self.wait_for_non_stale = true;
        self.cutoff_etag = Some(etag);
        self.timeout = timeout;
        self
    }

    /// Do not track returned entities in the session.
    pub fn no_tracking(mut self) -> Self {
        self.disable_tracking = true;
        self
    }

    /// Ask the transport not to serve this query from a cache.
    pub fn no_caching(mut self) -> Self {
        self.disable_caching = true;
        self
    }

    // ------------------------------------------------------------------
    // Raw text and parameters
    // ------------------------------------------------------------------

    /// Use `text` verbatim. Only allowed on an empty builder.
    pub fn raw_query(mut self, text: &str) -> Result<Self> {
        let structured = !self.where_tokens.is_empty()
            || !self.order_by_tokens.is_empty()
            || !self.group_by_tokens.is_empty()
            || !self.select_tokens.is_empty()
            || !self.load_tokens.is_empty()
            || !self.includes.is_empty();
        if structured || self.raw_query.is_some() {
            return Err(Error::query_state(
                QueryStateErrorKind::RawQueryMixed,
                "You can only use raw_query on a new query, without applying any operations \
                 (such as where, select, order_by, group_by, etc)",
            ));
        }
        self.raw_query = Some(text.to_string());
        Ok(self)
    }

    /// Bind a named parameter, typically referenced from raw query text.
    pub fn add_parameter(mut self, name: &str, value: impl Into<JsonValue>) -> Result<Self> {
        if !self.parameters.add_named(name, value.into()) {
            return Err(Error::query_state(
                QueryStateErrorKind::DuplicateParameter,
                format!("The parameter {} was already added", name),
            ));
        }
        Ok(self)
    }

    // ------------------------------------------------------------------
    // Rendering
    // ------------------------------------------------------------------

    /// Render the query text.
    pub fn to_query_text(&self) -> Result<String> {
        if let Some(raw) = &self.raw_query {
            return Ok(raw.clone());
        }
        if self.clause_depth != 0 {
            return Err(Error::query_state(
                QueryStateErrorKind::UnbalancedSubclause,
                format!(
                    "A clause was not closed correctly within this query, current clause depth = {}",
                    self.clause_depth
                ),
            ));
        }
        if self.negate {
            return Err(Error::query_state(
                QueryStateErrorKind::NothingToNegate,
                "negate_next() was called but no predicate followed it",
            ));
        }

        let mut out = String::new();
        self.write_from(&mut out);
        write_list(&mut out, " GROUP BY ", &self.group_by_tokens);
        self.write_where(&mut out);
        write_list(&mut out, " ORDER BY ", &self.order_by_tokens);
        write_list(&mut out, " LOAD ", &self.load_tokens);
        self.write_select(&mut out);
        if !self.includes.is_empty() {
            out.push_str(" INCLUDE ");
            let paths: Vec<String> = self.includes.iter().map(|p| escape_field(p)).collect();
            out.push_str(&paths.join(", "));
        }
        Ok(out)
    }

    fn write_from(&self, out: &mut String) {
        out.push_str("FROM ");
        match (&self.index_name, &self.collection_name) {
            (Some(index), _) => {
                out.push_str("INDEX '");
                out.push_str(&index.replace('\'', "\\'"));
                out.push('\'');
            }
            (None, Some(collection)) => out.push_str(&escape_field(collection)),
            (None, None) => out.push_str(ALL_DOCUMENTS_COLLECTION),
        }
        if let Some(alias) = &self.alias {
            out.push_str(" AS ");
            out.push_str(alias);
        }
    }

    fn write_where(&self, out: &mut String) {
        if self.where_tokens.is_empty() {
            return;
        }
        out.push_str(" WHERE ");
        if self.is_intersect {
            out.push_str("intersect(");
        }
        let mut previous: Option<&QueryToken> = None;
        for token in &self.where_tokens {
            if let Some(prev) = previous {
                let no_space = matches!(prev, QueryToken::OpenSubclause)
                    || matches!(
                        token,
                        QueryToken::CloseSubclause | QueryToken::IntersectMarker
                    );
                if !no_space {
                    out.push(' ');
                }
            }
            token.write_to(out);
            previous = Some(token);
        }
        if self.is_intersect {
            out.push(')');
        }
    }

    fn write_select(&self, out: &mut String) {
        if self.select_tokens.is_empty() {
            return;
        }
        out.push_str(" SELECT ");
        let mut first = true;
        for token in &self.select_tokens {
            if !first {
                out.push_str(", ");
            }
            token.write_to(out);
            // DISTINCT prefixes the field list without a comma.
            if matches!(token, QueryToken::Distinct) {
                out.push(' ');
                first = true;
            } else {
                first = false;
            }
        }
        if self.select_tokens.len() == 1 && self.is_distinct() {
            out.push('*');
        }
    }

    /// Build the index query: text, parameters, paging and freshness.
    pub fn index_query(&self) -> Result<IndexQuery> {
        let query = self.to_query_text()?;
        let timeout = self
            .wait_for_non_stale
            .then(|| self.timeout.unwrap_or(self.conventions.default_query_timeout));
        Ok(IndexQuery {
            query,
            query_parameters: self.parameters.clone(),
            start: self.start,
            page_size: self.page_size,
            wait_for_non_stale_results: self.wait_for_non_stale,
            cutoff_etag: self.cutoff_etag,
            wait_for_non_stale_results_timeout: timeout,
            disable_caching: self.disable_caching || self.wait_for_non_stale,
        })
    }

    /// A fresh resolver for this query.
    pub fn create_operation(&self) -> Result<QueryOperation> {
        QueryOperation::new(
            self.target_name(),
            self.index_query()?,
            &self.conventions,
            self.is_dynamic(),
            self.disable_tracking,
            self.projection_fields.clone(),
        )
    }

    /// The resolver owned by this query, created on first use.
    ///
    /// Once it finishes, later executions replay its result.
    pub fn init_operation(&mut self) -> Result<&mut QueryOperation> {
        self.init_operation_with(|operation| operation)
    }

    /// Like [`init_operation`](Self::init_operation), letting the caller
    /// adjust a newly created resolver before it is stored.
    pub fn init_operation_with(
        &mut self,
        configure: impl FnOnce(QueryOperation) -> QueryOperation,
    ) -> Result<&mut QueryOperation> {
        if self.operation.is_none() {
            self.operation = Some(configure(self.create_operation()?));
        }
        self.operation
            .as_mut()
            .ok_or_else(|| Error::Custom("query operation missing after initialization".into()))
    }

    pub fn operation(&self) -> Option<&QueryOperation> {
        self.operation.as_ref()
    }

    /// Statistics of the accepted result, once the query has run.
    pub fn statistics(&self) -> Option<QueryStatistics> {
        self.operation.as_ref().and_then(QueryOperation::statistics)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Index or collection the query targets.
    pub fn target_name(&self) -> String {
        match (&self.index_name, &self.collection_name) {
            (Some(index), _) => index.clone(),
            (None, Some(collection)) => format!("dynamic/{}", collection),
            (None, None) => "dynamic".to_string(),
        }
    }

    pub fn index_name(&self) -> Option<&str> {
        self.index_name.as_deref()
    }

    pub fn collection_name(&self) -> Option<&str> {
        self.collection_name.as_deref()
    }

    pub fn is_dynamic(&self) -> bool {
        self.index_name.is_none()
    }

    pub fn conventions(&self) -> &Arc<Conventions> {
        &self.conventions
    }

    pub fn identity_property(&self) -> Option<&str> {
        self.identity_property.as_deref()
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn where_tokens(&self) -> &[QueryToken] {
        &self.where_tokens
    }

    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    pub fn projection_fields(&self) -> &[String] {
        &self.projection_fields
    }

    pub fn is_tracking_disabled(&self) -> bool {
        self.disable_tracking
    }

    pub fn page_size(&self) -> Option<usize> {
        self.page_size
    }

    pub fn start(&self) -> usize {
        self.start
    }

    // ------------------------------------------------------------------
    // Token bookkeeping
    // ------------------------------------------------------------------

    fn push_predicate(
        mut self,
        field: &str,
        exact: bool,
        kind: impl FnOnce(&mut Parameters) -> WhereKind,
    ) -> Result<Self> {
        self.assert_no_raw_query()?;
        let field = self.ensure_valid_field_name(field);
        self.append_operator_if_needed();
        self.negate_if_needed(Some(&field));
        let kind = kind(&mut self.parameters);
        self.where_tokens
            .push(QueryToken::Where(WhereToken::new(field, kind).exact(exact)));
        Ok(self)
    }

    fn assert_no_raw_query(&self) -> Result<()> {
        if self.raw_query.is_some() {
            return Err(Error::query_state(
                QueryStateErrorKind::RawQueryMixed,
                "raw_query was called, cannot modify this query by calling on operations \
                 that would modify the query (such as where, select, order_by, group_by, etc)",
            ));
        }
        Ok(())
    }

    fn append_operator_if_needed(&mut self) {
        if !matches!(
            self.where_tokens.last(),
            Some(QueryToken::Where(_) | QueryToken::CloseSubclause)
        ) {
            return;
        }
        let last_was_search = self
            .where_tokens
            .iter()
            .rev()
            .find_map(|token| match token {
                QueryToken::Where(w) => Some(w.is_search()),
                _ => None,
            })
            .unwrap_or(false);
        let operator = if last_was_search {
            QueryOperator::Or
        } else {
            self.default_operator
        };
        self.where_tokens.push(QueryToken::Operator(operator));
    }

    fn negate_if_needed(&mut self, field: Option<&str>) {
        if !self.negate {
            return;
        }
        self.negate = false;
        if matches!(
            self.where_tokens.last(),
            None | Some(QueryToken::OpenSubclause)
        ) {
            match field {
                Some(field) => self
                    .where_tokens
                    .push(QueryToken::Where(WhereToken::new(field, WhereKind::Exists))),
                None => self.where_tokens.push(QueryToken::True),
            }
            self.where_tokens
                .push(QueryToken::Operator(QueryOperator::And));
        }
        self.where_tokens.push(QueryToken::Negate);
    }

    fn ensure_valid_field_name(&self, field: &str) -> String {
        let nested_path = field.contains('.');
        if self.is_group_by || nested_path {
            return escape_field(field);
        }
        if self.identity_property.as_deref() == Some(field) {
            return DOCUMENT_ID_FIELD_NAME.to_string();
        }
        escape_field(field)
    }
}

impl<T> Clone for DocumentQuery<T> {
    /// Clones the query definition; the clone starts with a fresh resolver.
    fn clone(&self) -> Self {
        Self {
            conventions: Arc::clone(&self.conventions),
            index_name: self.index_name.clone(),
            collection_name: self.collection_name.clone(),
            alias: self.alias.clone(),
            identity_property: self.identity_property.clone(),
            where_tokens: self.where_tokens.clone(),
            order_by_tokens: self.order_by_tokens.clone(),
            group_by_tokens: self.group_by_tokens.clone(),
            select_tokens: self.select_tokens.clone(),
            load_tokens: self.load_tokens.clone(),
            includes: self.includes.clone(),
            parameters: self.parameters.clone(),
            default_operator: self.default_operator,
            negate: self.negate,
            clause_depth: self.clause_depth,
            is_intersect: self.is_intersect,
            is_group_by: self.is_group_by,
            raw_query: self.raw_query.clone(),
            start: self.start,
            page_size: self.page_size,
            wait_for_non_stale: self.wait_for_non_stale,
            cutoff_etag: self.cutoff_etag,
            timeout: self.timeout,
            disable_tracking: self.disable_tracking,
            disable_caching: self.disable_caching,
            projection_fields: self.projection_fields.clone(),
            operation: None,
            _marker: PhantomData,
        }
    }
}

fn range_value(value: JsonValue, open_bound: &str) -> JsonValue {
    if value.is_null() {
        JsonValue::String(open_bound.to_string())
    } else {
        value
    }
}

fn write_list(out: &mut String, keyword: &str, tokens: &[QueryToken]) {
    if tokens.is_empty() {
        return;
    }
    out.push_str(keyword);
    for (i, token) in tokens.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        token.write_to(out);
    }
}

fn invalid_argument(message: &str) -> Error {
    Error::query_state(QueryStateErrorKind::InvalidArgument, message)
}
