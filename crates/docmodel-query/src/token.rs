//! Query tokens and their text rendering.
//!
//! The builder records every call as a [`QueryToken`]; rendering walks the
//! tokens in insertion order. Tokens only ever reference literal values
//! through parameter names, so the rendered text never embeds caller data.

use std::fmt::Write as _;
use std::sync::OnceLock;

use docmodel_core::OrderingType;
use regex::Regex;

use crate::clause::{
    DEFAULT_DISTANCE_ERROR_PCT, OrderDirection, QueryOperator, SearchOperator, SpatialRelation,
    SpatialUnits,
};

/// One element of the token stream.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryToken {
    Where(WhereToken),
    Operator(QueryOperator),
    OpenSubclause,
    CloseSubclause,
    Negate,
    /// Always-true predicate
    True,
    /// Separator between the sub-queries of an `intersect(...)`
    IntersectMarker,
    OrderBy(OrderByToken),
    GroupBy(String),
    Distinct,
    Select(SelectToken),
    Load { path: String, alias: String },
}

/// A single predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct WhereToken {
    pub field: String,
    pub kind: WhereKind,
    pub exact: bool,
    pub boost: Option<f64>,
    pub fuzzy: Option<f64>,
    pub proximity: Option<u32>,
}

/// Predicate operator with its parameter names.
#[derive(Debug, Clone, PartialEq)]
pub enum WhereKind {
    Equals(String),
    NotEquals(String),
    GreaterThan(String),
    GreaterThanOrEqual(String),
    LessThan(String),
    LessThanOrEqual(String),
    In(String),
    AllIn(String),
    StartsWith(String),
    EndsWith(String),
    Between { from: String, to: String },
    Search { param: String, operator: SearchOperator },
    Lucene(String),
    Exists,
    Spatial {
        relation: SpatialRelation,
        shape: ShapeToken,
        distance_error_pct: f64,
    },
}

/// Parameterized spatial shape.
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeToken {
    Circle {
        radius: String,
        latitude: String,
        longitude: String,
        units: Option<SpatialUnits>,
    },
    Wkt(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderByToken {
    Field {
        field: String,
        direction: OrderDirection,
        ordering: OrderingType,
    },
    Score(OrderDirection),
    Random(Option<String>),
    Distance {
        field: String,
        latitude: String,
        longitude: String,
        direction: OrderDirection,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectToken {
    Field { name: String, alias: Option<String> },
    /// Group key; `None` selects the composite `key()`.
    Key { field: Option<String>, alias: Option<String> },
    Sum { field: String, alias: String },
    Count { alias: String },
}

impl WhereToken {
    pub fn new(field: impl Into<String>, kind: WhereKind) -> Self {
        Self {
            field: field.into(),
            kind,
            exact: false,
            boost: None,
            fuzzy: None,
            proximity: None,
        }
    }

    #[must_use]
    pub fn exact(mut self, exact: bool) -> Self {
        self.exact = exact;
        self
    }

    pub fn is_search(&self) -> bool {
        matches!(self.kind, WhereKind::Search { .. })
    }

    pub fn write_to(&self, out: &mut String) {
        if self.boost.is_some() {
            out.push_str("boost(");
        }
        if self.fuzzy.is_some() {
            out.push_str("fuzzy(");
        }
        if self.proximity.is_some() {
            out.push_str("proximity(");
        }
        if self.exact {
            out.push_str("exact(");
        }

        let field = &self.field;
        match &self.kind {
            WhereKind::Equals(p) => {
                let _ = write!(out, "{field} = ${p}");
            }
            WhereKind::NotEquals(p) => {
                let _ = write!(out, "{field} != ${p}");
            }
            WhereKind::GreaterThan(p) => {
                let _ = write!(out, "{field} > ${p}");
            }
            WhereKind::GreaterThanOrEqual(p) => {
                let _ = write!(out, "{field} >= ${p}");
            }
            WhereKind::LessThan(p) => {
                let _ = write!(out, "{field} < ${p}");
            }
            WhereKind::LessThanOrEqual(p) => {
                let _ = write!(out, "{field} <= ${p}");
            }
            WhereKind::In(p) => {
                let _ = write!(out, "{field} IN (${p})");
            }
            WhereKind::AllIn(p) => {
                let _ = write!(out, "{field} ALL IN (${p})");
            }
            WhereKind::StartsWith(p) => {
                let _ = write!(out, "startsWith({field}, ${p})");
            }
            WhereKind::EndsWith(p) => {
                let _ = write!(out, "endsWith({field}, ${p})");
            }
            WhereKind::Between { from, to } => {
                let _ = write!(out, "{field} BETWEEN ${from} AND ${to}");
            }
            WhereKind::Search { param, operator } => {
                let _ = write!(out, "search({field}, ${param}");
                if *operator == SearchOperator::And {
                    out.push_str(", and");
                }
                out.push(')');
            }
            WhereKind::Lucene(p) => {
                let _ = write!(out, "lucene({field}, ${p})");
            }
            WhereKind::Exists => {
                let _ = write!(out, "exists({field})");
            }
            WhereKind::Spatial {
                relation,
                shape,
                distance_error_pct,
            } => {
                let _ = write!(out, "{}({field}, ", relation.function_name());
                shape.write_to(out);
                if (distance_error_pct - DEFAULT_DISTANCE_ERROR_PCT).abs() > f64::EPSILON {
                    let _ = write!(out, ", {distance_error_pct}");
                }
                out.push(')');
            }
        }

        if self.exact {
            out.push(')');
        }
        if let Some(proximity) = self.proximity {
            let _ = write!(out, ", {proximity})");
        }
        if let Some(fuzzy) = self.fuzzy {
            let _ = write!(out, ", {fuzzy})");
        }
        if let Some(boost) = self.boost {
            let _ = write!(out, ", {boost})");
        }
    }
}

impl ShapeToken {
    pub fn write_to(&self, out: &mut String) {
        match self {
            ShapeToken::Circle {
                radius,
                latitude,
                longitude,
                units,
            } => {
                let _ = write!(out, "spatial.circle(${radius}, ${latitude}, ${longitude}");
                if let Some(units) = units {
                    let _ = write!(out, ", '{units}'");
                }
                out.push(')');
            }
            ShapeToken::Wkt(p) => {
                let _ = write!(out, "spatial.wkt(${p})");
            }
        }
    }
}

impl OrderByToken {
    pub fn write_to(&self, out: &mut String) {
        let direction = match self {
            OrderByToken::Field {
                field,
                direction,
                ordering,
            } => {
                out.push_str(field);
                if let Some(suffix) = ordering.as_query_suffix() {
                    out.push(' ');
                    out.push_str(suffix);
                }
                *direction
            }
            OrderByToken::Score(direction) => {
                out.push_str("score()");
                *direction
            }
            OrderByToken::Random(seed) => {
                match seed {
                    Some(seed) => {
                        let _ = write!(out, "random('{}')", seed.replace('\'', "\\'"));
                    }
                    None => out.push_str("random()"),
                }
                OrderDirection::Asc
            }
            OrderByToken::Distance {
                field,
                latitude,
                longitude,
                direction,
            } => {
                let _ = write!(
                    out,
                    "spatial.distance({field}, spatial.point(${latitude}, ${longitude}))"
                );
                *direction
            }
        };
        if direction == OrderDirection::Desc {
            out.push_str(" DESC");
        }
    }
}

impl SelectToken {
    pub fn write_to(&self, out: &mut String) {
        match self {
            SelectToken::Field { name, alias } => {
                out.push_str(name);
                write_alias(out, alias.as_deref());
            }
            SelectToken::Key { field, alias } => {
                out.push_str(field.as_deref().unwrap_or("key()"));
                write_alias(out, alias.as_deref());
            }
            SelectToken::Sum { field, alias } => {
                let _ = write!(out, "sum({field})");
                write_alias(out, Some(alias));
            }
            SelectToken::Count { alias } => {
                out.push_str("count()");
                write_alias(out, Some(alias));
            }
        }
    }
}

fn write_alias(out: &mut String, alias: Option<&str>) {
    if let Some(alias) = alias {
        out.push_str(" AS ");
        out.push_str(&escape_field(alias));
    }
}

impl QueryToken {
    pub fn write_to(&self, out: &mut String) {
        match self {
            QueryToken::Where(token) => token.write_to(out),
            QueryToken::Operator(op) => out.push_str(op.as_str()),
            QueryToken::OpenSubclause => out.push('('),
            QueryToken::CloseSubclause => out.push(')'),
            QueryToken::Negate => out.push_str("NOT"),
            QueryToken::True => out.push_str("true"),
            QueryToken::IntersectMarker => out.push(','),
            QueryToken::OrderBy(token) => token.write_to(out),
            QueryToken::GroupBy(field) => out.push_str(field),
            QueryToken::Distinct => out.push_str("DISTINCT"),
            QueryToken::Select(token) => token.write_to(out),
            QueryToken::Load { path, alias } => {
                let _ = write!(out, "{path} AS {alias}");
            }
        }
    }
}

fn plain_identifier() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"^[A-Za-z_@][\w@]*(\[\])?(\.[A-Za-z_@][\w@]*(\[\])?)*$").ok()
        })
        .as_ref()
}

/// Quote a field name unless it is a plain (possibly dotted) identifier.
pub fn escape_field(name: &str) -> String {
    if plain_identifier().is_some_and(|pattern| pattern.is_match(name)) {
        return name.to_string();
    }
    format!("'{}'", name.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(token: &QueryToken) -> String {
        let mut out = String::new();
        token.write_to(&mut out);
        out
    }

    #[test]
    fn where_decorations_nest_in_order() {
        let mut token = WhereToken::new("Name", WhereKind::Equals("p0".into())).exact(true);
        token.boost = Some(2.0);
        assert_eq!(
            render(&QueryToken::Where(token)),
            "boost(exact(Name = $p0), 2)"
        );

        let mut token = WhereToken::new(
            "Body",
            WhereKind::Search {
                param: "p1".into(),
                operator: SearchOperator::And,
            },
        );
        token.proximity = Some(3);
        assert_eq!(
            render(&QueryToken::Where(token)),
            "proximity(search(Body, $p1, and), 3)"
        );
    }

    #[test]
    fn between_and_membership() {
        let between = WhereToken::new(
            "Age",
            WhereKind::Between {
                from: "p0".into(),
                to: "p1".into(),
            },
        );
        assert_eq!(render(&QueryToken::Where(between)), "Age BETWEEN $p0 AND $p1");
        let all_in = WhereToken::new("Tags", WhereKind::AllIn("p2".into()));
        assert_eq!(render(&QueryToken::Where(all_in)), "Tags ALL IN ($p2)");
    }

    #[test]
    fn spatial_circle_with_units_and_precision() {
        let token = WhereToken::new(
            "Location",
            WhereKind::Spatial {
                relation: SpatialRelation::Within,
                shape: ShapeToken::Circle {
                    radius: "p0".into(),
                    latitude: "p1".into(),
                    longitude: "p2".into(),
                    units: Some(SpatialUnits::Miles),
                },
                distance_error_pct: 0.05,
            },
        );
        assert_eq!(
            render(&QueryToken::Where(token)),
            "spatial.within(Location, spatial.circle($p0, $p1, $p2, 'Miles'), 0.05)"
        );
    }

    #[test]
    fn order_by_variants() {
        let by_age = OrderByToken::Field {
            field: "Age".into(),
            direction: OrderDirection::Desc,
            ordering: OrderingType::Long,
        };
        assert_eq!(render(&QueryToken::OrderBy(by_age)), "Age AS long DESC");
        assert_eq!(
            render(&QueryToken::OrderBy(OrderByToken::Score(OrderDirection::Asc))),
            "score()"
        );
        assert_eq!(
            render(&QueryToken::OrderBy(OrderByToken::Random(Some("s1".into())))),
            "random('s1')"
        );
    }

    #[test]
    fn select_tokens() {
        let sum = SelectToken::Sum {
            field: "Total".into(),
            alias: "Sum".into(),
        };
        assert_eq!(render(&QueryToken::Select(sum)), "sum(Total) AS Sum");
        let key = SelectToken::Key {
            field: None,
            alias: Some("Group".into()),
        };
        assert_eq!(render(&QueryToken::Select(key)), "key() AS Group");
    }

    #[test]
    fn field_escaping() {
        assert_eq!(escape_field("Name"), "Name");
        assert_eq!(escape_field("Address.City"), "Address.City");
        assert_eq!(escape_field("Lines[].Price"), "Lines[].Price");
        assert_eq!(escape_field("First Name"), "'First Name'");
        assert_eq!(escape_field("it's"), "'it\\'s'");
        assert_eq!(escape_field("1st"), "'1st'");
    }
}
