//! Clause-level vocabulary: boolean operators, sort direction, search and
//! spatial descriptors.

use std::fmt;

/// Boolean operator joining two predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryOperator {
    #[default]
    And,
    Or,
}

impl QueryOperator {
    pub const fn as_str(&self) -> &'static str {
        match self {
            QueryOperator::And => "AND",
            QueryOperator::Or => "OR",
        }
    }
}

/// How the terms of a full-text search combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchOperator {
    /// Any term may match
    #[default]
    Or,
    /// All terms must match
    And,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

/// Spatial relation between an indexed shape and the query shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpatialRelation {
    Within,
    Contains,
    Disjoint,
    Intersects,
}

impl SpatialRelation {
    pub const fn function_name(&self) -> &'static str {
        match self {
            SpatialRelation::Within => "spatial.within",
            SpatialRelation::Contains => "spatial.contains",
            SpatialRelation::Disjoint => "spatial.disjoint",
            SpatialRelation::Intersects => "spatial.intersects",
        }
    }
}

/// Distance units for circle shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpatialUnits {
    #[default]
    Kilometers,
    Miles,
}

impl fmt::Display for SpatialUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpatialUnits::Kilometers => write!(f, "Kilometers"),
            SpatialUnits::Miles => write!(f, "Miles"),
        }
    }
}

/// Default error percentage the server applies to spatial shapes.
pub const DEFAULT_DISTANCE_ERROR_PCT: f64 = 0.025;

/// Shape argument of a spatial predicate, before parameterization.
#[derive(Debug, Clone, PartialEq)]
pub enum SpatialShape {
    Circle {
        radius: f64,
        latitude: f64,
        longitude: f64,
        units: Option<SpatialUnits>,
    },
    Wkt(String),
}

/// A spatial predicate: relation, shape and precision.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialCriteria {
    pub relation: SpatialRelation,
    pub shape: SpatialShape,
    pub distance_error_pct: f64,
}

impl SpatialCriteria {
    pub fn new(relation: SpatialRelation, shape: SpatialShape) -> Self {
        Self {
            relation,
            shape,
            distance_error_pct: DEFAULT_DISTANCE_ERROR_PCT,
        }
    }

    #[must_use]
    pub fn distance_error_pct(mut self, pct: f64) -> Self {
        self.distance_error_pct = pct;
        self
    }
}
