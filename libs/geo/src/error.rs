//! Error types for clause validation.

use thiserror::Error;

/// Reasons a polygon literal is rejected.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PolygonError {
    /// The literal is not a JSON array of coordinate pairs.
    #[error("polygon is not a list of [longitude, latitude] pairs: {0}")]
    Unparsable(String),

    /// A vertex has the wrong arity or an out-of-range component.
    #[error("polygon vertex {index} is not a valid [longitude, latitude] pair")]
    InvalidVertex { index: usize },

    /// Fewer than three distinct vertices remain after normalisation.
    #[error("polygon needs at least 3 distinct vertices, found {found}")]
    TooFewVertices { found: usize },

    /// All vertices are collinear.
    #[error("polygon has zero area")]
    Degenerate,
}

/// Reasons a selector clause is rejected.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ClauseError {
    #[error("unsupported region type")]
    UnsupportedRegionType,

    #[error("unsupported operator, expected In or NotIn")]
    UnsupportedOperator,

    #[error(transparent)]
    Polygon(#[from] PolygonError),
}
