//! Geographic placement model.
//!
//! This library holds everything needed to turn a SelectiveDeployment's
//! selector into a set of node names, without talking to a cluster:
//!
//! - **Types**: region types, selector clauses, node geolocation records.
//! - **Evaluator**: matches one clause value against one node.
//! - **Selection**: applies operators and caps over a node inventory.
//! - **Labels**: the node label encoding written by the node labeler.
//!
//! # Invariants
//!
//! - Selection is a pure function of its inputs; input order never matters
//! - Only nodes with a resolved geolocation are ever selected
//! - A malformed clause selects nothing

mod error;
mod evaluator;
pub mod labels;
mod polygon;
mod selection;
mod types;

pub use error::{ClauseError, PolygonError};
pub use evaluator::{matches, normalize_region_name, CompiledClause, Matcher};
pub use polygon::{Polygon, BOUNDARY_EPSILON};
pub use selection::{select, select_compiled, ClauseOutcome, Selection, TargetNodeSet};
pub use types::{
    Coordinate, NodeGeoInfo, Operator, RegionType, ResolutionSource, SelectorClause,
};
