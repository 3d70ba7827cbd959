//! Polygon literals and point containment.
//!
//! Literals are JSON arrays of `[longitude, latitude]` pairs, for example
//! `[[2.215,48.895],[2.204,48.808],[2.339,48.784],[2.452,48.842]]`. The ring
//! may be open or closed; a closing vertex equal to the first is dropped.
//!
//! # Boundary policy
//!
//! A point lying on an edge or a vertex (within [`BOUNDARY_EPSILON`] degrees)
//! is inside. Everything else uses the even-odd ray casting rule.

use std::str::FromStr;

use crate::error::PolygonError;
use crate::types::Coordinate;

/// Distance, in degrees, under which a point counts as lying on an edge.
pub const BOUNDARY_EPSILON: f64 = 1e-9;

/// A validated simple ring of at least three distinct vertices.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    vertices: Vec<Coordinate>,
}

impl Polygon {
    /// Build a polygon from vertices, applying the same validation as parsing.
    pub fn new(vertices: Vec<Coordinate>) -> Result<Self, PolygonError> {
        for (index, v) in vertices.iter().enumerate() {
            if !v.is_valid() {
                return Err(PolygonError::InvalidVertex { index });
            }
        }

        let mut ring: Vec<Coordinate> = Vec::with_capacity(vertices.len());
        for v in vertices {
            if ring.last() != Some(&v) {
                ring.push(v);
            }
        }
        if ring.len() > 1 && ring.first() == ring.last() {
            ring.pop();
        }

        let mut distinct = ring.clone();
        distinct.sort_by(|a, b| {
            a.longitude
                .total_cmp(&b.longitude)
                .then(a.latitude.total_cmp(&b.latitude))
        });
        distinct.dedup();
        if distinct.len() < 3 {
            return Err(PolygonError::TooFewVertices {
                found: distinct.len(),
            });
        }

        let polygon = Self { vertices: ring };
        if polygon.signed_area().abs() < BOUNDARY_EPSILON * BOUNDARY_EPSILON {
            return Err(PolygonError::Degenerate);
        }
        Ok(polygon)
    }

    /// Parse a JSON polygon literal.
    pub fn parse(literal: &str) -> Result<Self, PolygonError> {
        let raw: Vec<Vec<f64>> = serde_json::from_str(literal.trim())
            .map_err(|e| PolygonError::Unparsable(e.to_string()))?;

        let vertices = raw
            .into_iter()
            .enumerate()
            .map(|(index, pair)| match pair.as_slice() {
                [lon, lat] => Ok(Coordinate::new(*lon, *lat)),
                _ => Err(PolygonError::InvalidVertex { index }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(vertices)
    }

    pub fn vertices(&self) -> &[Coordinate] {
        &self.vertices
    }

    /// Returns true when `point` is inside the ring or on its boundary.
    pub fn contains(&self, point: Coordinate) -> bool {
        let n = self.vertices.len();
        let mut inside = false;
        let mut j = n - 1;

        for i in 0..n {
            let a = self.vertices[i];
            let b = self.vertices[j];

            if on_segment(a, b, point) {
                return true;
            }

            if (a.latitude > point.latitude) != (b.latitude > point.latitude) {
                let crossing = (b.longitude - a.longitude) * (point.latitude - a.latitude)
                    / (b.latitude - a.latitude)
                    + a.longitude;
                if point.longitude < crossing {
                    inside = !inside;
                }
            }
            j = i;
        }

        inside
    }

    /// Shoelace area; the sign gives the winding direction.
    fn signed_area(&self) -> f64 {
        let n = self.vertices.len();
        let mut sum = 0.0;
        for i in 0..n {
            let a = self.vertices[i];
            let b = self.vertices[(i + 1) % n];
            sum += a.longitude * b.latitude - b.longitude * a.latitude;
        }
        sum / 2.0
    }
}

impl FromStr for Polygon {
    type Err = PolygonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn on_segment(a: Coordinate, b: Coordinate, p: Coordinate) -> bool {
    let dx = b.longitude - a.longitude;
    let dy = b.latitude - a.latitude;
    let length = (dx * dx + dy * dy).sqrt();
    if length == 0.0 {
        return (p.longitude - a.longitude).abs() <= BOUNDARY_EPSILON
            && (p.latitude - a.latitude).abs() <= BOUNDARY_EPSILON;
    }

    let cross = dx * (p.latitude - a.latitude) - dy * (p.longitude - a.longitude);
    if cross.abs() / length > BOUNDARY_EPSILON {
        return false;
    }

    let within = |v: f64, lo: f64, hi: f64| {
        v >= lo.min(hi) - BOUNDARY_EPSILON && v <= lo.max(hi) + BOUNDARY_EPSILON
    };
    within(p.longitude, a.longitude, b.longitude) && within(p.latitude, a.latitude, b.latitude)
}
