//! Greedy proximity clustering
//!
//! Single pass over the batch in arrival order. A point joins the first
//! existing cluster whose *first* member is within `radius` (the anchor, not a
//! centroid and not the nearest member). When `max_clusters` groups already
//! exist, an unmatched point is appended to the last group: nobody is dropped,
//! crowding is preferred over fragmentation.
//!
//! The output depends on input order. Callers keep the batch order stable
//! (a slice, not a hash map) so identical batches give identical partitions.

use serde::{Deserialize, Serialize};

/// A position in game-world units
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn distance_squared(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }
}

/// Partition `points` into at most `max_clusters` groups.
///
/// Cluster order is construction order; cluster `i` is the `i`-th group whose
/// anchor was seen. A `max_clusters` of zero is treated as one.
pub fn cluster<K: Clone>(points: &[(K, Position)], radius: f64, max_clusters: usize) -> Vec<Vec<K>> {
    let r2 = radius * radius;
    let max_clusters = max_clusters.max(1);

    let mut anchors: Vec<Position> = Vec::with_capacity(max_clusters);
    let mut clusters: Vec<Vec<K>> = Vec::with_capacity(max_clusters);

    for (id, pos) in points {
        match anchors.iter().position(|anchor| pos.distance_squared(anchor) <= r2) {
            Some(idx) => clusters[idx].push(id.clone()),
            None if clusters.len() < max_clusters => {
                anchors.push(*pos);
                clusters.push(vec![id.clone()]);
            }
            None => {
                if let Some(last) = clusters.last_mut() {
                    last.push(id.clone());
                }
            }
        }
    }

    clusters
}
