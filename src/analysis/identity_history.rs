// src/analysis/identity_history.rs
//
// Per-track rolling position buffer plus the crossing geometry used by the
// entry/exit state machine. Purely geometric bookkeeping: no counting or
// lifecycle state lives here.

use std::collections::HashMap;
use std::collections::VecDeque;

/// Centroids kept per identity. Old positions fall off the front.
const MAX_HISTORY_POINTS: usize = 30;

#[derive(Debug, Default)]
pub struct IdentityHistory {
    points: HashMap<u32, VecDeque<(f32, f32)>>,
}

impl IdentityHistory {
    pub fn new() -> Self {
        Self {
            points: HashMap::new(),
        }
    }

    /// Append the centroid of `bbox` to the identity's trail.
    pub fn record(&mut self, track_id: u32, bbox: &[f32; 4]) {
        let trail = self.points.entry(track_id).or_default();
        trail.push_back(((bbox[0] + bbox[2]) * 0.5, (bbox[1] + bbox[3]) * 0.5));
        if trail.len() > MAX_HISTORY_POINTS {
            trail.pop_front();
        }
    }

    /// An identity needs two observed positions before any crossing analysis.
    pub fn has_history(&self, track_id: u32) -> bool {
        self.points.get(&track_id).map_or(false, |t| t.len() >= 2)
    }

    /// Second-to-last centroid, or `None` when fewer than two points exist.
    pub fn previous_position(&self, track_id: u32) -> Option<(f32, f32)> {
        let trail = self.points.get(&track_id)?;
        if trail.len() < 2 {
            return None;
        }
        trail.get(trail.len() - 2).copied()
    }

    pub fn remove(&mut self, track_id: u32) {
        self.points.remove(&track_id);
    }
}

// ============================================================================
// CROSSING GEOMETRY
// ============================================================================

/// True when segments (a1,a2) and (b1,b2) intersect, endpoints included.
pub fn segments_intersect(a1: (f32, f32), a2: (f32, f32), b1: (f32, f32), b2: (f32, f32)) -> bool {
    fn orientation(p: (f32, f32), q: (f32, f32), r: (f32, f32)) -> f32 {
        (q.0 - p.0) * (r.1 - p.1) - (q.1 - p.1) * (r.0 - p.0)
    }
    fn on_segment(p: (f32, f32), q: (f32, f32), r: (f32, f32)) -> bool {
        q.0 >= p.0.min(r.0) && q.0 <= p.0.max(r.0) && q.1 >= p.1.min(r.1) && q.1 <= p.1.max(r.1)
    }

    let d1 = orientation(b1, b2, a1);
    let d2 = orientation(b1, b2, a2);
    let d3 = orientation(a1, a2, b1);
    let d4 = orientation(a1, a2, b2);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }

    // Collinear touches
    (d1 == 0.0 && on_segment(b1, a1, b2))
        || (d2 == 0.0 && on_segment(b1, a2, b2))
        || (d3 == 0.0 && on_segment(a1, b1, a2))
        || (d4 == 0.0 && on_segment(a1, b2, a2))
}

/// Ray-casting containment test. Points exactly on an edge count as inside.
pub fn point_in_polygon(point: (f32, f32), polygon: &[[f32; 2]]) -> bool {
    let n = polygon.len();
    if n < 3 {
        return false;
    }
    let (px, py) = point;
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = (polygon[i][0], polygon[i][1]);
        let (xj, yj) = (polygon[j][0], polygon[j][1]);

        // Edge hit
        let cross = (xj - xi) * (py - yi) - (yj - yi) * (px - xi);
        if cross == 0.0
            && px >= xi.min(xj)
            && px <= xi.max(xj)
            && py >= yi.min(yj)
            && py <= yi.max(yj)
        {
            return true;
        }

        if (yi > py) != (yj > py) && px < (xj - xi) * (py - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}
