// src/person_tracker.rs
//
// IoU-based multi-object tracker for overhead retail footage.
//
// Design:
//   - Greedy IoU matching (sufficient for <20 people per frame)
//   - Centroid-distance fallback rescues matches when a box deforms faster
//     than IoU tolerates (person turning, partial occlusion)
//   - Tracks coast through brief detection gaps; while coasting no more
//     than `flicker_bridge_frames`, the last box is still emitted so a
//     1-2 frame detector flicker never reaches the counting logic
//   - Track ids are monotonically increasing and never reused

use crate::person_detection::{calculate_iou, Detection, PersonDetector};
use crate::types::{Frame, TrackedDetection, TrackingConfig};
use anyhow::Result;
use tracing::{debug, info};

/// Tracker seam consumed by the frame orchestrator. An empty result is a
/// valid frame, not an error.
pub trait ObjectTracker {
    fn track(&mut self, frame: &Frame) -> Result<Vec<TrackedDetection>>;
}

#[derive(Debug, Clone)]
struct Track {
    id: u32,
    bbox: [f32; 4],
    class_name: String,
    frames_since_hit: u32,
    hits: u32,
}

impl Track {
    fn center(&self) -> (f32, f32) {
        (
            (self.bbox[0] + self.bbox[2]) * 0.5,
            (self.bbox[1] + self.bbox[3]) * 0.5,
        )
    }
}

pub struct PersonTracker {
    detector: PersonDetector,
    assigner: TrackAssigner,
}

impl PersonTracker {
    pub fn new(detector: PersonDetector, config: TrackingConfig, frame_width: f32) -> Self {
        Self {
            detector,
            assigner: TrackAssigner::new(config, frame_width),
        }
    }
}

impl ObjectTracker for PersonTracker {
    fn track(&mut self, frame: &Frame) -> Result<Vec<TrackedDetection>> {
        let detections = self
            .detector
            .detect(&frame.data, frame.width, frame.height)?;
        Ok(self.assigner.update(&detections))
    }
}

/// Id assignment separated from the neural detector so the matching logic
/// is testable with synthetic detections.
pub struct TrackAssigner {
    config: TrackingConfig,
    tracks: Vec<Track>,
    next_id: u32,
    frame_width: f32,
}

impl TrackAssigner {
    pub fn new(config: TrackingConfig, frame_width: f32) -> Self {
        Self {
            config,
            tracks: Vec::with_capacity(32),
            next_id: 1,
            frame_width,
        }
    }

    pub fn update(&mut self, detections: &[Detection]) -> Vec<TrackedDetection> {
        let mut matched_tracks = vec![false; self.tracks.len()];
        let mut matched_dets = vec![false; detections.len()];

        // ────────────────────────────────────────────────────────────────
        // PHASE 1: IoU matching (primary)
        // ────────────────────────────────────────────────────────────────
        let mut iou_pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (di, det) in detections.iter().enumerate() {
                let iou = calculate_iou(&track.bbox, &det.bbox);
                if iou >= self.config.min_iou {
                    iou_pairs.push((ti, di, iou));
                }
            }
        }
        iou_pairs.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        for (ti, di, _) in &iou_pairs {
            if matched_tracks[*ti] || matched_dets[*di] {
                continue;
            }
            matched_tracks[*ti] = true;
            matched_dets[*di] = true;
            self.hit(*ti, &detections[*di]);
        }

        // ────────────────────────────────────────────────────────────────
        // PHASE 2: centroid-distance fallback
        // ────────────────────────────────────────────────────────────────
        let max_dist = self.frame_width * self.config.max_centroid_distance_ratio;
        let max_dist_sq = max_dist * max_dist;

        let mut centroid_pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            if matched_tracks[ti] {
                continue;
            }
            let (tcx, tcy) = track.center();
            for (di, det) in detections.iter().enumerate() {
                if matched_dets[di] {
                    continue;
                }
                let dcx = (det.bbox[0] + det.bbox[2]) * 0.5;
                let dcy = (det.bbox[1] + det.bbox[3]) * 0.5;
                let dist_sq = (tcx - dcx).powi(2) + (tcy - dcy).powi(2);
                if dist_sq < max_dist_sq {
                    centroid_pairs.push((ti, di, dist_sq));
                }
            }
        }
        centroid_pairs.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));

        for (ti, di, dist_sq) in &centroid_pairs {
            if matched_tracks[*ti] || matched_dets[*di] {
                continue;
            }
            matched_tracks[*ti] = true;
            matched_dets[*di] = true;
            debug!(
                "Centroid rescue: track {} ↔ det (dist={:.0}px)",
                self.tracks[*ti].id,
                dist_sq.sqrt()
            );
            self.hit(*ti, &detections[*di]);
        }

        // Unmatched tracks coast
        for (ti, matched) in matched_tracks.iter().enumerate() {
            if !matched {
                self.tracks[ti].frames_since_hit += 1;
            }
        }

        // Unmatched detections start new tracks; ids are never reused
        for (di, matched) in matched_dets.iter().enumerate() {
            if !matched {
                let det = &detections[di];
                info!(
                    "New track {} at [{:.0},{:.0},{:.0},{:.0}]",
                    self.next_id, det.bbox[0], det.bbox[1], det.bbox[2], det.bbox[3]
                );
                self.tracks.push(Track {
                    id: self.next_id,
                    bbox: det.bbox,
                    class_name: det.class_name.clone(),
                    frames_since_hit: 0,
                    hits: 1,
                });
                self.next_id += 1;
            }
        }

        // Prune dead tracks
        let max_coast = self.config.max_coast_frames;
        self.tracks.retain(|t| {
            if t.frames_since_hit > max_coast {
                debug!("Track {} pruned after coasting {} frames", t.id, t.frames_since_hit);
                false
            } else {
                true
            }
        });

        // Emit everything visible this frame, plus short-coasting tracks at
        // their last seen box to bridge detector flicker
        let bridge = self.config.flicker_bridge_frames;
        self.tracks
            .iter()
            .filter(|t| t.frames_since_hit == 0 || (t.hits > 1 && t.frames_since_hit <= bridge))
            .map(|t| TrackedDetection {
                track_id: t.id,
                class_name: t.class_name.clone(),
                bbox: t.bbox,
            })
            .collect()
    }

    fn hit(&mut self, ti: usize, det: &Detection) {
        let track = &mut self.tracks[ti];
        track.bbox = det.bbox;
        track.frames_since_hit = 0;
        track.hits += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TrackingConfig {
        TrackingConfig {
            min_iou: 0.2,
            max_coast_frames: 30,
            flicker_bridge_frames: 2,
            max_centroid_distance_ratio: 0.1,
        }
    }

    fn det(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection {
            bbox: [x1, y1, x2, y2],
            confidence: 0.8,
            class_id: 0,
            class_name: "person".to_string(),
        }
    }

    #[test]
    fn id_is_stable_across_frames() {
        let mut assigner = TrackAssigner::new(config(), 1280.0);
        let first = assigner.update(&[det(100.0, 100.0, 160.0, 260.0)]);
        assert_eq!(first.len(), 1);
        let id = first[0].track_id;

        let second = assigner.update(&[det(108.0, 104.0, 168.0, 264.0)]);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].track_id, id);
    }

    #[test]
    fn flicker_gap_is_bridged_with_the_last_box() {
        let mut assigner = TrackAssigner::new(config(), 1280.0);
        assigner.update(&[det(100.0, 100.0, 160.0, 260.0)]);
        assigner.update(&[det(102.0, 100.0, 162.0, 260.0)]);

        // Detector drops the box for one frame: the track is still emitted
        let bridged = assigner.update(&[]);
        assert_eq!(bridged.len(), 1);
        assert_eq!(bridged[0].bbox, [102.0, 100.0, 162.0, 260.0]);

        // Box comes back and keeps its id
        let resumed = assigner.update(&[det(104.0, 100.0, 164.0, 260.0)]);
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].track_id, bridged[0].track_id);
    }

    #[test]
    fn long_absence_ends_the_bridge_but_not_the_track() {
        let mut assigner = TrackAssigner::new(config(), 1280.0);
        assigner.update(&[det(100.0, 100.0, 160.0, 260.0)]);
        assigner.update(&[det(100.0, 100.0, 160.0, 260.0)]);

        assert_eq!(assigner.update(&[]).len(), 1); // bridged
        assert_eq!(assigner.update(&[]).len(), 1); // bridged
        assert_eq!(assigner.update(&[]).len(), 0); // gone from output

        // Within coast range the id is still recovered
        let back = assigner.update(&[det(100.0, 100.0, 160.0, 260.0)]);
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].track_id, 1);
    }

    #[test]
    fn ids_are_never_reused() {
        let mut assigner = TrackAssigner::new(config(), 1280.0);
        assigner.update(&[det(100.0, 100.0, 160.0, 260.0)]);
        // Coast past deletion
        for _ in 0..32 {
            assigner.update(&[]);
        }
        let fresh = assigner.update(&[det(100.0, 100.0, 160.0, 260.0)]);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].track_id, 2);
    }

    #[test]
    fn distant_detection_starts_a_new_track() {
        let mut assigner = TrackAssigner::new(config(), 1280.0);
        assigner.update(&[det(100.0, 100.0, 160.0, 260.0)]);
        let out = assigner.update(&[
            det(100.0, 100.0, 160.0, 260.0),
            det(900.0, 400.0, 960.0, 560.0),
        ]);
        assert_eq!(out.len(), 2);
        let ids: Vec<u32> = out.iter().map(|t| t.track_id).collect();
        assert!(ids.contains(&1) && ids.contains(&2));
    }

    #[test]
    fn centroid_fallback_rescues_deformed_boxes() {
        let mut assigner = TrackAssigner::new(config(), 1280.0);
        assigner.update(&[det(500.0, 200.0, 560.0, 360.0)]);
        // Same person, box suddenly much larger: IoU below threshold,
        // centroid within range
        let out = assigner.update(&[det(460.0, 160.0, 640.0, 420.0)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].track_id, 1);
    }
}
