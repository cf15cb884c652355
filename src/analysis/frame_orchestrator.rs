// src/analysis/frame_orchestrator.rs
//
// Per-frame driver. For every decoded frame, in order:
//   tracker → (heatmap apply, history record, state machine evaluate) per
//   detection → lost-id reconciliation → annotation → count overlay →
//   heatmap blend → periodic aggregation, advancing the media clock once.
//
// Produces two images per frame: the fully annotated one for display/video
// writing and a clean heat-blended one for upload.

use crate::analysis::heatmap::HeatmapAccumulator;
use crate::analysis::periodic_aggregator::{PeriodicAggregator, TimeSliceReport};
use crate::analysis::state_machine::EntryExitStateMachine;
use crate::annotator;
use crate::person_tracker::ObjectTracker;
use crate::types::{Frame, NOT_DETECTED};
use crate::video_processor::MediaClock;
use anyhow::Result;
use opencv::core::Mat;
use opencv::prelude::*;
use std::collections::HashSet;
use tracing::{debug, info};

pub struct FrameOutput {
    /// Region, boxes, counts and heat overlay, for display and video writing
    pub annotated: Mat,
    /// Heat overlay on the untouched frame, for upload
    pub heatmap: Mat,
}

pub struct FrameOrchestrator {
    tracker: Box<dyn ObjectTracker>,
    machine: EntryExitStateMachine,
    heatmap: HeatmapAccumulator,
    aggregator: PeriodicAggregator,
    clock: MediaClock,
    baseline_taken: bool,
    any_identity_seen: bool,
    frames_processed: u64,
}

impl FrameOrchestrator {
    pub fn new(
        tracker: Box<dyn ObjectTracker>,
        machine: EntryExitStateMachine,
        aggregator: PeriodicAggregator,
        clock: MediaClock,
    ) -> Self {
        Self {
            tracker,
            machine,
            heatmap: HeatmapAccumulator::new(),
            aggregator,
            clock,
            baseline_taken: false,
            any_identity_seen: false,
            frames_processed: 0,
        }
    }

    /// Process one frame. Returns the annotated/heat frames and, when the
    /// reporting cadence was hit, the flushed time-slice report.
    pub fn process_frame(
        &mut self,
        frame: &Frame,
    ) -> Result<(FrameOutput, Option<TimeSliceReport>)> {
        self.heatmap.initialize(frame.height, frame.width);
        let now = self.clock.now();
        self.aggregator.note_frame_start(now);

        let tracked = self.tracker.track(frame)?;
        if tracked.is_empty() {
            debug!("No tracks found in this frame");
        }
        self.any_identity_seen |= !tracked.is_empty();

        if !self.baseline_taken {
            // Everyone visible on the very first frame is already inside
            for det in &tracked {
                self.heatmap.apply(&det.bbox)?;
                self.machine.admit_initial(frame, det, now)?;
            }
            self.baseline_taken = true;
        } else {
            let slice_frame = self.aggregator.slice_frame_count();
            for det in &tracked {
                self.heatmap.apply(&det.bbox)?;
                self.machine.observe(det);
                self.machine.evaluate(frame, det, now, slice_frame)?;
            }
        }

        let current_ids: HashSet<u32> = tracked.iter().map(|d| d.track_id).collect();
        self.machine.reconcile_lost(&current_ids, now)?;
        self.machine.verify_counters()?;

        // ── Annotation ──
        let clean = annotator::frame_to_bgr_mat(frame)?;
        let mut canvas = clean.try_clone()?;
        annotator::draw_region(&mut canvas, self.machine.region())?;
        for det in &tracked {
            let (age, gender) = match self.machine.identity(det.track_id) {
                Some(identity) => (
                    identity.age_label().to_string(),
                    identity.gender_label().to_string(),
                ),
                None => (NOT_DETECTED.to_string(), NOT_DETECTED.to_string()),
            };
            annotator::draw_identity(
                &mut canvas,
                &det.bbox,
                det.track_id,
                &det.class_name,
                &age,
                &gender,
                self.machine.is_counted_client(det.track_id),
            )?;
        }
        annotator::draw_count_panel(&mut canvas, self.machine.counts())?;

        let output = if self.any_identity_seen {
            FrameOutput {
                annotated: self.heatmap.render(&canvas)?,
                heatmap: self.heatmap.render(&clean)?,
            }
        } else {
            FrameOutput {
                annotated: canvas,
                heatmap: clean,
            }
        };

        // ── Clock and cadence ──
        self.clock.advance_frame();
        self.frames_processed += 1;
        let report = self
            .aggregator
            .complete_frame(&mut self.machine, self.clock.now())?;

        Ok((output, report))
    }

    /// Stream exhaustion: flush the partial slice (capturing in-progress
    /// dwell), then close every still-open dwell so the all-time customer
    /// record is complete.
    pub fn finish(&mut self) -> Result<TimeSliceReport> {
        let now = self.clock.now();
        let report = self.aggregator.final_flush(&mut self.machine, now)?;
        self.machine.close_open_dwells(now)?;
        info!(
            "Stream finished: occupancy {}, {} customers recorded",
            self.machine.occupancy(),
            self.machine.past_customers().len()
        );
        Ok(report)
    }

    pub fn machine(&self) -> &EntryExitStateMachine {
        &self.machine
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::state_machine::Region;
    use crate::classifier::RegionClassifier;
    use crate::types::{
        Classification, CountingConfig, ScheduleConfig, TrackedDetection,
    };

    struct ScriptedTracker {
        frames: Vec<Vec<TrackedDetection>>,
        cursor: usize,
    }

    impl ObjectTracker for ScriptedTracker {
        fn track(&mut self, _frame: &Frame) -> Result<Vec<TrackedDetection>> {
            let out = self
                .frames
                .get(self.cursor)
                .cloned()
                .unwrap_or_default();
            self.cursor += 1;
            Ok(out)
        }
    }

    struct FixedClassifier;

    impl RegionClassifier for FixedClassifier {
        fn classify(&mut self, _frame: &Frame, _bbox: &[f32; 4]) -> Result<Classification> {
            Ok(Classification {
                label: "adult".to_string(),
                confidence: 0.9,
            })
        }
    }

    fn frame() -> Frame {
        Frame {
            data: vec![0; 640 * 480 * 3],
            width: 640,
            height: 480,
            timestamp_ms: 0.0,
        }
    }

    fn det(id: u32, bbox: [f32; 4]) -> TrackedDetection {
        TrackedDetection {
            track_id: id,
            class_name: "person".to_string(),
            bbox,
        }
    }

    fn orchestrator(frames: Vec<Vec<TrackedDetection>>, interval: u64) -> FrameOrchestrator {
        let counting = CountingConfig {
            reevaluation_interval: 5,
            low_confidence_threshold: 0.75,
            report_interval_seconds: 1,
        };
        let machine = EntryExitStateMachine::new(
            Region::Line([[0.0, 400.0], [640.0, 400.0]]),
            Box::new(FixedClassifier),
            Box::new(FixedClassifier),
            &counting,
        );
        let clock = MediaClock::new(
            &ScheduleConfig {
                date: "2025-03-14".to_string(),
                start_time: "10:00:00".to_string(),
                job_id: "job-1".to_string(),
            },
            25.0,
        )
        .unwrap();
        FrameOrchestrator::new(
            Box::new(ScriptedTracker { frames, cursor: 0 }),
            machine,
            PeriodicAggregator::new(interval),
            clock,
        )
    }

    #[test]
    fn first_frame_population_becomes_the_baseline() {
        let mut orchestrator = orchestrator(
            vec![
                vec![det(1, [100.0, 410.0, 140.0, 470.0])],
                vec![det(1, [102.0, 410.0, 142.0, 470.0])],
            ],
            100,
        );
        orchestrator.process_frame(&frame()).unwrap();
        assert_eq!(orchestrator.machine().counts().in_count(), 1);

        // Second frame: same person, no crossing, still one client
        orchestrator.process_frame(&frame()).unwrap();
        assert_eq!(orchestrator.machine().counts().in_count(), 1);
        assert_eq!(orchestrator.machine().counts().dirty_in_count(), 0);
    }

    #[test]
    fn empty_frames_are_valid_and_reconcile_lost_ids() {
        let mut orchestrator = orchestrator(
            vec![
                vec![det(1, [100.0, 410.0, 140.0, 470.0])],
                vec![],
            ],
            100,
        );
        orchestrator.process_frame(&frame()).unwrap();
        assert_eq!(orchestrator.machine().occupancy(), 1);

        // Baseline client vanishes: dirty exit via reconciliation
        orchestrator.process_frame(&frame()).unwrap();
        assert_eq!(orchestrator.machine().occupancy(), 0);
        assert_eq!(orchestrator.machine().past_customers().len(), 1);
    }

    #[test]
    fn cadence_emits_a_report() {
        let frames = vec![
            vec![det(1, [100.0, 410.0, 140.0, 470.0])],
            vec![det(1, [100.0, 410.0, 140.0, 470.0])],
            vec![det(1, [100.0, 410.0, 140.0, 470.0])],
        ];
        let mut orchestrator = orchestrator(frames, 3);
        let (_, r1) = orchestrator.process_frame(&frame()).unwrap();
        let (_, r2) = orchestrator.process_frame(&frame()).unwrap();
        let (_, r3) = orchestrator.process_frame(&frame()).unwrap();
        assert!(r1.is_none() && r2.is_none());
        let report = r3.unwrap();
        assert_eq!(report.total_customers, 1);
    }

    #[test]
    fn finish_flushes_and_closes_open_dwells() {
        let mut orchestrator = orchestrator(
            vec![vec![det(1, [100.0, 410.0, 140.0, 470.0])]],
            100,
        );
        orchestrator.process_frame(&frame()).unwrap();
        let report = orchestrator.finish().unwrap();
        assert_eq!(report.total_customers, 1);
        // The active customer's dwell was closed into the all-time record
        assert_eq!(orchestrator.machine().past_customers().len(), 1);
        assert_eq!(orchestrator.machine().active_client_count(), 0);
    }
}
