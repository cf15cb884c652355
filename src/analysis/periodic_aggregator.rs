// src/analysis/periodic_aggregator.rs
//
// Time-sliced rollups. Every N processed frames (default: one second of
// source video) the current occupancy, demographics and dwell figures are
// folded into a TimeSliceReport. Only the slice-local finalized-customer
// list and frame counter reset on flush. Active identities carry over, so
// a customer spanning several slices keeps contributing to each of them.

use crate::analysis::state_machine::EntryExitStateMachine;
use crate::types::PastCustomer;
use anyhow::Result;
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AgeBuckets {
    pub young: u64,
    pub children: u64,
    pub adult: u64,
    pub elder: u64,
}

impl AgeBuckets {
    fn add(&mut self, label: &str) {
        match label {
            "young" => self.young += 1,
            "children" => self.children += 1,
            "adult" => self.adult += 1,
            "elder" => self.elder += 1,
            // "Not Detected" and anything unexpected stays uncounted
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSliceReport {
    pub date: NaiveDate,
    pub slice_start: NaiveDateTime,
    pub slice_end: NaiveDateTime,
    pub total_customers: u64,
    pub total_male: u64,
    pub total_female: u64,
    pub customers_by_age: AgeBuckets,
    pub avg_dwell_seconds: f64,
}

pub struct PeriodicAggregator {
    interval_frames: u64,
    slice_frame_count: u64,
    slice_start: Option<NaiveDateTime>,
}

impl PeriodicAggregator {
    pub fn new(interval_frames: u64) -> Self {
        Self {
            interval_frames: interval_frames.max(1),
            slice_frame_count: 0,
            slice_start: None,
        }
    }

    /// Frame index within the current slice, used by the orchestrator for
    /// the reevaluation cadence.
    pub fn slice_frame_count(&self) -> u64 {
        self.slice_frame_count
    }

    /// Record that a frame at media time `now` is being processed. The first
    /// frame of a slice pins the slice start timestamp.
    pub fn note_frame_start(&mut self, now: NaiveDateTime) {
        if self.slice_frame_count == 0 {
            self.slice_start = Some(now);
        }
    }

    /// Advance the slice frame counter; flush when the cadence is reached.
    pub fn complete_frame(
        &mut self,
        machine: &mut EntryExitStateMachine,
        now: NaiveDateTime,
    ) -> Result<Option<TimeSliceReport>> {
        self.slice_frame_count += 1;
        if self.slice_frame_count % self.interval_frames == 0 {
            let report = self.flush(machine, now)?;
            return Ok(Some(report));
        }
        Ok(None)
    }

    /// Mandatory flush at stream exhaustion, regardless of cadence position.
    pub fn final_flush(
        &mut self,
        machine: &mut EntryExitStateMachine,
        now: NaiveDateTime,
    ) -> Result<TimeSliceReport> {
        self.flush(machine, now)
    }

    /// Roll the current slice into a report and reset the slice-local state.
    /// Demographics merge the slice's finalized customers with the stored
    /// labels of identities still inside; dwell merges closed dwell with the
    /// in-progress dwell of those same identities.
    fn flush(
        &mut self,
        machine: &mut EntryExitStateMachine,
        now: NaiveDateTime,
    ) -> Result<TimeSliceReport> {
        let slice_start = self.slice_start.unwrap_or(now);
        let total_customers = machine.occupancy();

        let mut ages = AgeBuckets::default();
        let mut male = 0u64;
        let mut female = 0u64;
        let mut total_dwell = 0.0f64;

        for customer in machine.slice_customers() {
            merge_customer(customer, &mut ages, &mut male, &mut female);
            total_dwell += customer.dwell_seconds;
        }
        let closed = machine.slice_customers().len() as u64;

        let mut active = 0u64;
        for identity in machine.active_clients() {
            if let Some(age) = &identity.age {
                ages.add(&age.label);
            }
            match identity.gender.as_ref().map(|g| g.label.as_str()) {
                Some("male") => male += 1,
                Some("female") => female += 1,
                _ => {}
            }
            if let Some(entrance) = identity.entrance_time {
                total_dwell += (now - entrance).num_milliseconds() as f64 / 1000.0;
            }
            active += 1;
        }

        // Average over everyone the slice saw: closed customers plus the
        // ones still inside with an in-progress dwell.
        let denominator = closed + active;
        let avg_dwell_seconds = if denominator > 0 {
            total_dwell / denominator as f64
        } else {
            0.0
        };

        let report = TimeSliceReport {
            date: slice_start.date(),
            slice_start,
            slice_end: now,
            total_customers,
            total_male: male,
            total_female: female,
            customers_by_age: ages,
            avg_dwell_seconds,
        };
        info!(
            "Slice {} -> {}: {} customers, avg dwell {:.1}s",
            slice_start, now, total_customers, avg_dwell_seconds
        );
        debug!(
            "Slice demographics: {male} male / {female} female, ages {:?}",
            report.customers_by_age
        );

        machine.clear_slice_customers();
        self.slice_frame_count = 0;
        self.slice_start = None;
        Ok(report)
    }
}

fn merge_customer(
    customer: &PastCustomer,
    ages: &mut AgeBuckets,
    male: &mut u64,
    female: &mut u64,
) {
    if let Some(age) = &customer.age {
        ages.add(&age.label);
    }
    match customer.gender.as_ref().map(|g| g.label.as_str()) {
        Some("male") => *male += 1,
        Some("female") => *female += 1,
        _ => {}
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
    use crate::types::{Classification, CountingConfig, Frame, TrackedDetection};
    use chrono::NaiveDate;
    use std::collections::HashSet;

    struct FixedClassifier {
        label: &'static str,
    }

    impl RegionClassifier for FixedClassifier {
        fn classify(&mut self, _frame: &Frame, _bbox: &[f32; 4]) -> Result<Classification> {
            Ok(Classification {
                label: self.label.to_string(),
                confidence: 0.9,
            })
        }
    }

    fn frame() -> Frame {
        Frame {
            data: vec![0; 64 * 64 * 3],
            width: 64,
            height: 64,
            timestamp_ms: 0.0,
        }
    }

    fn t(secs: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 14)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
            + chrono::Duration::seconds(secs)
    }

    fn det(id: u32, bbox: [f32; 4]) -> TrackedDetection {
        TrackedDetection {
            track_id: id,
            class_name: "person".to_string(),
            bbox,
        }
    }

    fn machine() -> EntryExitStateMachine {
        let counting = CountingConfig {
            reevaluation_interval: 5,
            low_confidence_threshold: 0.75,
            report_interval_seconds: 1,
        };
        EntryExitStateMachine::new(
            Region::Line([[0.0, 400.0], [640.0, 400.0]]),
            Box::new(FixedClassifier { label: "adult" }),
            Box::new(FixedClassifier { label: "female" }),
            &counting,
        )
    }

    const ABOVE: [f32; 4] = [90.0, 380.0, 110.0, 400.0]; // centroid (100, 390)
    const BELOW: [f32; 4] = [90.0, 400.0, 110.0, 420.0]; // centroid (100, 410)

    #[test]
    fn scenario_e_flush_merges_closed_and_in_progress_dwell() {
        let mut machine = machine();

        // Three clean entrances at t=0 (baseline population)
        for id in 1..=3 {
            machine
                .admit_initial(&frame(), &det(id, ABOVE), t(0))
                .unwrap();
        }

        // Customer 1 walks out through the line at t=10 (dwell 10s)
        let exit_det = det(1, BELOW);
        machine.observe(&exit_det);
        machine.evaluate(&frame(), &exit_det, t(10), 1).unwrap();
        let ids: HashSet<u32> = [1u32, 2, 3].into_iter().collect();
        machine.reconcile_lost(&ids, t(10)).unwrap();

        let mut aggregator = PeriodicAggregator::new(25);
        aggregator.note_frame_start(t(0));
        let report = aggregator.final_flush(&mut machine, t(12)).unwrap();

        // Occupancy at flush: 3 in, 1 out
        assert_eq!(report.total_customers, 2);
        // (10 closed + 12 + 12 in-progress) / 3
        assert!((report.avg_dwell_seconds - 34.0 / 3.0).abs() < 1e-9);
        assert_eq!(report.total_female, 3);
        assert_eq!(report.customers_by_age.adult, 3);
        assert_eq!(report.slice_start, t(0));
        assert_eq!(report.slice_end, t(12));
    }

    #[test]
    fn flush_clears_only_slice_state() {
        let mut machine = machine();
        machine
            .admit_initial(&frame(), &det(1, ABOVE), t(0))
            .unwrap();
        let exit_det = det(1, BELOW);
        machine.observe(&exit_det);
        machine.evaluate(&frame(), &exit_det, t(5), 1).unwrap();
        machine
            .reconcile_lost(&[1u32].into_iter().collect(), t(5))
            .unwrap();
        assert_eq!(machine.slice_customers().len(), 1);

        let mut aggregator = PeriodicAggregator::new(25);
        aggregator.note_frame_start(t(0));
        aggregator.final_flush(&mut machine, t(6)).unwrap();

        // Slice list cleared, all-time list intact
        assert!(machine.slice_customers().is_empty());
        assert_eq!(machine.past_customers().len(), 1);

        // An empty follow-up slice reports zeros rather than dividing by zero
        let report = aggregator.final_flush(&mut machine, t(12)).unwrap();
        assert_eq!(report.avg_dwell_seconds, 0.0);
        assert_eq!(report.total_customers, 0);
    }

    #[test]
    fn cadence_flushes_every_interval_frames() {
        let mut machine = machine();
        let mut aggregator = PeriodicAggregator::new(5);

        for i in 0..4 {
            aggregator.note_frame_start(t(i));
            let flushed = aggregator.complete_frame(&mut machine, t(i)).unwrap();
            assert!(flushed.is_none(), "frame {i} must not flush");
        }
        aggregator.note_frame_start(t(4));
        let flushed = aggregator.complete_frame(&mut machine, t(4)).unwrap();
        assert!(flushed.is_some());
        // Counter reset: next frame starts a fresh slice
        assert_eq!(aggregator.slice_frame_count(), 0);
    }

    #[test]
    fn ongoing_customers_keep_counting_into_the_next_slice() {
        let mut machine = machine();
        machine
            .admit_initial(&frame(), &det(2, ABOVE), t(0))
            .unwrap();

        let mut aggregator = PeriodicAggregator::new(25);
        aggregator.note_frame_start(t(0));
        let first = aggregator.final_flush(&mut machine, t(10)).unwrap();
        assert!((first.avg_dwell_seconds - 10.0).abs() < 1e-9);

        // Still inside during the second slice: dwell keeps growing
        aggregator.note_frame_start(t(10));
        let second = aggregator.final_flush(&mut machine, t(20)).unwrap();
        assert!((second.avg_dwell_seconds - 20.0).abs() < 1e-9);
        assert_eq!(second.total_customers, 1);
    }
}
