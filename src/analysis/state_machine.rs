// src/analysis/state_machine.rs
//
// Identity lifecycle and counting engine.
//
// Per-identity state machine:
//   New ──inward crossing──────────► InsideClean ──outward crossing──► ExitedClean
//    │                                   ▲    │
//    │ no crossing                       │    └──vanished from stream──► ExitedDirty
//    ▼                                   │
//   DirtyPending ──inward crossing───────┘
//    │
//    └──vanished from stream──► dropped (never was a client)
//
// This is the single registry for identities: position history, counters,
// dirty/finalized id sets and past-customer lists all live behind its API.
// Track ids come from the tracker adapter and are never reused, so a
// finalized id reappearing is ignored rather than re-counted.

use crate::analysis::count_aggregator::CountAggregator;
use crate::analysis::identity_history::{point_in_polygon, segments_intersect, IdentityHistory};
use crate::classifier::RegionClassifier;
use crate::types::{
    Classification, CountingConfig, EntranceType, ExitType, Frame, PastCustomer, TrackedDetection,
    NOT_DETECTED,
};
use anyhow::{anyhow, bail, Result};
use chrono::NaiveDateTime;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

// ============================================================================
// REGION
// ============================================================================

/// The monitored boundary: a 2-point entrance line tested by segment
/// intersection, or a polygon tested by containment of the latest centroid.
#[derive(Debug, Clone)]
pub enum Region {
    Line([[f32; 2]; 2]),
    Polygon(Vec<[f32; 2]>),
}

impl Region {
    pub fn from_points(points: &[[f32; 2]]) -> Result<Self> {
        match points.len() {
            0 | 1 => bail!("region needs at least 2 points, got {}", points.len()),
            2 => Ok(Self::Line([points[0], points[1]])),
            _ => Ok(Self::Polygon(points.to_vec())),
        }
    }

    pub fn points(&self) -> &[[f32; 2]] {
        match self {
            Self::Line(pts) => pts,
            Self::Polygon(pts) => pts,
        }
    }
}

// ============================================================================
// IDENTITY STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityState {
    /// Observed, no entrance decision yet
    New,
    /// Appeared without crossing the boundary; not a client
    DirtyPending,
    /// Counted client, currently in the store
    InsideClean,
    /// Terminal: crossed out through the boundary
    ExitedClean,
    /// Terminal: vanished from the stream while counted
    ExitedDirty,
}

#[derive(Debug, Clone)]
pub struct TrackedIdentity {
    pub track_id: u32,
    pub class_name: String,
    pub state: IdentityState,
    pub entrance_time: Option<NaiveDateTime>,
    pub exit_time: Option<NaiveDateTime>,
    pub entrance_type: Option<EntranceType>,
    pub exit_type: Option<ExitType>,
    pub is_present: bool,
    pub age: Option<Classification>,
    pub gender: Option<Classification>,
}

impl TrackedIdentity {
    fn new(det: &TrackedDetection) -> Self {
        Self {
            track_id: det.track_id,
            class_name: det.class_name.clone(),
            state: IdentityState::New,
            entrance_time: None,
            exit_time: None,
            entrance_type: None,
            exit_type: None,
            is_present: false,
            age: None,
            gender: None,
        }
    }

    pub fn age_label(&self) -> &str {
        self.age.as_ref().map_or(NOT_DETECTED, |c| c.label.as_str())
    }

    pub fn gender_label(&self) -> &str {
        self.gender
            .as_ref()
            .map_or(NOT_DETECTED, |c| c.label.as_str())
    }
}

// ============================================================================
// STATE MACHINE
// ============================================================================

pub struct EntryExitStateMachine {
    region: Region,
    history: IdentityHistory,
    counts: CountAggregator,
    identities: HashMap<u32, TrackedIdentity>,
    dirty_ids: HashSet<u32>,
    finalized_ids: HashSet<u32>,
    past_customers: Vec<PastCustomer>,
    slice_customers: Vec<PastCustomer>,
    prev_frame_ids: HashSet<u32>,
    age_classifier: Box<dyn RegionClassifier>,
    gender_classifier: Box<dyn RegionClassifier>,
    reevaluation_interval: u64,
    low_confidence: f32,
}

impl EntryExitStateMachine {
    pub fn new(
        region: Region,
        age_classifier: Box<dyn RegionClassifier>,
        gender_classifier: Box<dyn RegionClassifier>,
        counting: &CountingConfig,
    ) -> Self {
        Self {
            region,
            history: IdentityHistory::new(),
            counts: CountAggregator::new(),
            identities: HashMap::new(),
            dirty_ids: HashSet::new(),
            finalized_ids: HashSet::new(),
            past_customers: Vec::new(),
            slice_customers: Vec::new(),
            prev_frame_ids: HashSet::new(),
            age_classifier,
            gender_classifier,
            reevaluation_interval: counting.reevaluation_interval.max(1),
            low_confidence: counting.low_confidence_threshold,
        }
    }

    /// Register one detection of this frame: append to the position history
    /// and make sure a live identity record exists. Finalized ids keep only
    /// history, so a tracker hiccup that resurrects an old id cannot create
    /// a second identity.
    pub fn observe(&mut self, det: &TrackedDetection) {
        self.history.record(det.track_id, &det.bbox);
        if !self.finalized_ids.contains(&det.track_id) {
            self.identities
                .entry(det.track_id)
                .or_insert_with(|| TrackedIdentity::new(det));
        }
    }

    /// First-frame baseline: everyone already visible is assumed inside.
    /// Counted and classified immediately, no crossing test.
    pub fn admit_initial(
        &mut self,
        frame: &Frame,
        det: &TrackedDetection,
        now: NaiveDateTime,
    ) -> Result<()> {
        self.observe(det);
        let identity = self
            .identities
            .get_mut(&det.track_id)
            .ok_or_else(|| anyhow!("identity {} missing after observe", det.track_id))?;
        identity.state = IdentityState::InsideClean;
        identity.is_present = true;
        identity.entrance_type = Some(EntranceType::Initial);
        identity.entrance_time = Some(now);
        self.counts.count_clean_in(&det.class_name);
        info!("ID {}: present on first frame, counted in", det.track_id);
        self.classify(frame, det.track_id, &det.bbox);
        Ok(())
    }

    /// Apply the transition rules to one observed detection.
    /// `slice_frame` is the frame index inside the current reporting slice,
    /// used for the reevaluation cadence.
    pub fn evaluate(
        &mut self,
        frame: &Frame,
        det: &TrackedDetection,
        now: NaiveDateTime,
        slice_frame: u64,
    ) -> Result<()> {
        let id = det.track_id;
        if self.finalized_ids.contains(&id) {
            debug!("ID {id}: already finalized, ignoring re-observation");
            return Ok(());
        }
        // Crossing analysis needs two positions
        if !self.history.has_history(id) {
            return Ok(());
        }
        let Some(prev) = self.history.previous_position(id) else {
            return Ok(());
        };
        let current = det.centroid();

        let crossing = match &self.region {
            Region::Line(pts) => segments_intersect(
                prev,
                (det.bbox[0], det.bbox[1]),
                (pts[0][0], pts[0][1]),
                (pts[1][0], pts[1][1]),
            ),
            Region::Polygon(pts) => point_in_polygon(current, pts),
        };

        let state = self
            .identities
            .get(&id)
            .map(|i| i.state)
            .unwrap_or(IdentityState::New);

        if crossing {
            let dy = current.1 - prev.1;
            if dy < 0.0 {
                // Moving toward the entrance side
                if state == IdentityState::New || state == IdentityState::DirtyPending {
                    self.admit_clean(frame, det, now, state)?;
                }
            } else if state == IdentityState::InsideClean {
                self.counts.count_clean_out(&det.class_name);
                self.finalize(id, now, ExitType::Clean)?;
                info!("ID {id}: clean exit");
            }
        } else if state == IdentityState::New {
            // In frame without having crossed the boundary
            if let Some(identity) = self.identities.get_mut(&id) {
                identity.state = IdentityState::DirtyPending;
                identity.entrance_type = Some(EntranceType::Dirty);
            }
            self.dirty_ids.insert(id);
            self.counts.count_dirty_in(&det.class_name);
            info!("ID {id}: dirty entrance");
        }

        // Low-confidence classifications are retried on a fixed cadence
        if slice_frame % self.reevaluation_interval == 0 {
            self.reevaluate(frame, id, &det.bbox);
        }
        Ok(())
    }

    fn admit_clean(
        &mut self,
        frame: &Frame,
        det: &TrackedDetection,
        now: NaiveDateTime,
        previous_state: IdentityState,
    ) -> Result<()> {
        let id = det.track_id;
        if previous_state == IdentityState::DirtyPending {
            self.dirty_ids.remove(&id);
            self.counts.promote_dirty_to_clean(&det.class_name)?;
            info!("ID {id}: promoted from dirty entrance");
        }
        self.counts.count_clean_in(&det.class_name);
        let identity = self
            .identities
            .get_mut(&id)
            .ok_or_else(|| anyhow!("identity {id} missing during clean admission"))?;
        identity.state = IdentityState::InsideClean;
        identity.is_present = true;
        identity.entrance_type = Some(EntranceType::Clean);
        identity.entrance_time = Some(now);
        info!("ID {id}: clean enter at {now}");
        self.classify(frame, id, &det.bbox);
        Ok(())
    }

    /// End-of-frame reconciliation: every identity seen last frame but not
    /// in `current_ids` left the detection stream.
    pub fn reconcile_lost(&mut self, current_ids: &HashSet<u32>, now: NaiveDateTime) -> Result<()> {
        let lost: Vec<u32> = self
            .prev_frame_ids
            .difference(current_ids)
            .copied()
            .collect();

        for id in lost {
            if self.dirty_ids.remove(&id) {
                // Entered dirty, left dirty: undo the dirty entrance, no record kept
                let class_name = self
                    .identities
                    .get(&id)
                    .map(|i| i.class_name.clone())
                    .unwrap_or_else(|| "person".to_string());
                self.counts.count_dirty_and_dirty_exit(&class_name)?;
                self.identities.remove(&id);
                self.history.remove(id);
                info!("ID {id}: entered dirty and exited dirty");
            } else if let Some(identity) = self.identities.get(&id) {
                match identity.state {
                    IdentityState::InsideClean => {
                        let class_name = identity.class_name.clone();
                        self.counts.count_clean_dirty_exit(&class_name)?;
                        self.finalize(id, now, ExitType::Dirty)?;
                        info!("ID {id}: was counted and performed dirty exit");
                    }
                    _ => {
                        // Seen for a frame or two, never entered any counter
                        self.identities.remove(&id);
                        self.history.remove(id);
                        debug!("ID {id}: dropped before any entrance decision");
                    }
                }
            }
        }

        self.prev_frame_ids = current_ids.clone();
        Ok(())
    }

    /// Move an identity into the past-customer lists and purge it from every
    /// active map. This is the only removal path for counted clients: an identity
    /// cannot leave the registry without its dwell record being closed and
    /// validated.
    fn finalize(&mut self, id: u32, now: NaiveDateTime, exit_type: ExitType) -> Result<()> {
        let mut identity = self
            .identities
            .remove(&id)
            .ok_or_else(|| anyhow!("integrity violation: finalizing unknown id {id}"))?;
        identity.exit_time = Some(now);
        identity.exit_type = Some(exit_type);
        identity.is_present = false;
        identity.state = match exit_type {
            ExitType::Clean => IdentityState::ExitedClean,
            ExitType::Dirty => IdentityState::ExitedDirty,
        };
        let entrance_type = identity.entrance_type.ok_or_else(|| {
            anyhow!("integrity violation: finalizing id {id} with no entrance type")
        })?;
        let customer = PastCustomer::new(
            id,
            identity.entrance_time,
            identity.exit_time,
            entrance_type,
            exit_type,
            identity.age,
            identity.gender,
        )?;
        debug!(
            "ID {id}: finalized, dwell {:.1}s, exit {}",
            customer.dwell_seconds,
            exit_type.as_str()
        );
        self.past_customers.push(customer.clone());
        self.slice_customers.push(customer);
        self.finalized_ids.insert(id);
        self.history.remove(id);
        Ok(())
    }

    /// Stream exhaustion: close the dwell of everyone still inside so no
    /// active customer is dropped from the all-time record. Counters are
    /// left untouched; nobody departed, the footage ended.
    pub fn close_open_dwells(&mut self, now: NaiveDateTime) -> Result<()> {
        let open: Vec<u32> = self
            .identities
            .iter()
            .filter(|(_, i)| i.state == IdentityState::InsideClean)
            .map(|(id, _)| *id)
            .collect();
        for id in open {
            self.finalize(id, now, ExitType::Dirty)?;
            info!("ID {id}: still inside at end of stream, dwell closed");
        }
        self.identities.clear();
        self.dirty_ids.clear();
        Ok(())
    }

    fn classify(&mut self, frame: &Frame, id: u32, bbox: &[f32; 4]) {
        match self.age_classifier.classify(frame, bbox) {
            Ok(result) => {
                debug!("ID {id}: age {} ({:.2})", result.label, result.confidence);
                if let Some(identity) = self.identities.get_mut(&id) {
                    identity.age = Some(result);
                }
            }
            Err(e) => warn!("ID {id}: age classification failed: {e:#}"),
        }
        match self.gender_classifier.classify(frame, bbox) {
            Ok(result) => {
                debug!("ID {id}: gender {} ({:.2})", result.label, result.confidence);
                if let Some(identity) = self.identities.get_mut(&id) {
                    identity.gender = Some(result);
                }
            }
            Err(e) => warn!("ID {id}: gender classification failed: {e:#}"),
        }
    }

    /// Re-submit stored classifications that are absent or below the
    /// confidence threshold. A confident stored result is never overwritten.
    fn reevaluate(&mut self, frame: &Frame, id: u32, bbox: &[f32; 4]) {
        let Some(identity) = self.identities.get(&id) else {
            return;
        };
        if identity.state != IdentityState::InsideClean {
            return;
        }
        let low = self.low_confidence;
        let needs = |c: &Option<Classification>| c.as_ref().map_or(true, |c| c.confidence < low);

        if needs(&identity.age) {
            debug!("ID {id}: low-confidence age, reclassifying");
            match self.age_classifier.classify(frame, bbox) {
                Ok(result) => {
                    if let Some(identity) = self.identities.get_mut(&id) {
                        identity.age = Some(result);
                    }
                }
                Err(e) => warn!("ID {id}: age reevaluation failed: {e:#}"),
            }
        }
        let Some(identity) = self.identities.get(&id) else {
            return;
        };
        if needs(&identity.gender) {
            debug!("ID {id}: low-confidence gender, reclassifying");
            match self.gender_classifier.classify(frame, bbox) {
                Ok(result) => {
                    if let Some(identity) = self.identities.get_mut(&id) {
                        identity.gender = Some(result);
                    }
                }
                Err(e) => warn!("ID {id}: gender reevaluation failed: {e:#}"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn counts(&self) -> &CountAggregator {
        &self.counts
    }

    pub fn occupancy(&self) -> u64 {
        self.counts.occupancy()
    }

    /// True when this id is a counted, currently-present client.
    pub fn is_counted_client(&self, id: u32) -> bool {
        self.identities.get(&id).map_or(false, |i| i.is_present)
    }

    pub fn identity(&self, id: u32) -> Option<&TrackedIdentity> {
        self.identities.get(&id)
    }

    pub fn active_clients(&self) -> impl Iterator<Item = &TrackedIdentity> {
        self.identities
            .values()
            .filter(|i| i.state == IdentityState::InsideClean)
    }

    pub fn active_client_count(&self) -> usize {
        self.active_clients().count()
    }

    pub fn past_customers(&self) -> &[PastCustomer] {
        &self.past_customers
    }

    pub fn slice_customers(&self) -> &[PastCustomer] {
        &self.slice_customers
    }

    /// Called by the periodic aggregator after a flush. Only the slice list
    /// is cleared; the all-time list survives until the end of the run.
    pub fn clear_slice_customers(&mut self) {
        self.slice_customers.clear();
    }

    pub fn verify_counters(&self) -> Result<()> {
        self.counts.verify_reconciliation()
    }
}

// ============================================================================
// TESTS
// ============================================================================
