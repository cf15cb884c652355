// src/analysis/count_aggregator.rs
//
// Classwise clean/dirty entrance and exit counters plus occupancy.
// Three counter families must stay reconciled at all times:
//   - global clean in/out
//   - global dirty in/out
//   - per-class {clean_in, dirty_in, clean_out, dirty_out}
// Every decrement is checked; a counter that would go negative is a logic
// error in the caller and is surfaced as an Err, never clamped.

use anyhow::{bail, Result};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClasswiseCounts {
    pub clean_in: u64,
    pub dirty_in: u64,
    pub clean_out: u64,
    pub dirty_out: u64,
}

#[derive(Debug, Default)]
pub struct CountAggregator {
    in_count: u64,
    out_count: u64,
    dirty_in_count: u64,
    dirty_out_count: u64,
    classwise: HashMap<String, ClasswiseCounts>,
}

impl CountAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn class_entry(&mut self, class_name: &str) -> &mut ClasswiseCounts {
        self.classwise.entry(class_name.to_string()).or_default()
    }

    /// A client crossed the boundary inward (or was part of the initial
    /// baseline population).
    pub fn count_clean_in(&mut self, class_name: &str) {
        self.in_count += 1;
        self.class_entry(class_name).clean_in += 1;
    }

    /// A client crossed the boundary outward.
    pub fn count_clean_out(&mut self, class_name: &str) {
        self.out_count += 1;
        self.class_entry(class_name).clean_out += 1;
    }

    /// An identity appeared in frame without crossing the boundary.
    pub fn count_dirty_in(&mut self, class_name: &str) {
        self.dirty_in_count += 1;
        self.class_entry(class_name).dirty_in += 1;
    }

    /// A dirty entrant crossed the boundary inward after all. Removes the
    /// dirty mark only; the caller follows up with `count_clean_in`.
    pub fn promote_dirty_to_clean(&mut self, class_name: &str) -> Result<()> {
        if self.dirty_in_count == 0 {
            bail!("counter underflow: promoting {class_name} with global dirty_in at 0");
        }
        let counts = self.class_entry(class_name);
        if counts.dirty_in == 0 {
            bail!("counter underflow: promoting {class_name} with classwise dirty_in at 0");
        }
        counts.dirty_in -= 1;
        self.dirty_in_count -= 1;
        Ok(())
    }

    /// A dirty entrant vanished before ever becoming a client. Undoes the
    /// dirty entrance; clean counters are untouched.
    pub fn count_dirty_and_dirty_exit(&mut self, class_name: &str) -> Result<()> {
        if self.dirty_in_count == 0 {
            bail!("counter underflow: dirty exit of {class_name} with global dirty_in at 0");
        }
        let counts = self.class_entry(class_name);
        if counts.dirty_in == 0 {
            bail!("counter underflow: dirty exit of {class_name} with classwise dirty_in at 0");
        }
        counts.dirty_in -= 1;
        self.dirty_in_count -= 1;
        Ok(())
    }

    /// A counted client left the frame without using the exit boundary.
    /// The person leaves the active population, so the clean in-counters are
    /// rolled back (globally and for the class) to keep occupancy and the
    /// classwise reconciliation honest, and a dirty exit is recorded.
    pub fn count_clean_dirty_exit(&mut self, class_name: &str) -> Result<()> {
        if self.in_count == 0 {
            bail!("counter underflow: dirty exit of counted {class_name} with in_count at 0");
        }
        let counts = self.class_entry(class_name);
        if counts.clean_in == 0 {
            bail!(
                "counter underflow: dirty exit of counted {class_name} with classwise clean_in at 0"
            );
        }
        counts.clean_in -= 1;
        counts.dirty_out += 1;
        self.in_count -= 1;
        self.dirty_out_count += 1;
        Ok(())
    }

    /// Current clean occupancy.
    pub fn occupancy(&self) -> u64 {
        self.in_count.saturating_sub(self.out_count)
    }

    pub fn in_count(&self) -> u64 {
        self.in_count
    }

    pub fn out_count(&self) -> u64 {
        self.out_count
    }

    pub fn dirty_in_count(&self) -> u64 {
        self.dirty_in_count
    }

    pub fn dirty_out_count(&self) -> u64 {
        self.dirty_out_count
    }

    pub fn classwise(&self) -> &HashMap<String, ClasswiseCounts> {
        &self.classwise
    }

    /// Cross-check the classwise sums against the global counters. A mismatch
    /// means a counting path skipped one of the two families.
    pub fn verify_reconciliation(&self) -> Result<()> {
        let clean_in: u64 = self.classwise.values().map(|c| c.clean_in).sum();
        let clean_out: u64 = self.classwise.values().map(|c| c.clean_out).sum();
        let dirty_in: u64 = self.classwise.values().map(|c| c.dirty_in).sum();
        let dirty_out: u64 = self.classwise.values().map(|c| c.dirty_out).sum();
        if clean_in != self.in_count
            || clean_out != self.out_count
            || dirty_in != self.dirty_in_count
            || dirty_out != self.dirty_out_count
        {
            bail!(
                "counter drift: classwise ({clean_in}/{clean_out}/{dirty_in}/{dirty_out}) vs global ({}/{}/{}/{})",
                self.in_count,
                self.out_count,
                self.dirty_in_count,
                self.dirty_out_count
            );
        }
        if self.out_count > self.in_count {
            bail!(
                "counter drift: out_count {} exceeds in_count {}",
                self.out_count,
                self.in_count
            );
        }
        Ok(())
    }
}
