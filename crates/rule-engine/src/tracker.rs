//! Scan-local dependency recorder
//!
//! While a condition callback runs, every cell the script touches is
//! recorded here. The engine indexes the rule under each touched cell and
//! timer afterwards; if any touched cell was incomplete, the rule is
//! skipped for the whole scan.

use cell_model::CellSpec;

/// Dependencies collected during one condition invocation
#[derive(Debug, Clone, Default)]
pub struct ScanDeps {
    pub cells: Vec<CellSpec>,
    pub timers: Vec<String>,
    pub touched_incomplete: bool,
}

impl ScanDeps {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty() && self.timers.is_empty()
    }

    /// Fold another invocation's dependencies in (used by `Or` conditions,
    /// where every child's dependencies accumulate).
    pub fn merge(&mut self, other: ScanDeps) {
        for cell in other.cells {
            if !self.cells.contains(&cell) {
                self.cells.push(cell);
            }
        }
        for timer in other.timers {
            if !self.timers.contains(&timer) {
                self.timers.push(timer);
            }
        }
        self.touched_incomplete |= other.touched_incomplete;
    }
}

/// Recorder active only while a condition callback runs
#[derive(Debug, Default)]
pub struct DepTracker {
    active: Option<ScanDeps>,
}

impl DepTracker {
    /// Start recording. Any previous recording is discarded.
    pub fn begin(&mut self) {
        self.active = Some(ScanDeps::default());
    }

    /// Stop recording and take the collected set.
    pub fn finish(&mut self) -> ScanDeps {
        self.active.take().unwrap_or_default()
    }

    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Note a cell access; accesses outside a recording window are ignored
    /// (reads from `then` callbacks don't create dependencies).
    pub fn record_cell(&mut self, spec: &CellSpec, complete: bool) {
        if let Some(deps) = &mut self.active {
            if !deps.cells.contains(spec) {
                deps.cells.push(spec.clone());
            }
            if !complete {
                deps.touched_incomplete = true;
            }
        }
    }

    /// Note a named-timer access (`timers[name]`).
    pub fn record_timer(&mut self, name: &str) {
        if let Some(deps) = &mut self.active {
            if !deps.timers.iter().any(|t| t == name) {
                deps.timers.push(name.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_only_while_active() {
        let mut tracker = DepTracker::default();
        tracker.record_cell(&CellSpec::new("d", "c"), true);
        assert!(tracker.finish().is_empty());

        tracker.begin();
        tracker.record_cell(&CellSpec::new("d", "c"), true);
        tracker.record_cell(&CellSpec::new("d", "c"), true);
        tracker.record_timer("t");
        let deps = tracker.finish();
        assert_eq!(deps.cells.len(), 1);
        assert_eq!(deps.timers, vec!["t".to_string()]);
        assert!(!deps.touched_incomplete);
    }

    #[test]
    fn test_incomplete_touch_is_sticky() {
        let mut tracker = DepTracker::default();
        tracker.begin();
        tracker.record_cell(&CellSpec::new("d", "a"), false);
        tracker.record_cell(&CellSpec::new("d", "b"), true);
        assert!(tracker.finish().touched_incomplete);
    }

    #[test]
    fn test_merge_accumulates() {
        let mut a = ScanDeps {
            cells: vec![CellSpec::new("d", "a")],
            timers: vec![],
            touched_incomplete: false,
        };
        let b = ScanDeps {
            cells: vec![CellSpec::new("d", "a"), CellSpec::new("d", "b")],
            timers: vec!["t".to_string()],
            touched_incomplete: true,
        };
        a.merge(b);
        assert_eq!(a.cells.len(), 2);
        assert!(a.touched_incomplete);
    }
}
