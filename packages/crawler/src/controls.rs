//! Global crawl/index control switches.
//!
//! Instead of process-wide mutable statics, a single `Controls` value is
//! constructed in `main` and shared (`Arc`) with the worker, the scheduler
//! and the indexing stage. Flags are plain atomics read fresh on every poll
//! iteration, so flipping a switch takes effect within one poll cycle.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use serde::Serialize;

pub struct Controls {
    crawl_enabled: AtomicBool,
    index_enabled: AtomicBool,
    force_stop: AtomicBool,
    force_pause_index: AtomicBool,
    min_interval_hours: AtomicU32,
    max_interval_hours: AtomicU32,
}

impl Controls {
    pub fn new(min_interval_hours: u32, max_interval_hours: u32) -> Self {
        Self {
            crawl_enabled: AtomicBool::new(true),
            index_enabled: AtomicBool::new(true),
            force_stop: AtomicBool::new(false),
            force_pause_index: AtomicBool::new(false),
            min_interval_hours: AtomicU32::new(min_interval_hours),
            max_interval_hours: AtomicU32::new(max_interval_hours),
        }
    }

    /// May the worker claim new jobs right now?
    pub fn crawl_allowed(&self) -> bool {
        self.crawl_enabled.load(Ordering::SeqCst) && !self.force_stop.load(Ordering::SeqCst)
    }

    /// May the indexing stage apply crawl results right now?
    pub fn index_allowed(&self) -> bool {
        self.index_enabled.load(Ordering::SeqCst) && !self.force_pause_index.load(Ordering::SeqCst)
    }

    pub fn set_crawl_enabled(&self, enabled: bool) {
        self.crawl_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_index_enabled(&self, enabled: bool) {
        self.index_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Stop claiming new jobs. In-flight jobs run to completion; their
    /// children stay queued until `resume`.
    pub fn force_stop(&self) {
        self.force_stop.store(true, Ordering::SeqCst);
        self.crawl_enabled.store(false, Ordering::SeqCst);
    }

    /// Keep crawling, stop applying results to the search index.
    pub fn pause_indexing(&self) {
        self.force_pause_index.store(true, Ordering::SeqCst);
        self.index_enabled.store(false, Ordering::SeqCst);
    }

    /// Clear every stop/pause flag and re-enable both stages.
    pub fn resume(&self) {
        self.force_stop.store(false, Ordering::SeqCst);
        self.force_pause_index.store(false, Ordering::SeqCst);
        self.crawl_enabled.store(true, Ordering::SeqCst);
        self.index_enabled.store(true, Ordering::SeqCst);
    }

    pub fn interval_bounds(&self) -> (u32, u32) {
        (
            self.min_interval_hours.load(Ordering::SeqCst),
            self.max_interval_hours.load(Ordering::SeqCst),
        )
    }

    pub fn set_interval_bounds(&self, min_hours: u32, max_hours: u32) {
        self.min_interval_hours.store(min_hours, Ordering::SeqCst);
        self.max_interval_hours.store(max_hours, Ordering::SeqCst);
    }

    pub fn status(&self) -> ControlsStatus {
        let (min_interval_hours, max_interval_hours) = self.interval_bounds();
        ControlsStatus {
            crawl_enabled: self.crawl_enabled.load(Ordering::SeqCst),
            index_enabled: self.index_enabled.load(Ordering::SeqCst),
            force_stop: self.force_stop.load(Ordering::SeqCst),
            force_pause_index: self.force_pause_index.load(Ordering::SeqCst),
            min_interval_hours,
            max_interval_hours,
        }
    }
}

impl Default for Controls {
    fn default() -> Self {
        Self::new(4, 24)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ControlsStatus {
    pub crawl_enabled: bool,
    pub index_enabled: bool,
    pub force_stop: bool,
    pub force_pause_index: bool,
    pub min_interval_hours: u32,
    pub max_interval_hours: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_allow_everything() {
        let controls = Controls::default();
        assert!(controls.crawl_allowed());
        assert!(controls.index_allowed());
        assert_eq!(controls.interval_bounds(), (4, 24));
    }

    #[test]
    fn test_force_stop_blocks_claiming() {
        let controls = Controls::default();
        controls.force_stop();
        assert!(!controls.crawl_allowed());
        // Indexing is independent of the crawl stop.
        assert!(controls.index_allowed());
    }

    #[test]
    fn test_pause_indexing_keeps_crawling() {
        let controls = Controls::default();
        controls.pause_indexing();
        assert!(controls.crawl_allowed());
        assert!(!controls.index_allowed());
    }

    #[test]
    fn test_resume_clears_all_flags() {
        let controls = Controls::default();
        controls.force_stop();
        controls.pause_indexing();
        controls.resume();
        assert!(controls.crawl_allowed());
        assert!(controls.index_allowed());

        let status = controls.status();
        assert!(!status.force_stop);
        assert!(!status.force_pause_index);
    }

    #[test]
    fn test_disable_without_force() {
        let controls = Controls::default();
        controls.set_crawl_enabled(false);
        assert!(!controls.crawl_allowed());
        controls.set_crawl_enabled(true);
        assert!(controls.crawl_allowed());
    }
}
