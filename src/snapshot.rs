use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

use crate::config::HeatmapConfig;
use crate::heatmap::{HeatmapGrid, HeatmapView};
use crate::state::{LiveCounts, OccupancyStatus};

/// Per-job aggregate behind the analytics summary.
#[derive(Clone, Copy, Debug, Default)]
struct RunStats {
    peak: u64,
    inside_sum: u64,
    samples: u64,
    alert_events: u64,
    alert_active: bool,
    status: Option<OccupancyStatus>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AnalyticsSummary {
    pub peak: u64,
    pub average: f64,
    pub alerts: u8,
    pub alert_events: u64,
    pub status: OccupancyStatus,
}

/// Everything a job publishes for one processed frame.
pub struct FrameUpdate {
    pub counts: LiveCounts,
    pub heatmap: HeatmapView,
    pub frame: Option<Arc<Vec<u8>>>,
    pub frame_index: u64,
    pub status: OccupancyStatus,
    pub alert_active: bool,
    pub new_alert: bool,
}

#[derive(Clone, Debug)]
struct Snapshot {
    generation: u64,
    counts: LiveCounts,
    heatmap: HeatmapView,
    frame: Option<Arc<Vec<u8>>>,
    frame_index: u64,
    stats: RunStats,
    updated_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    fn empty(generation: u64, heatmap: &HeatmapConfig) -> Self {
        Self {
            generation,
            counts: LiveCounts::default(),
            heatmap: HeatmapGrid::empty_view(heatmap),
            frame: None,
            frame_index: 0,
            stats: RunStats::default(),
            updated_at: None,
        }
    }
}

/// Latest published state, read by the HTTP side. A publish replaces counts,
/// grid and frame under one write lock.
pub struct LiveState {
    inner: RwLock<Snapshot>,
}

impl LiveState {
    pub fn new(heatmap: &HeatmapConfig) -> Self {
        Self {
            inner: RwLock::new(Snapshot::empty(0, heatmap)),
        }
    }

    pub fn reset(&self, generation: u64, heatmap: &HeatmapConfig) {
        *self.inner.write() = Snapshot::empty(generation, heatmap);
    }

    /// Returns false when the update belongs to a superseded job.
    pub fn publish(&self, generation: u64, update: FrameUpdate) -> bool {
        let mut guard = self.inner.write();
        if guard.generation != generation {
            return false;
        }
        let s = &mut *guard;
        s.counts = update.counts;
        s.heatmap = update.heatmap;
        if update.frame.is_some() {
            s.frame = update.frame;
        }
        s.frame_index = update.frame_index;
        s.stats.peak = s.stats.peak.max(update.counts.inside);
        s.stats.inside_sum += update.counts.inside;
        s.stats.samples += 1;
        if update.new_alert {
            s.stats.alert_events += 1;
        }
        s.stats.alert_active = update.alert_active;
        s.stats.status = Some(update.status);
        s.updated_at = Some(Utc::now());
        true
    }

    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    pub fn counts(&self) -> LiveCounts {
        self.inner.read().counts
    }

    pub fn heatmap(&self) -> HeatmapView {
        self.inner.read().heatmap.clone()
    }

    pub fn frame(&self) -> Option<Arc<Vec<u8>>> {
        self.inner.read().frame.clone()
    }

    pub fn frame_index(&self) -> u64 {
        self.inner.read().frame_index
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().updated_at
    }

    /// Counts and grid taken under the same read lock.
    pub fn consistent_view(&self) -> (LiveCounts, HeatmapView) {
        let guard = self.inner.read();
        (guard.counts, guard.heatmap.clone())
    }

    pub fn analytics(&self) -> AnalyticsSummary {
        let s = self.inner.read().stats;
        AnalyticsSummary {
            peak: s.peak,
            average: if s.samples == 0 {
                0.0
            } else {
                s.inside_sum as f64 / s.samples as f64
            },
            alerts: u8::from(s.alert_active),
            alert_events: s.alert_events,
            status: s.status.unwrap_or(OccupancyStatus::Normal),
        }
    }
}
