// src/state.rs

use serde::{Deserialize, Serialize};

// Live config defaults
pub const DEFAULT_CONFIDENCE: f32 = 0.5;
pub const DEFAULT_SAMPLE_RATE: u32 = 10;
pub const DEFAULT_MAX_OCCUPANCY: u32 = 1000;

// Heatmap
pub const GRID_ROWS: usize = 5;
pub const GRID_COLS: usize = 8;
pub const MAX_DENSITY: f32 = 10.0;
pub const HEATMAP_DECAY: f32 = 0.85;

// Tracking
pub const PERSON_CLASS: i64 = 0;
pub const TRACK_FRAME_RATE: usize = 30;
pub const TRACK_BUFFER: usize = 30;
pub const TRACK_THRESH: f32 = 0.5;
pub const HIGH_THRESH: f32 = 0.6;
pub const MATCH_THRESH: f32 = 0.8;
pub const LEDGER_EVICT_AFTER: u64 = 30;

// Job
pub const MAX_READ_ERRORS: u32 = 25;
pub const JPEG_QUALITY: u8 = 80;

// Settings sync
pub const SYNC_INTERVAL_SECS: u64 = 10;
pub const SYNC_TIMEOUT_SECS: u64 = 3;

// ================== CORE TYPES ==================

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn from_ltwh(ltwh: [f32; 4]) -> Self {
        let [l, t, w, h] = ltwh;
        Self {
            x1: l,
            y1: t,
            x2: l + w,
            y2: t + h,
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn to_ltwh(self) -> [f32; 4] {
        [self.x1, self.y1, self.width(), self.height()]
    }
}

/// Integer pixel centroid of a box, truncating the corners first.
pub fn bbox_centroid(b: BBox) -> (i32, i32) {
    let (l, t, r, btm) = (b.x1 as i32, b.y1 as i32, b.x2 as i32, b.y2 as i32);
    ((l + r).div_euclid(2), (t + btm).div_euclid(2))
}

pub type TrackId = u64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveCounts {
    pub entered: u64,
    pub exited: u64,
    pub inside: u64,
}

// ================== OCCUPANCY ==================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OccupancyStatus {
    Normal,
    Warning,
    Critical,
}

impl OccupancyStatus {
    pub fn classify(inside: u64, max_occupancy: u32) -> Self {
        let max = max_occupancy as u64;
        if inside > max {
            OccupancyStatus::Critical
        } else if inside * 5 >= max * 4 {
            OccupancyStatus::Warning
        } else {
            OccupancyStatus::Normal
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OccupancyStatus::Normal => "NORMAL",
            OccupancyStatus::Warning => "WARNING",
            OccupancyStatus::Critical => "CRITICAL",
        }
    }
}
