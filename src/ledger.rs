use std::collections::HashMap;

use crate::state::TrackId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Crossing {
    /// Net upward motion, currently in the upper half.
    Entered,
    /// Net downward motion, currently in the lower half.
    Exited,
}

#[derive(Clone, Debug)]
pub struct TrackState {
    pub id: TrackId,
    pub centroids: Vec<(i32, i32)>,
    pub counted: bool,
    pub last_seen: u64,
}

impl TrackState {
    fn new(id: TrackId, centroid: (i32, i32), frame_idx: u64) -> Self {
        Self {
            id,
            centroids: vec![centroid],
            counted: false,
            last_seen: frame_idx,
        }
    }

    fn mean_y(&self) -> f64 {
        let sum: f64 = self.centroids.iter().map(|&(_, y)| y as f64).sum();
        sum / self.centroids.len() as f64
    }
}

/// Per-job track memory. Owned by the frame loop only.
#[derive(Debug)]
pub struct TrackLedger {
    tracks: HashMap<TrackId, TrackState>,
    frame_height: i32,
    evict_after: u64,
    entered: u64,
    exited: u64,
}

impl TrackLedger {
    pub fn new(frame_height: u32, evict_after: u64) -> Self {
        Self {
            tracks: HashMap::new(),
            frame_height: frame_height as i32,
            evict_after,
            entered: 0,
            exited: 0,
        }
    }

    pub fn entered(&self) -> u64 {
        self.entered
    }

    pub fn exited(&self) -> u64 {
        self.exited
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn get(&self, id: TrackId) -> Option<&TrackState> {
        self.tracks.get(&id)
    }

    /// Record one confirmed sighting and return the crossing it produced, if any.
    pub fn observe(&mut self, id: TrackId, centroid: (i32, i32), frame_idx: u64) -> Option<Crossing> {
        let midline = self.frame_height.div_euclid(2);
        let Some(t) = self.tracks.get_mut(&id) else {
            self.tracks.insert(id, TrackState::new(id, centroid, frame_idx));
            return None;
        };

        let cy = centroid.1;
        let direction = cy as f64 - t.mean_y();
        t.centroids.push(centroid);
        t.last_seen = frame_idx;

        if t.counted {
            return None;
        }
        let crossing = if direction < 0.0 && cy < midline {
            Crossing::Entered
        } else if direction > 0.0 && cy > midline {
            Crossing::Exited
        } else {
            return None;
        };
        t.counted = true;
        match crossing {
            Crossing::Entered => self.entered += 1,
            Crossing::Exited => self.exited += 1,
        }
        Some(crossing)
    }

    /// Drop tracks the tracker has stopped reporting. Returns how many went.
    pub fn evict_stale(&mut self, frame_idx: u64) -> usize {
        let before = self.tracks.len();
        let keep_for = self.evict_after;
        self.tracks
            .retain(|_, t| frame_idx.saturating_sub(t.last_seen) <= keep_for);
        before - self.tracks.len()
    }
}
