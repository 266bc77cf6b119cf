use anyhow::Result;
use jamtrack_rs::byte_tracker::ByteTracker;
use jamtrack_rs::{Object, Rect as JamRect};

use crate::config::TrackerConfig;
use crate::state::{BBox, TrackId};

/// One detection in the geometry the tracker consumes: `[left, top, width, height]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackerInput {
    pub ltwh: [f32; 4],
    pub confidence: f32,
    pub class_id: i64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackedBox {
    pub id: TrackId,
    pub confirmed: bool,
    pub bbox: BBox,
}

pub trait Tracker: Send {
    /// Called once per processed frame, with an empty slice when nothing
    /// was detected, so lost tracks age on the same clock as the ledger.
    fn update(&mut self, detections: &[TrackerInput]) -> Result<Vec<TrackedBox>>;
}

/// ByteTrack behind the `Tracker` seam. It only reports activated tracks,
/// so everything it returns is confirmed.
#[derive(Debug)]
pub struct ByteTrackAdapter {
    inner: ByteTracker,
}

impl ByteTrackAdapter {
    pub fn new(cfg: &TrackerConfig) -> Self {
        Self {
            inner: ByteTracker::new(
                cfg.frame_rate.max(1),
                cfg.track_buffer,
                cfg.track_thresh,
                cfg.high_thresh,
                cfg.match_thresh,
            ),
        }
    }
}

impl Tracker for ByteTrackAdapter {
    fn update(&mut self, detections: &[TrackerInput]) -> Result<Vec<TrackedBox>> {
        let objects: Vec<Object> = detections
            .iter()
            .map(|d| {
                let [l, t, w, h] = d.ltwh;
                Object::new(JamRect::new(l, t, w, h), d.confidence, None)
            })
            .collect();

        let tracked = self.inner.update(&objects)?;
        let mut out: Vec<TrackedBox> = tracked
            .iter()
            .filter_map(|obj| {
                let id = obj.get_track_id()? as TrackId;
                let [x1, y1, x2, y2] = obj.get_rect().get_xyxy();
                Some(TrackedBox {
                    id,
                    confirmed: true,
                    bbox: BBox { x1, y1, x2, y2 },
                })
            })
            .collect();
        out.sort_by_key(|t| t.id);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(l: f32, t: f32) -> TrackerInput {
        TrackerInput {
            ltwh: [l, t, 40.0, 80.0],
            confidence: 0.9,
            class_id: 0,
        }
    }

    fn tracker() -> ByteTrackAdapter {
        ByteTrackAdapter::new(&TrackerConfig::default())
    }

    #[test]
    fn nothing_in_nothing_out() {
        let mut t = tracker();
        assert!(t.update(&[]).unwrap().is_empty());
    }

    #[test]
    fn steady_person_keeps_one_id() {
        let mut t = tracker();
        let mut ids = Vec::new();
        let mut last = Vec::new();
        for i in 0..5 {
            last = t.update(&[det(100.0 + i as f32, 100.0)]).unwrap();
            ids.extend(last.iter().map(|b| b.id));
        }
        assert_eq!(last.len(), 1);
        assert!(last[0].confirmed);
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert!((last[0].bbox.x1 - 104.0).abs() < 5.0);
        assert!((last[0].bbox.height() - 80.0).abs() < 5.0);
    }

    #[test]
    fn separate_people_keep_separate_ids() {
        let mut t = tracker();
        let mut out = Vec::new();
        for _ in 0..3 {
            out = t.update(&[det(0.0, 0.0), det(300.0, 0.0)]).unwrap();
        }
        assert_eq!(out.len(), 2);
        assert_ne!(out[0].id, out[1].id);
    }

    #[test]
    fn short_gap_keeps_the_same_id() {
        let mut t = tracker();
        let mut before = Vec::new();
        for _ in 0..3 {
            before = t.update(&[det(100.0, 100.0)]).unwrap();
        }
        for _ in 0..3 {
            assert!(t.update(&[]).unwrap().is_empty());
        }
        let after = t.update(&[det(100.0, 100.0)]).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, before[0].id);
    }
}
