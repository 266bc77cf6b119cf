use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use std::time::{Duration, Instant};

use crate::config::HeatmapConfig;
use crate::heatmap::{GridGeometry, HeatmapGrid, HeatmapView};
use crate::ledger::{Crossing, TrackLedger};
use crate::state::{bbox_centroid, LiveCounts, OccupancyStatus, TrackId};
use crate::tracker::TrackedBox;

// ================== COUNTING + HEATMAP ==================

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameAnalysis {
    pub inside: u64,
    pub crossings: Vec<(TrackId, Crossing)>,
    pub evicted: usize,
}

/// Per-job analytics state: the track ledger plus the density grid.
/// Ledger ages advance once per `process` call, the same clock the
/// tracker ages its tracks on, so gated-out frames never age a track.
pub struct FrameAnalyzer {
    ledger: TrackLedger,
    heatmap: HeatmapGrid,
    geometry: GridGeometry,
    processed: u64,
}

impl FrameAnalyzer {
    pub fn new(frame_w: u32, frame_h: u32, heatmap: &HeatmapConfig, evict_after: u64) -> Self {
        let grid = HeatmapGrid::new(heatmap);
        let geometry = GridGeometry::new(frame_w, frame_h, grid.rows(), grid.cols());
        Self {
            ledger: TrackLedger::new(frame_h, evict_after),
            heatmap: grid,
            geometry,
            processed: 0,
        }
    }

    /// Count, accumulate and decay for one processed frame. Unconfirmed
    /// tracks are ignored entirely.
    pub fn process(&mut self, tracks: &[TrackedBox]) -> FrameAnalysis {
        self.processed += 1;
        let tick = self.processed;
        let mut occupancy = self.geometry.empty_occupancy();
        let mut out = FrameAnalysis::default();

        for t in tracks.iter().filter(|t| t.confirmed) {
            out.inside += 1;
            let (cx, cy) = bbox_centroid(t.bbox);
            if let Some(c) = self.ledger.observe(t.id, (cx, cy), tick) {
                out.crossings.push((t.id, c));
            }
            let (row, col) = self.geometry.cell_of(cx, cy);
            occupancy[[row, col]] += 1;
        }

        self.heatmap.update(&occupancy);
        out.evicted = self.ledger.evict_stale(tick);
        out
    }

    pub fn counts(&self, inside: u64) -> LiveCounts {
        LiveCounts {
            entered: self.ledger.entered(),
            exited: self.ledger.exited(),
            inside,
        }
    }

    pub fn heatmap_view(&self) -> HeatmapView {
        self.heatmap.view()
    }

    pub fn ledger(&self) -> &TrackLedger {
        &self.ledger
    }

    pub fn frames_processed(&self) -> u64 {
        self.processed
    }
}

// ================== STATS ==================

/// Processed-frames-per-second, refreshed once a second.
pub struct FpsMeter {
    frames: usize,
    last_update: Instant,
    value: f32,
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self {
            frames: 0,
            last_update: Instant::now(),
            value: 0.0,
        }
    }
}

impl FpsMeter {
    pub fn tick(&mut self) -> f32 {
        self.frames += 1;
        let elapsed = self.last_update.elapsed();
        if elapsed >= Duration::from_secs(1) {
            let secs = elapsed.as_secs_f32().max(0.001);
            self.value = self.frames as f32 / secs;
            self.frames = 0;
            self.last_update = Instant::now();
        }
        self.value
    }

    pub fn value(&self) -> f32 {
        self.value
    }
}

// ================== HUD ==================

const BOX_COLOR: Rgb<u8> = Rgb([40, 220, 90]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const SHADOW_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const GLYPH_W: i32 = 5;
const GLYPH_H: i32 = 7;

pub fn status_color(status: OccupancyStatus) -> Rgb<u8> {
    match status {
        OccupancyStatus::Normal => Rgb([60, 220, 60]),
        OccupancyStatus::Warning => Rgb([255, 165, 0]),
        OccupancyStatus::Critical => Rgb([255, 40, 40]),
    }
}

/// Boxes and `ID n` labels for confirmed tracks, then the counts banner.
pub fn annotate(
    frame: &mut RgbImage,
    tracks: &[TrackedBox],
    counts: &LiveCounts,
    status: OccupancyStatus,
    proc_fps: f32,
) {
    draw_tracks(frame, tracks);
    draw_hud(frame, counts, status, proc_fps);
}

pub fn draw_tracks(frame: &mut RgbImage, tracks: &[TrackedBox]) {
    for t in tracks.iter().filter(|t| t.confirmed) {
        let b = t.bbox;
        let x = b.x1 as i32;
        let y = b.y1 as i32;
        let w = (b.x2 - b.x1).max(2.0) as u32;
        let h = (b.y2 - b.y1).max(2.0) as u32;
        draw_hollow_rect_mut(frame, Rect::at(x, y).of_size(w, h), BOX_COLOR);
        draw_hollow_rect_mut(frame, Rect::at(x + 1, y + 1).of_size(w, h), BOX_COLOR);

        let label = format!("ID {}", t.id);
        let ly = (y - GLYPH_H * 2 - 4).max(0);
        draw_text_with_shadow(frame, &label, x, ly, 2, BOX_COLOR);
    }
}

pub fn draw_hud(frame: &mut RgbImage, counts: &LiveCounts, status: OccupancyStatus, proc_fps: f32) {
    let scale = if frame.width() >= 960 { 3 } else { 2 };
    let line_h = (GLYPH_H + 3) * scale;

    let line1 = format!("IN {} OUT {} NOW {}", counts.entered, counts.exited, counts.inside);
    let line2 = format!("{} FPS {:.1}", status.as_str(), proc_fps);
    let panel_w = text_width(&line1, scale).max(text_width(&line2, scale)) + 16;
    let panel_h = line_h * 2 + 12;
    if frame.width() > 0 && frame.height() > 0 {
        darken(frame, 0, 0, panel_w as u32, panel_h as u32);
    }

    draw_text_with_shadow(frame, &line1, 8, 6, scale, TEXT_COLOR);
    draw_text_with_shadow(frame, &line2, 8, 6 + line_h, scale, status_color(status));
}

fn darken(frame: &mut RgbImage, x: u32, y: u32, w: u32, h: u32) {
    let x_end = (x + w).min(frame.width());
    let y_end = (y + h).min(frame.height());
    for py in y..y_end {
        for px in x..x_end {
            let p = frame.get_pixel_mut(px, py);
            for c in p.0.iter_mut() {
                *c /= 2;
            }
        }
    }
}

fn draw_text_with_shadow(frame: &mut RgbImage, text: &str, x: i32, y: i32, scale: i32, color: Rgb<u8>) {
    draw_text(frame, text, x + 1, y + 1, scale, SHADOW_COLOR);
    draw_text(frame, text, x, y, scale, color);
}

pub fn text_width(text: &str, scale: i32) -> i32 {
    let n = text.chars().count() as i32;
    if n == 0 {
        0
    } else {
        (n * (GLYPH_W + 1) - 1) * scale
    }
}

/// Blits `text` with the built-in 5x7 font. Unknown characters render blank.
pub fn draw_text(frame: &mut RgbImage, text: &str, x: i32, y: i32, scale: i32, color: Rgb<u8>) {
    let scale = scale.max(1);
    let mut pen = x;
    for ch in text.chars() {
        let rows = glyph(ch.to_ascii_uppercase());
        for (ry, bits) in rows.iter().enumerate() {
            for rx in 0..GLYPH_W {
                if bits & (1 << (GLYPH_W - 1 - rx)) == 0 {
                    continue;
                }
                let px = pen + rx * scale;
                let py = y + ry as i32 * scale;
                draw_filled_rect_mut(
                    frame,
                    Rect::at(px, py).of_size(scale as u32, scale as u32),
                    color,
                );
            }
        }
        pen += (GLYPH_W + 1) * scale;
    }
}

fn glyph(ch: char) -> [u8; 7] {
    match ch {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        _ => [0; 7],
    }
}
