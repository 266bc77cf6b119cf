use ndarray::Array2;
use serde::Serialize;

use crate::config::{HeatmapConfig, Quantization};

/// Maps frame pixels onto grid cells. Out-of-frame points land on the border.
#[derive(Clone, Copy, Debug)]
pub struct GridGeometry {
    rows: usize,
    cols: usize,
    cell_w: i32,
    cell_h: i32,
}

impl GridGeometry {
    pub fn new(frame_w: u32, frame_h: u32, rows: usize, cols: usize) -> Self {
        let rows = rows.max(1);
        let cols = cols.max(1);
        Self {
            rows,
            cols,
            cell_w: (frame_w as i32 / cols as i32).max(1),
            cell_h: (frame_h as i32 / rows as i32).max(1),
        }
    }

    pub fn cell_of(&self, x: i32, y: i32) -> (usize, usize) {
        let col = x.div_euclid(self.cell_w).clamp(0, self.cols as i32 - 1) as usize;
        let row = y.div_euclid(self.cell_h).clamp(0, self.rows as i32 - 1) as usize;
        (row, col)
    }

    pub fn empty_occupancy(&self) -> Array2<u32> {
        Array2::zeros((self.rows, self.cols))
    }
}

/// Decaying density grid: `new = clamp(old * decay + occupancy, 0, max)`.
#[derive(Clone, Debug)]
pub struct HeatmapGrid {
    cells: Array2<f32>,
    decay: f32,
    max_density: f32,
    quantization: Quantization,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HeatmapView {
    pub rows: usize,
    pub cols: usize,
    pub max: f32,
    pub zones: Vec<f32>,
}

impl HeatmapGrid {
    pub fn new(cfg: &HeatmapConfig) -> Self {
        Self {
            cells: Array2::zeros((cfg.rows.max(1), cfg.cols.max(1))),
            decay: cfg.decay.clamp(0.0, 1.0),
            max_density: cfg.max_density.max(0.0),
            quantization: cfg.quantization,
        }
    }

    pub fn rows(&self) -> usize {
        self.cells.nrows()
    }

    pub fn cols(&self) -> usize {
        self.cells.ncols()
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.cells[[row, col]]
    }

    pub fn cells(&self) -> &Array2<f32> {
        &self.cells
    }

    /// Runs once per processed frame, occupied or not.
    pub fn update(&mut self, occupancy: &Array2<u32>) {
        debug_assert_eq!(occupancy.dim(), self.cells.dim());
        let (decay, max, quant) = (self.decay, self.max_density, self.quantization);
        ndarray::Zip::from(&mut self.cells)
            .and(occupancy)
            .for_each(|cell, &occ| {
                let mut v = *cell * decay + occ as f32;
                if quant == Quantization::Whole {
                    v = v.floor();
                }
                *cell = v.clamp(0.0, max);
            });
    }

    pub fn decay_only(&mut self) {
        let empty = Array2::zeros(self.cells.dim());
        self.update(&empty);
    }

    pub fn view(&self) -> HeatmapView {
        HeatmapView {
            rows: self.rows(),
            cols: self.cols(),
            max: self.max_density,
            zones: self.cells.iter().copied().collect(),
        }
    }

    pub fn empty_view(cfg: &HeatmapConfig) -> HeatmapView {
        Self::new(cfg).view()
    }

    #[cfg(test)]
    fn set(&mut self, row: usize, col: usize, value: f32) {
        self.cells[[row, col]] = value;
    }
}
