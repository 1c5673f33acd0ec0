use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

pub const DEFAULT_CELL_SIZE: u32 = 16;
pub const DEFAULT_PIXEL_DELTA: f32 = 24.0;
pub const DEFAULT_MIN_CELLS: usize = 2;

/// CPU frame-difference detector.
///
/// Averages luma over a coarse grid and reports a single `motion` detection
/// enclosing every cell whose mean changed by more than `pixel_delta` since the
/// previous frame. The first frame (and any resolution change) only primes the
/// reference grid.
pub struct MotionBackend {
    cell_size: u32,
    pixel_delta: f32,
    min_cells: usize,
    previous: Option<LumaGrid>,
}

struct LumaGrid {
    width: u32,
    height: u32,
    cols: u32,
    rows: u32,
    cells: Vec<f32>,
}

impl LumaGrid {
    fn from_frame(frame: &Frame, cell_size: u32) -> Self {
        let (width, height) = (frame.width(), frame.height());
        let cols = width.div_ceil(cell_size).max(1);
        let rows = height.div_ceil(cell_size).max(1);
        let mut sums = vec![0f32; (cols * rows) as usize];
        let mut counts = vec![0u32; (cols * rows) as usize];
        for (x, y, px) in frame.image().enumerate_pixels() {
            let idx = ((y / cell_size) * cols + (x / cell_size)) as usize;
            let [r, g, b] = px.0;
            sums[idx] += 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
            counts[idx] += 1;
        }
        let cells = sums
            .iter()
            .zip(&counts)
            .map(|(sum, &count)| if count == 0 { 0.0 } else { sum / count as f32 })
            .collect();
        Self {
            width,
            height,
            cols,
            rows,
            cells,
        }
    }
}

impl MotionBackend {
    pub fn new() -> Self {
        Self {
            cell_size: DEFAULT_CELL_SIZE,
            pixel_delta: DEFAULT_PIXEL_DELTA,
            min_cells: DEFAULT_MIN_CELLS,
            previous: None,
        }
    }

    pub fn with_cell_size(mut self, cell_size: u32) -> Self {
        self.cell_size = cell_size.max(1);
        self
    }

    pub fn with_pixel_delta(mut self, delta: f32) -> Self {
        self.pixel_delta = delta.max(0.0);
        self
    }

    pub fn with_min_cells(mut self, min_cells: usize) -> Self {
        self.min_cells = min_cells.max(1);
        self
    }
}

impl Default for MotionBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for MotionBackend {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let current = LumaGrid::from_frame(frame, self.cell_size);
        let previous = self.previous.replace(current);
        let (Some(previous), Some(current)) = (previous, self.previous.as_ref()) else {
            return Ok(Vec::new());
        };
        if previous.width != current.width || previous.height != current.height {
            return Ok(Vec::new());
        }

        let mut changed = 0usize;
        let mut delta_sum = 0f32;
        let (mut min_col, mut min_row) = (u32::MAX, u32::MAX);
        let (mut max_col, mut max_row) = (0u32, 0u32);
        for row in 0..current.rows {
            for col in 0..current.cols {
                let idx = (row * current.cols + col) as usize;
                let delta = (current.cells[idx] - previous.cells[idx]).abs();
                if delta > self.pixel_delta {
                    changed += 1;
                    delta_sum += delta;
                    min_col = min_col.min(col);
                    min_row = min_row.min(row);
                    max_col = max_col.max(col);
                    max_row = max_row.max(row);
                }
            }
        }

        if changed < self.min_cells {
            return Ok(Vec::new());
        }

        let cs = self.cell_size;
        let bbox = BoundingBox::new(
            (min_col * cs) as f32,
            (min_row * cs) as f32,
            ((max_col + 1) * cs).min(current.width) as f32,
            ((max_row + 1) * cs).min(current.height) as f32,
        );
        let confidence = (delta_sum / changed as f32 / 128.0).min(1.0);
        Ok(vec![Detection::new(bbox, "motion", confidence)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn frame_with_square(seq: u64, x: u32, y: u32, side: u32) -> Frame {
        let mut image = RgbImage::from_pixel(64, 64, Rgb([10, 10, 10]));
        for py in y..y + side {
            for px in x..x + side {
                image.put_pixel(px, py, Rgb([250, 250, 250]));
            }
        }
        Frame::new(image, seq)
    }

    #[test]
    fn first_frame_only_primes_reference() {
        let mut backend = MotionBackend::new();
        assert!(backend.detect(&frame_with_square(1, 0, 0, 16)).unwrap().is_empty());
    }

    #[test]
    fn static_scene_reports_nothing() {
        let mut backend = MotionBackend::new();
        backend.detect(&frame_with_square(1, 0, 0, 16)).unwrap();
        assert!(backend.detect(&frame_with_square(2, 0, 0, 16)).unwrap().is_empty());
    }

    #[test]
    fn moving_square_is_boxed() {
        let mut backend = MotionBackend::new();
        backend.detect(&frame_with_square(1, 0, 0, 16)).unwrap();
        let dets = backend.detect(&frame_with_square(2, 32, 32, 16)).unwrap();

        assert_eq!(dets.len(), 1);
        let det = &dets[0];
        assert_eq!(det.label, "motion");
        assert_eq!(det.bbox, BoundingBox::new(0.0, 0.0, 48.0, 48.0));
        assert!(det.confidence > 0.9);
    }

    #[test]
    fn tuning_raises_the_bar_for_motion() {
        // a 16px square moving one cell changes exactly two cells
        let mut strict = MotionBackend::new().with_min_cells(3);
        strict.detect(&frame_with_square(1, 0, 0, 16)).unwrap();
        assert!(strict.detect(&frame_with_square(2, 16, 0, 16)).unwrap().is_empty());

        let mut blind = MotionBackend::new().with_pixel_delta(250.0);
        blind.detect(&frame_with_square(1, 0, 0, 16)).unwrap();
        assert!(blind.detect(&frame_with_square(2, 32, 32, 16)).unwrap().is_empty());
    }

    #[test]
    fn resolution_change_resets_reference() {
        let mut backend = MotionBackend::new();
        backend.detect(&frame_with_square(1, 0, 0, 16)).unwrap();
        let small = Frame::new(RgbImage::from_pixel(32, 32, Rgb([255, 255, 255])), 2);
        assert!(backend.detect(&small).unwrap().is_empty());
    }
}
