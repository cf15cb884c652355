// src/analysis/heatmap.rs
//
// Cumulative occupancy heatmap. The accumulator grid only ever grows for
// the life of the run; rendering normalizes a copy and never touches it.

use anyhow::{bail, Result};
use ndarray::Array2;
use opencv::{
    core::{self, Mat},
    imgproc,
    prelude::*,
};

/// Intensity added per covered cell per frame.
const HEAT_INCREMENT: f32 = 2.0;

/// Overlay blend weights (frame, heat).
const BLEND_ALPHA: f64 = 0.5;
const BLEND_BETA: f64 = 0.5;

pub struct HeatmapAccumulator {
    grid: Option<Array2<f32>>,
    colormap: i32,
}

impl HeatmapAccumulator {
    pub fn new() -> Self {
        Self {
            grid: None,
            colormap: imgproc::COLORMAP_PARULA,
        }
    }

    /// Allocate the zero grid once; later calls are no-ops.
    pub fn initialize(&mut self, height: usize, width: usize) {
        if self.grid.is_none() {
            self.grid = Some(Array2::zeros((height, width)));
        }
    }

    /// Accumulate footfall weight for one bounding box: every cell within
    /// `min(box_w, box_h) / 2` of the box center gains a fixed increment.
    /// Using the shorter side keeps the stamp round regardless of the box
    /// aspect ratio, and restricting the scan to the box ROI keeps the cost
    /// proportional to the box, not the frame.
    pub fn apply(&mut self, bbox: &[f32; 4]) -> Result<()> {
        let Some(grid) = self.grid.as_mut() else {
            bail!("heatmap applied before initialize");
        };
        let (rows, cols) = grid.dim();

        let x0 = (bbox[0].max(0.0) as usize).min(cols);
        let y0 = (bbox[1].max(0.0) as usize).min(rows);
        let x1 = (bbox[2].max(0.0) as usize).min(cols);
        let y1 = (bbox[3].max(0.0) as usize).min(rows);
        if x1 <= x0 || y1 <= y0 {
            return Ok(());
        }

        let cx = ((bbox[0] + bbox[2]) / 2.0) as i64;
        let cy = ((bbox[1] + bbox[3]) / 2.0) as i64;
        let radius = ((x1 - x0).min(y1 - y0) / 2) as i64;
        let radius_sq = radius * radius;

        for y in y0..y1 {
            let dy = y as i64 - cy;
            let dy_sq = dy * dy;
            for x in x0..x1 {
                let dx = x as i64 - cx;
                if dx * dx + dy_sq <= radius_sq {
                    grid[[y, x]] += HEAT_INCREMENT;
                }
            }
        }
        Ok(())
    }

    /// Min-max normalize the accumulator to 0-255, color-map it and blend it
    /// onto `frame` (BGR). The accumulator itself is untouched.
    pub fn render(&self, frame: &Mat) -> Result<Mat> {
        let Some(grid) = self.grid.as_ref() else {
            bail!("heatmap rendered before initialize");
        };
        let (rows, cols) = grid.dim();

        let mut min = f32::MAX;
        let mut max = f32::MIN;
        for &v in grid.iter() {
            min = min.min(v);
            max = max.max(v);
        }
        let scale = if max > min { 255.0 / (max - min) } else { 0.0 };

        let mut bytes = vec![0u8; rows * cols];
        for (dst, &v) in bytes.iter_mut().zip(grid.iter()) {
            *dst = ((v - min) * scale) as u8;
        }

        let gray = Mat::from_slice(&bytes)?;
        let gray = gray.reshape(1, rows as i32)?;

        let mut colored = Mat::default();
        imgproc::apply_color_map(&gray, &mut colored, self.colormap)?;

        let mut blended = Mat::default();
        core::add_weighted(frame, BLEND_ALPHA, &colored, BLEND_BETA, 0.0, &mut blended, -1)?;
        Ok(blended)
    }

    #[cfg(test)]
    fn cell(&self, y: usize, x: usize) -> f32 {
        self.grid.as_ref().map_or(0.0, |g| g[[y, x]])
    }
}

impl Default for HeatmapAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_before_initialize_is_an_error() {
        let mut heatmap = HeatmapAccumulator::new();
        assert!(heatmap.apply(&[0.0, 0.0, 10.0, 10.0]).is_err());
    }

    #[test]
    fn apply_stamps_a_disc_inside_the_box() {
        let mut heatmap = HeatmapAccumulator::new();
        heatmap.initialize(100, 100);
        // 20x40 box centered at (30, 20): radius = 10
        heatmap.apply(&[20.0, 10.0, 40.0, 50.0]).unwrap();

        // Box center gains the increment
        assert_eq!(heatmap.cell(30, 30), 2.0);
        // Inside the radius
        assert_eq!(heatmap.cell(35, 30), 2.0);
        // Inside the box but outside the radius (corner)
        assert_eq!(heatmap.cell(49, 39), 0.0);
        // Outside the box entirely
        assert_eq!(heatmap.cell(30, 60), 0.0);
    }

    #[test]
    fn grid_values_never_decrease() {
        let mut heatmap = HeatmapAccumulator::new();
        heatmap.initialize(50, 50);
        heatmap.apply(&[10.0, 10.0, 30.0, 30.0]).unwrap();
        let before = heatmap.cell(20, 20);
        heatmap.apply(&[10.0, 10.0, 30.0, 30.0]).unwrap();
        assert!(heatmap.cell(20, 20) > before);
        // Re-initialize must not reset the accumulated signal
        heatmap.initialize(50, 50);
        assert!(heatmap.cell(20, 20) >= before);
    }

    #[test]
    fn out_of_frame_boxes_are_clamped() {
        let mut heatmap = HeatmapAccumulator::new();
        heatmap.initialize(40, 40);
        heatmap.apply(&[-10.0, -10.0, 10.0, 10.0]).unwrap();
        heatmap.apply(&[35.0, 35.0, 60.0, 60.0]).unwrap();
        // No panic and the visible corner cells received heat
        assert!(heatmap.cell(0, 0) > 0.0);
    }

    #[test]
    fn render_leaves_the_accumulator_untouched() {
        let mut heatmap = HeatmapAccumulator::new();
        heatmap.initialize(8, 8);
        heatmap.apply(&[1.0, 1.0, 7.0, 7.0]).unwrap();
        let before = heatmap.cell(4, 4);

        let frame =
            Mat::new_rows_cols_with_default(8, 8, core::CV_8UC3, core::Scalar::all(0.0)).unwrap();
        let blended = heatmap.render(&frame).unwrap();
        assert_eq!(blended.rows(), 8);
        assert_eq!(blended.cols(), 8);
        assert_eq!(heatmap.cell(4, 4), before);
    }
}
