// src/annotator.rs
//
// Frame annotation: state-colored identity boxes, the monitored region and
// the live count panel. Works on BGR Mats; the orchestrator converts each
// RGB frame once and draws everything onto that canvas.

use crate::analysis::count_aggregator::CountAggregator;
use crate::analysis::state_machine::Region;
use crate::types::Frame;
use anyhow::Result;
use opencv::{
    core::{self, Mat},
    imgproc,
    prelude::*,
};

// BGR colors
fn client_color() -> core::Scalar {
    core::Scalar::new(0.0, 0.0, 255.0, 0.0) // Red: counted clients
}

fn tracked_color() -> core::Scalar {
    core::Scalar::new(255.0, 0.0, 0.0, 0.0) // Blue: tracked, not a client
}

fn region_color() -> core::Scalar {
    core::Scalar::new(123.0, 9.0, 104.0, 0.0) // Purple
}

const BOX_THICKNESS: i32 = 2;

/// Convert an RGB byte frame into an owned BGR Mat drawing canvas.
pub fn frame_to_bgr_mat(frame: &Frame) -> Result<Mat> {
    let mat = Mat::from_slice(&frame.data)?;
    let mat = mat.reshape(3, frame.height as i32)?;

    let mut bgr_mat = Mat::default();
    imgproc::cvt_color(&mat, &mut bgr_mat, imgproc::COLOR_RGB2BGR, 0)?;
    Ok(bgr_mat)
}

/// Draw the monitored boundary: the entrance line, or the polygon outline.
pub fn draw_region(output: &mut Mat, region: &Region) -> Result<()> {
    let points = region.points();
    match region {
        Region::Line(_) => {
            let p1 = core::Point::new(points[0][0] as i32, points[0][1] as i32);
            let p2 = core::Point::new(points[1][0] as i32, points[1][1] as i32);
            imgproc::line(
                output,
                p1,
                p2,
                region_color(),
                BOX_THICKNESS * 2,
                imgproc::LINE_AA,
                0,
            )?;
        }
        Region::Polygon(_) => {
            for window in points.windows(2) {
                let p1 = core::Point::new(window[0][0] as i32, window[0][1] as i32);
                let p2 = core::Point::new(window[1][0] as i32, window[1][1] as i32);
                imgproc::line(
                    output,
                    p1,
                    p2,
                    region_color(),
                    BOX_THICKNESS * 2,
                    imgproc::LINE_AA,
                    0,
                )?;
            }
            // Close the outline
            let first = core::Point::new(points[0][0] as i32, points[0][1] as i32);
            let last = core::Point::new(
                points[points.len() - 1][0] as i32,
                points[points.len() - 1][1] as i32,
            );
            imgproc::line(
                output,
                last,
                first,
                region_color(),
                BOX_THICKNESS * 2,
                imgproc::LINE_AA,
                0,
            )?;
        }
    }
    Ok(())
}

/// One identity box. Counted clients are red, everything else blue; the
/// label carries id, class and the stored demographic readings.
pub fn draw_identity(
    output: &mut Mat,
    bbox: &[f32; 4],
    track_id: u32,
    class_name: &str,
    age: &str,
    gender: &str,
    is_client: bool,
) -> Result<()> {
    let color = if is_client {
        client_color()
    } else {
        tracked_color()
    };

    let rect = core::Rect::new(
        bbox[0] as i32,
        bbox[1] as i32,
        (bbox[2] - bbox[0]) as i32,
        (bbox[3] - bbox[1]) as i32,
    );
    imgproc::rectangle(output, rect, color, BOX_THICKNESS, imgproc::LINE_8, 0)?;

    let label = format!("{class_name} id:{track_id} age:{age} gender:{gender}");
    imgproc::put_text(
        output,
        &label,
        core::Point::new(bbox[0] as i32, (bbox[1] as i32 - 6).max(12)),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.5,
        color,
        1,
        imgproc::LINE_8,
        false,
    )?;
    Ok(())
}

/// Count panel in the top-left corner: per-class in/out plus occupancy.
pub fn draw_count_panel(output: &mut Mat, counts: &CountAggregator) -> Result<()> {
    let mut lines: Vec<String> = Vec::new();
    let mut classes: Vec<&String> = counts.classwise().keys().collect();
    classes.sort();
    for class_name in classes {
        let c = counts.classwise()[class_name];
        lines.push(format!(
            "{class_name}: IN {} OUT {} (dirty {}/{})",
            c.clean_in, c.clean_out, c.dirty_in, c.dirty_out
        ));
    }
    lines.push(format!("occupancy: {}", counts.occupancy()));

    let panel_height = 22 * lines.len() as i32 + 16;
    imgproc::rectangle(
        output,
        core::Rect::new(5, 5, 320, panel_height),
        core::Scalar::new(40.0, 40.0, 40.0, 0.0),
        -1,
        imgproc::LINE_8,
        0,
    )?;

    for (i, line) in lines.iter().enumerate() {
        imgproc::put_text(
            output,
            line,
            core::Point::new(15, 26 + 22 * i as i32),
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.55,
            core::Scalar::new(255.0, 255.0, 255.0, 0.0),
            1,
            imgproc::LINE_8,
            false,
        )?;
    }
    Ok(())
}
