// src/video_processor.rs

use crate::types::{Config, Frame, ScheduleConfig};
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use opencv::{
    core::{self, Mat},
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTraitConst, VideoWriter},
};
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

pub struct VideoProcessor {
    config: Config,
}

impl VideoProcessor {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn find_video_files(&self) -> Result<Vec<PathBuf>> {
        const VIDEO_EXTENSIONS: [&str; 4] = ["mp4", "avi", "mov", "mkv"];

        let mut videos: Vec<PathBuf> = WalkDir::new(&self.config.video.input_dir)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|p| {
                p.extension()
                    .and_then(|ext| ext.to_str())
                    .map_or(false, |ext| {
                        VIDEO_EXTENSIONS.iter().any(|v| ext.eq_ignore_ascii_case(v))
                    })
            })
            .collect();
        videos.sort();

        info!("Found {} video files", videos.len());
        Ok(videos)
    }

    pub fn open_video(&self, path: &Path) -> Result<VideoReader> {
        info!("Opening video: {}", path.display());

        let path_str = path
            .to_str()
            .with_context(|| format!("non-UTF8 video path: {}", path.display()))?;
        let cap = VideoCapture::from_file(path_str, videoio::CAP_ANY)?;

        if !cap.is_opened()? {
            anyhow::bail!("Failed to open video file");
        }

        let fps = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FPS)?;
        let total_frames = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_COUNT)? as i32;
        let width = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_WIDTH)? as i32;
        let height = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_HEIGHT)? as i32;

        info!(
            "Video properties: {}x{} @ {:.1} FPS, {} frames",
            width, height, fps, total_frames
        );

        Ok(VideoReader {
            cap,
            fps,
            total_frames,
            current_frame: 0,
            width,
            height,
        })
    }

    pub fn create_writer(
        &self,
        input_path: &Path,
        width: i32,
        height: i32,
        fps: f64,
    ) -> Result<Option<VideoWriter>> {
        if !self.config.video.save_annotated {
            return Ok(None);
        }

        std::fs::create_dir_all(&self.config.video.output_dir)?;

        let input_name = input_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("analysis");
        let output_path = PathBuf::from(&self.config.video.output_dir)
            .join(format!("{}_annotated.mp4", input_name));

        info!("Output video: {}", output_path.display());

        let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v')?;
        let writer = VideoWriter::new(
            output_path.to_str().context("non-UTF8 output video path")?,
            fourcc,
            fps,
            core::Size::new(width, height),
            true,
        )?;

        Ok(Some(writer))
    }
}

pub struct VideoReader {
    pub cap: VideoCapture,
    pub fps: f64,
    pub total_frames: i32,
    pub current_frame: i32,
    pub width: i32,
    pub height: i32,
}

impl VideoReader {
    pub fn read_frame(&mut self) -> Result<Option<Frame>> {
        use opencv::videoio::VideoCaptureTrait;

        let mut mat = Mat::default();

        if !VideoCaptureTrait::read(&mut self.cap, &mut mat)? || mat.empty() {
            return Ok(None);
        }

        self.current_frame += 1;
        let timestamp_ms = (self.current_frame as f64 / self.fps) * 1000.0;

        let mut rgb_mat = Mat::default();
        imgproc::cvt_color(&mat, &mut rgb_mat, imgproc::COLOR_BGR2RGB, 0)?;

        let data = rgb_mat.data_bytes()?.to_vec();

        Ok(Some(Frame {
            data,
            width: self.width as usize,
            height: self.height as usize,
            timestamp_ms,
        }))
    }

    pub fn progress(&self) -> f32 {
        if self.total_frames == 0 {
            return 0.0;
        }
        (self.current_frame as f32 / self.total_frames as f32) * 100.0
    }
}

/// Maps processed frame indices onto the wall-clock range the footage covers.
/// One tick per processed frame, 1/fps seconds each.
pub struct MediaClock {
    current_time: NaiveDateTime,
    frame_step_us: i64,
}

impl MediaClock {
    pub fn new(schedule: &ScheduleConfig, fps: f64) -> Result<Self> {
        let start = NaiveDateTime::parse_from_str(
            &format!("{} {}", schedule.date, schedule.start_time),
            "%Y-%m-%d %H:%M:%S",
        )
        .with_context(|| {
            format!(
                "bad schedule: {} {}",
                schedule.date, schedule.start_time
            )
        })?;
        if fps <= 0.0 {
            anyhow::bail!("media clock needs a positive fps, got {fps}");
        }
        Ok(Self {
            current_time: start,
            frame_step_us: (1_000_000.0 / fps) as i64,
        })
    }

    pub fn now(&self) -> NaiveDateTime {
        self.current_time
    }

    pub fn advance_frame(&mut self) {
        self.current_time += chrono::Duration::microseconds(self.frame_step_us);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> ScheduleConfig {
        ScheduleConfig {
            date: "2025-03-14".to_string(),
            start_time: "10:00:00".to_string(),
            job_id: "job-1".to_string(),
        }
    }

    #[test]
    fn clock_advances_one_second_per_fps_frames() {
        let mut clock = MediaClock::new(&schedule(), 25.0).unwrap();
        let start = clock.now();
        for _ in 0..25 {
            clock.advance_frame();
        }
        assert_eq!((clock.now() - start).num_seconds(), 1);
    }

    #[test]
    fn clock_rejects_invalid_schedule() {
        let mut bad = schedule();
        bad.start_time = "25:99".to_string();
        assert!(MediaClock::new(&bad, 25.0).is_err());
        assert!(MediaClock::new(&schedule(), 0.0).is_err());
    }
}
