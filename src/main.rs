// src/main.rs

mod analysis;
mod annotator;
mod classifier;
mod config;
mod person_detection;
mod person_tracker;
mod report_sink;
mod types;
mod video_processor;

use analysis::{EntryExitStateMachine, FrameOrchestrator, PeriodicAggregator, Region};
use anyhow::Result;
use classifier::OnnxCropClassifier;
use opencv::videoio::VideoWriterTrait;
use person_detection::PersonDetector;
use person_tracker::PersonTracker;
use report_sink::ReportSink;
use std::path::Path;
use tracing::{debug, error, info};
use video_processor::{MediaClock, VideoProcessor};

#[tokio::main]
async fn main() -> Result<()> {
    let config = types::Config::load("config.yaml")?;

    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "footfall_analytics={},ort=warn",
            config.logging.level
        ))
        .init();

    info!("🏬 Foot-Traffic Analytics Starting");
    info!("✓ Configuration loaded");
    info!(
        "Counting setup: region points={}, reevaluation every {} frames, low-confidence < {:.2}",
        config.region.points.len(),
        config.counting.reevaluation_interval,
        config.counting.low_confidence_threshold
    );

    let video_processor = VideoProcessor::new(config.clone());
    let video_files = video_processor.find_video_files()?;

    if video_files.is_empty() {
        error!("No video files found in {}", config.video.input_dir);
        return Ok(());
    }

    info!("Found {} video file(s) to process", video_files.len());

    for (idx, video_path) in video_files.iter().enumerate() {
        info!("\n========================================");
        info!(
            "Processing video {}/{}: {}",
            idx + 1,
            video_files.len(),
            video_path.display()
        );
        info!("========================================\n");

        match process_video(video_path, &video_processor, &config).await {
            Ok(stats) => {
                info!("\n✓ Video processed successfully!");
                info!("  Total frames: {}", stats.total_frames);
                info!("  🚪 Clean entrances: {}", stats.clean_in);
                info!("  🚪 Clean exits: {}", stats.clean_out);
                info!(
                    "  ⚠️  Dirty entrances/exits: {}/{}",
                    stats.dirty_in, stats.dirty_out
                );
                info!("  🧍 Final occupancy: {}", stats.final_occupancy);
                info!("  🗂️  Customers recorded: {}", stats.customers_recorded);
                info!("  🕒 Average dwell: {:.1}s", stats.avg_dwell_seconds);
                info!("  📊 Reports emitted: {}", stats.reports_emitted);
            }
            Err(e) => {
                error!("Failed to process video: {e:#}");
            }
        }
    }

    Ok(())
}

struct ProcessingStats {
    total_frames: u64,
    clean_in: u64,
    clean_out: u64,
    dirty_in: u64,
    dirty_out: u64,
    final_occupancy: u64,
    customers_recorded: usize,
    avg_dwell_seconds: f64,
    reports_emitted: usize,
}

async fn process_video(
    video_path: &Path,
    video_processor: &VideoProcessor,
    config: &types::Config,
) -> Result<ProcessingStats> {
    let mut reader = video_processor.open_video(video_path)?;
    let clock = MediaClock::new(&config.schedule, reader.fps)?;

    let detector = PersonDetector::new(
        &config.model.person_model_path,
        config.detection.confidence_threshold,
        config.detection.nms_iou_threshold,
    )?;
    let tracker = PersonTracker::new(detector, config.tracking.clone(), reader.width as f32);

    let age_classifier = OnnxCropClassifier::new(
        &config.model.age_model_path,
        config.model.age_labels.clone(),
        config.model.classifier_input_size,
    )?;
    let gender_classifier = OnnxCropClassifier::new(
        &config.model.gender_model_path,
        config.model.gender_labels.clone(),
        config.model.classifier_input_size,
    )?;

    let region = Region::from_points(&config.region.points)?;
    let machine = EntryExitStateMachine::new(
        region,
        Box::new(age_classifier),
        Box::new(gender_classifier),
        &config.counting,
    );

    // Default cadence: one flush per wall-clock second of source video
    let interval_frames =
        (reader.fps * config.counting.report_interval_seconds as f64).round() as u64;
    let aggregator = PeriodicAggregator::new(interval_frames);

    let mut orchestrator = FrameOrchestrator::new(Box::new(tracker), machine, aggregator, clock);

    let mut writer =
        video_processor.create_writer(video_path, reader.width, reader.height, reader.fps)?;
    let mut sink = ReportSink::new(config.server.clone())?;
    let mut last_heatmap = None;

    while let Some(frame) = reader.read_frame()? {
        let (output, report) = orchestrator.process_frame(&frame)?;

        if let Some(writer) = writer.as_mut() {
            writer.write(&output.annotated)?;
        }
        last_heatmap = Some(output.heatmap);

        if let Some(report) = report {
            sink.push(report);
        }

        if reader.current_frame % 100 == 0 {
            debug!(
                "Progress: {:.1}% ({} frames)",
                reader.progress(),
                reader.current_frame
            );
        }
    }

    // Mandatory final flush: capture the partial slice and close open dwells
    let final_report = orchestrator.finish()?;
    sink.push(final_report);

    sink.save_local(&config.video.output_dir)?;
    sink.upload_reports(&config.schedule.job_id).await;
    if let Some(heatmap) = &last_heatmap {
        sink.provide_heatmap(heatmap, &config.video.output_dir, &config.schedule.job_id)
            .await;
    }

    let machine = orchestrator.machine();
    let counts = machine.counts();
    let customers = machine.past_customers();
    let avg_dwell_seconds = if customers.is_empty() {
        0.0
    } else {
        customers.iter().map(|c| c.dwell_seconds).sum::<f64>() / customers.len() as f64
    };
    Ok(ProcessingStats {
        total_frames: orchestrator.frames_processed(),
        clean_in: counts.in_count(),
        clean_out: counts.out_count(),
        dirty_in: counts.dirty_in_count(),
        dirty_out: counts.dirty_out_count(),
        final_occupancy: machine.occupancy(),
        customers_recorded: customers.len(),
        avg_dwell_seconds,
        reports_emitted: sink.reports().len(),
    })
}
