// src/report_sink.rs
//
// Destination for the TimeSliceReport stream and the final heatmap frame.
// Reports accumulate for the whole run, get dumped to a local JSON file for
// offline inspection, and are optionally POSTed to the collaborating server
// together with the base64-encoded heatmap PNG. Upload failures are logged
// and absorbed; the analysis result on disk is the source of truth.

use crate::analysis::periodic_aggregator::TimeSliceReport;
use crate::types::ServerConfig;
use anyhow::{Context, Result};
use base64::Engine;
use opencv::{core::Mat, imgcodecs, prelude::*};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{error, info};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReportPayload<'a> {
    reports: &'a [TimeSliceReport],
    job_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HeatmapPayload<'a> {
    job_id: &'a str,
    image_base64: String,
}

pub struct ReportSink {
    http_client: reqwest::Client,
    server: ServerConfig,
    reports: Vec<TimeSliceReport>,
}

impl ReportSink {
    pub fn new(server: ServerConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http_client,
            server,
            reports: Vec::new(),
        })
    }

    pub fn push(&mut self, report: TimeSliceReport) {
        self.reports.push(report);
    }

    pub fn reports(&self) -> &[TimeSliceReport] {
        &self.reports
    }

    /// Dump every collected report as pretty JSON next to the video output.
    pub fn save_local(&self, output_dir: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(output_dir)?;
        let path = Path::new(output_dir).join("time_slice_reports.json");
        let json = serde_json::to_string_pretty(&self.reports)?;
        std::fs::write(&path, json)?;
        info!("Saved {} reports to {}", self.reports.len(), path.display());
        Ok(path)
    }

    /// POST the accumulated reports to the configured server.
    pub async fn upload_reports(&self, job_id: &str) {
        if !self.server.upload_enabled {
            return;
        }
        let url = format!(
            "{}{}",
            self.server.base_url.trim_end_matches('/'),
            self.server.report_endpoint
        );
        let payload = ReportPayload {
            reports: &self.reports,
            job_id,
        };
        info!("Uploading {} reports to {}", self.reports.len(), url);

        match self.http_client.post(&url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                info!("✓ Reports accepted by server");
            }
            Ok(response) => {
                error!(
                    "Report upload rejected with {}: {}",
                    response.status(),
                    response
                        .text()
                        .await
                        .unwrap_or_else(|_| "<no body>".to_string())
                );
            }
            Err(e) => {
                error!("Report upload failed: {e}");
            }
        }
    }

    /// Save the final heatmap frame as a PNG and, when uploads are enabled,
    /// send it base64-embedded to the heatmap endpoint.
    pub async fn provide_heatmap(&self, heatmap_frame: &Mat, output_dir: &str, job_id: &str) {
        let png = match encode_png(heatmap_frame) {
            Ok(png) => png,
            Err(e) => {
                error!("Heatmap PNG encoding failed: {e:#}");
                return;
            }
        };

        if let Err(e) = save_heatmap_png(&png, output_dir, job_id) {
            error!("Heatmap save failed: {e:#}");
        }

        if !self.server.upload_enabled {
            return;
        }
        let url = format!(
            "{}{}",
            self.server.base_url.trim_end_matches('/'),
            self.server.heatmap_endpoint
        );
        let payload = HeatmapPayload {
            job_id,
            image_base64: base64::engine::general_purpose::STANDARD.encode(&png),
        };
        info!("Uploading heatmap ({} bytes) to {}", png.len(), url);

        match self.http_client.post(&url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                info!("✓ Heatmap accepted by server");
            }
            Ok(response) => {
                error!("Heatmap upload rejected with {}", response.status());
            }
            Err(e) => {
                error!("Heatmap upload failed: {e}");
            }
        }
    }
}

fn encode_png(frame: &Mat) -> Result<Vec<u8>> {
    let mut buf = opencv::core::Vector::<u8>::new();
    imgcodecs::imencode(".png", frame, &mut buf, &opencv::core::Vector::new())?;
    Ok(buf.to_vec())
}

fn save_heatmap_png(png: &[u8], output_dir: &str, job_id: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir)?;
    let path = Path::new(output_dir).join(format!("{job_id}_heatmap.png"));
    std::fs::write(&path, png)?;
    info!("Saved heatmap snapshot to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::periodic_aggregator::AgeBuckets;
    use chrono::NaiveDate;

    fn server(upload: bool) -> ServerConfig {
        ServerConfig {
            base_url: "http://127.0.0.1:4000".to_string(),
            report_endpoint: "/report/create".to_string(),
            heatmap_endpoint: "/heatmap/add".to_string(),
            upload_enabled: upload,
        }
    }

    fn report() -> TimeSliceReport {
        let start = NaiveDate::from_ymd_opt(2025, 3, 14)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        TimeSliceReport {
            date: start.date(),
            slice_start: start,
            slice_end: start + chrono::Duration::seconds(1),
            total_customers: 2,
            total_male: 1,
            total_female: 1,
            customers_by_age: AgeBuckets {
                adult: 2,
                ..Default::default()
            },
            avg_dwell_seconds: 12.5,
        }
    }

    #[test]
    fn report_payload_uses_the_server_field_names() {
        let json = serde_json::to_value(report()).unwrap();
        assert!(json.get("totalCustomers").is_some());
        assert!(json.get("avgDwellSeconds").is_some());
        assert!(json.get("customersByAge").is_some());
        assert_eq!(json["customersByAge"]["adult"], 2);
    }

    #[test]
    fn save_local_writes_the_collected_reports() {
        let dir = std::env::temp_dir().join("footfall_report_sink_test");
        let mut sink = ReportSink::new(server(false)).unwrap();
        sink.push(report());
        let path = sink.save_local(dir.to_str().unwrap()).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("totalCustomers"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
