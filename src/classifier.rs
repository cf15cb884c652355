// src/classifier.rs
//
// Demographic classification of a cropped person region. The counting
// engine only knows the RegionClassifier trait; the ONNX-backed
// implementation below is what production wires in, tests substitute
// scripted stubs.

use crate::person_detection::resize_bilinear;
use crate::types::{Classification, Frame};
use anyhow::{bail, Result};
use ort::{
    execution_providers::CUDAExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session},
};
use tracing::{debug, info};

pub trait RegionClassifier {
    /// Classify the `bbox` region of the un-annotated `frame`.
    /// The confidence is in [0, 1].
    fn classify(&mut self, frame: &Frame, bbox: &[f32; 4]) -> Result<Classification>;
}

/// Classification head (e.g. a YOLO-cls export) run on a square-resized crop.
pub struct OnnxCropClassifier {
    session: Session,
    labels: Vec<String>,
    input_size: usize,
}

impl OnnxCropClassifier {
    pub fn new(model_path: &str, labels: Vec<String>, input_size: usize) -> Result<Self> {
        if labels.is_empty() {
            bail!("classifier {model_path} configured with no labels");
        }
        info!("Loading classifier model: {}", model_path);

        let session = Session::builder()?
            .with_execution_providers([CUDAExecutionProvider::default().with_device_id(0).build()])?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        info!("✓ Classifier ready ({} labels)", labels.len());
        Ok(Self {
            session,
            labels,
            input_size,
        })
    }

    /// Crop the box out of the frame, clamped to the image bounds.
    fn crop(&self, frame: &Frame, bbox: &[f32; 4]) -> Result<(Vec<u8>, usize, usize)> {
        let x0 = (bbox[0].max(0.0) as usize).min(frame.width);
        let y0 = (bbox[1].max(0.0) as usize).min(frame.height);
        let x1 = (bbox[2].max(0.0) as usize).min(frame.width);
        let y1 = (bbox[3].max(0.0) as usize).min(frame.height);
        if x1 <= x0 || y1 <= y0 {
            bail!("empty crop for box [{:.0},{:.0},{:.0},{:.0}]", bbox[0], bbox[1], bbox[2], bbox[3]);
        }
        let (w, h) = (x1 - x0, y1 - y0);
        let mut out = vec![0u8; w * h * 3];
        for row in 0..h {
            let src_start = ((y0 + row) * frame.width + x0) * 3;
            let dst_start = row * w * 3;
            out[dst_start..dst_start + w * 3]
                .copy_from_slice(&frame.data[src_start..src_start + w * 3]);
        }
        Ok((out, w, h))
    }
}

impl RegionClassifier for OnnxCropClassifier {
    fn classify(&mut self, frame: &Frame, bbox: &[f32; 4]) -> Result<Classification> {
        let (crop, crop_w, crop_h) = self.crop(frame, bbox)?;
        let size = self.input_size;
        let resized = resize_bilinear(&crop, crop_w, crop_h, size, size);

        // HWC u8 -> CHW f32 in [0, 1]
        let mut input = vec![0.0f32; 3 * size * size];
        for c in 0..3 {
            for y in 0..size {
                for x in 0..size {
                    input[c * size * size + y * size + x] =
                        resized[(y * size + x) * 3 + c] as f32 / 255.0;
                }
            }
        }

        let shape = [1usize, 3, size, size];
        let input_value =
            ort::value::Value::from_array((shape.as_slice(), input.into_boxed_slice()))?;
        let outputs = self.session.run(ort::inputs!["images" => input_value])?;
        let (_, probs) = outputs[0].try_extract_tensor::<f32>()?;

        let classes = self.labels.len().min(probs.len());
        if classes == 0 {
            bail!("classifier produced no outputs");
        }
        let mut best = 0;
        for i in 1..classes {
            if probs[i] > probs[best] {
                best = i;
            }
        }
        let result = Classification {
            label: self.labels[best].clone(),
            confidence: probs[best].clamp(0.0, 1.0),
        };
        debug!(
            "Classified crop as {} ({:.2})",
            result.label, result.confidence
        );
        Ok(result)
    }
}
