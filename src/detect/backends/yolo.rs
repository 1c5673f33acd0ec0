#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::backends::labels::COCO_LABELS;
use crate::detect::result::{non_max_suppression, BoundingBox, Detection};
use crate::frame::Frame;

const LETTERBOX_FILL: u8 = 114;

/// YOLOv5 ONNX detector running on tract.
///
/// Expects the stock export layout: input `[1, 3, S, S]` RGB in 0..1, output
/// `[1, N, 5 + classes]` rows of `cx, cy, w, h, objectness, class scores...`
/// in input-space pixels.
pub struct YoloBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    labels: Vec<String>,
    /// Pre-filter applied before NMS. Kept below the pipeline threshold so the
    /// pipeline's own filter stays authoritative.
    score_floor: f32,
    iou_threshold: f32,
}

impl YoloBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let size = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            labels: COCO_LABELS.iter().map(|s| s.to_string()).collect(),
            score_floor: 0.25,
            iou_threshold: 0.45,
        })
    }

    /// Replace the COCO class names (custom-trained models).
    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    /// Letterbox the frame into the model's square input.
    /// Returns the tensor plus (scale, pad_x, pad_y) to undo the mapping.
    fn build_input(&self, frame: &Frame) -> Result<(Tensor, f32, f32, f32)> {
        let (w, h) = (frame.width(), frame.height());
        if w == 0 || h == 0 {
            return Err(anyhow!("empty frame"));
        }
        let size = self.input_size;
        let scale = (size as f32 / w as f32).min(size as f32 / h as f32);
        let new_w = ((w as f32 * scale).round() as u32).clamp(1, size);
        let new_h = ((h as f32 * scale).round() as u32).clamp(1, size);
        let resized = image::imageops::resize(frame.image(), new_w, new_h, FilterType::Triangle);

        let pad_x = (size - new_w) / 2;
        let pad_y = (size - new_h) / 2;
        let mut canvas =
            image::RgbImage::from_pixel(size, size, image::Rgb([LETTERBOX_FILL; 3]));
        image::imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);

        let side = size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            canvas.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        Ok((input.into_tensor(), scale, pad_x as f32, pad_y as f32))
    }

    fn decode(
        &self,
        outputs: TVec<TValue>,
        scale: f32,
        pad_x: f32,
        pad_y: f32,
        frame: &Frame,
    ) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[2] < 6 {
            return Err(anyhow!("unexpected yolo output shape {:?}", shape));
        }
        let rows = view
            .into_shape((shape[1], shape[2]))
            .context("reshape yolo output")?;

        let max_x = frame.width() as f32;
        let max_y = frame.height() as f32;
        let mut detections = Vec::new();
        for row in rows.outer_iter() {
            let objectness = row[4];
            if objectness < self.score_floor {
                continue;
            }
            let Some((class_id, class_score)) = row
                .iter()
                .skip(5)
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
            else {
                continue;
            };
            let confidence = objectness * class_score;
            if confidence < self.score_floor {
                continue;
            }

            let (cx, cy, bw, bh) = (row[0], row[1], row[2], row[3]);
            let x1 = ((cx - bw / 2.0 - pad_x) / scale).clamp(0.0, max_x);
            let y1 = ((cy - bh / 2.0 - pad_y) / scale).clamp(0.0, max_y);
            let x2 = ((cx + bw / 2.0 - pad_x) / scale).clamp(0.0, max_x);
            let y2 = ((cy + bh / 2.0 - pad_y) / scale).clamp(0.0, max_y);

            let label = self
                .labels
                .get(class_id)
                .cloned()
                .unwrap_or_else(|| format!("class{}", class_id));
            detections.push(Detection::new(
                BoundingBox::new(x1, y1, x2, y2),
                label,
                confidence,
            ));
        }

        non_max_suppression(&mut detections, self.iou_threshold);
        Ok(detections)
    }
}

impl DetectorBackend for YoloBackend {
    fn name(&self) -> &'static str {
        "yolo"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let (input, scale, pad_x, pad_y) = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, scale, pad_x, pad_y, frame)
    }

    fn warm_up(&mut self) -> Result<()> {
        let frame = Frame::new(
            image::RgbImage::new(self.input_size, self.input_size),
            0,
        );
        self.detect(&frame).map(|_| ())
    }
}
