#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use tract_onnx::prelude::*;

use crate::detect::backend::{AnomalyModel, AnomalyPrediction};
use crate::frame::Frame;
use crate::polygon::HeatMap;

/// ONNX anomaly model run with tract.
///
/// Input is `1x3xHxW` f32 RGB in [0,1]. The first output is the anomaly map
/// (its last two axes are read as rows and columns); an optional second
/// output holds the scalar score, otherwise the map maximum is used.
pub struct OnnxAnomalyModel {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    width: u32,
    height: u32,
}

impl OnnxAnomalyModel {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
        })
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let rgb = frame.to_rgb_image()?;
        let resized = if rgb.width() == self.width && rgb.height() == self.height {
            rgb
        } else {
            imageops::resize(&rgb, self.width, self.height, FilterType::Triangle)
        };
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        );
        Ok(input.into_tensor())
    }

    fn extract_prediction(outputs: TVec<TValue>) -> Result<AnomalyPrediction> {
        let map = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?
            .to_array_view::<f32>()
            .context("anomaly map tensor was not f32")?;
        let shape = map.shape();
        if shape.len() < 2 {
            return Err(anyhow!("anomaly map has rank {}, expected >= 2", shape.len()));
        }
        let (rows, cols) = (shape[shape.len() - 2], shape[shape.len() - 1]);
        // Leading axes are batch/channel; take the first plane.
        let values: Vec<f32> = map.iter().take(rows * cols).copied().collect();
        let heat_map = HeatMap::new(cols, rows, values)?;

        let score = match outputs.get(1) {
            Some(tensor) => tensor
                .to_array_view::<f32>()
                .context("score tensor was not f32")?
                .iter()
                .next()
                .copied()
                .map(f64::from)
                .ok_or_else(|| anyhow!("score tensor is empty"))?,
            None => heat_map.max_value() as f64,
        };
        let score = if score.is_finite() { score } else { 0.0 };
        Ok(AnomalyPrediction { score, heat_map })
    }
}

impl AnomalyModel for OnnxAnomalyModel {
    fn name(&self) -> &'static str {
        "onnx"
    }

    fn predict(&mut self, frame: &Frame) -> Result<AnomalyPrediction> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        Self::extract_prediction(outputs)
    }
}
