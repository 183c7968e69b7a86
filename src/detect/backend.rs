use anyhow::Result;

use crate::frame::Frame;
use crate::polygon::{HeatMap, NormalizedPolygon};

/// Output of an anomaly model for one frame.
#[derive(Clone, Debug)]
pub struct AnomalyPrediction {
    /// Frame-level anomaly score in [0,1].
    pub score: f64,
    /// Per-pixel anomaly map, same aspect as the frame, any resolution.
    pub heat_map: HeatMap,
}

/// Result of classifying a region embedding.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassPrediction {
    pub class_id: i64,
    pub class_name: String,
    pub confidence: f64,
}

/// Anomaly model contract.
///
/// Models are used by exactly one orchestrator thread, so `predict` takes
/// `&mut self` and implementations may keep scratch buffers between calls.
/// The frame must be treated as read-only.
pub trait AnomalyModel: Send {
    /// Model identifier.
    fn name(&self) -> &'static str;

    /// Score a frame and produce its anomaly heat map.
    fn predict(&mut self, frame: &Frame) -> Result<AnomalyPrediction>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Turns the image region described by a polygon into a fixed-length vector.
pub trait RegionEmbedder: Send {
    fn name(&self) -> &'static str;

    fn dimension(&self) -> usize;

    fn embed(&mut self, frame: &Frame, polygon: &NormalizedPolygon) -> Result<Vec<f32>>;
}

/// Classifies region embeddings.
pub trait Classifier: Send {
    fn name(&self) -> &'static str;

    fn classify(&mut self, embedding: &[f32]) -> Result<ClassPrediction>;
}
