//! Anomaly model, region embedder and classifier contracts.
//!
//! The models are black boxes behind narrow traits. Built-in
//! implementations:
//! - `StubAnomalyModel`: block-averaged luminance, always available
//! - `OnnxAnomalyModel`: tract ONNX runtime (feature: backend-tract)
//! - `HistogramEmbedder`: pooled colour histogram over the polygon
//! - `LinearClassifier`: soft-max over a JSON weight file

mod backend;
mod backends;
mod registry;
mod result;

pub use backend::{AnomalyModel, AnomalyPrediction, ClassPrediction, Classifier, RegionEmbedder};
#[cfg(feature = "backend-tract")]
pub use backends::OnnxAnomalyModel;
pub use backends::{HistogramEmbedder, LinearClassifier, StubAnomalyModel};
pub use registry::{build_anomaly_model, DetectorSet};
pub use result::DetectionCandidate;
