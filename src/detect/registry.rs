use anyhow::{anyhow, Result};

use crate::config::{ModelKind, ModelSettings};

use super::backend::{AnomalyModel, Classifier, RegionEmbedder};
use super::backends::{HistogramEmbedder, LinearClassifier, StubAnomalyModel};

/// Per-camera inference stack.
///
/// Models take `&mut self`, so every camera owns its own set and nothing is
/// shared across orchestrator threads.
pub struct DetectorSet {
    pub model: Box<dyn AnomalyModel>,
    pub embedder: Box<dyn RegionEmbedder>,
    /// `None` when no classifier is configured; detections stay unclassified.
    pub classifier: Option<Box<dyn Classifier>>,
}

impl DetectorSet {
    /// Build the configured model, embedder and classifier.
    pub fn from_settings(settings: &ModelSettings) -> Result<Self> {
        let model = build_anomaly_model(settings)?;
        let embedder: Box<dyn RegionEmbedder> = Box::new(HistogramEmbedder::new());
        let classifier = match &settings.classifier_path {
            Some(path) => {
                let classifier = LinearClassifier::from_file(path)?;
                if classifier.dimension() != embedder.dimension() {
                    return Err(anyhow!(
                        "classifier expects {}-value embeddings, {} embedder produces {}",
                        classifier.dimension(),
                        embedder.name(),
                        embedder.dimension()
                    ));
                }
                Some(Box::new(classifier) as Box<dyn Classifier>)
            }
            None => None,
        };
        Ok(Self {
            model,
            embedder,
            classifier,
        })
    }

    /// Names for logs: `model/embedder/classifier`.
    pub fn describe(&self) -> String {
        format!(
            "{}/{}/{}",
            self.model.name(),
            self.embedder.name(),
            self.classifier.as_ref().map_or("none", |c| c.name())
        )
    }
}

pub fn build_anomaly_model(settings: &ModelSettings) -> Result<Box<dyn AnomalyModel>> {
    match settings.kind {
        ModelKind::Stub => Ok(Box::new(StubAnomalyModel::new(
            settings.input_width / 8,
            settings.input_height / 8,
        ))),
        ModelKind::Onnx => build_onnx(settings),
    }
}

#[cfg(feature = "backend-tract")]
fn build_onnx(settings: &ModelSettings) -> Result<Box<dyn AnomalyModel>> {
    let path = settings
        .path
        .as_ref()
        .ok_or_else(|| anyhow!("model.path is required for onnx models"))?;
    Ok(Box::new(super::backends::OnnxAnomalyModel::new(
        path,
        settings.input_width,
        settings.input_height,
    )?))
}

#[cfg(not(feature = "backend-tract"))]
fn build_onnx(_settings: &ModelSettings) -> Result<Box<dyn AnomalyModel>> {
    Err(anyhow!(
        "onnx models require the backend-tract feature; rebuild with --features backend-tract"
    ))
}
