use chrono::{DateTime, Utc};

use crate::polygon::NormalizedPolygon;

use super::backend::ClassPrediction;

/// One positive detection, ready to report. Immutable after creation.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionCandidate {
    /// Model anomaly score.
    pub score: f64,
    pub polygon: NormalizedPolygon,
    pub class_id: Option<i64>,
    pub class_name: Option<String>,
    pub class_confidence: Option<f64>,
    /// Capture time of the frame the detection came from.
    pub frame_timestamp: DateTime<Utc>,
}

impl DetectionCandidate {
    /// Candidate without a class (classifier missing or failed).
    pub fn unclassified(
        score: f64,
        polygon: NormalizedPolygon,
        frame_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            score,
            polygon,
            class_id: None,
            class_name: None,
            class_confidence: None,
            frame_timestamp,
        }
    }

    pub fn with_class(mut self, prediction: ClassPrediction) -> Self {
        self.class_id = Some(prediction.class_id);
        self.class_name = Some(prediction.class_name);
        self.class_confidence = Some(prediction.confidence);
        self
    }

    pub fn is_classified(&self) -> bool {
        self.class_id.is_some()
    }
}
