pub mod histogram;
pub mod linear;
pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use histogram::HistogramEmbedder;
pub use linear::LinearClassifier;
pub use stub::StubAnomalyModel;

#[cfg(feature = "backend-tract")]
pub use tract::OnnxAnomalyModel;
