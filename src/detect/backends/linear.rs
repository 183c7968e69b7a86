use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::detect::backend::{ClassPrediction, Classifier};

#[derive(Debug, Deserialize)]
struct ModelFile {
    classes: Vec<ClassFile>,
}

#[derive(Debug, Deserialize)]
struct ClassFile {
    id: i64,
    name: Option<String>,
    weights: Vec<f32>,
    #[serde(default)]
    bias: f32,
}

#[derive(Clone, Debug)]
struct LinearClass {
    id: i64,
    name: String,
    weights: Vec<f32>,
    bias: f32,
}

/// Linear soft-max classifier over region embeddings, loaded from JSON:
/// `{"classes":[{"id":1,"name":"scratch","weights":[...],"bias":0.0}]}`.
#[derive(Clone, Debug)]
pub struct LinearClassifier {
    classes: Vec<LinearClass>,
    dimension: usize,
}

impl LinearClassifier {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read classifier {}", path.display()))?;
        Self::from_json(&contents)
            .with_context(|| format!("invalid classifier {}", path.display()))
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let file: ModelFile = serde_json::from_str(contents)?;
        let first = file
            .classes
            .first()
            .ok_or_else(|| anyhow!("classifier has no classes"))?;
        let dimension = first.weights.len();
        if dimension == 0 {
            return Err(anyhow!("classifier weights are empty"));
        }
        let mut classes = Vec::with_capacity(file.classes.len());
        for class in file.classes {
            if class.weights.len() != dimension {
                return Err(anyhow!(
                    "class {} has {} weights, expected {}",
                    class.id,
                    class.weights.len(),
                    dimension
                ));
            }
            classes.push(LinearClass {
                name: class
                    .name
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| format!("class_{}", class.id)),
                id: class.id,
                weights: class.weights,
                bias: class.bias,
            });
        }
        Ok(Self { classes, dimension })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

impl Classifier for LinearClassifier {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn classify(&mut self, embedding: &[f32]) -> Result<ClassPrediction> {
        if embedding.len() != self.dimension {
            return Err(anyhow!(
                "embedding has {} values, classifier expects {}",
                embedding.len(),
                self.dimension
            ));
        }
        let logits: Vec<f64> = self
            .classes
            .iter()
            .map(|class| {
                class
                    .weights
                    .iter()
                    .zip(embedding)
                    .map(|(w, x)| (*w as f64) * (*x as f64))
                    .sum::<f64>()
                    + class.bias as f64
            })
            .collect();
        let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
        let total: f64 = exps.iter().sum();

        let (best, _) = exps
            .iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |acc, (i, &e)| if e > acc.1 { (i, e) } else { acc });
        let class = &self.classes[best];
        Ok(ClassPrediction {
            class_id: class.id,
            class_name: class.name.clone(),
            confidence: exps[best] / total,
        })
    }
}
