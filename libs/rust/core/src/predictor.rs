//! Predictor contract and the concrete artifact formats that implement it.
//!
//! An artifact is a self-describing JSON document; its `format` tag selects
//! the concrete implementation at deserialization time. Predictors are pure
//! with respect to shared state: `predict` takes an immutable self and a
//! request-scoped feature vector, so concurrent requests never interfere.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LoadError, PredictError, ValidationError};

/// Declared input contract of a loaded model: ordered feature names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSchema {
    pub features: Vec<String>,
}

impl InputSchema {
    /// Validates a decoded request body and returns the feature vector in
    /// schema order. Unknown keys are rejected so schema drift between
    /// client and model surfaces as a client error, not a silent skew.
    pub fn validate(&self, body: &Value) -> Result<Vec<f64>, ValidationError> {
        let obj = body.as_object().ok_or(ValidationError::NotAnObject)?;
        for key in obj.keys() {
            if !self.features.iter().any(|f| f == key) {
                return Err(ValidationError::UnknownFeature(key.clone()));
            }
        }
        let mut out = Vec::with_capacity(self.features.len());
        for name in &self.features {
            let value = obj
                .get(name)
                .ok_or_else(|| ValidationError::MissingFeature(name.clone()))?;
            let number = value
                .as_f64()
                .filter(|v| v.is_finite())
                .ok_or_else(|| ValidationError::NotANumber(name.clone()))?;
            out.push(number);
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: f64,
    pub scores: BTreeMap<String, f64>,
}

pub trait Predictor: Send + Sync + std::fmt::Debug {
    fn input_schema(&self) -> &InputSchema;
    /// Single-item synchronous prediction over a schema-ordered feature vector.
    fn predict(&self, features: &[f64]) -> Result<Prediction, PredictError>;
}

#[derive(Debug, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
enum ArtifactDoc {
    LinearSoftmax {
        schema: Vec<String>,
        classes: Vec<String>,
        weights: Vec<Vec<f64>>,
        intercepts: Vec<f64>,
    },
    NearestCentroid {
        schema: Vec<String>,
        classes: Vec<String>,
        centroids: Vec<Vec<f64>>,
    },
}

/// Builds a predictor from verified artifact bytes. Unknown formats and
/// shape inconsistencies are `LoadError::Deserialize`; a corrupted artifact
/// can never become a servable predictor.
pub fn deserialize_artifact(bytes: &[u8]) -> Result<Arc<dyn Predictor>, LoadError> {
    let doc: ArtifactDoc = serde_json::from_slice(bytes)
        .map_err(|e| LoadError::Deserialize(format!("invalid artifact document: {e}")))?;
    match doc {
        ArtifactDoc::LinearSoftmax { schema, classes, weights, intercepts } => {
            Ok(Arc::new(LinearSoftmax::new(schema, classes, weights, intercepts)?))
        }
        ArtifactDoc::NearestCentroid { schema, classes, centroids } => {
            Ok(Arc::new(NearestCentroid::new(schema, classes, centroids)?))
        }
    }
}

/// Multiclass linear model with softmax scoring.
#[derive(Debug)]
pub struct LinearSoftmax {
    schema: InputSchema,
    classes: Vec<String>,
    weights: Vec<Vec<f64>>,
    intercepts: Vec<f64>,
}

impl LinearSoftmax {
    fn new(
        schema: Vec<String>,
        classes: Vec<String>,
        weights: Vec<Vec<f64>>,
        intercepts: Vec<f64>,
    ) -> Result<Self, LoadError> {
        if schema.is_empty() || classes.is_empty() {
            return Err(LoadError::Deserialize("empty schema or class list".into()));
        }
        if weights.len() != classes.len() || intercepts.len() != classes.len() {
            return Err(LoadError::Deserialize(format!(
                "expected {} weight rows and intercepts, got {} and {}",
                classes.len(),
                weights.len(),
                intercepts.len()
            )));
        }
        if let Some(row) = weights.iter().find(|r| r.len() != schema.len()) {
            return Err(LoadError::Deserialize(format!(
                "weight row length {} does not match schema length {}",
                row.len(),
                schema.len()
            )));
        }
        Ok(Self { schema: InputSchema { features: schema }, classes, weights, intercepts })
    }
}

impl Predictor for LinearSoftmax {
    fn input_schema(&self) -> &InputSchema {
        &self.schema
    }

    fn predict(&self, features: &[f64]) -> Result<Prediction, PredictError> {
        if features.len() != self.schema.features.len() {
            return Err(PredictError(format!(
                "feature vector length {} does not match schema length {}",
                features.len(),
                self.schema.features.len()
            )));
        }
        let mut logits: Vec<f64> = self
            .weights
            .iter()
            .zip(&self.intercepts)
            .map(|(row, b)| row.iter().zip(features).map(|(w, x)| w * x).sum::<f64>() + b)
            .collect();
        softmax(&mut logits);
        finish(&self.classes, logits)
    }
}

/// Classifies by distance to per-class centroids; confidence is a softmax
/// over negated distances.
#[derive(Debug)]
pub struct NearestCentroid {
    schema: InputSchema,
    classes: Vec<String>,
    centroids: Vec<Vec<f64>>,
}

impl NearestCentroid {
    fn new(schema: Vec<String>, classes: Vec<String>, centroids: Vec<Vec<f64>>) -> Result<Self, LoadError> {
        if schema.is_empty() || classes.is_empty() {
            return Err(LoadError::Deserialize("empty schema or class list".into()));
        }
        if centroids.len() != classes.len() {
            return Err(LoadError::Deserialize(format!(
                "expected {} centroids, got {}",
                classes.len(),
                centroids.len()
            )));
        }
        if let Some(row) = centroids.iter().find(|r| r.len() != schema.len()) {
            return Err(LoadError::Deserialize(format!(
                "centroid length {} does not match schema length {}",
                row.len(),
                schema.len()
            )));
        }
        Ok(Self { schema: InputSchema { features: schema }, classes, centroids })
    }
}

impl Predictor for NearestCentroid {
    fn input_schema(&self) -> &InputSchema {
        &self.schema
    }

    fn predict(&self, features: &[f64]) -> Result<Prediction, PredictError> {
        if features.len() != self.schema.features.len() {
            return Err(PredictError(format!(
                "feature vector length {} does not match schema length {}",
                features.len(),
                self.schema.features.len()
            )));
        }
        let mut scores: Vec<f64> = self
            .centroids
            .iter()
            .map(|c| {
                let dist2: f64 = c.iter().zip(features).map(|(a, b)| (a - b) * (a - b)).sum();
                -dist2.sqrt()
            })
            .collect();
        softmax(&mut scores);
        finish(&self.classes, scores)
    }
}

fn finish(classes: &[String], probs: Vec<f64>) -> Result<Prediction, PredictError> {
    let (best, confidence) = probs
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .ok_or_else(|| PredictError("empty class scores".into()))?;
    let scores: BTreeMap<String, f64> = classes
        .iter()
        .cloned()
        .zip(probs.iter().copied())
        .collect();
    Ok(Prediction { label: classes[best].clone(), confidence: *confidence, scores })
}

fn softmax(v: &mut [f64]) {
    if v.is_empty() {
        return;
    }
    let max = v.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let mut sum = 0.0;
    for x in v.iter_mut() {
        *x = (*x - max).exp();
        sum += *x;
    }
    if sum > 0.0 {
        for x in v.iter_mut() {
            *x /= sum;
        }
    }
}
