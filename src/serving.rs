//! ## Serving contract
//!
//! Scores one raw transaction with a trained classifier:
//!
//! request JSON → [`Transaction`] → [`FittedFeatures::transform_transaction`] → feature vector
//! in the training column order → [`RiskModel::predict_proba`] → [`RiskScore`].
//!
//! Preprocessing always reuses the training-fitted parameters, including the scaler.
//! A request whose timestamp does not parse is rejected with a descriptive error and never
//! scored. [`RiskScorer::score_json`] turns every failure into an error response, so a bad
//! request cannot take the caller down.

use crate::exceptions::{CreditRiskError, CreditRiskResult};
use crate::features::FittedFeatures;
use crate::schema::Transaction;
use datafusion::prelude::SessionContext;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, warn};

/// Result text for probabilities at or above the decision threshold.
pub const HIGH_RISK_RESULT: &str = "Has probability of default";
/// Result text for probabilities below the decision threshold.
pub const LOW_RISK_RESULT: &str = "Does not have probability of default";

/// A trained binary classifier over the feature vector.
pub trait RiskModel: Send + Sync {
    /// Probability of the positive (high-risk) class.
    fn predict_proba(&self, features: &[f64]) -> CreditRiskResult<f64>;

    /// Number of features the model expects, when known.
    fn n_features(&self) -> Option<usize> {
        None
    }

    /// Feature names the model was trained on, when known.
    fn feature_names(&self) -> Option<&[String]> {
        None
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// A logistic regression exported as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticRegressionModel {
    pub intercept: f64,
    pub coefficients: Vec<f64>,
    #[serde(default)]
    pub feature_names: Vec<String>,
}

impl LogisticRegressionModel {
    pub fn new(intercept: f64, coefficients: Vec<f64>) -> Self {
        Self {
            intercept,
            coefficients,
            feature_names: Vec::new(),
        }
    }

    pub fn with_feature_names(mut self, names: Vec<String>) -> Self {
        self.feature_names = names;
        self
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> CreditRiskResult<Self> {
        let reader = BufReader::new(File::open(path)?);
        let model: Self = serde_json::from_reader(reader)?;
        if !model.feature_names.is_empty() && model.feature_names.len() != model.coefficients.len()
        {
            return Err(CreditRiskError::FeatureMismatch {
                expected: model.coefficients.len(),
                found: model.feature_names.len(),
            });
        }
        Ok(model)
    }
}

impl RiskModel for LogisticRegressionModel {
    fn predict_proba(&self, features: &[f64]) -> CreditRiskResult<f64> {
        if features.len() != self.coefficients.len() {
            return Err(CreditRiskError::FeatureMismatch {
                expected: self.coefficients.len(),
                found: features.len(),
            });
        }
        let z = self.intercept
            + self
                .coefficients
                .iter()
                .zip(features)
                .map(|(w, x)| w * x)
                .sum::<f64>();
        Ok(sigmoid(z))
    }

    fn n_features(&self) -> Option<usize> {
        Some(self.coefficients.len())
    }

    fn feature_names(&self) -> Option<&[String]> {
        (!self.feature_names.is_empty()).then_some(self.feature_names.as_slice())
    }
}

/// Probability and verdict for one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskScore {
    pub risk_probability: f64,
    pub result: String,
}

/// Response body: either a score or an error message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScoreResponse {
    Score(RiskScore),
    Error { error: String },
}

impl ScoreResponse {
    pub fn is_error(&self) -> bool {
        matches!(self, ScoreResponse::Error { .. })
    }
}

/// Scores transactions with a fitted feature artifact and a trained model.
pub struct RiskScorer<M: RiskModel> {
    features: FittedFeatures,
    model: M,
    threshold: f64,
    ctx: SessionContext,
}

impl<M: RiskModel> RiskScorer<M> {
    /// Pairs an artifact with a model, checking that they agree on the feature layout.
    pub fn new(features: FittedFeatures, model: M) -> CreditRiskResult<Self> {
        if let Some(n) = model.n_features() {
            if n != features.n_features() {
                return Err(CreditRiskError::FeatureMismatch {
                    expected: features.n_features(),
                    found: n,
                });
            }
        }
        if let Some(names) = model.feature_names() {
            if let Some((i, (ours, theirs))) = features
                .columns
                .iter()
                .zip(names)
                .enumerate()
                .find(|(_, (a, b))| a != b)
            {
                return Err(CreditRiskError::InvalidParameter(format!(
                    "Model feature {} is '{}' but the feature artifact has '{}'",
                    i, theirs, ours
                )));
            }
        }
        Ok(Self {
            features,
            model,
            threshold: 0.5,
            ctx: SessionContext::new(),
        })
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn features(&self) -> &FittedFeatures {
        &self.features
    }

    /// Scores one transaction.
    pub async fn score(&self, transaction: &Transaction) -> CreditRiskResult<RiskScore> {
        let vector = self
            .features
            .transform_transaction(&self.ctx, transaction)
            .await?;
        let probability = self.model.predict_proba(&vector.values)?;
        debug!(
            "Scored transaction {}: {:.4}",
            transaction.transaction_id, probability
        );
        let result = if probability >= self.threshold {
            HIGH_RISK_RESULT
        } else {
            LOW_RISK_RESULT
        };
        Ok(RiskScore {
            risk_probability: probability,
            result: result.to_string(),
        })
    }

    /// Scores a JSON request body. Failures become `{"error": ...}` responses.
    pub async fn score_json(&self, body: &str) -> ScoreResponse {
        let transaction: Transaction = match serde_json::from_str(body) {
            Ok(t) => t,
            Err(e) => {
                warn!("Rejected malformed request: {}", e);
                return ScoreResponse::Error {
                    error: format!("Invalid request body: {}", e),
                };
            }
        };
        match self.score(&transaction).await {
            Ok(score) => ScoreResponse::Score(score),
            Err(e) => {
                warn!("Rejected transaction {}: {}", transaction.transaction_id, e);
                ScoreResponse::Error {
                    error: e.to_string(),
                }
            }
        }
    }
}
