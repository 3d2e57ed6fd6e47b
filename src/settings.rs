//! ## Pipeline Settings
//!
//! Configuration for the proxy-label engine and the feature pipeline.
//!
//! Every value has a default matching the reference labeling run (snapshot 2025-06-30 UTC,
//! three clusters, seed 42). Settings can be loaded from a JSON file and selectively
//! overridden through environment variables:
//!
//! - `CREDIT_RISK_SNAPSHOT_DATE`: RFC 3339 date-time used as the recency reference point.
//! - `CREDIT_RISK_CLUSTERS`: number of customer clusters.
//! - `CREDIT_RISK_SEED`: seed for the clustering initialisation.

use crate::exceptions::{CreditRiskError, CreditRiskResult};
use crate::transformers::imputation::ImputeStrategy;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How `log1p` treats values below -1 (possible after capping heavily negative amounts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogPolicy {
    /// Plain `ln(1 + x)`. Fitting fails when a value is <= -1; at transform time such
    /// values become missing and are imputed downstream.
    Strict,
    /// `sign(x) * ln(1 + |x|)`, identical to `log1p` for non-negative values.
    #[default]
    Signed,
}

/// What to do with timestamp text that does not parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimestampPolicy {
    /// Treat the value as missing (logged) and let imputation fill the calendar fields.
    #[default]
    Coerce,
    /// Fail query execution on the first unparseable value.
    Reject,
}

/// Settings for the RFM proxy-label engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfmSettings {
    /// Recency is measured in whole days from the latest transaction to this instant.
    #[serde(default = "default_snapshot_date")]
    pub snapshot_date: DateTime<Utc>,
    #[serde(default = "default_n_clusters")]
    pub n_clusters: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Number of k-means restarts; the run with the lowest inertia wins.
    #[serde(default = "default_n_init")]
    pub n_init: usize,
}

fn default_snapshot_date() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 30, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn default_n_clusters() -> usize {
    3
}

fn default_seed() -> u64 {
    42
}

fn default_max_iter() -> usize {
    300
}

fn default_tolerance() -> f64 {
    1e-4
}

fn default_n_init() -> usize {
    10
}

impl Default for RfmSettings {
    fn default() -> Self {
        Self {
            snapshot_date: default_snapshot_date(),
            n_clusters: default_n_clusters(),
            seed: default_seed(),
            max_iter: default_max_iter(),
            tolerance: default_tolerance(),
            n_init: default_n_init(),
        }
    }
}

/// Settings for the feature pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSettings {
    /// Multiplier of the inter-quartile range used for outlier caps.
    #[serde(default = "default_iqr_factor")]
    pub iqr_factor: f64,
    #[serde(default)]
    pub log_policy: LogPolicy,
    #[serde(default)]
    pub timestamp_policy: TimestampPolicy,
    /// Statistic filled into missing numeric features.
    #[serde(default)]
    pub numeric_imputation: ImputeStrategy,
}

fn default_iqr_factor() -> f64 {
    1.5
}

impl Default for FeatureSettings {
    fn default() -> Self {
        Self {
            iqr_factor: default_iqr_factor(),
            log_policy: LogPolicy::default(),
            timestamp_policy: TimestampPolicy::default(),
            numeric_imputation: ImputeStrategy::default(),
        }
    }
}

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default)]
    pub rfm: RfmSettings,
    #[serde(default)]
    pub features: FeatureSettings,
}

impl PipelineSettings {
    /// Loads settings from a JSON file and validates them.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> CreditRiskResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Applies `CREDIT_RISK_*` environment overrides on top of these settings.
    pub fn with_env_overrides(self) -> CreditRiskResult<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary key lookup (the environment in production).
    pub fn with_overrides<F>(mut self, lookup: F) -> CreditRiskResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("CREDIT_RISK_SNAPSHOT_DATE") {
            self.rfm.snapshot_date = DateTime::parse_from_rfc3339(raw.trim())
                .map_err(|e| {
                    CreditRiskError::InvalidParameter(format!(
                        "CREDIT_RISK_SNAPSHOT_DATE '{}' is not RFC 3339: {}",
                        raw, e
                    ))
                })?
                .with_timezone(&Utc);
        }
        if let Some(raw) = lookup("CREDIT_RISK_CLUSTERS") {
            self.rfm.n_clusters = raw.trim().parse().map_err(|_| {
                CreditRiskError::InvalidParameter(format!(
                    "CREDIT_RISK_CLUSTERS '{}' is not a positive integer",
                    raw
                ))
            })?;
        }
        if let Some(raw) = lookup("CREDIT_RISK_SEED") {
            self.rfm.seed = raw.trim().parse().map_err(|_| {
                CreditRiskError::InvalidParameter(format!(
                    "CREDIT_RISK_SEED '{}' is not an unsigned integer",
                    raw
                ))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> CreditRiskResult<()> {
        if self.rfm.n_clusters == 0 {
            return Err(CreditRiskError::InvalidParameter(
                "n_clusters must be at least 1".to_string(),
            ));
        }
        if self.rfm.max_iter == 0 || self.rfm.n_init == 0 {
            return Err(CreditRiskError::InvalidParameter(
                "max_iter and n_init must be at least 1".to_string(),
            ));
        }
        if !(self.rfm.tolerance.is_finite() && self.rfm.tolerance >= 0.0) {
            return Err(CreditRiskError::InvalidParameter(format!(
                "tolerance {} must be a finite non-negative number",
                self.rfm.tolerance
            )));
        }
        if !(self.features.iqr_factor.is_finite() && self.features.iqr_factor > 0.0) {
            return Err(CreditRiskError::InvalidParameter(format!(
                "iqr_factor {} must be a finite positive number",
                self.features.iqr_factor
            )));
        }
        Ok(())
    }
}
