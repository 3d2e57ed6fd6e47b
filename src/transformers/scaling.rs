//! ## Scaling Transformers
//!
//! [`StandardScaler`] centres each numeric column on its training mean and divides by the
//! population standard deviation, both learned at fit time. Columns with zero spread keep a
//! scale of 1.0, so they are centred but never divided by zero.
//!
//! [`standardize`] is the in-memory counterpart used on RFM matrices before clustering.

use crate::exceptions::{CreditRiskError, CreditRiskResult};
use crate::impl_transformer;
use crate::schema::require_columns;
use approx::abs_diff_eq;
use arrow::datatypes::DataType;
use datafusion::functions_aggregate::expr_fn::{avg, stddev_pop};
use datafusion::logical_expr::{cast, ident, lit, Expr};
use datafusion::prelude::*;
use datafusion::scalar::ScalarValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Returns the mean and population standard deviation of `values`.
/// A zero (or undefined) deviation is reported as 1.0.
pub fn mean_and_scale(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 1.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, effective_scale(var.sqrt()))
}

/// Standardizes values to zero mean and unit population variance.
pub fn standardize(values: &[f64]) -> Vec<f64> {
    let (mean, scale) = mean_and_scale(values);
    values.iter().map(|v| (v - mean) / scale).collect()
}

fn effective_scale(std: f64) -> f64 {
    if !std.is_finite() || abs_diff_eq!(std, 0.0, epsilon = 1e-12) {
        1.0
    } else {
        std
    }
}

/// Fitted centring and scaling parameters of one column.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleParams {
    pub mean: f64,
    pub scale: f64,
}

/// Standardizes numeric columns: `(x - mean) / std`.
pub struct StandardScaler {
    pub columns: Vec<String>,
    pub params: BTreeMap<String, ScaleParams>,
}

impl StandardScaler {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            params: BTreeMap::new(),
        }
    }

    /// Create a scaler from previously fitted parameters.
    pub fn from_params(params: BTreeMap<String, ScaleParams>) -> Self {
        Self {
            columns: params.keys().cloned().collect(),
            params,
        }
    }

    pub async fn fit(&mut self, df: &DataFrame) -> CreditRiskResult<()> {
        let names: Vec<&str> = self.columns.iter().map(String::as_str).collect();
        require_columns(df, &names)?;
        if self.columns.is_empty() {
            return Ok(());
        }

        let mut aggs: Vec<Expr> = Vec::with_capacity(self.columns.len() * 2);
        for (i, name) in self.columns.iter().enumerate() {
            let value = cast(ident(name), DataType::Float64);
            aggs.push(avg(value.clone()).alias(format!("mean_{}", i)));
            aggs.push(stddev_pop(value).alias(format!("std_{}", i)));
        }
        let batches = df.clone().aggregate(vec![], aggs)?.collect().await?;
        let batch = batches.first().ok_or_else(|| {
            CreditRiskError::InvalidParameter("Aggregate returned no rows".to_string())
        })?;

        let as_f64 = |scalar: ScalarValue| match scalar {
            ScalarValue::Float64(v) => v,
            _ => None,
        };
        for (i, name) in self.columns.iter().enumerate() {
            let mean = as_f64(ScalarValue::try_from_array(batch.column(2 * i), 0)?).unwrap_or(0.0);
            let std = as_f64(ScalarValue::try_from_array(batch.column(2 * i + 1), 0)?)
                .unwrap_or(f64::NAN);
            self.params.insert(
                name.clone(),
                ScaleParams {
                    mean,
                    scale: effective_scale(std),
                },
            );
        }
        Ok(())
    }

    pub fn transform(&self, df: DataFrame) -> CreditRiskResult<DataFrame> {
        let names: Vec<&str> = self.columns.iter().map(String::as_str).collect();
        require_columns(&df, &names)?;
        if self.columns.iter().any(|c| !self.params.contains_key(c)) {
            return Err(CreditRiskError::FitNotCalled);
        }
        let exprs: Vec<Expr> = df
            .schema()
            .fields()
            .iter()
            .map(|field| {
                let name = field.name();
                match self.params.get(name.as_str()) {
                    Some(p) => ((cast(ident(name), DataType::Float64) - lit(p.mean))
                        / lit(p.scale))
                    .alias(name),
                    None => ident(name),
                }
            })
            .collect();
        df.select(exprs).map_err(CreditRiskError::from)
    }

    fn inherent_is_stateful(&self) -> bool {
        true
    }
}

impl_transformer!(StandardScaler);
