//! ## Transformers for handling outliers
//!
//! This module provides the inter-quartile-range (IQR) rule for capping extreme values.
//!
//! - [`cap_outliers`]: pure function over a single column of values.
//! - [`IqrOutlierCapper`]: transformer that learns the caps (`Q1 - factor·IQR`,
//!   `Q3 + factor·IQR`) per column at fit time and applies them lazily afterwards.
//!
//! Quartiles use linear interpolation between order statistics, so the caps for a column
//! match what the usual dataframe tooling reports for `quantile(0.25)` and `quantile(0.75)`.
//! Errors are returned as `CreditRiskError` and results are wrapped in `CreditRiskResult`.

use crate::exceptions::{CreditRiskError, CreditRiskResult};
use crate::impl_transformer;
use crate::schema::require_columns;
use arrow::array::{Array, Float64Array};
use arrow::datatypes::DataType;
use datafusion::logical_expr::{cast, ident, lit, Case as DFCase, Expr};
use datafusion::prelude::*;
use futures::future::try_join_all;
use std::collections::BTreeMap;
use tracing::debug;

/// Returns the `q`-quantile of already sorted, NaN-free values using linear interpolation.
/// Returns `None` for an empty slice.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let q = q.clamp(0.0, 1.0);
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Returns the first and third quartiles of the finite values in `values`.
pub fn quartiles(values: &[f64]) -> Option<(f64, f64)> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(f64::total_cmp);
    Some((quantile_sorted(&sorted, 0.25)?, quantile_sorted(&sorted, 0.75)?))
}

/// Returns the IQR caps `(Q1 - factor·IQR, Q3 + factor·IQR)` for the given values.
pub fn iqr_bounds(values: &[f64], factor: f64) -> Option<(f64, f64)> {
    let (q1, q3) = quartiles(values)?;
    let iqr = q3 - q1;
    Some((q1 - factor * iqr, q3 + factor * iqr))
}

/// Clips every value into `[Q1 - factor·IQR, Q3 + factor·IQR]`.
///
/// Values already inside the bounds are returned unchanged and non-finite values pass
/// through untouched. An empty input yields an empty output.
pub fn cap_outliers(values: &[f64], factor: f64) -> Vec<f64> {
    match iqr_bounds(values, factor) {
        Some((lower, upper)) => values
            .iter()
            .map(|&v| if v.is_finite() { v.clamp(lower, upper) } else { v })
            .collect(),
        None => values.to_vec(),
    }
}

/// Helper function to build a CASE expression for capping values.
/// Depending on the provided lower and upper bounds, this function returns a CASE expression:
/// - If both bounds are provided:
///   `CASE WHEN col < lower THEN lower WHEN col > upper THEN upper ELSE col END`
/// - If only one bound is provided, the corresponding condition is applied.
/// - If no bounds are provided, returns the original column.
pub(crate) fn cap_expr_for(col_name: &str, lower: Option<f64>, upper: Option<f64>) -> Expr {
    let base = ident(col_name);
    let mut when_then_expr = Vec::new();
    if let Some(l) = lower {
        when_then_expr.push((Box::new(base.clone().lt(lit(l))), Box::new(lit(l))));
    }
    if let Some(u) = upper {
        when_then_expr.push((Box::new(base.clone().gt(lit(u))), Box::new(lit(u))));
    }
    if when_then_expr.is_empty() {
        return base;
    }
    Expr::Case(DFCase {
        expr: None,
        when_then_expr,
        else_expr: Some(Box::new(base)),
    })
}

/// Collects the non-null values of a column as `f64`.
pub(crate) async fn collect_f64_column(df: &DataFrame, col_name: &str) -> CreditRiskResult<Vec<f64>> {
    let batches = df
        .clone()
        .select(vec![cast(ident(col_name), DataType::Float64).alias("v")])?
        .collect()
        .await?;
    let mut values = Vec::new();
    for batch in batches {
        let array = batch
            .column(0)
            .as_any()
            .downcast_ref::<Float64Array>()
            .ok_or_else(|| {
                CreditRiskError::InvalidParameter(format!(
                    "Expected Float64 values for column {}",
                    col_name
                ))
            })?;
        values.extend(array.iter().flatten());
    }
    Ok(values)
}

/// Caps outliers using thresholds derived from the inter-quartile range.
///
/// With no suffix the capped values replace the column; with a suffix they are written to
/// a new column `<column><suffix>` and the original column is kept.
pub struct IqrOutlierCapper {
    pub columns: Vec<String>,
    pub factor: f64,
    pub suffix: Option<String>,
    /// Fitted `(lower, upper)` caps per column.
    pub thresholds: BTreeMap<String, (f64, f64)>,
}

impl IqrOutlierCapper {
    /// Create a new IqrOutlierCapper.
    pub fn new(columns: Vec<String>, factor: f64) -> Self {
        Self {
            columns,
            factor,
            suffix: None,
            thresholds: BTreeMap::new(),
        }
    }

    /// Create a capper from previously fitted thresholds.
    pub fn from_thresholds(thresholds: BTreeMap<String, (f64, f64)>) -> Self {
        Self {
            columns: thresholds.keys().cloned().collect(),
            factor: f64::NAN,
            suffix: None,
            thresholds,
        }
    }

    /// Write capped values into `<column><suffix>` instead of replacing the column.
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    /// Name of the column holding the capped values of `col_name`.
    pub fn output_name(&self, col_name: &str) -> String {
        match &self.suffix {
            Some(suffix) => format!("{}{}", col_name, suffix),
            None => col_name.to_string(),
        }
    }

    /// Fit the capper by computing the quartiles of each target column.
    pub async fn fit(&mut self, df: &DataFrame) -> CreditRiskResult<()> {
        if !(self.factor.is_finite() && self.factor >= 0.0) {
            return Err(CreditRiskError::InvalidParameter(format!(
                "IQR factor {} must be a finite non-negative number",
                self.factor
            )));
        }
        let names: Vec<&str> = self.columns.iter().map(String::as_str).collect();
        require_columns(df, &names)?;

        let columns = try_join_all(names.iter().map(|name| collect_f64_column(df, name))).await?;
        for (name, values) in names.iter().zip(columns) {
            let bounds = iqr_bounds(&values, self.factor).ok_or_else(|| {
                CreditRiskError::InvalidParameter(format!(
                    "Cannot compute quartiles for column '{}' without any values",
                    name
                ))
            })?;
            debug!("IQR caps for '{}': [{}, {}]", name, bounds.0, bounds.1);
            self.thresholds.insert(name.to_string(), bounds);
        }
        Ok(())
    }

    /// Returns a new DataFrame where each target column is capped using the computed thresholds.
    pub fn transform(&self, df: DataFrame) -> CreditRiskResult<DataFrame> {
        let names: Vec<&str> = self.columns.iter().map(String::as_str).collect();
        require_columns(&df, &names)?;
        if self.columns.iter().any(|c| !self.thresholds.contains_key(c)) {
            return Err(CreditRiskError::FitNotCalled);
        }

        let mut exprs: Vec<Expr> = Vec::new();
        for field in df.schema().fields() {
            let name = field.name();
            match (self.thresholds.get(name.as_str()), &self.suffix) {
                (Some(&(lower, upper)), None) => {
                    exprs.push(cap_expr_for(name, Some(lower), Some(upper)).alias(name))
                }
                _ => exprs.push(ident(name)),
            }
        }
        if self.suffix.is_some() {
            for (name, &(lower, upper)) in &self.thresholds {
                exprs.push(cap_expr_for(name, Some(lower), Some(upper)).alias(self.output_name(name)));
            }
        }
        df.select(exprs).map_err(CreditRiskError::from)
    }

    fn inherent_is_stateful(&self) -> bool {
        true
    }
}

impl_transformer!(IqrOutlierCapper);
