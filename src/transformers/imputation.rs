//! ## Transformers for imputing missing values
//!
//! This module provides the imputers used by the feature pipeline:
//!
//! - **MeanMedianImputer**: Imputes numeric columns using the mean or the median learned at fit time.
//! - **CategoricalImputer**: Imputes categorical columns using the most frequent value.
//!
//! Each transformer returns a new DataFrame with the applied imputation strategy to the specified columns.
//! Errors are returned as `CreditRiskError` and results are wrapped in `CreditRiskResult`.

use crate::exceptions::{CreditRiskError, CreditRiskResult};
use crate::impl_transformer;
use crate::schema::require_columns;
use arrow::array::{Array, StringArray};
use arrow::datatypes::DataType;
use datafusion::functions_aggregate::expr_fn::{avg, count, median};
use datafusion::logical_expr::{cast, ident, lit, not, Case as DFCase, Expr};
use datafusion::prelude::*;
use datafusion::scalar::ScalarValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Constructs an expression equivalent to SQL COALESCE(col, fallback).
/// This is implemented as a CASE expression: if `col` is not null then return it, otherwise return `fallback`.
pub(crate) fn coalesce_expr_for(name: &str, fallback: Expr) -> Expr {
    Expr::Case(DFCase {
        expr: None,
        when_then_expr: vec![(Box::new(not(ident(name).is_null())), Box::new(ident(name)))],
        else_expr: Some(Box::new(fallback)),
    })
}

/// Generic helper function to apply a mapping to a set of target columns.
/// For each field in the DataFrame, if a fallback is available via `get_fallback`,
/// the column is replaced by a CASE–WHEN expression; otherwise, the original column is retained.
fn apply_imputation<F>(df: DataFrame, get_fallback: F) -> CreditRiskResult<DataFrame>
where
    F: Fn(&str) -> Option<Expr>,
{
    let exprs: Vec<Expr> = df
        .schema()
        .fields()
        .iter()
        .map(|field| {
            let name = field.name();
            match get_fallback(name) {
                Some(fallback_expr) => coalesce_expr_for(name, fallback_expr).alias(name),
                None => ident(name),
            }
        })
        .collect();
    df.select(exprs).map_err(CreditRiskError::from)
}

/// Imputation strategy for the [`MeanMedianImputer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImputeStrategy {
    Mean,
    #[default]
    Median,
}

/// Replaces missing values with the mean (or median) value for numeric columns.
///
/// A column with no observed values at fit time is imputed with 0.0.
pub struct MeanMedianImputer {
    pub columns: Vec<String>,
    pub strategy: ImputeStrategy,
    pub impute_values: BTreeMap<String, f64>,
}

impl MeanMedianImputer {
    /// Create a new imputer for the given columns and strategy.
    pub fn new(columns: Vec<String>, strategy: ImputeStrategy) -> Self {
        Self {
            columns,
            strategy,
            impute_values: BTreeMap::new(),
        }
    }

    /// Create an imputer from previously fitted values.
    pub fn from_values(strategy: ImputeStrategy, impute_values: BTreeMap<String, f64>) -> Self {
        Self {
            columns: impute_values.keys().cloned().collect(),
            strategy,
            impute_values,
        }
    }

    /// For each target column, compute the mean or median via an aggregate query.
    pub async fn fit(&mut self, df: &DataFrame) -> CreditRiskResult<()> {
        let names: Vec<&str> = self.columns.iter().map(String::as_str).collect();
        require_columns(df, &names)?;
        if self.columns.is_empty() {
            return Ok(());
        }

        let aggs: Vec<Expr> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let value = cast(ident(name), DataType::Float64);
                let agg = match self.strategy {
                    ImputeStrategy::Mean => avg(value),
                    ImputeStrategy::Median => median(value),
                };
                agg.alias(format!("stat_{}", i))
            })
            .collect();
        let batches = df.clone().aggregate(vec![], aggs)?.collect().await?;
        let batch = batches.first().ok_or_else(|| {
            CreditRiskError::InvalidParameter("Aggregate returned no rows".to_string())
        })?;

        for (i, name) in self.columns.iter().enumerate() {
            let scalar = ScalarValue::try_from_array(batch.column(i), 0)?;
            let value = match scalar {
                ScalarValue::Float64(Some(v)) => v,
                _ => {
                    warn!("Column '{}' has no values to learn from; imputing 0.0", name);
                    0.0
                }
            };
            self.impute_values.insert(name.clone(), value);
        }
        Ok(())
    }

    /// Returns a new DataFrame where, for each target column, missing values are replaced with the learned value.
    pub fn transform(&self, df: DataFrame) -> CreditRiskResult<DataFrame> {
        let names: Vec<&str> = self.columns.iter().map(String::as_str).collect();
        require_columns(&df, &names)?;
        if self.columns.iter().any(|c| !self.impute_values.contains_key(c)) {
            return Err(CreditRiskError::FitNotCalled);
        }
        apply_imputation(df, |name| self.impute_values.get(name).map(|&v| lit(v)))
    }

    fn inherent_is_stateful(&self) -> bool {
        true
    }
}

/// Finds the most frequent non-null value of a text column.
/// Ties go to the lexicographically smallest value.
async fn most_frequent(df: &DataFrame, col_name: &str) -> CreditRiskResult<Option<String>> {
    let value = cast(ident(col_name), DataType::Utf8).alias("value");
    let batches = df
        .clone()
        .select(vec![value])?
        .filter(col("value").is_not_null())?
        .aggregate(vec![col("value")], vec![count(lit(1)).alias("cnt")])?
        .sort(vec![
            col("cnt").sort(false, true),
            col("value").sort(true, true),
        ])?
        .limit(0, Some(1))?
        .collect()
        .await?;
    for batch in batches {
        if batch.num_rows() == 0 {
            continue;
        }
        let values = batch
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| {
                CreditRiskError::InvalidParameter(format!(
                    "Expected Utf8 array for column {}",
                    col_name
                ))
            })?;
        if !values.is_null(0) {
            return Ok(Some(values.value(0).to_string()));
        }
    }
    Ok(None)
}

/// Replaces missing values in categorical columns with the most frequent category.
///
/// Columns with no observed values fall back to `default`.
pub struct CategoricalImputer {
    pub columns: Vec<String>,
    pub default: String,
    pub mapping: BTreeMap<String, String>,
}

impl CategoricalImputer {
    /// Create a new categorical imputer for the given columns.
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            default: "missing".to_string(),
            mapping: BTreeMap::new(),
        }
    }

    /// Create an imputer from previously learned modes.
    pub fn from_values(mapping: BTreeMap<String, String>) -> Self {
        Self {
            columns: mapping.keys().cloned().collect(),
            default: "missing".to_string(),
            mapping,
        }
    }

    /// Learn the mode of each target column.
    pub async fn fit(&mut self, df: &DataFrame) -> CreditRiskResult<()> {
        let names: Vec<&str> = self.columns.iter().map(String::as_str).collect();
        require_columns(df, &names)?;
        for col_name in &self.columns {
            let mode = match most_frequent(df, col_name).await? {
                Some(mode) => mode,
                None => {
                    warn!(
                        "Column '{}' has no values; imputing '{}'",
                        col_name, self.default
                    );
                    self.default.clone()
                }
            };
            self.mapping.insert(col_name.clone(), mode);
        }
        Ok(())
    }

    pub fn transform(&self, df: DataFrame) -> CreditRiskResult<DataFrame> {
        let names: Vec<&str> = self.columns.iter().map(String::as_str).collect();
        require_columns(&df, &names)?;
        if self.columns.iter().any(|c| !self.mapping.contains_key(c)) {
            return Err(CreditRiskError::FitNotCalled);
        }
        apply_imputation(df, |name| self.mapping.get(name).map(|v| lit(v.clone())))
    }

    fn inherent_is_stateful(&self) -> bool {
        true
    }
}

impl_transformer!(MeanMedianImputer);
impl_transformer!(CategoricalImputer);
