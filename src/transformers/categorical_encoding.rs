//! # Categorical Encoding Transformers
//!
//! [`OneHotEncoder`] expands each categorical column into one binary `Float64` indicator per
//! category seen at fit time. The vocabulary of a column is sorted, so the generated columns
//! always come out in the same order for the same training data.
//!
//! Categories that were not seen during fitting (and missing values) encode as all zeros.
//! The original categorical columns are dropped from the output.

use crate::exceptions::{CreditRiskError, CreditRiskResult};
use crate::impl_transformer;
use crate::schema::require_columns;
use arrow::array::{Array, StringArray};
use arrow::datatypes::DataType;
use datafusion::logical_expr::{cast, ident, lit, Case as DFCase, Expr};
use datafusion::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

/// Extract the distinct non-null values of a column, sorted.
async fn extract_distinct_values(df: &DataFrame, col_name: &str) -> CreditRiskResult<Vec<String>> {
    let distinct_df = df
        .clone()
        .select(vec![cast(ident(col_name), DataType::Utf8).alias("value")])?
        .distinct()?;
    let batches = distinct_df.collect().await?;
    let mut values = BTreeSet::new();
    for batch in batches {
        let array = batch
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| {
                CreditRiskError::InvalidParameter(format!(
                    "Expected Utf8 array for column {}",
                    col_name
                ))
            })?;
        for i in 0..array.len() {
            if !array.is_null(i) {
                values.insert(array.value(i).to_string());
            }
        }
    }
    Ok(values.into_iter().collect())
}

/// Name of the indicator column for `category` of `col_name`.
pub fn indicator_name(col_name: &str, category: &str) -> String {
    format!("{}_{}", col_name, category)
}

/// OneHotEncoder transforms each categorical column into multiple binary columns
/// (one per distinct category).
pub struct OneHotEncoder {
    pub columns: Vec<String>,
    /// Mapping from column name to its sorted list of categories.
    pub categories: BTreeMap<String, Vec<String>>,
}

impl OneHotEncoder {
    /// Create a new OneHotEncoder for the specified columns.
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            categories: BTreeMap::new(),
        }
    }

    /// Create an encoder from a previously learned vocabulary.
    pub fn from_categories(columns: Vec<String>, categories: BTreeMap<String, Vec<String>>) -> Self {
        Self { columns, categories }
    }

    /// Names of the indicator columns, in output order.
    pub fn output_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .flat_map(|c| {
                self.categories
                    .get(c)
                    .into_iter()
                    .flatten()
                    .map(move |cat| indicator_name(c, cat))
            })
            .collect()
    }

    /// Learn distinct category values for each target column.
    pub async fn fit(&mut self, df: &DataFrame) -> CreditRiskResult<()> {
        let names: Vec<&str> = self.columns.iter().map(String::as_str).collect();
        require_columns(df, &names)?;
        for col_name in &self.columns {
            let values = extract_distinct_values(df, col_name).await?;
            self.categories.insert(col_name.clone(), values);
        }
        Ok(())
    }

    /// Replace the target columns with their indicator columns.
    pub fn transform(&self, df: DataFrame) -> CreditRiskResult<DataFrame> {
        let names: Vec<&str> = self.columns.iter().map(String::as_str).collect();
        require_columns(&df, &names)?;
        if self.columns.iter().any(|c| !self.categories.contains_key(c)) {
            return Err(CreditRiskError::FitNotCalled);
        }

        let mut exprs: Vec<Expr> = df
            .schema()
            .fields()
            .iter()
            .filter(|f| !self.columns.contains(f.name()))
            .map(|f| ident(f.name()))
            .collect();
        for col_name in &self.columns {
            let value = cast(ident(col_name), DataType::Utf8);
            for cat in &self.categories[col_name] {
                let indicator = Expr::Case(DFCase {
                    expr: None,
                    when_then_expr: vec![(
                        Box::new(value.clone().eq(lit(cat.clone()))),
                        Box::new(lit(1.0_f64)),
                    )],
                    else_expr: Some(Box::new(lit(0.0_f64))),
                });
                exprs.push(indicator.alias(indicator_name(col_name, cat)));
            }
        }
        df.select(exprs).map_err(CreditRiskError::from)
    }

    fn inherent_is_stateful(&self) -> bool {
        true
    }
}

impl_transformer!(OneHotEncoder);
