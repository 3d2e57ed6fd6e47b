//! ## Per-customer aggregate features
//!
//! [`CustomerAggregates`] groups rows by a key column and computes the sum, mean, count and
//! sample standard deviation of a target column per group. The four statistics are left-joined
//! back onto every row of the group as `<target>_sum`, `<target>_mean`, `<target>_count` and
//! `<target>_std`, so no input row is lost.
//!
//! The sample standard deviation is undefined for single-row groups; it is filled with 0.0
//! so the column never carries missing values into the model.
//!
//! The statistics are part of the lazy plan: they are recomputed from whatever table is being
//! transformed, which at serving time is the request itself.

use crate::exceptions::{CreditRiskError, CreditRiskResult};
use crate::impl_transformer;
use crate::schema::require_columns;
use crate::transformers::imputation::coalesce_expr_for;
use arrow::datatypes::DataType;
use datafusion::common::JoinType;
use datafusion::functions_aggregate::expr_fn::{avg, count, stddev, sum};
use datafusion::logical_expr::{cast, ident, lit, Expr};
use datafusion::prelude::*;

const KEY_ALIAS: &str = "__aggregate_key";

/// Statistic suffixes, in output order.
pub const AGGREGATE_SUFFIXES: [&str; 4] = ["sum", "mean", "count", "std"];

/// Adds per-group sum, mean, count and standard deviation of a numeric column.
pub struct CustomerAggregates {
    pub group_by: String,
    pub target: String,
}

impl CustomerAggregates {
    pub fn new(group_by: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            group_by: group_by.into(),
            target: target.into(),
        }
    }

    /// Names of the generated columns.
    pub fn output_columns(&self) -> Vec<String> {
        AGGREGATE_SUFFIXES
            .iter()
            .map(|s| format!("{}_{}", self.target, s))
            .collect()
    }

    /// Stateless transformer: fit only validates the input.
    pub async fn fit(&mut self, df: &DataFrame) -> CreditRiskResult<()> {
        require_columns(df, &[self.group_by.as_str(), self.target.as_str()])
    }

    pub fn transform(&self, df: DataFrame) -> CreditRiskResult<DataFrame> {
        require_columns(&df, &[self.group_by.as_str(), self.target.as_str()])?;
        let outputs = self.output_columns();
        let [sum_name, mean_name, count_name, std_name] = [
            outputs[0].as_str(),
            outputs[1].as_str(),
            outputs[2].as_str(),
            outputs[3].as_str(),
        ];

        // Any stale aggregate columns are replaced.
        let base_exprs: Vec<Expr> = df
            .schema()
            .fields()
            .iter()
            .filter(|f| !outputs.contains(f.name()))
            .map(|f| ident(f.name()))
            .collect();
        let base = df.select(base_exprs)?;

        let value = cast(ident(&self.target), DataType::Float64);
        let stats = base
            .clone()
            .aggregate(
                vec![ident(&self.group_by)],
                vec![
                    sum(value.clone()).alias(sum_name),
                    avg(value.clone()).alias(mean_name),
                    count(value.clone()).alias(count_name),
                    stddev(value).alias(std_name),
                ],
            )?
            .select(vec![
                ident(&self.group_by).alias(KEY_ALIAS),
                ident(sum_name),
                ident(mean_name),
                cast(ident(count_name), DataType::Float64).alias(count_name),
                coalesce_expr_for(std_name, lit(0.0_f64)).alias(std_name),
            ])?;

        base.join_on(
            stats,
            JoinType::Left,
            [ident(&self.group_by).eq(ident(KEY_ALIAS))],
        )?
            .drop_columns(&[KEY_ALIAS])
            .map_err(CreditRiskError::from)
    }

    fn inherent_is_stateful(&self) -> bool {
        false
    }
}

impl_transformer!(CustomerAggregates);
