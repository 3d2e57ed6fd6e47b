//! ## Numerical Transformation Transformers
//!
//! This module provides [`Log1pTransformer`], which compresses right-skewed monetary fields
//! with `ln(1 + x)`.
//!
//! `log1p` is undefined at and below -1, which capped amounts can reach when a dataset holds
//! heavy reversals. The behaviour there is chosen with [`LogPolicy`]:
//!
//! - `Strict`: fitting fails if any value is <= -1; at transform time such values become
//!   missing (and are imputed by a later step).
//! - `Signed`: `sign(x) * ln(1 + |x|)`, which equals `log1p` for non-negative input and is
//!   defined for every real number.

use crate::exceptions::{CreditRiskError, CreditRiskResult};
use crate::impl_transformer;
use crate::schema::require_columns;
use crate::settings::LogPolicy;
use crate::transformers::outlier_handling::collect_f64_column;
use arrow::datatypes::DataType;
use datafusion::dataframe::DataFrame;
use datafusion::logical_expr::Case as DFCase;
use datafusion::scalar::ScalarValue;
use datafusion_expr::{cast, ident, lit, Expr};
use datafusion_functions::math;

/// Wrapper function wrapping math's natural logarithm UDF.
fn ln_expr(e: Expr) -> Expr {
    math::ln().call(vec![e])
}

/// Builds the `log1p` expression for a column under the given policy.
fn log1p_expr(col_name: &str, policy: LogPolicy) -> Expr {
    let x = cast(ident(col_name), DataType::Float64);
    match policy {
        LogPolicy::Strict => Expr::Case(DFCase {
            expr: None,
            when_then_expr: vec![(
                Box::new(x.clone().gt(lit(-1.0))),
                Box::new(ln_expr(lit(1.0) + x)),
            )],
            else_expr: Some(Box::new(lit(ScalarValue::Float64(None)))),
        }),
        LogPolicy::Signed => Expr::Case(DFCase {
            expr: None,
            when_then_expr: vec![(
                Box::new(x.clone().lt(lit(0.0))),
                Box::new(-ln_expr(lit(1.0) - x.clone())),
            )],
            else_expr: Some(Box::new(ln_expr(lit(1.0) + x))),
        }),
    }
}

/// Applies `log1p` to input columns, writing each result to its paired output column.
/// An output name equal to its input name replaces the column in place.
pub struct Log1pTransformer {
    /// `(input, output)` column pairs.
    pub columns: Vec<(String, String)>,
    pub policy: LogPolicy,
}

impl Log1pTransformer {
    pub fn new(columns: Vec<(String, String)>, policy: LogPolicy) -> Self {
        Self { columns, policy }
    }

    /// Stateless transformer: fit only validates the input.
    /// Under `LogPolicy::Strict`, every value of every input column must be greater than -1.
    pub async fn fit(&mut self, df: &DataFrame) -> CreditRiskResult<()> {
        let inputs: Vec<&str> = self.columns.iter().map(|(i, _)| i.as_str()).collect();
        require_columns(df, &inputs)?;
        if self.policy == LogPolicy::Strict {
            for name in inputs {
                let values = collect_f64_column(df, name).await?;
                if let Some(min) = values.iter().copied().reduce(f64::min) {
                    if min <= -1.0 {
                        return Err(CreditRiskError::InvalidParameter(format!(
                            "log1p requires all values in column '{}' to be greater than -1, found min {}",
                            name, min
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn transform(&self, df: DataFrame) -> CreditRiskResult<DataFrame> {
        let inputs: Vec<&str> = self.columns.iter().map(|(i, _)| i.as_str()).collect();
        require_columns(&df, &inputs)?;

        let mut exprs: Vec<Expr> = Vec::new();
        for field in df.schema().fields() {
            let name = field.name();
            match self.columns.iter().find(|(i, o)| i == name && o == name) {
                Some(_) => exprs.push(log1p_expr(name, self.policy).alias(name)),
                None => {
                    // Columns about to be overwritten by a pair's output are dropped here.
                    if !self.columns.iter().any(|(i, o)| o == name && i != name) {
                        exprs.push(ident(name));
                    }
                }
            }
        }
        for (input, output) in &self.columns {
            if input != output {
                exprs.push(log1p_expr(input, self.policy).alias(output));
            }
        }
        df.select(exprs).map_err(CreditRiskError::from)
    }

    fn inherent_is_stateful(&self) -> bool {
        false
    }
}

impl_transformer!(Log1pTransformer);
