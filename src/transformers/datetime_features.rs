//! ## Transformers for extracting datetime-based features
//!
//! [`DatetimeFeatures`] parses a transaction timestamp column (text or an Arrow timestamp)
//! and appends four calendar features: `<prefix>_hour` (0–23), `<prefix>_day` (day of month),
//! `<prefix>_month` (1–12) and `<prefix>_year`, all as `Float64`.
//!
//! Unparseable text is handled according to [`TimestampPolicy`]:
//!
//! - `Coerce`: the value becomes missing and so do its calendar features; `fit` counts and
//!   logs such rows so they are never lost silently.
//! - `Reject`: the query fails when executed.
//!
//! Errors are returned as `CreditRiskError` and results are wrapped in `CreditRiskResult`.

use crate::exceptions::{CreditRiskError, CreditRiskResult};
use crate::impl_transformer;
use crate::settings::TimestampPolicy;
use arrow::array::Int64Array;
use datafusion::arrow::datatypes::{DataType, TimeUnit};
use datafusion::functions_aggregate::expr_fn::count;
use datafusion::prelude::*;
use datafusion_expr::{cast, ident, lit, try_cast, Expr};
use datafusion_functions::datetime::date_part;
use tracing::warn;

/// Calendar parts extracted from the timestamp, with the `date_part` unit for each.
pub const CALENDAR_PARTS: [(&str, &str); 4] = [
    ("hour", "hour"),
    ("day", "day"),
    ("month", "month"),
    ("year", "year"),
];

/// Validates that a column exists and is either text or a datetime type.
fn validate_datetime_column(df: &DataFrame, col_name: &str) -> CreditRiskResult<()> {
    let field = df.schema().field_with_name(None, col_name).map_err(|_| {
        CreditRiskError::MissingColumn(format!("Column '{}' not found", col_name))
    })?;
    match field.data_type() {
        DataType::Utf8
        | DataType::LargeUtf8
        | DataType::Utf8View
        | DataType::Timestamp(_, _)
        | DataType::Date32
        | DataType::Date64 => Ok(()),
        dt => Err(CreditRiskError::InvalidParameter(format!(
            "Column '{}' must hold timestamp text or a datetime type, but found {:?}",
            col_name, dt
        ))),
    }
}

/// Extracts hour, day, month and year from a timestamp column.
pub struct DatetimeFeatures {
    pub column: String,
    pub prefix: String,
    pub policy: TimestampPolicy,
    /// Number of non-null values that failed to parse during the last `fit`.
    pub unparsed_rows: usize,
}

impl DatetimeFeatures {
    pub fn new(column: impl Into<String>, prefix: impl Into<String>, policy: TimestampPolicy) -> Self {
        Self {
            column: column.into(),
            prefix: prefix.into(),
            policy,
            unparsed_rows: 0,
        }
    }

    /// Names of the generated columns, in the order they are appended.
    pub fn output_columns(&self) -> Vec<String> {
        CALENDAR_PARTS
            .iter()
            .map(|(suffix, _)| format!("{}_{}", self.prefix, suffix))
            .collect()
    }

    fn parsed_expr(&self) -> Expr {
        let target = DataType::Timestamp(TimeUnit::Nanosecond, None);
        match self.policy {
            TimestampPolicy::Coerce => try_cast(ident(&self.column), target),
            TimestampPolicy::Reject => cast(ident(&self.column), target),
        }
    }

    /// Validates the column and, under `Coerce`, counts (and logs) values that will be
    /// treated as missing because they do not parse.
    pub async fn fit(&mut self, df: &DataFrame) -> CreditRiskResult<()> {
        validate_datetime_column(df, &self.column)?;
        self.unparsed_rows = 0;
        if self.policy == TimestampPolicy::Reject {
            return Ok(());
        }

        let counts = df
            .clone()
            .aggregate(
                vec![],
                vec![
                    count(ident(&self.column)).alias("present"),
                    count(self.parsed_expr()).alias("parsed"),
                ],
            )?
            .collect()
            .await?;
        if let Some(batch) = counts.first() {
            let value_at = |i: usize| -> CreditRiskResult<i64> {
                batch
                    .column(i)
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .map(|a| a.value(0))
                    .ok_or_else(|| {
                        CreditRiskError::InvalidParameter("Expected Int64 counts".to_string())
                    })
            };
            let (present, parsed) = (value_at(0)?, value_at(1)?);
            self.unparsed_rows = (present - parsed).max(0) as usize;
        }
        if self.unparsed_rows > 0 {
            warn!(
                column = %self.column,
                rows = self.unparsed_rows,
                "Unparseable timestamps coerced to missing; calendar features will be imputed"
            );
        }
        Ok(())
    }

    /// Transforms the DataFrame by appending the calendar features.
    pub fn transform(&self, df: DataFrame) -> CreditRiskResult<DataFrame> {
        validate_datetime_column(&df, &self.column)?;
        let mut exprs: Vec<Expr> = df.schema().fields().iter().map(|f| ident(f.name())).collect();
        let parsed = self.parsed_expr();
        for ((_, unit), name) in CALENDAR_PARTS.iter().zip(self.output_columns()) {
            let part = date_part().call(vec![lit(*unit), parsed.clone()]);
            exprs.push(cast(part, DataType::Float64).alias(name));
        }
        df.select(exprs).map_err(CreditRiskError::from)
    }

    fn inherent_is_stateful(&self) -> bool {
        false
    }
}

impl_transformer!(DatetimeFeatures);
