//! ## Transaction Schema
//!
//! Column names, canonical types and the record type for raw transactions.
//!
//! Raw tables arrive with whatever types CSV inference or a Parquet writer chose.
//! [`normalize_transactions`] validates that every required column is present and projects
//! the table onto the canonical layout: identifiers, categoricals and the timestamp text as
//! `Utf8`, numeric fields as `Float64`, extra columns dropped.

use crate::exceptions::{CreditRiskError, CreditRiskResult};
use arrow::array::{ArrayRef, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use datafusion::dataframe::DataFrame;
use datafusion::prelude::SessionContext;
use datafusion_expr::{cast, ident, Expr};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const TRANSACTION_ID: &str = "TransactionId";
pub const BATCH_ID: &str = "BatchId";
pub const ACCOUNT_ID: &str = "AccountId";
pub const SUBSCRIPTION_ID: &str = "SubscriptionId";
pub const CUSTOMER_ID: &str = "CustomerId";
pub const CURRENCY_CODE: &str = "CurrencyCode";
pub const COUNTRY_CODE: &str = "CountryCode";
pub const PROVIDER_ID: &str = "ProviderId";
pub const PRODUCT_ID: &str = "ProductId";
pub const PRODUCT_CATEGORY: &str = "ProductCategory";
pub const CHANNEL_ID: &str = "ChannelId";
pub const AMOUNT: &str = "Amount";
pub const VALUE: &str = "Value";
pub const TRANSACTION_START_TIME: &str = "TransactionStartTime";
pub const PRICING_STRATEGY: &str = "PricingStrategy";

/// Name of the binary proxy label column.
pub const IS_HIGH_RISK: &str = "is_high_risk";

/// Categorical columns that are imputed and one-hot encoded.
pub const CATEGORICAL_COLUMNS: [&str; 5] = [
    CURRENCY_CODE,
    PROVIDER_ID,
    PRODUCT_ID,
    PRODUCT_CATEGORY,
    CHANNEL_ID,
];

/// Raw numeric columns carried into the feature table.
pub const RAW_NUMERIC_COLUMNS: [&str; 4] = [AMOUNT, VALUE, COUNTRY_CODE, PRICING_STRATEGY];

/// Storage class of a transaction column after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Numeric,
}

impl ColumnKind {
    fn data_type(self) -> DataType {
        match self {
            ColumnKind::Text => DataType::Utf8,
            ColumnKind::Numeric => DataType::Float64,
        }
    }
}

/// Every required transaction column, in canonical order.
pub const TRANSACTION_COLUMNS: [(&str, ColumnKind); 15] = [
    (TRANSACTION_ID, ColumnKind::Text),
    (BATCH_ID, ColumnKind::Text),
    (ACCOUNT_ID, ColumnKind::Text),
    (SUBSCRIPTION_ID, ColumnKind::Text),
    (CUSTOMER_ID, ColumnKind::Text),
    (CURRENCY_CODE, ColumnKind::Text),
    (COUNTRY_CODE, ColumnKind::Numeric),
    (PROVIDER_ID, ColumnKind::Text),
    (PRODUCT_ID, ColumnKind::Text),
    (PRODUCT_CATEGORY, ColumnKind::Text),
    (CHANNEL_ID, ColumnKind::Text),
    (AMOUNT, ColumnKind::Numeric),
    (VALUE, ColumnKind::Numeric),
    (TRANSACTION_START_TIME, ColumnKind::Text),
    (PRICING_STRATEGY, ColumnKind::Numeric),
];

/// The canonical Arrow schema of a normalized transaction table.
pub fn transaction_schema() -> SchemaRef {
    Arc::new(Schema::new(
        TRANSACTION_COLUMNS
            .iter()
            .map(|(name, kind)| Field::new(*name, kind.data_type(), true))
            .collect::<Vec<_>>(),
    ))
}

/// Returns true if the DataFrame has a column with the given (unqualified) name.
pub fn has_column(df: &DataFrame, name: &str) -> bool {
    df.schema().field_with_name(None, name).is_ok()
}

/// Validates that every column in `columns` exists in the DataFrame.
pub fn require_columns(df: &DataFrame, columns: &[&str]) -> CreditRiskResult<()> {
    for name in columns {
        if !has_column(df, name) {
            return Err(CreditRiskError::MissingColumn(format!(
                "Column '{}' not found in DataFrame",
                name
            )));
        }
    }
    Ok(())
}

/// Validates that every required transaction column is present.
pub fn validate_schema(df: &DataFrame) -> CreditRiskResult<()> {
    let required: Vec<&str> = TRANSACTION_COLUMNS.iter().map(|(name, _)| *name).collect();
    require_columns(df, &required)
}

/// Projects a raw transaction table onto the canonical schema.
pub fn normalize_transactions(df: DataFrame) -> CreditRiskResult<DataFrame> {
    validate_schema(&df)?;
    let exprs: Vec<Expr> = TRANSACTION_COLUMNS
        .iter()
        .map(|(name, kind)| cast(ident(*name), kind.data_type()).alias(*name))
        .collect();
    df.select(exprs).map_err(CreditRiskError::from)
}

/// Parses transaction timestamp text.
///
/// Accepts RFC 3339 (offsets are converted to UTC), `YYYY-MM-DD HH:MM:SS`,
/// `YYYY-MM-DDTHH:MM:SS` (both with optional fractional seconds) and bare dates.
/// Instants a nanosecond Arrow timestamp cannot hold (before 1677-09-21 or after
/// 2262-04-11) are rejected.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    parse_naive(raw.trim()).filter(|dt| dt.and_utc().timestamp_nanos_opt().is_some())
}

fn parse_naive(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
    ];
    for fmt in FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// A single raw transaction, as found in the dataset and in scoring requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Transaction {
    pub transaction_id: String,
    pub batch_id: String,
    pub account_id: String,
    pub subscription_id: String,
    pub customer_id: String,
    pub currency_code: String,
    pub country_code: i64,
    pub provider_id: String,
    pub product_id: String,
    pub product_category: String,
    pub channel_id: String,
    pub amount: f64,
    pub value: f64,
    pub transaction_start_time: String,
    pub pricing_strategy: i64,
    /// Present in historical data only; never used as a feature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fraud_result: Option<i64>,
}

impl Transaction {
    /// Strictly parses the transaction timestamp, naming the offending value on failure.
    pub fn parse_timestamp(&self) -> CreditRiskResult<NaiveDateTime> {
        parse_timestamp(&self.transaction_start_time).ok_or_else(|| {
            CreditRiskError::TimestampParse {
                column: TRANSACTION_START_TIME.to_string(),
                value: self.transaction_start_time.clone(),
            }
        })
    }
}

/// Builds a normalized single-batch table from transaction records.
///
/// Timestamps are validated strictly and rewritten in a canonical ISO form, so the
/// resulting table never carries unparseable timestamp text.
pub fn transactions_to_dataframe(
    ctx: &SessionContext,
    transactions: &[Transaction],
) -> CreditRiskResult<DataFrame> {
    let timestamps = transactions
        .iter()
        .map(|t| {
            t.parse_timestamp()
                .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
        })
        .collect::<CreditRiskResult<Vec<String>>>()?;

    fn text<'a>(
        transactions: &'a [Transaction],
        f: impl Fn(&'a Transaction) -> &'a str,
    ) -> ArrayRef {
        Arc::new(StringArray::from(
            transactions.iter().map(f).collect::<Vec<&str>>(),
        ))
    }
    fn numeric(transactions: &[Transaction], f: impl Fn(&Transaction) -> f64) -> ArrayRef {
        Arc::new(Float64Array::from(
            transactions.iter().map(f).collect::<Vec<f64>>(),
        ))
    }

    let columns: Vec<ArrayRef> = vec![
        text(transactions, |t| t.transaction_id.as_str()),
        text(transactions, |t| t.batch_id.as_str()),
        text(transactions, |t| t.account_id.as_str()),
        text(transactions, |t| t.subscription_id.as_str()),
        text(transactions, |t| t.customer_id.as_str()),
        text(transactions, |t| t.currency_code.as_str()),
        numeric(transactions, |t| t.country_code as f64),
        text(transactions, |t| t.provider_id.as_str()),
        text(transactions, |t| t.product_id.as_str()),
        text(transactions, |t| t.product_category.as_str()),
        text(transactions, |t| t.channel_id.as_str()),
        numeric(transactions, |t| t.amount),
        numeric(transactions, |t| t.value),
        Arc::new(StringArray::from(timestamps)),
        numeric(transactions, |t| t.pricing_strategy as f64),
    ];
    let batch = RecordBatch::try_new(transaction_schema(), columns)?;
    ctx.read_batch(batch).map_err(CreditRiskError::from)
}
