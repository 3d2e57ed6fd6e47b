//! ## Feature Pipeline Assembler
//!
//! [`FeaturePipeline::fit`] learns every parameter the feature table depends on and returns
//! them as an immutable [`FittedFeatures`] artifact. The stages run in a fixed order:
//!
//! 1. projection onto the canonical transaction schema,
//! 2. calendar features from `TransactionStartTime`,
//! 3. per-customer aggregates of `Amount`,
//! 4. IQR caps of `Amount` and `Value` into `Amount_capped` and `Value_capped`,
//! 5. `log1p` of the capped columns into `log_Amount` and `log_Value`,
//! 6. median (or mean) imputation of numeric features and mode imputation of categoricals,
//! 7. one-hot encoding of categoricals,
//! 8. standardization of numeric features.
//!
//! The artifact replays exactly these stages from its stored parameters (nothing is ever
//! refitted), then re-indexes the result onto the column order recorded at fit time, filling
//! columns it cannot produce with 0.0. The column order is serialized with the artifact, so
//! training tables and single serving rows always line up.

use crate::exceptions::{CreditRiskError, CreditRiskResult};
use crate::make_pipeline;
use crate::pipeline::Pipeline;
use crate::schema::{
    has_column, normalize_transactions, transactions_to_dataframe, Transaction, AMOUNT,
    CATEGORICAL_COLUMNS, CUSTOMER_ID, RAW_NUMERIC_COLUMNS, TRANSACTION_ID,
    TRANSACTION_START_TIME, VALUE,
};
use crate::settings::{FeatureSettings, TimestampPolicy};
use crate::transformers::aggregation::CustomerAggregates;
use crate::transformers::categorical_encoding::OneHotEncoder;
use crate::transformers::datetime_features::DatetimeFeatures;
use crate::transformers::imputation::{CategoricalImputer, MeanMedianImputer};
use crate::transformers::numerical_transformations::Log1pTransformer;
use crate::transformers::outlier_handling::IqrOutlierCapper;
use crate::transformers::scaling::{ScaleParams, StandardScaler};
use arrow::array::{Array, Float64Array};
use arrow::datatypes::DataType;
use datafusion::logical_expr::{cast, ident, lit, Expr};
use datafusion::prelude::*;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::info;

/// Identifier columns carried in front of the features.
pub const KEY_COLUMNS: [&str; 2] = [TRANSACTION_ID, CUSTOMER_ID];

const DATETIME_PREFIX: &str = "transaction";
const CAPPED_SUFFIX: &str = "_capped";

/// Columns capped for outliers before the log transform.
const CAPPED_COLUMNS: [&str; 2] = [AMOUNT, VALUE];

const DATETIME_STEP: &str = "datetime";
const AGGREGATES_STEP: &str = "aggregates";
const OUTLIERS_STEP: &str = "outliers";
const LOG_STEP: &str = "log1p";
const NUMERIC_IMPUTATION_STEP: &str = "numeric_imputation";
const CATEGORICAL_IMPUTATION_STEP: &str = "categorical_imputation";
const ONE_HOT_STEP: &str = "one_hot";
const SCALING_STEP: &str = "scaling";

/// A fitted stage of the feature pipeline.
fn fitted_step<'a, T: Any>(pipeline: &'a Pipeline, name: &str) -> CreditRiskResult<&'a T> {
    pipeline.step::<T>(name).ok_or_else(|| {
        CreditRiskError::InvalidParameter(format!("Feature pipeline has no step '{}'", name))
    })
}

fn capped_name(col_name: &str) -> String {
    format!("{}{}", col_name, CAPPED_SUFFIX)
}

/// `(capped input, log output)` column pairs.
fn log_pairs() -> Vec<(String, String)> {
    CAPPED_COLUMNS
        .iter()
        .map(|c| (capped_name(c), format!("log_{}", c)))
        .collect()
}

/// Every numeric feature, in output order.
pub fn numeric_feature_columns() -> Vec<String> {
    let datetime =
        DatetimeFeatures::new(TRANSACTION_START_TIME, DATETIME_PREFIX, Default::default());
    let aggregates = CustomerAggregates::new(CUSTOMER_ID, AMOUNT);
    RAW_NUMERIC_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .chain(CAPPED_COLUMNS.iter().map(|c| capped_name(c)))
        .chain(log_pairs().into_iter().map(|(_, out)| out))
        .chain(datetime.output_columns())
        .chain(aggregates.output_columns())
        .collect()
}

fn categorical_columns() -> Vec<String> {
    CATEGORICAL_COLUMNS.iter().map(|c| c.to_string()).collect()
}

/// One transformed row, aligned with the artifact's column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub columns: Vec<String>,
    pub values: Vec<f64>,
}

impl FeatureVector {
    /// Value of a named feature.
    pub fn get(&self, column: &str) -> Option<f64> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| self.values[i])
    }
}

/// Fits the feature pipeline.
pub struct FeaturePipeline {
    pub settings: FeatureSettings,
    pub verbose: bool,
}

impl FeaturePipeline {
    pub fn new(settings: FeatureSettings) -> Self {
        Self {
            settings,
            verbose: false,
        }
    }

    /// Log stage progress at `INFO` instead of `DEBUG`.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Learns every stage's parameters from a raw transaction table.
    pub async fn fit(&self, df: &DataFrame) -> CreditRiskResult<FittedFeatures> {
        let numeric = numeric_feature_columns();
        let categorical = categorical_columns();

        let df = normalize_transactions(df.clone())?;
        let capped: Vec<String> = CAPPED_COLUMNS.iter().map(|c| c.to_string()).collect();
        let mut pipeline = make_pipeline!(self.verbose,
            (DATETIME_STEP, DatetimeFeatures::new(
                TRANSACTION_START_TIME,
                DATETIME_PREFIX,
                self.settings.timestamp_policy,
            )),
            (AGGREGATES_STEP, CustomerAggregates::new(CUSTOMER_ID, AMOUNT)),
            (OUTLIERS_STEP, IqrOutlierCapper::new(capped, self.settings.iqr_factor)
                .with_suffix(CAPPED_SUFFIX)),
            (LOG_STEP, Log1pTransformer::new(log_pairs(), self.settings.log_policy)),
            (NUMERIC_IMPUTATION_STEP, MeanMedianImputer::new(
                numeric.clone(),
                self.settings.numeric_imputation,
            )),
            (CATEGORICAL_IMPUTATION_STEP, CategoricalImputer::new(categorical.clone())),
            (ONE_HOT_STEP, OneHotEncoder::new(categorical)),
            (SCALING_STEP, StandardScaler::new(numeric.clone())),
        );
        pipeline.fit(&df).await?;

        let encoder = fitted_step::<OneHotEncoder>(&pipeline, ONE_HOT_STEP)?;
        let mut columns = numeric;
        columns.extend(encoder.output_columns());
        let fitted = FittedFeatures {
            settings: self.settings.clone(),
            outlier_caps: fitted_step::<IqrOutlierCapper>(&pipeline, OUTLIERS_STEP)?
                .thresholds
                .clone(),
            numeric_fill: fitted_step::<MeanMedianImputer>(&pipeline, NUMERIC_IMPUTATION_STEP)?
                .impute_values
                .clone(),
            modes: fitted_step::<CategoricalImputer>(&pipeline, CATEGORICAL_IMPUTATION_STEP)?
                .mapping
                .clone(),
            categories: encoder.categories.clone(),
            scaling: fitted_step::<StandardScaler>(&pipeline, SCALING_STEP)?
                .params
                .clone(),
            columns,
        };
        info!(
            "Fitted feature pipeline: {} feature columns ({} one-hot)",
            fitted.columns.len(),
            fitted.columns.len() - numeric_feature_columns().len()
        );
        Ok(fitted)
    }

    /// Fits the pipeline and transforms the same table with the fitted parameters.
    pub async fn fit_transform(
        &self,
        df: &DataFrame,
    ) -> CreditRiskResult<(FittedFeatures, DataFrame)> {
        let fitted = self.fit(df).await?;
        let transformed = fitted.transform(df.clone())?;
        Ok((fitted, transformed))
    }
}

/// The immutable, serializable parameter set learned by [`FeaturePipeline::fit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedFeatures {
    pub settings: FeatureSettings,
    /// `(lower, upper)` IQR caps of `Amount` and `Value`.
    pub outlier_caps: BTreeMap<String, (f64, f64)>,
    /// Median (or mean) of every numeric feature, filled into missing values.
    pub numeric_fill: BTreeMap<String, f64>,
    pub modes: BTreeMap<String, String>,
    /// Sorted one-hot vocabulary per categorical column.
    pub categories: BTreeMap<String, Vec<String>>,
    pub scaling: BTreeMap<String, ScaleParams>,
    /// Feature column order of every table this artifact produces.
    pub columns: Vec<String>,
}

impl FittedFeatures {
    /// Number of feature columns.
    pub fn n_features(&self) -> usize {
        self.columns.len()
    }

    /// Rebuilds the transform-only pipeline from the stored parameters.
    pub fn pipeline(&self) -> Pipeline {
        self.replay_pipeline(self.settings.timestamp_policy)
    }

    fn replay_pipeline(&self, timestamp_policy: TimestampPolicy) -> Pipeline {
        make_pipeline!(false,
            (DATETIME_STEP, DatetimeFeatures::new(
                TRANSACTION_START_TIME,
                DATETIME_PREFIX,
                timestamp_policy,
            )),
            (AGGREGATES_STEP, CustomerAggregates::new(CUSTOMER_ID, AMOUNT)),
            (OUTLIERS_STEP, IqrOutlierCapper::from_thresholds(self.outlier_caps.clone())
                .with_suffix(CAPPED_SUFFIX)),
            (LOG_STEP, Log1pTransformer::new(log_pairs(), self.settings.log_policy)),
            (NUMERIC_IMPUTATION_STEP, MeanMedianImputer::from_values(
                self.settings.numeric_imputation,
                self.numeric_fill.clone(),
            )),
            (CATEGORICAL_IMPUTATION_STEP, CategoricalImputer::from_values(self.modes.clone())),
            (ONE_HOT_STEP, OneHotEncoder::from_categories(
                categorical_columns(),
                self.categories.clone(),
            )),
            (SCALING_STEP, StandardScaler::from_params(self.scaling.clone())),
        )
    }

    /// Transforms a raw transaction table into the feature table:
    /// `TransactionId`, `CustomerId`, then every feature column, rows sorted by `TransactionId`.
    pub fn transform(&self, df: DataFrame) -> CreditRiskResult<DataFrame> {
        self.transform_with(df, self.settings.timestamp_policy)
    }

    fn transform_with(
        &self,
        df: DataFrame,
        timestamp_policy: TimestampPolicy,
    ) -> CreditRiskResult<DataFrame> {
        let df = normalize_transactions(df)?;
        let df = self.replay_pipeline(timestamp_policy).transform(df)?;
        self.reindex(df)
    }

    /// Projects onto the recorded column order; absent feature columns become 0.0.
    fn reindex(&self, df: DataFrame) -> CreditRiskResult<DataFrame> {
        let mut exprs: Vec<Expr> = KEY_COLUMNS.iter().map(|k| ident(*k)).collect();
        for name in &self.columns {
            let expr = if has_column(&df, name) {
                cast(ident(name), DataType::Float64)
            } else {
                lit(0.0_f64)
            };
            exprs.push(expr.alias(name));
        }
        df.select(exprs)?
            .sort(vec![ident(TRANSACTION_ID).sort(true, true)])
            .map_err(CreditRiskError::from)
    }

    /// Transforms a single request record into a feature vector.
    ///
    /// The timestamp is parsed strictly: an unparseable or out-of-range value is rejected with
    /// [`CreditRiskError::TimestampParse`] instead of producing calendar features, and the
    /// replayed pipeline runs under [`TimestampPolicy::Reject`] whatever the training policy.
    pub async fn transform_transaction(
        &self,
        ctx: &SessionContext,
        transaction: &Transaction,
    ) -> CreditRiskResult<FeatureVector> {
        transaction.parse_timestamp()?;
        let df = transactions_to_dataframe(ctx, std::slice::from_ref(transaction))?;
        let batches = self
            .transform_with(df, TimestampPolicy::Reject)?
            .collect()
            .await?;
        let batch = batches.iter().find(|b| b.num_rows() > 0).ok_or_else(|| {
            CreditRiskError::InvalidParameter("Transform produced no rows".to_string())
        })?;

        let mut values = Vec::with_capacity(self.columns.len());
        for name in &self.columns {
            let index = batch.schema().index_of(name)?;
            let array = batch
                .column(index)
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| {
                    CreditRiskError::InvalidParameter(format!("Feature '{}' is not Float64", name))
                })?;
            if array.is_null(0) {
                return Err(CreditRiskError::InvalidParameter(format!(
                    "Feature '{}' is missing after imputation",
                    name
                )));
            }
            values.push(array.value(0));
        }
        Ok(FeatureVector {
            columns: self.columns.clone(),
            values,
        })
    }

    /// Writes the artifact as JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> CreditRiskResult<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// Reads an artifact written by [`FittedFeatures::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> CreditRiskResult<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}
