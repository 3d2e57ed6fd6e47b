//! ## Dataset I/O
//!
//! Loading raw transaction tables and writing the tables the pipeline produces.
//! The format is chosen from the file extension: `.csv` or `.parquet`.

use crate::exceptions::{CreditRiskError, CreditRiskResult};
use crate::rfm::attach_labels;
use crate::schema::{normalize_transactions, TRANSACTION_ID};
use arrow::csv::WriterBuilder;
use datafusion::logical_expr::ident;
use datafusion::prelude::*;
use parquet::arrow::ArrowWriter;
use std::fs::File;
use std::path::Path;
use tracing::info;

/// Supported table formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    Csv,
    Parquet,
}

impl TableFormat {
    /// Detects the format from the file extension.
    pub fn from_path(path: &Path) -> CreditRiskResult<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("csv") => Ok(TableFormat::Csv),
            Some("parquet") => Ok(TableFormat::Parquet),
            _ => Err(CreditRiskError::UnsupportedFormat(format!(
                "'{}': please provide a CSV or Parquet file",
                path.display()
            ))),
        }
    }
}

fn path_str(path: &Path) -> CreditRiskResult<&str> {
    path.to_str().ok_or_else(|| {
        CreditRiskError::InvalidParameter(format!("Path '{}' is not valid UTF-8", path.display()))
    })
}

/// Loads a raw transaction table and projects it onto the canonical schema.
pub async fn load_transactions<P: AsRef<Path>>(
    ctx: &SessionContext,
    path: P,
) -> CreditRiskResult<DataFrame> {
    let path = path.as_ref();
    let df = match TableFormat::from_path(path)? {
        TableFormat::Csv => {
            ctx.read_csv(path_str(path)?, CsvReadOptions::new().has_header(true))
                .await?
        }
        TableFormat::Parquet => {
            ctx.read_parquet(path_str(path)?, ParquetReadOptions::default())
                .await?
        }
    };
    normalize_transactions(df)
}

/// Executes a DataFrame and writes it to a single file. Returns the number of rows written.
pub async fn write_table<P: AsRef<Path>>(df: DataFrame, path: P) -> CreditRiskResult<usize> {
    let path = path.as_ref();
    let format = TableFormat::from_path(path)?;
    let schema = df.schema().inner().clone();
    let batches = df.collect().await?;
    let file = File::create(path)?;

    match format {
        TableFormat::Csv => {
            let mut writer = WriterBuilder::new().with_header(true).build(file);
            for batch in &batches {
                writer.write(batch)?;
            }
        }
        TableFormat::Parquet => {
            let mut writer = ArrowWriter::try_new(file, schema, None)?;
            for batch in &batches {
                writer.write(batch)?;
            }
            writer.close()?;
        }
    }
    let rows = batches.iter().map(|b| b.num_rows()).sum();
    info!("Wrote {} rows to {}", rows, path.display());
    Ok(rows)
}

/// Joins proxy labels onto the feature table, giving the model-ready training table:
/// keys, features, then `is_high_risk`, rows sorted by `TransactionId`.
pub fn build_training_table(features: DataFrame, labels: DataFrame) -> CreditRiskResult<DataFrame> {
    attach_labels(features, labels)?
        .sort(vec![ident(TRANSACTION_ID).sort(true, true)])
        .map_err(CreditRiskError::from)
}
