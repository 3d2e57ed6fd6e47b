//! ## Custom Errors for the Credit Risk Factory
//!
//! This module defines the error type shared by every stage of the library.
//! It uses the `thiserror` crate to derive the `Error` trait.
//! The `CreditRiskError` enum covers wrapped library errors (DataFusion, Arrow, Parquet, I/O,
//! JSON) and the domain failures of the pipeline:
//!
//! - schema errors (a required column is absent),
//! - timestamp parse errors (raised for single requests at serving time),
//! - configuration errors (snapshot date before the data, fewer customers than clusters).
//!
//! The `CreditRiskResult` type alias simplifies error handling by providing a convenient
//! alias for results returned by the library.
//!
//! ### Example
//!
//! ```rust
//! use credit_risk_factory::exceptions::{CreditRiskError, CreditRiskResult};
//!
//! fn check_clusters(customers: usize, clusters: usize) -> CreditRiskResult<()> {
//!     if customers < clusters {
//!         return Err(CreditRiskError::InsufficientCustomers { customers, clusters });
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Errors specific to the Credit Risk Factory library.
#[derive(Debug, Error)]
pub enum CreditRiskError {
    /// Wraps underlying I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Wraps errors from DataFusion.
    #[error("DataFusion error: {0}")]
    DataFusionError(#[from] datafusion::error::DataFusionError),

    /// Wraps errors from Arrow.
    #[error("Arrow error: {0}")]
    ArrowError(#[from] arrow::error::ArrowError),

    /// Wraps errors from Parquet.
    #[error("Parquet error: {0}")]
    ParquetError(#[from] parquet::errors::ParquetError),

    /// Wraps JSON (de)serialization errors for artifacts, settings and requests.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Indicates that an invalid parameter was provided (e.g., unsupported value or incorrect data type).
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Indicates that the provided data format is unsupported (e.g., unknown file format).
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Indicates that the specified column does not exist in the DataFrame.
    #[error("Missing column: {0}")]
    MissingColumn(String),

    /// A timestamp value could not be parsed into a date-time.
    #[error("Invalid or missing {column}: could not parse '{value}' as a date-time; provide an ISO 8601 string such as '2023-01-01T12:00:00Z'")]
    TimestampParse { column: String, value: String },

    /// The RFM snapshot date is earlier than the most recent transaction.
    #[error("Snapshot date {snapshot} is earlier than the latest transaction at {latest}")]
    SnapshotBeforeData { snapshot: String, latest: String },

    /// Clustering was requested with fewer distinct customers than clusters.
    #[error("Cannot form {clusters} clusters from {customers} distinct customers")]
    InsufficientCustomers { customers: usize, clusters: usize },

    /// A feature vector does not have the width a model expects.
    #[error("Feature mismatch: expected {expected} features, found {found}")]
    FeatureMismatch { expected: usize, found: usize },

    /// Indicates the transform method was called before calling fit for a stateful transformer.
    #[error("Transform called before fit for stateful transformer")]
    FitNotCalled,
}

/// A convenient result type for Credit Risk Factory operations.
pub type CreditRiskResult<T> = std::result::Result<T, CreditRiskError>;
