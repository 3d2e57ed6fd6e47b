//! # Transformer Implementations
//!
//! The submodules contain the transformers that make up the feature pipeline.

pub mod aggregation;
pub mod categorical_encoding;
pub mod datetime_features;
pub mod imputation;
pub mod numerical_transformations;
pub mod outlier_handling;
pub mod scaling;
