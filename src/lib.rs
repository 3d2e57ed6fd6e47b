//! # Credit Risk Factory
//!
//! Proxy-label derivation and feature engineering for credit-risk scoring, built on
//! Apache DataFusion.
//!
//! - [`rfm`]: recency/frequency/monetary profiles, k-means clustering ([`clustering`]) and the
//!   ranking that turns the least engaged cluster into a binary `is_high_risk` label.
//! - [`features`]: the fitted feature pipeline (calendar features, customer aggregates,
//!   outlier caps, `log1p`, imputation, one-hot encoding, scaling) and its serializable
//!   parameter artifact.
//! - [`serving`]: scoring a single JSON transaction with the same fitted parameters.
//! - [`dataset`]: CSV/Parquet loading and writing.
//!
//! Individual stages live in [`transformers`] and compose through [`pipeline::Pipeline`].

pub mod clustering;
pub mod dataset;
pub mod exceptions;
pub mod features;
mod logging;
pub mod pipeline;
pub mod rfm;
pub mod schema;
pub mod serving;
pub mod settings;
pub mod transformers;
