//! ## Transformer Pipeline
//!
//! This module provides core abstractions for building, fitting, and transforming data using
//! composable pipelines of transformers.
//!
//! ### Overview
//!
//! - The [`Transformer`] trait defines a common interface for implementing data transformation steps,
//!   supporting both stateful (requiring fitting) and stateless transformations.
//! - The [`Pipeline`] struct enables chaining multiple transformers into a cohesive data transformation pipeline,
//!   supporting both fitting and transforming operations.
//! - Macros [`crate::impl_transformer`] and [`crate::make_pipeline`] simplify the creation and implementation
//!   of transformers and pipelines.
//!
//! Fitted parameters are read back from a pipeline with [`Pipeline::step`]. Stateful
//! transformers in this crate can also be built directly from previously fitted parameters;
//! a pipeline assembled that way only ever calls `transform`, which is how the fitted feature
//! artifact replays training-time preprocessing on new data.

use crate::exceptions::{CreditRiskError, CreditRiskResult};
use async_trait::async_trait;
use datafusion::prelude::*;
use std::any::Any;
use std::time::Instant;
use tracing::{debug, info};

/// Trait for components used in the data transformation pipeline.
///
/// Every transformer must provide a `fit` method (which may collect data to compute parameters)
/// and a `transform` method (which updates the DataFrame’s logical plan without triggering execution).
#[async_trait]
pub trait Transformer {
    /// Fit the transformer given a DataFrame.
    ///
    /// # Arguments
    ///
    /// * `df` - The input DataFrame.
    ///
    /// # Returns
    ///
    /// * `CreditRiskResult<()>` - Returns Ok if successful, or an error otherwise.
    async fn fit(&mut self, df: &DataFrame) -> CreditRiskResult<()>;

    /// Transform the input DataFrame, returning a new DataFrame with the transformation applied.
    ///
    /// # Arguments
    ///
    /// * `df` - The input DataFrame.
    ///
    /// # Returns
    ///
    /// * `CreditRiskResult<DataFrame>` - The transformed DataFrame or an error if transformation fails.
    fn transform(&self, df: DataFrame) -> CreditRiskResult<DataFrame>;

    /// Returns true if the transformer is stateful (i.e. requires a call to fit before transform can be called).
    fn is_stateful(&self) -> bool;

    /// The concrete transformer, for reading fitted parameters back out of a pipeline.
    fn as_any(&self) -> &dyn Any;
}

/// Macro to implement the [`Transformer`] trait for transformers in this crate.
///
/// The type must already have inherent methods:
/// - `async fn fit(&mut self, &DataFrame) -> CreditRiskResult<()>`
/// - `fn transform(&self, DataFrame) -> CreditRiskResult<DataFrame>`
/// - **`fn inherent_is_stateful(&self) -> bool`**
///
/// # Example
///
/// ```rust,no_run
/// use credit_risk_factory::exceptions::CreditRiskResult;
/// use datafusion::prelude::DataFrame;
/// use credit_risk_factory::impl_transformer;
///
/// pub struct MyTransformer { /* ... */ }
///
/// impl MyTransformer {
///     pub async fn fit(&mut self, df: &DataFrame) -> CreditRiskResult<()> {
///         Ok(())
///     }
///
///     pub fn transform(&self, df: DataFrame) -> CreditRiskResult<DataFrame> {
///         Ok(df)
///     }
///
///     // Note the different name for the inherent method.
///     pub fn inherent_is_stateful(&self) -> bool {
///         false
///     }
/// }
///
/// impl_transformer!(MyTransformer);
/// ```
#[macro_export]
macro_rules! impl_transformer {
    ($ty:ty) => {
        #[async_trait::async_trait]
        impl $crate::pipeline::Transformer for $ty {
            async fn fit(
                &mut self,
                df: &datafusion::prelude::DataFrame,
            ) -> $crate::exceptions::CreditRiskResult<()> {
                <$ty>::fit(self, df).await
            }
            fn transform(
                &self,
                df: datafusion::prelude::DataFrame,
            ) -> $crate::exceptions::CreditRiskResult<datafusion::prelude::DataFrame> {
                <$ty>::transform(self, df)
            }
            fn is_stateful(&self) -> bool {
                <$ty>::inherent_is_stateful(self)
            }
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
        }
    };
}

/// A pipeline that chains a sequence of transformers.
///
/// Each transformer’s output (a new logical plan) is passed as input to the next transformer.
/// This design allows lazy chaining of transformations until a terminal action (like `collect`) is called.
pub struct Pipeline {
    steps: Vec<(String, Box<dyn Transformer + Send + Sync>)>,
    verbose: bool,
}

impl Pipeline {
    /// Creates a new pipeline.
    ///
    /// # Arguments
    ///
    /// * `steps` - A vector of (name, transformer) pairs (each transformer is already boxed).
    /// * `verbose` - If true, step progress and timings are logged at `INFO` instead of `DEBUG`.
    pub fn new(steps: Vec<(String, Box<dyn Transformer + Send + Sync>)>, verbose: bool) -> Self {
        Self { steps, verbose }
    }

    /// Names of the steps, in execution order.
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// The transformer registered under `name`, if it has type `T`.
    pub fn step<T: Any>(&self, name: &str) -> Option<&T> {
        self.steps
            .iter()
            .find(|(step_name, _)| step_name == name)
            .and_then(|(_, step)| step.as_any().downcast_ref::<T>())
    }

    fn log(&self, message: std::fmt::Arguments<'_>) {
        if self.verbose {
            info!("{}", message);
        } else {
            debug!("{}", message);
        }
    }

    /// Fits each transformer (sequentially) and updates the logical plan.
    pub async fn fit(&mut self, df: &DataFrame) -> CreditRiskResult<DataFrame> {
        if self.steps.is_empty() {
            return Err(CreditRiskError::InvalidParameter(
                "Pipeline must have at least one transformer.".to_string(),
            ));
        }
        let verbose = self.verbose;
        let mut current_df = df.clone();
        for (name, step) in self.steps.iter_mut() {
            let start = Instant::now();
            step.fit(&current_df).await.map_err(|e| wrap_step_error("fitting", name, e))?;
            current_df = step
                .transform(current_df)
                .map_err(|e| wrap_step_error("transforming in", name, e))?;
            if verbose {
                info!("Step '{}' fitted in {:?}", name, start.elapsed());
            } else {
                debug!("Step '{}' fitted in {:?}", name, start.elapsed());
            }
        }
        Ok(current_df)
    }

    /// Applies the `transform` method of each transformer (without fitting).
    pub fn transform(&self, df: DataFrame) -> CreditRiskResult<DataFrame> {
        if self.steps.is_empty() {
            return Err(CreditRiskError::InvalidParameter(
                "Pipeline must have at least one transformer.".to_string(),
            ));
        }
        let mut current_df = df;
        for (name, step) in self.steps.iter() {
            self.log(format_args!("Applying transformer: {}", name));
            current_df = step
                .transform(current_df)
                .map_err(|e| wrap_step_error("in", name, e))?;
        }
        Ok(current_df)
    }
}

/// Adds the failing step's name to an error.
///
/// Schema and timestamp errors keep their variant so callers can still match on them;
/// everything else is reported as an invalid pipeline step.
fn wrap_step_error(action: &str, name: &str, err: CreditRiskError) -> CreditRiskError {
    match err {
        CreditRiskError::MissingColumn(msg) => {
            CreditRiskError::MissingColumn(format!("{} (step '{}')", msg, name))
        }
        e @ (CreditRiskError::TimestampParse { .. }
        | CreditRiskError::FitNotCalled
        | CreditRiskError::InsufficientCustomers { .. }) => e,
        e => CreditRiskError::InvalidParameter(format!(
            "Error {} transformer '{}': {}",
            action, name, e
        )),
    }
}

/// Macro to simplify pipeline creation by automatically boxing transformers.
///
/// # Example
///
/// ```rust,no_run
/// use credit_risk_factory::make_pipeline;
/// use credit_risk_factory::transformers::aggregation::CustomerAggregates;
///
/// // Create a pipeline with a single step.
/// let pipeline = make_pipeline!(false,
///     ("aggregates", CustomerAggregates::new("CustomerId", "Amount")),
/// );
/// ```
#[macro_export]
macro_rules! make_pipeline {
    ($verbose:expr, $(($name:expr, $transformer:expr)),+ $(,)?) => {
        {
            let steps: Vec<(String, Box<dyn $crate::pipeline::Transformer + Send + Sync>)> = vec![
                $(
                    ($name.to_string(), Box::new($transformer)),
                )+
            ];
            $crate::pipeline::Pipeline::new(steps, $verbose)
        }
    };
}
