//! Command-line entry point.
//!
//! - `prepare`: fits the feature pipeline and the proxy labels on a transaction table and
//!   writes the feature table, the label table, the model-ready training table and the
//!   fitted feature artifact.
//! - `score`: scores one JSON transaction with a feature artifact and a logistic model.
//!
//! Set `DEBUG_CREDIT_RISK=true` to see stage timings and the cluster profiles.

use clap::{Parser, Subcommand};
use credit_risk_factory::dataset::{build_training_table, load_transactions, write_table};
use credit_risk_factory::features::{FeaturePipeline, FittedFeatures};
use credit_risk_factory::rfm::{labels_to_dataframe, RfmEngine};
use credit_risk_factory::serving::{LogisticRegressionModel, RiskScorer};
use credit_risk_factory::settings::PipelineSettings;
use datafusion::prelude::SessionContext;
use std::error::Error;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "credit-risk")]
#[command(about = "RFM proxy labels and feature engineering for credit-risk scoring", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON settings file (defaults are used when omitted)
    #[arg(short, long)]
    settings: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the feature table, proxy labels and training table
    Prepare {
        /// Raw transactions (.csv or .parquet)
        #[arg(short, long)]
        input: PathBuf,

        /// Output directory
        #[arg(short, long, default_value = "data/processed")]
        output_dir: PathBuf,

        /// Output table format
        #[arg(long, default_value = "csv")]
        format: String,
    },

    /// Score a single JSON transaction
    Score {
        /// Fitted feature artifact written by `prepare`
        #[arg(long)]
        features: PathBuf,

        /// Logistic regression model (JSON)
        #[arg(long)]
        model: PathBuf,

        /// Request body file
        #[arg(long)]
        request: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let settings = match &cli.settings {
        Some(path) => PipelineSettings::from_json_file(path)?,
        None => PipelineSettings::default(),
    }
    .with_env_overrides()?;

    match cli.command {
        Commands::Prepare {
            input,
            output_dir,
            format,
        } => {
            let ctx = SessionContext::new();
            let transactions = load_transactions(&ctx, &input).await?.cache().await?;

            let pipeline = FeaturePipeline::new(settings.features.clone()).with_verbose(true);
            let (fitted, features) = pipeline.fit_transform(&transactions).await?;
            let features = features.cache().await?;

            let outcome = RfmEngine::new(settings.rfm.clone())
                .run(&transactions)
                .await?;
            let labels = labels_to_dataframe(&ctx, &outcome.labels)?;

            std::fs::create_dir_all(&output_dir)?;
            let out = |name: &str| output_dir.join(format!("{}.{}", name, format));
            write_table(features.clone(), out("features")).await?;
            write_table(labels.clone(), out("labels")).await?;
            write_table(build_training_table(features, labels)?, out("model_ready_with_target"))
                .await?;
            fitted.save(output_dir.join("feature_artifact.json"))?;
            std::fs::write(
                output_dir.join("rfm_clusters.json"),
                serde_json::to_string_pretty(&outcome.clusters)?,
            )?;

            println!(
                "{} customers labelled, {} high-risk (cluster {}); {} feature columns",
                outcome.labels.len(),
                outcome.high_risk_count(),
                outcome.high_risk_cluster,
                fitted.n_features()
            );
        }
        Commands::Score {
            features,
            model,
            request,
        } => {
            let fitted = FittedFeatures::load(features)?;
            let model = LogisticRegressionModel::from_json_file(model)?;
            let scorer = RiskScorer::new(fitted, model)?;
            let body = std::fs::read_to_string(request)?;
            let response = scorer.score_json(&body).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }
    Ok(())
}
