//! ## RFM proxy-label engine
//!
//! No ground-truth default label exists, so one is manufactured from behaviour: customers who
//! have not transacted for a long time, transact rarely and move little money are treated as
//! the high-risk group.
//!
//! 1. [`compute_rfm`] reduces the transaction table to one [`RfmProfile`] per customer:
//!    Recency (whole days from the latest transaction to the snapshot date), Frequency
//!    (transaction count) and Monetary (sum of amounts).
//! 2. [`RfmEngine::label_profiles`] standardizes the three metrics, clusters the customers
//!    with k-means, profiles each cluster on the unscaled metrics and ranks the clusters by
//!    mean Recency (descending), then mean Frequency (ascending), then mean Monetary
//!    (ascending). Customers of the top-ranked cluster are labelled 1, everyone else 0.
//!
//! Cluster ids carry no meaning between runs; the high-risk cluster is always re-derived
//! from the ranking.

use crate::clustering::KMeans;
use crate::exceptions::{CreditRiskError, CreditRiskResult};
use crate::schema::{
    require_columns, AMOUNT, CUSTOMER_ID, IS_HIGH_RISK, TRANSACTION_ID, TRANSACTION_START_TIME,
};
use crate::settings::RfmSettings;
use crate::transformers::imputation::coalesce_expr_for;
use crate::transformers::scaling::standardize;
use arrow::array::{Array, ArrayRef, Float64Array, Int32Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use datafusion::common::JoinType;
use datafusion::functions_aggregate::expr_fn::{count, max, sum};
use datafusion::logical_expr::{cast, ident, lit, try_cast, Expr};
use datafusion::prelude::*;
use datafusion_functions::datetime::to_unixtime;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

const SECONDS_PER_DAY: i64 = 86_400;
const LABEL_KEY: &str = "__label_customer";

/// Recency, frequency and monetary value of one customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfmProfile {
    pub customer_id: String,
    /// Whole days between the customer's latest transaction and the snapshot date.
    pub recency: i64,
    pub frequency: i64,
    pub monetary: f64,
}

/// Size and mean (unscaled) metrics of one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterProfile {
    pub cluster: usize,
    pub size: usize,
    pub recency: f64,
    pub frequency: f64,
    pub monetary: f64,
}

/// Proxy label of one customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskLabel {
    pub customer_id: String,
    pub cluster: usize,
    pub is_high_risk: i32,
}

/// Everything a labeling run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfmOutcome {
    pub profiles: Vec<RfmProfile>,
    /// Non-empty clusters, highest risk first.
    pub clusters: Vec<ClusterProfile>,
    pub high_risk_cluster: usize,
    /// One label per profile, in profile order.
    pub labels: Vec<RiskLabel>,
}

impl RfmOutcome {
    /// Number of customers labelled high-risk.
    pub fn high_risk_count(&self) -> usize {
        self.labels.iter().filter(|l| l.is_high_risk == 1).count()
    }
}

fn downcast<'a, T: 'static>(
    batch: &'a RecordBatch,
    i: usize,
    what: &str,
) -> CreditRiskResult<&'a T> {
    batch.column(i).as_any().downcast_ref::<T>().ok_or_else(|| {
        CreditRiskError::InvalidParameter(format!("Unexpected array type for {}", what))
    })
}

fn format_unix(secs: i64) -> String {
    DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| secs.to_string())
}

/// Computes one RFM profile per customer, sorted by customer id.
///
/// Transactions whose timestamp does not parse still count towards Frequency and Monetary;
/// a customer with no parseable timestamp at all is left out (and logged). Fails with
/// [`CreditRiskError::SnapshotBeforeData`] when any transaction is later than `snapshot`.
pub async fn compute_rfm(
    df: &DataFrame,
    snapshot: DateTime<Utc>,
) -> CreditRiskResult<Vec<RfmProfile>> {
    require_columns(df, &[CUSTOMER_ID, TRANSACTION_ID, AMOUNT, TRANSACTION_START_TIME])?;

    let seconds = to_unixtime().call(vec![try_cast(
        ident(TRANSACTION_START_TIME),
        DataType::Timestamp(TimeUnit::Nanosecond, None),
    )]);
    let batches = df
        .clone()
        .aggregate(
            vec![cast(ident(CUSTOMER_ID), DataType::Utf8).alias("customer")],
            vec![
                max(cast(seconds, DataType::Int64)).alias("last_seen"),
                count(ident(TRANSACTION_ID)).alias("frequency"),
                sum(cast(ident(AMOUNT), DataType::Float64)).alias("monetary"),
            ],
        )?
        .collect()
        .await?;

    let snapshot_secs = snapshot.timestamp();
    let mut profiles = Vec::new();
    let mut latest: Option<i64> = None;
    let mut excluded = 0usize;
    for batch in &batches {
        let customers = downcast::<StringArray>(batch, 0, "customer id")?;
        let last_seen = downcast::<Int64Array>(batch, 1, "last transaction")?;
        let frequency = downcast::<Int64Array>(batch, 2, "frequency")?;
        let monetary = downcast::<Float64Array>(batch, 3, "monetary")?;
        for i in 0..batch.num_rows() {
            if customers.is_null(i) {
                warn!("Skipping {} transactions without a customer id", frequency.value(i));
                continue;
            }
            if last_seen.is_null(i) {
                excluded += 1;
                continue;
            }
            let last = last_seen.value(i);
            latest = Some(latest.map_or(last, |l| l.max(last)));
            profiles.push(RfmProfile {
                customer_id: customers.value(i).to_string(),
                recency: (snapshot_secs - last).div_euclid(SECONDS_PER_DAY),
                frequency: frequency.value(i),
                monetary: if monetary.is_null(i) { 0.0 } else { monetary.value(i) },
            });
        }
    }
    if excluded > 0 {
        warn!(
            "Excluded {} customers with no parseable {}; they default to label 0",
            excluded, TRANSACTION_START_TIME
        );
    }
    if let Some(latest) = latest.filter(|l| *l > snapshot_secs) {
        return Err(CreditRiskError::SnapshotBeforeData {
            snapshot: snapshot.to_rfc3339(),
            latest: format_unix(latest),
        });
    }
    profiles.sort_by(|a, b| a.customer_id.cmp(&b.customer_id));
    Ok(profiles)
}

/// Orders clusters from highest to lowest risk: mean Recency descending, then mean
/// Frequency ascending, then mean Monetary ascending. Remaining ties keep the lower id first.
pub fn rank_clusters(clusters: &mut [ClusterProfile]) {
    clusters.sort_by(|a, b| {
        b.recency
            .total_cmp(&a.recency)
            .then_with(|| a.frequency.total_cmp(&b.frequency))
            .then_with(|| a.monetary.total_cmp(&b.monetary))
            .then_with(|| a.cluster.cmp(&b.cluster))
    });
}

/// Mean unscaled metrics of every non-empty cluster.
fn profile_clusters(
    profiles: &[RfmProfile],
    labels: &[usize],
    n_clusters: usize,
) -> Vec<ClusterProfile> {
    let mut acc = vec![(0usize, 0.0, 0.0, 0.0); n_clusters];
    for (p, &label) in profiles.iter().zip(labels) {
        let entry = &mut acc[label];
        entry.0 += 1;
        entry.1 += p.recency as f64;
        entry.2 += p.frequency as f64;
        entry.3 += p.monetary;
    }
    acc.into_iter()
        .enumerate()
        .filter(|(_, (size, ..))| *size > 0)
        .map(|(cluster, (size, r, f, m))| {
            let n = size as f64;
            ClusterProfile {
                cluster,
                size,
                recency: r / n,
                frequency: f / n,
                monetary: m / n,
            }
        })
        .collect()
}

/// Derives proxy risk labels from transaction history.
pub struct RfmEngine {
    pub settings: RfmSettings,
}

impl RfmEngine {
    pub fn new(settings: RfmSettings) -> Self {
        Self { settings }
    }

    /// Clusters the given profiles and labels the members of the highest-risk cluster.
    pub fn label_profiles(&self, profiles: &[RfmProfile]) -> CreditRiskResult<RfmOutcome> {
        let k = self.settings.n_clusters;
        if profiles.len() < k {
            return Err(CreditRiskError::InsufficientCustomers {
                customers: profiles.len(),
                clusters: k,
            });
        }

        let recency: Vec<f64> = profiles.iter().map(|p| p.recency as f64).collect();
        let frequency: Vec<f64> = profiles.iter().map(|p| p.frequency as f64).collect();
        let monetary: Vec<f64> = profiles.iter().map(|p| p.monetary).collect();
        let (r, f, m) = (standardize(&recency), standardize(&frequency), standardize(&monetary));
        let points: Vec<Vec<f64>> = (0..profiles.len()).map(|i| vec![r[i], f[i], m[i]]).collect();

        let fit = KMeans::from_settings(&self.settings).fit(&points)?;
        let mut clusters = profile_clusters(profiles, &fit.labels, k);
        rank_clusters(&mut clusters);
        let high_risk_cluster = clusters.first().map(|c| c.cluster).ok_or_else(|| {
            CreditRiskError::InvalidParameter("Clustering produced no clusters".to_string())
        })?;

        for c in &clusters {
            info!(
                "cluster {}: {} customers, recency {:.2}, frequency {:.2}, monetary {:.2}",
                c.cluster, c.size, c.recency, c.frequency, c.monetary
            );
        }
        info!("High-risk cluster: {}", high_risk_cluster);

        let labels = profiles
            .iter()
            .zip(&fit.labels)
            .map(|(p, &cluster)| RiskLabel {
                customer_id: p.customer_id.clone(),
                cluster,
                is_high_risk: i32::from(cluster == high_risk_cluster),
            })
            .collect();
        Ok(RfmOutcome {
            profiles: profiles.to_vec(),
            clusters,
            high_risk_cluster,
            labels,
        })
    }

    /// Computes RFM profiles from a transaction table and labels them.
    pub async fn run(&self, df: &DataFrame) -> CreditRiskResult<RfmOutcome> {
        let profiles = compute_rfm(df, self.settings.snapshot_date).await?;
        self.label_profiles(&profiles)
    }
}

/// Builds the two-column label table (`CustomerId`, `is_high_risk`).
pub fn labels_to_dataframe(
    ctx: &SessionContext,
    labels: &[RiskLabel],
) -> CreditRiskResult<DataFrame> {
    let schema = Arc::new(Schema::new(vec![
        Field::new(CUSTOMER_ID, DataType::Utf8, false),
        Field::new(IS_HIGH_RISK, DataType::Int32, false),
    ]));
    let ids: ArrayRef = Arc::new(StringArray::from(
        labels.iter().map(|l| l.customer_id.as_str()).collect::<Vec<_>>(),
    ));
    let flags: ArrayRef = Arc::new(Int32Array::from(
        labels.iter().map(|l| l.is_high_risk).collect::<Vec<_>>(),
    ));
    let batch = RecordBatch::try_new(schema, vec![ids, flags])?;
    ctx.read_batch(batch).map_err(CreditRiskError::from)
}

/// Left-joins labels onto a table keyed by `CustomerId`; customers without a label get 0.
pub fn attach_labels(df: DataFrame, labels: DataFrame) -> CreditRiskResult<DataFrame> {
    require_columns(&df, &[CUSTOMER_ID])?;
    require_columns(&labels, &[CUSTOMER_ID, IS_HIGH_RISK])?;

    let keep: Vec<String> = df
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .filter(|name| name != IS_HIGH_RISK)
        .collect();
    let left = df.select(keep.iter().map(|n| ident(n.as_str())).collect())?;
    let right = labels.select(vec![
        cast(ident(CUSTOMER_ID), DataType::Utf8).alias(LABEL_KEY),
        ident(IS_HIGH_RISK).alias("__label"),
    ])?;

    let mut exprs: Vec<Expr> = keep.iter().map(|n| ident(n.as_str())).collect();
    let label = coalesce_expr_for("__label", lit(0_i32));
    exprs.push(cast(label, DataType::Int32).alias(IS_HIGH_RISK));
    left.join_on(right, JoinType::Left, [ident(CUSTOMER_ID).eq(ident(LABEL_KEY))])?
        .select(exprs)
        .map_err(CreditRiskError::from)
}
