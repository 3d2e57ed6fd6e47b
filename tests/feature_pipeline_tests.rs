use approx::assert_abs_diff_eq;
use arrow::array::{Array, ArrayRef, Float64Array, StringArray};
use arrow::record_batch::RecordBatch;
use credit_risk_factory::exceptions::{CreditRiskError, CreditRiskResult};
use credit_risk_factory::features::{numeric_feature_columns, FeaturePipeline, FittedFeatures};
use credit_risk_factory::schema::{
    transaction_schema, transactions_to_dataframe, Transaction, TRANSACTION_COLUMNS,
};
use credit_risk_factory::settings::{FeatureSettings, TimestampPolicy};
use credit_risk_factory::transformers::imputation::ImputeStrategy;
use datafusion::prelude::*;
use std::sync::Arc;

fn transaction(
    id: &str,
    customer: &str,
    amount: f64,
    channel: &str,
    category: &str,
    timestamp: &str,
) -> Transaction {
    Transaction {
        transaction_id: id.to_string(),
        batch_id: format!("BatchId_{}", id),
        account_id: format!("AccountId_{}", customer),
        subscription_id: "SubscriptionId_1".to_string(),
        customer_id: customer.to_string(),
        currency_code: "UGX".to_string(),
        country_code: 256,
        provider_id: if amount < 0.0 { "ProviderId_4" } else { "ProviderId_6" }.to_string(),
        product_id: format!("ProductId_{}", category.len()),
        product_category: category.to_string(),
        channel_id: channel.to_string(),
        amount,
        value: amount.abs(),
        transaction_start_time: timestamp.to_string(),
        pricing_strategy: 2,
        fraud_result: Some(0),
    }
}

/// A small history: three customers, a refund, and one very large purchase.
fn training_transactions() -> Vec<Transaction> {
    vec![
        transaction("T01", "C1", 1000.0, "ChannelId_3", "airtime", "2025-06-01T08:15:00Z"),
        transaction("T02", "C1", -50.0, "ChannelId_2", "financial_services", "2025-06-02T09:30:00Z"),
        transaction("T03", "C1", 500.0, "ChannelId_3", "airtime", "2025-06-03T18:45:00Z"),
        transaction("T04", "C2", 20000.0, "ChannelId_3", "utility_bill", "2025-05-20T12:00:00Z"),
        transaction("T05", "C2", 2500.0, "ChannelId_3", "airtime", "2025-05-21T13:10:00Z"),
        transaction("T06", "C3", 750000.0, "ChannelId_1", "financial_services", "2025-04-11 07:05:00"),
        transaction("T07", "C3", 1500.0, "ChannelId_3", "airtime", "2025-04-12T22:00:00Z"),
        transaction("T08", "C3", 3000.0, "ChannelId_2", "tv", "2025-04-13T06:30:00Z"),
    ]
}

fn training_df(ctx: &SessionContext) -> DataFrame {
    transactions_to_dataframe(ctx, &training_transactions()).unwrap()
}

/// Builds a raw table straight from the records, keeping timestamp text as-is.
fn raw_df(ctx: &SessionContext, transactions: &[Transaction]) -> DataFrame {
    let columns: Vec<ArrayRef> = TRANSACTION_COLUMNS
        .iter()
        .map(|(name, _)| -> ArrayRef {
            let value = |t: &Transaction| serde_json::to_value(t).unwrap()[*name].clone();
            let values: Vec<serde_json::Value> = transactions.iter().map(value).collect();
            if values.iter().all(|v| v.is_number()) {
                Arc::new(Float64Array::from(
                    values.iter().map(|v| v.as_f64().unwrap()).collect::<Vec<_>>(),
                ))
            } else {
                Arc::new(StringArray::from(
                    values
                        .iter()
                        .map(|v| v.as_str().unwrap().to_string())
                        .collect::<Vec<_>>(),
                ))
            }
        })
        .collect();
    let batch = RecordBatch::try_new(transaction_schema(), columns).unwrap();
    ctx.read_batch(batch).unwrap()
}

async fn column_f64(df: DataFrame, name: &str) -> Vec<Option<f64>> {
    let mut out = Vec::new();
    for batch in df.collect().await.unwrap() {
        let idx = batch.schema().index_of(name).unwrap();
        let arr = batch.column(idx).as_any().downcast_ref::<Float64Array>().unwrap();
        out.extend(arr.iter());
    }
    out
}

#[tokio::test]
async fn test_fit_records_feature_layout() -> CreditRiskResult<()> {
    let ctx = SessionContext::new();
    let fitted = FeaturePipeline::new(FeatureSettings::default())
        .fit(&training_df(&ctx))
        .await?;

    let numeric = numeric_feature_columns();
    assert_eq!(numeric.len(), 16);
    assert_eq!(&fitted.columns[..16], numeric.as_slice());

    let one_hot: usize = fitted.categories.values().map(Vec::len).sum();
    assert_eq!(fitted.n_features(), 16 + one_hot);
    assert_eq!(
        fitted.categories["ProductCategory"],
        vec!["airtime", "financial_services", "tv", "utility_bill"]
    );
    assert!(fitted.columns.contains(&"ChannelId_ChannelId_3".to_string()));
    assert!(fitted.outlier_caps.contains_key("Amount"));
    assert!(fitted.outlier_caps.contains_key("Value"));
    assert_eq!(fitted.modes["ChannelId"], "ChannelId_3");
    Ok(())
}

#[tokio::test]
async fn test_transform_produces_scaled_feature_table() -> CreditRiskResult<()> {
    let ctx = SessionContext::new();
    let df = training_df(&ctx);
    let (fitted, transformed) = FeaturePipeline::new(FeatureSettings::default())
        .with_verbose(true)
        .fit_transform(&df)
        .await?;

    let names: Vec<String> = transformed
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    assert_eq!(names[..2], ["TransactionId", "CustomerId"]);
    assert_eq!(names[2..], fitted.columns[..]);

    let batches = transformed.clone().collect().await?;
    let mut ids = Vec::new();
    for batch in &batches {
        let arr = batch.column(0).as_any().downcast_ref::<StringArray>().unwrap();
        ids.extend(arr.iter().map(|v| v.unwrap().to_string()));
        for column in batch.columns().iter().skip(2) {
            assert_eq!(column.null_count(), 0);
        }
    }
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);
    assert_eq!(ids.len(), 8);

    for name in numeric_feature_columns() {
        let values = column_f64(transformed.clone(), &name).await;
        let mean = values.iter().map(|v| v.unwrap()).sum::<f64>() / values.len() as f64;
        assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-9);
    }

    // The extreme purchase is capped before the log transform.
    let (_, upper) = fitted.outlier_caps["Amount"];
    assert!(upper < 750000.0);
    Ok(())
}

#[tokio::test]
async fn test_single_transaction_with_unseen_category() -> CreditRiskResult<()> {
    let ctx = SessionContext::new();
    let fitted = FeaturePipeline::new(FeatureSettings::default())
        .fit(&training_df(&ctx))
        .await?;

    let request = transaction(
        "T99",
        "C_new",
        150.50,
        "ChannelId_3",
        "movies",
        "2025-06-15T10:00:00Z",
    );
    let vector = fitted.transform_transaction(&ctx, &request).await?;
    assert_eq!(vector.columns, fitted.columns);
    assert_eq!(vector.values.len(), fitted.n_features());
    assert!(vector.values.iter().all(|v| v.is_finite()));

    for category in &fitted.categories["ProductCategory"] {
        let name = format!("ProductCategory_{}", category);
        assert_eq!(vector.get(&name), Some(0.0));
    }
    assert_eq!(vector.get("ChannelId_ChannelId_3"), Some(1.0));

    let hour = fitted.scaling["transaction_hour"];
    assert_abs_diff_eq!(
        vector.get("transaction_hour").unwrap(),
        (10.0 - hour.mean) / hour.scale,
        epsilon = 1e-9
    );
    Ok(())
}

#[tokio::test]
async fn test_single_transaction_with_bad_timestamp() -> CreditRiskResult<()> {
    let ctx = SessionContext::new();
    let fitted = FeaturePipeline::new(FeatureSettings::default())
        .fit(&training_df(&ctx))
        .await?;
    let request = transaction("T99", "C1", 10.0, "ChannelId_3", "airtime", "not-a-date");
    match fitted.transform_transaction(&ctx, &request).await {
        Err(CreditRiskError::TimestampParse { column, value }) => {
            assert_eq!(column, "TransactionStartTime");
            assert_eq!(value, "not-a-date");
        }
        other => panic!("expected a timestamp error, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_artifact_round_trip() -> CreditRiskResult<()> {
    let ctx = SessionContext::new();
    let df = training_df(&ctx);
    let fitted = FeaturePipeline::new(FeatureSettings::default())
        .fit(&df)
        .await?;

    let path = std::env::temp_dir().join(format!(
        "credit_risk_features_{}.json",
        std::process::id()
    ));
    fitted.save(&path)?;
    let restored = FittedFeatures::load(&path)?;
    std::fs::remove_file(&path)?;
    assert_eq!(restored.columns, fitted.columns);
    assert_eq!(restored.categories, fitted.categories);
    assert_eq!(restored.modes, fitted.modes);
    assert_eq!(restored.settings, fitted.settings);

    let a = column_f64(fitted.transform(df.clone())?, "log_Amount").await;
    let b = column_f64(restored.transform(df)?, "log_Amount").await;
    for (x, y) in a.iter().zip(&b) {
        assert_abs_diff_eq!(x.unwrap(), y.unwrap(), epsilon = 1e-9);
    }
    Ok(())
}

#[tokio::test]
async fn test_unparseable_training_timestamp_is_imputed() -> CreditRiskResult<()> {
    let ctx = SessionContext::new();
    let mut transactions = training_transactions();
    transactions[1].transaction_start_time = "yesterday".to_string();
    let df = raw_df(&ctx, &transactions);

    let (fitted, transformed) = FeaturePipeline::new(FeatureSettings::default())
        .fit_transform(&df)
        .await?;
    let hours = column_f64(transformed, "transaction_hour").await;
    assert!(hours.iter().all(Option::is_some));

    // The bad row (T02) carries the scaled training median.
    let median = fitted.numeric_fill["transaction_hour"];
    let params = fitted.scaling["transaction_hour"];
    assert_abs_diff_eq!(
        hours[1].unwrap(),
        (median - params.mean) / params.scale,
        epsilon = 1e-9
    );
    Ok(())
}

#[tokio::test]
async fn test_mean_imputation_setting() -> CreditRiskResult<()> {
    let ctx = SessionContext::new();
    let settings = FeatureSettings {
        numeric_imputation: ImputeStrategy::Mean,
        ..FeatureSettings::default()
    };
    let fitted = FeaturePipeline::new(settings).fit(&training_df(&ctx)).await?;
    assert_abs_diff_eq!(fitted.numeric_fill["Amount"], 778450.0 / 8.0, epsilon = 1e-6);
    assert_abs_diff_eq!(fitted.numeric_fill["PricingStrategy"], 2.0, epsilon = 1e-12);
    Ok(())
}

#[tokio::test]
async fn test_serving_rejects_timestamp_outside_nanosecond_range() -> CreditRiskResult<()> {
    let ctx = SessionContext::new();
    let fitted = FeaturePipeline::new(FeatureSettings::default())
        .fit(&training_df(&ctx))
        .await?;
    assert_eq!(fitted.settings.timestamp_policy, TimestampPolicy::Coerce);

    for raw in ["1500-01-01T05:00:00Z", "2262-05-01T00:00:00Z"] {
        let request = transaction("T99", "C1", 10.0, "ChannelId_3", "airtime", raw);
        match fitted.transform_transaction(&ctx, &request).await {
            Err(CreditRiskError::TimestampParse { value, .. }) => assert_eq!(value, raw),
            other => panic!("expected a timestamp error for {}, got {:?}", raw, other),
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_reject_policy_fails_on_unparseable_timestamp() {
    let ctx = SessionContext::new();
    let mut transactions = training_transactions();
    transactions[1].transaction_start_time = "yesterday".to_string();
    let df = raw_df(&ctx, &transactions);

    let settings = FeatureSettings {
        timestamp_policy: TimestampPolicy::Reject,
        ..FeatureSettings::default()
    };
    assert!(FeaturePipeline::new(settings).fit(&df).await.is_err());
}

#[tokio::test]
async fn test_missing_column_is_reported() {
    let ctx = SessionContext::new();
    let df = training_df(&ctx).drop_columns(&["ChannelId"]).unwrap();
    let result = FeaturePipeline::new(FeatureSettings::default()).fit(&df).await;
    match result {
        Err(CreditRiskError::MissingColumn(msg)) => assert!(msg.contains("ChannelId")),
        other => panic!("expected a missing column error, got {:?}", other.map(|_| ())),
    }
}
