use arrow::array::{ArrayRef, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use credit_risk_factory::exceptions::{CreditRiskError, CreditRiskResult};
use credit_risk_factory::transformers::categorical_encoding::OneHotEncoder;
use datafusion::datasource::MemTable;
use datafusion::prelude::*;
use std::sync::Arc;

/// Creates a DataFrame with a key "id" and a categorical column "channel".
async fn create_df(channels: Vec<Option<&str>>) -> DataFrame {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("channel", DataType::Utf8, true),
    ]));
    let ids: ArrayRef = Arc::new(StringArray::from(
        (0..channels.len()).map(|i| format!("r{}", i)).collect::<Vec<_>>(),
    ));
    let channel: ArrayRef = Arc::new(StringArray::from(channels));
    let batch = RecordBatch::try_new(schema.clone(), vec![ids, channel]).unwrap();
    let mem_table = MemTable::try_new(schema, vec![vec![batch]]).unwrap();
    let ctx = SessionContext::new();
    ctx.register_table("t", Arc::new(mem_table)).unwrap();
    ctx.table("t").await.unwrap()
}

async fn column_f64(df: DataFrame, name: &str) -> Vec<f64> {
    let batches = df.sort(vec![col("id").sort(true, true)]).unwrap().collect().await.unwrap();
    let mut out = Vec::new();
    for batch in batches {
        let idx = batch.schema().index_of(name).unwrap();
        let arr = batch.column(idx).as_any().downcast_ref::<Float64Array>().unwrap();
        out.extend(arr.iter().map(|v| v.unwrap()));
    }
    out
}

#[tokio::test]
async fn test_one_hot_encoder() -> CreditRiskResult<()> {
    let df = create_df(vec![Some("web"), Some("android"), Some("web"), Some("ios")]).await;
    let mut encoder = OneHotEncoder::new(vec!["channel".to_string()]);
    encoder.fit(&df).await?;
    assert_eq!(encoder.categories["channel"], vec!["android", "ios", "web"]);
    assert_eq!(
        encoder.output_columns(),
        vec!["channel_android", "channel_ios", "channel_web"]
    );

    let transformed = encoder.transform(df)?;
    let names: Vec<String> = transformed
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    assert!(!names.contains(&"channel".to_string()));
    assert_eq!(
        column_f64(transformed.clone(), "channel_web").await,
        vec![1.0, 0.0, 1.0, 0.0]
    );
    assert_eq!(
        column_f64(transformed.clone(), "channel_android").await,
        vec![0.0, 1.0, 0.0, 0.0]
    );
    assert_eq!(
        column_f64(transformed, "channel_ios").await,
        vec![0.0, 0.0, 0.0, 1.0]
    );
    Ok(())
}

#[tokio::test]
async fn test_unknown_and_missing_categories_encode_to_zeros() -> CreditRiskResult<()> {
    let train = create_df(vec![Some("web"), Some("ios")]).await;
    let mut encoder = OneHotEncoder::new(vec!["channel".to_string()]);
    encoder.fit(&train).await?;

    let serve = create_df(vec![Some("pay_later"), None]).await;
    let transformed = encoder.transform(serve)?;
    for name in encoder.output_columns() {
        assert_eq!(column_f64(transformed.clone(), &name).await, vec![0.0, 0.0]);
    }
    Ok(())
}

#[tokio::test]
async fn test_one_hot_encoder_requires_fit() {
    let df = create_df(vec![Some("web")]).await;
    let encoder = OneHotEncoder::new(vec!["channel".to_string()]);
    assert!(matches!(
        encoder.transform(df.clone()),
        Err(CreditRiskError::FitNotCalled)
    ));

    let mut missing = OneHotEncoder::new(vec!["product".to_string()]);
    assert!(matches!(
        missing.fit(&df).await,
        Err(CreditRiskError::MissingColumn(_))
    ));
}
