use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use credit_risk_factory::exceptions::{CreditRiskError, CreditRiskResult};
use credit_risk_factory::transformers::outlier_handling::IqrOutlierCapper;
use datafusion::datasource::MemTable;
use datafusion::prelude::*;
use std::collections::BTreeMap;

/// Creates a DataFrame with an "id" column and an "amount" column holding one extreme value.
async fn create_amounts_df() -> DataFrame {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("amount", DataType::Float64, true),
    ]));
    let ids: ArrayRef = Arc::new(StringArray::from(
        (1..=9).map(|i| format!("t{}", i)).collect::<Vec<_>>(),
    ));
    let amounts: ArrayRef = Arc::new(Float64Array::from(vec![
        1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 1000.0,
    ]));
    let batch = RecordBatch::try_new(schema.clone(), vec![ids, amounts]).unwrap();
    let mem_table = MemTable::try_new(schema, vec![vec![batch]]).unwrap();
    let ctx = SessionContext::new();
    ctx.register_table("t", Arc::new(mem_table)).unwrap();
    ctx.table("t").await.unwrap()
}

async fn collect_f64(df: DataFrame, col_name: &str) -> Vec<f64> {
    let batches = df.sort(vec![col("id").sort(true, true)]).unwrap().collect().await.unwrap();
    let mut out = Vec::new();
    for batch in batches {
        let idx = batch.schema().index_of(col_name).unwrap();
        let arr = batch.column(idx).as_any().downcast_ref::<Float64Array>().unwrap();
        out.extend(arr.iter().map(|v| v.unwrap()));
    }
    out
}

#[tokio::test]
async fn test_iqr_capper_in_place() -> CreditRiskResult<()> {
    let df = create_amounts_df().await;
    let mut capper = IqrOutlierCapper::new(vec!["amount".to_string()], 1.5);
    capper.fit(&df).await?;
    // Q1 = 3, Q3 = 7, IQR = 4.
    assert_eq!(capper.thresholds["amount"], (-3.0, 13.0));

    let values = collect_f64(capper.transform(df)?, "amount").await;
    assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 13.0]);
    Ok(())
}

#[tokio::test]
async fn test_iqr_capper_with_suffix_keeps_original() -> CreditRiskResult<()> {
    let df = create_amounts_df().await;
    let mut capper = IqrOutlierCapper::new(vec!["amount".to_string()], 1.5).with_suffix("_capped");
    capper.fit(&df).await?;
    let transformed = capper.transform(df)?;

    let original = collect_f64(transformed.clone(), "amount").await;
    let capped = collect_f64(transformed, "amount_capped").await;
    assert_eq!(original[8], 1000.0);
    assert_eq!(capped[8], 13.0);
    assert_eq!(capped[..8], original[..8]);
    Ok(())
}

#[tokio::test]
async fn test_iqr_capper_from_thresholds_skips_fit() -> CreditRiskResult<()> {
    let df = create_amounts_df().await;
    let mut thresholds = BTreeMap::new();
    thresholds.insert("amount".to_string(), (2.0, 6.0));
    let capper = IqrOutlierCapper::from_thresholds(thresholds);
    let values = collect_f64(capper.transform(df)?, "amount").await;
    assert_eq!(values, vec![2.0, 2.0, 3.0, 4.0, 5.0, 6.0, 6.0, 6.0, 6.0]);
    Ok(())
}

#[tokio::test]
async fn test_iqr_capper_errors() {
    let df = create_amounts_df().await;

    let capper = IqrOutlierCapper::new(vec!["amount".to_string()], 1.5);
    assert!(matches!(
        capper.transform(df.clone()),
        Err(CreditRiskError::FitNotCalled)
    ));

    let mut missing = IqrOutlierCapper::new(vec!["nope".to_string()], 1.5);
    assert!(matches!(
        missing.fit(&df).await,
        Err(CreditRiskError::MissingColumn(_))
    ));

    let mut negative = IqrOutlierCapper::new(vec!["amount".to_string()], -1.0);
    assert!(matches!(
        negative.fit(&df).await,
        Err(CreditRiskError::InvalidParameter(_))
    ));
}
