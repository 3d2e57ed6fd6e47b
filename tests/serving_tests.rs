use approx::assert_abs_diff_eq;
use credit_risk_factory::exceptions::{CreditRiskError, CreditRiskResult};
use credit_risk_factory::features::{FeaturePipeline, FittedFeatures};
use credit_risk_factory::schema::{transactions_to_dataframe, Transaction};
use credit_risk_factory::serving::{
    LogisticRegressionModel, RiskModel, RiskScore, RiskScorer, ScoreResponse, HIGH_RISK_RESULT,
    LOW_RISK_RESULT,
};
use credit_risk_factory::settings::FeatureSettings;
use datafusion::prelude::*;

fn transaction(id: &str, customer: &str, amount: f64, category: &str, timestamp: &str) -> Transaction {
    Transaction {
        transaction_id: id.to_string(),
        batch_id: "BatchId_1".to_string(),
        account_id: format!("AccountId_{}", customer),
        subscription_id: "SubscriptionId_1".to_string(),
        customer_id: customer.to_string(),
        currency_code: "UGX".to_string(),
        country_code: 256,
        provider_id: "ProviderId_6".to_string(),
        product_id: "ProductId_10".to_string(),
        product_category: category.to_string(),
        channel_id: "ChannelId_3".to_string(),
        amount,
        value: amount.abs(),
        transaction_start_time: timestamp.to_string(),
        pricing_strategy: 2,
        fraud_result: None,
    }
}

async fn fitted_features() -> FittedFeatures {
    let ctx = SessionContext::new();
    let history = vec![
        transaction("T1", "C1", 1000.0, "airtime", "2025-06-01T08:00:00Z"),
        transaction("T2", "C1", 200.0, "utility_bill", "2025-06-02T09:00:00Z"),
        transaction("T3", "C2", 5000.0, "airtime", "2025-06-03T10:00:00Z"),
        transaction("T4", "C3", -100.0, "financial_services", "2025-06-04T11:00:00Z"),
        transaction("T5", "C3", 700.0, "airtime", "2025-06-05T12:00:00Z"),
    ];
    let df = transactions_to_dataframe(&ctx, &history).unwrap();
    FeaturePipeline::new(FeatureSettings::default())
        .fit(&df)
        .await
        .unwrap()
}

fn request() -> Transaction {
    transaction("T100", "C9", 150.50, "movies", "2025-06-20T14:30:00Z")
}

#[tokio::test]
async fn test_neutral_model_scores_one_half() -> CreditRiskResult<()> {
    let features = fitted_features().await;
    let model = LogisticRegressionModel::new(0.0, vec![0.0; features.n_features()]);
    let scorer = RiskScorer::new(features, model)?;

    let score = scorer.score(&request()).await?;
    assert_abs_diff_eq!(score.risk_probability, 0.5, epsilon = 1e-12);
    assert_eq!(score.result, HIGH_RISK_RESULT);
    Ok(())
}

#[tokio::test]
async fn test_low_probability_verdict() -> CreditRiskResult<()> {
    let features = fitted_features().await;
    let model = LogisticRegressionModel::new(-2.0, vec![0.0; features.n_features()]);
    let scorer = RiskScorer::new(features, model)?;

    let body = serde_json::to_string(&request())?;
    match scorer.score_json(&body).await {
        ScoreResponse::Score(RiskScore {
            risk_probability,
            result,
        }) => {
            assert_abs_diff_eq!(risk_probability, 1.0 / (1.0 + 2.0_f64.exp()), epsilon = 1e-12);
            assert_eq!(result, LOW_RISK_RESULT);
        }
        other => panic!("expected a score, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_custom_threshold() -> CreditRiskResult<()> {
    let features = fitted_features().await;
    let model = LogisticRegressionModel::new(0.0, vec![0.0; features.n_features()]);
    let scorer = RiskScorer::new(features, model)?.with_threshold(0.6);
    assert_eq!(scorer.score(&request()).await?.result, LOW_RISK_RESULT);
    Ok(())
}

#[tokio::test]
async fn test_unparseable_timestamp_is_rejected() -> CreditRiskResult<()> {
    let features = fitted_features().await;
    let model = LogisticRegressionModel::new(0.0, vec![0.0; features.n_features()]);
    let scorer = RiskScorer::new(features, model)?;

    let mut bad = request();
    bad.transaction_start_time = "not-a-date".to_string();
    assert!(matches!(
        scorer.score(&bad).await,
        Err(CreditRiskError::TimestampParse { .. })
    ));

    let response = scorer.score_json(&serde_json::to_string(&bad)?).await;
    assert!(response.is_error());
    match response {
        ScoreResponse::Error { error } => {
            assert!(error.contains("TransactionStartTime"));
            assert!(error.contains("not-a-date"));
        }
        other => panic!("expected an error, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_out_of_range_timestamp_is_rejected() -> CreditRiskResult<()> {
    let features = fitted_features().await;
    let model = LogisticRegressionModel::new(0.0, vec![0.0; features.n_features()]);
    let scorer = RiskScorer::new(features, model)?;

    let mut ancient = request();
    ancient.transaction_start_time = "1500-01-01T05:00:00Z".to_string();
    match scorer.score(&ancient).await {
        Err(CreditRiskError::TimestampParse { column, value }) => {
            assert_eq!(column, "TransactionStartTime");
            assert_eq!(value, "1500-01-01T05:00:00Z");
        }
        other => panic!("expected a timestamp error, got {:?}", other),
    }
    assert!(scorer.score_json(&serde_json::to_string(&ancient)?).await.is_error());
    Ok(())
}

#[tokio::test]
async fn test_malformed_request_body() -> CreditRiskResult<()> {
    let features = fitted_features().await;
    let model = LogisticRegressionModel::new(0.0, vec![0.0; features.n_features()]);
    let scorer = RiskScorer::new(features, model)?;

    match scorer.score_json(r#"{"TransactionId": "T1"}"#).await {
        ScoreResponse::Error { error } => assert!(error.starts_with("Invalid request body")),
        other => panic!("expected an error, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_model_must_match_feature_layout() {
    let features = fitted_features().await;
    let n = features.n_features();

    let narrow = LogisticRegressionModel::new(0.0, vec![0.0; n - 1]);
    assert!(matches!(
        RiskScorer::new(features.clone(), narrow),
        Err(CreditRiskError::FeatureMismatch { .. })
    ));

    let mut names = features.columns.clone();
    names.swap(0, 1);
    let reordered = LogisticRegressionModel::new(0.0, vec![0.0; n]).with_feature_names(names);
    assert!(matches!(
        RiskScorer::new(features.clone(), reordered),
        Err(CreditRiskError::InvalidParameter(_))
    ));

    let named =
        LogisticRegressionModel::new(0.0, vec![0.0; n]).with_feature_names(features.columns.clone());
    assert!(RiskScorer::new(features, named).is_ok());
}

#[test]
fn test_logistic_model() {
    let model = LogisticRegressionModel::new(0.5, vec![1.0, -2.0]);
    assert_eq!(model.n_features(), Some(2));
    assert!(model.feature_names().is_none());
    let p = model.predict_proba(&[1.0, 0.25]).unwrap();
    assert_abs_diff_eq!(p, 1.0 / (1.0 + (-1.0_f64).exp()), epsilon = 1e-12);
    assert!(matches!(
        model.predict_proba(&[1.0]),
        Err(CreditRiskError::FeatureMismatch {
            expected: 2,
            found: 1
        })
    ));
}

#[test]
fn test_model_from_json_file() -> CreditRiskResult<()> {
    let path = std::env::temp_dir().join(format!("credit_risk_model_{}.json", std::process::id()));
    std::fs::write(
        &path,
        r#"{"intercept": -1.0, "coefficients": [0.5, 0.25], "feature_names": ["a", "b"]}"#,
    )?;
    let model = LogisticRegressionModel::from_json_file(&path)?;
    assert_eq!(model.coefficients, vec![0.5, 0.25]);
    assert_eq!(model.feature_names().map(<[String]>::len), Some(2));

    std::fs::write(
        &path,
        r#"{"intercept": 0.0, "coefficients": [0.5], "feature_names": ["a", "b"]}"#,
    )?;
    let result = LogisticRegressionModel::from_json_file(&path);
    std::fs::remove_file(&path)?;
    assert!(matches!(result, Err(CreditRiskError::FeatureMismatch { .. })));
    Ok(())
}

#[test]
fn test_response_shapes() {
    let score = ScoreResponse::Score(RiskScore {
        risk_probability: 0.25,
        result: LOW_RISK_RESULT.to_string(),
    });
    let json = serde_json::to_value(&score).unwrap();
    assert_eq!(json["risk_probability"], 0.25);
    assert_eq!(json["result"], "Does not have probability of default");

    let error = ScoreResponse::Error {
        error: "boom".to_string(),
    };
    assert_eq!(
        serde_json::to_string(&error).unwrap(),
        r#"{"error":"boom"}"#
    );
}
