use super::trim_base;
use crate::config::YooMoneyConfig;
use crate::domain::payment::{PaymentMethod, PaymentRecord, SettlementState};
use crate::domain::ports::{Charge, PaymentProvider};
use crate::domain::product::{ProductDescription, truncate_chars};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;
use tracing::{info, warn};
use url::Url;

/// Metadata key under which the label is kept alongside the reference.
pub const LABEL_KEY: &str = "label";

const HISTORY_DEPTH: &str = "30";

#[derive(Debug, Deserialize)]
struct OperationHistory {
    #[serde(default)]
    operations: Vec<Operation>,
}

#[derive(Debug, Deserialize)]
struct Operation {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    amount: Option<Value>,
}

impl Operation {
    fn amount(&self) -> Option<Decimal> {
        match self.amount.as_ref()? {
            Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
            Value::String(s) => Decimal::from_str(s.trim()).ok(),
            _ => None,
        }
    }

    fn settles(&self, label: &str, expected: Decimal) -> bool {
        self.status.as_deref() == Some("success")
            && self.label.as_deref() == Some(label)
            && self.amount().is_some_and(|amount| amount >= expected)
    }
}

/// Wallet transfers through a YooMoney Quickpay form.
///
/// There is no charge object on the processor side: the form URL is built
/// locally and settlement is found by searching the wallet's operation history
/// for the record's label.
pub struct YooMoneyProvider {
    http: Client,
    config: YooMoneyConfig,
    return_url: String,
}

impl YooMoneyProvider {
    pub fn new(http: Client, config: YooMoneyConfig, return_url: String) -> Self {
        Self {
            http,
            config,
            return_url,
        }
    }

    pub fn label_for(record: &PaymentRecord) -> String {
        format!("YM-{}-{}", record.id, record.user_id)
    }

    fn quickpay_url(&self, record: &PaymentRecord, label: &str) -> Result<Url> {
        let product = ProductDescription::for_record(record);
        let base = format!("{}/quickpay/confirm.xml", trim_base(&self.config.api_url));
        Url::parse_with_params(
            &base,
            &[
                ("receiver", self.config.wallet_id.clone()),
                ("quickpay-form", "shop".to_string()),
                ("sum", record.amount.to_minor_string()),
                ("label", label.to_string()),
                ("targets", truncate_chars(&product.name, 128)),
                ("comment", truncate_chars(&product.description, 512)),
                ("successURL", self.return_url.clone()),
            ],
        )
        .map_err(|e| PaymentError::ProviderUnavailable(format!("bad YooMoney URL {base}: {e}")))
    }

    async fn history(&self, label: &str) -> std::result::Result<OperationHistory, String> {
        let resp = self
            .http
            .post(format!("{}/api/operation-history", trim_base(&self.config.api_url)))
            .bearer_auth(&self.config.access_token)
            .form(&[("label", label), ("records", HISTORY_DEPTH)])
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("status {}", resp.status()));
        }
        resp.json().await.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl PaymentProvider for YooMoneyProvider {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::YooMoney
    }

    async fn initiate(&self, record: &PaymentRecord) -> Result<Charge> {
        let label = Self::label_for(record);
        let url = self.quickpay_url(record, &label)?;
        info!(payment_id = %record.id, %label, "Built YooMoney Quickpay form");

        let mut charge = Charge::new(label.clone(), url.to_string());
        charge.extra.insert(LABEL_KEY, label);
        Ok(charge)
    }

    async fn verify(&self, record: &PaymentRecord) -> Result<SettlementState> {
        let label = record
            .provider_reference()
            .or_else(|| record.metadata.get_str(LABEL_KEY))
            .ok_or_else(|| {
                PaymentError::VerificationInconclusive("no YooMoney label on record".into())
            })?;

        let history = match self.history(label).await {
            Ok(history) => history,
            Err(e) => {
                warn!(payment_id = %record.id, error = %e, "YooMoney history query failed");
                return Ok(SettlementState::Pending);
            }
        };

        let expected = record.amount.value();
        if history.operations.iter().any(|op| op.settles(label, expected)) {
            info!(payment_id = %record.id, %label, "YooMoney transfer found");
            Ok(SettlementState::Settled)
        } else {
            // An absent transfer may still arrive; the history never proves failure.
            Ok(SettlementState::Pending)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::payment::{Amount, Intent, Metadata, NewPayment, PaymentId, keys};
    use chrono::Utc;
    use mockito::{Matcher, Server};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn provider(api_url: String) -> YooMoneyProvider {
        YooMoneyProvider::new(
            super::super::http_client(Duration::from_secs(5)).unwrap(),
            YooMoneyConfig {
                wallet_id: "410011112222".to_string(),
                access_token: "token".to_string(),
                api_url,
            },
            "https://t.me/bot".to_string(),
        )
    }

    fn record(label: Option<&str>) -> PaymentRecord {
        priced_record(label, dec!(150))
    }

    fn priced_record(label: Option<&str>, amount: Decimal) -> PaymentRecord {
        let mut metadata = Metadata::new();
        if let Some(label) = label {
            metadata.insert(keys::PROVIDER_REFERENCE, label);
        }
        PaymentRecord::new(
            PaymentId(5),
            NewPayment {
                user_id: 777,
                intent: Intent::KeyPurchase,
                amount: Amount::new(amount).unwrap(),
                duration_months: 3,
                target_account: None,
                metadata,
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_initiate_builds_quickpay_form() {
        let charge = provider("https://yoomoney.ru/".to_string())
            .initiate(&record(None))
            .await
            .unwrap();

        assert_eq!(charge.reference, "YM-5-777");
        assert_eq!(charge.extra.get_str(LABEL_KEY), Some("YM-5-777"));

        let url = Url::parse(&charge.url).unwrap();
        assert_eq!(url.path(), "/quickpay/confirm.xml");
        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["receiver"], "410011112222");
        assert_eq!(params["quickpay-form"], "shop");
        assert_eq!(params["sum"], "150.00");
        assert_eq!(params["label"], "YM-5-777");
        assert_eq!(params["targets"], "VPN key, 3 mo.");
        assert_eq!(params["successURL"], "https://t.me/bot");
    }

    #[tokio::test]
    async fn test_verify_settles_on_matching_transfer() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/operation-history")
            .match_header("authorization", "Bearer token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("label".into(), "YM-5-777".into()),
                Matcher::UrlEncoded("records".into(), "30".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"operations":[
                    {"status":"success","label":"YM-5-777","amount":150.0}
                ]}"#,
            )
            .create_async()
            .await;

        let state = provider(server.url())
            .verify(&record(Some("YM-5-777")))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(state, SettlementState::Settled);
    }

    #[tokio::test]
    async fn test_invoiced_sum_settles_exactly() {
        let yoomoney = provider("https://yoomoney.ru".to_string());
        let priced = priced_record(None, dec!(299.99));
        let charge = yoomoney.initiate(&priced).await.unwrap();
        let url = Url::parse(&charge.url).unwrap();
        let sum = url
            .query_pairs()
            .find(|(k, _)| k == "sum")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        assert_eq!(sum, "299.99");

        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/operation-history")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!(
                r#"{{"operations":[{{"status":"success","label":"YM-5-777","amount":"{sum}"}}]}}"#
            ))
            .create_async()
            .await;

        let state = provider(server.url())
            .verify(&priced_record(Some("YM-5-777"), dec!(299.99)))
            .await
            .unwrap();
        assert_eq!(state, SettlementState::Settled);
    }

    #[tokio::test]
    async fn test_verify_ignores_short_or_foreign_transfers() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/operation-history")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"operations":[
                    {"status":"success","label":"YM-5-777","amount":149.99},
                    {"status":"in_progress","label":"YM-5-777","amount":150},
                    {"status":"success","label":"YM-6-777","amount":"500.00"}
                ]}"#,
            )
            .create_async()
            .await;

        let state = provider(server.url())
            .verify(&record(Some("YM-5-777")))
            .await
            .unwrap();
        assert_eq!(state, SettlementState::Pending);
    }

    #[tokio::test]
    async fn test_verify_unreachable_is_pending() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/operation-history")
            .with_status(401)
            .with_body(r#"{"error":"invalid_token"}"#)
            .create_async()
            .await;

        let state = provider(server.url())
            .verify(&record(Some("YM-5-777")))
            .await
            .unwrap();
        assert_eq!(state, SettlementState::Pending);
    }

    #[tokio::test]
    async fn test_verify_without_label_is_inconclusive() {
        let result = provider("http://127.0.0.1:9".to_string())
            .verify(&record(None))
            .await;
        assert!(matches!(result, Err(PaymentError::VerificationInconclusive(_))));
    }

    #[test]
    fn test_string_amounts_are_accepted() {
        let op = Operation {
            status: Some("success".into()),
            label: Some("L".into()),
            amount: Some(Value::String("150.00".into())),
        };
        assert!(op.settles("L", dec!(150)));
        assert!(!op.settles("L", dec!(150.01)));
    }
}
