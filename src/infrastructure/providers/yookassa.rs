use super::trim_base;
use crate::config::YooKassaConfig;
use crate::domain::payment::{PaymentMethod, PaymentRecord, SettlementState};
use crate::domain::ports::{Charge, PaymentProvider};
use crate::domain::product::{ProductDescription, truncate_chars};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct YooKassaPayment {
    id: String,
    status: String,
    #[serde(default)]
    confirmation: Option<Confirmation>,
}

#[derive(Debug, Deserialize)]
struct Confirmation {
    #[serde(default)]
    confirmation_url: Option<String>,
}

/// Card payments through the YooKassa REST API with a redirect confirmation.
pub struct YooKassaProvider {
    http: Client,
    config: YooKassaConfig,
    currency: String,
    return_url: String,
}

impl YooKassaProvider {
    pub fn new(http: Client, config: YooKassaConfig, currency: String, return_url: String) -> Self {
        Self {
            http,
            config,
            currency,
            return_url,
        }
    }

    fn payments_url(&self) -> String {
        format!("{}/v3/payments", trim_base(&self.config.api_url))
    }

    async fn fetch(&self, reference: &str) -> std::result::Result<YooKassaPayment, String> {
        let resp = self
            .http
            .get(format!("{}/{}", self.payments_url(), reference))
            .basic_auth(&self.config.shop_id, Some(&self.config.secret_key))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("status {}", resp.status()));
        }
        resp.json().await.map_err(|e| e.to_string())
    }
}

/// `succeeded` is final money; `canceled` covers declines and expiry.
fn settlement_from_status(status: &str) -> SettlementState {
    match status {
        "succeeded" => SettlementState::Settled,
        "canceled" | "expired" => SettlementState::Failed,
        _ => SettlementState::Pending,
    }
}

#[async_trait]
impl PaymentProvider for YooKassaProvider {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::YooKassa
    }

    async fn initiate(&self, record: &PaymentRecord) -> Result<Charge> {
        let product = ProductDescription::for_record(record);
        let description = truncate_chars(
            &format!("{} (tg:{}, pid:{})", product.name, record.user_id, record.id),
            128,
        );
        let body = json!({
            "amount": {
                "value": record.amount.to_minor_string(),
                "currency": self.currency,
            },
            "confirmation": {
                "type": "redirect",
                "return_url": self.return_url,
            },
            "capture": true,
            "description": description,
            "metadata": { "local_pid": record.id.to_string() },
        });

        info!(payment_id = %record.id, amount = %record.amount, "Creating YooKassa payment");
        let resp = self
            .http
            .post(self.payments_url())
            .basic_auth(&self.config.shop_id, Some(&self.config.secret_key))
            // A repeated initiate for the same record returns the same charge.
            .header("Idempotence-Key", format!("vpn-checkout-{}", record.id))
            .json(&body)
            .send()
            .await
            .map_err(|e| PaymentError::ProviderUnavailable(format!("YooKassa unreachable: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(payment_id = %record.id, %status, body = %text, "YooKassa rejected payment creation");
            return Err(PaymentError::ProviderUnavailable(format!(
                "YooKassa returned {status}"
            )));
        }

        let payment: YooKassaPayment = resp.json().await.map_err(|e| {
            PaymentError::ProviderUnavailable(format!("YooKassa response not understood: {e}"))
        })?;
        let url = payment
            .confirmation
            .and_then(|c| c.confirmation_url)
            .ok_or_else(|| {
                PaymentError::ProviderUnavailable("YooKassa did not return a payment link".into())
            })?;

        Ok(Charge::new(payment.id, url))
    }

    async fn verify(&self, record: &PaymentRecord) -> Result<SettlementState> {
        let reference = record.provider_reference().ok_or_else(|| {
            PaymentError::VerificationInconclusive("no YooKassa payment id on record".into())
        })?;

        match self.fetch(reference).await {
            Ok(payment) => {
                info!(payment_id = %record.id, yookassa_status = %payment.status, "YooKassa status");
                Ok(settlement_from_status(&payment.status))
            }
            Err(e) => {
                warn!(payment_id = %record.id, error = %e, "YooKassa status query failed");
                Ok(SettlementState::Pending)
            }
        }
    }
}
