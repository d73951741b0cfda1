use super::trim_base;
use crate::config::CryptoBotConfig;
use crate::domain::payment::{PaymentMethod, PaymentRecord, SettlementState};
use crate::domain::ports::{Charge, PaymentProvider};
use crate::domain::product::{ProductDescription, truncate_chars};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{info, warn};

const TOKEN_HEADER: &str = "Crypto-Pay-API-Token";

/// Envelope every Crypto Pay method answers with.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Invoice {
    invoice_id: u64,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, alias = "pay_url")]
    bot_invoice_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InvoiceList {
    #[serde(default)]
    items: Vec<Invoice>,
}

/// Fiat-denominated invoices paid in crypto through the Crypto Pay API.
pub struct CryptoBotProvider {
    http: Client,
    config: CryptoBotConfig,
    currency: String,
}

impl CryptoBotProvider {
    pub fn new(http: Client, config: CryptoBotConfig, currency: String) -> Self {
        Self {
            http,
            config,
            currency,
        }
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/{}", trim_base(&self.config.api_url), method)
    }

    async fn decode<T: DeserializeOwned>(
        resp: reqwest::Response,
    ) -> std::result::Result<T, String> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(format!("status {status}: {body}"));
        }
        let envelope: ApiResponse<T> = resp.json().await.map_err(|e| e.to_string())?;
        match (envelope.ok, envelope.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(format!(
                "API error: {}",
                envelope.error.map(|e| e.to_string()).unwrap_or_default()
            )),
        }
    }

    async fn invoice(&self, invoice_id: &str) -> std::result::Result<Option<Invoice>, String> {
        let resp = self
            .http
            .get(format!("{}?invoice_ids={}", self.endpoint("getInvoices"), invoice_id))
            .header(TOKEN_HEADER, &self.config.token)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let list: InvoiceList = Self::decode(resp).await?;
        Ok(list.items.into_iter().next())
    }
}

fn settlement_from_status(status: &str) -> SettlementState {
    match status {
        "paid" => SettlementState::Settled,
        "expired" => SettlementState::Failed,
        _ => SettlementState::Pending,
    }
}

#[async_trait]
impl PaymentProvider for CryptoBotProvider {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::CryptoBot
    }

    async fn initiate(&self, record: &PaymentRecord) -> Result<Charge> {
        let product = ProductDescription::for_record(record);
        let body = json!({
            "currency_type": "fiat",
            "fiat": self.currency,
            "amount": record.amount.to_minor_string(),
            "description": truncate_chars(&product.name, 1024),
            "payload": record.id.to_string(),
        });

        info!(payment_id = %record.id, amount = %record.amount, "Creating CryptoBot invoice");
        let resp = self
            .http
            .post(self.endpoint("createInvoice"))
            .header(TOKEN_HEADER, &self.config.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| PaymentError::ProviderUnavailable(format!("CryptoBot unreachable: {e}")))?;

        let invoice: Invoice = Self::decode(resp).await.map_err(|e| {
            warn!(payment_id = %record.id, error = %e, "CryptoBot rejected invoice creation");
            PaymentError::ProviderUnavailable(format!("CryptoBot: {e}"))
        })?;
        let url = invoice.bot_invoice_url.ok_or_else(|| {
            PaymentError::ProviderUnavailable("CryptoBot did not return an invoice link".into())
        })?;

        Ok(Charge::new(invoice.invoice_id.to_string(), url))
    }

    async fn verify(&self, record: &PaymentRecord) -> Result<SettlementState> {
        let reference = record.provider_reference().ok_or_else(|| {
            PaymentError::VerificationInconclusive("no CryptoBot invoice id on record".into())
        })?;

        match self.invoice(reference).await {
            Ok(Some(invoice)) => {
                let status = invoice.status.unwrap_or_default();
                info!(payment_id = %record.id, cryptobot_status = %status, "CryptoBot status");
                Ok(settlement_from_status(&status))
            }
            Ok(None) => {
                warn!(payment_id = %record.id, invoice_id = %reference, "CryptoBot does not know the invoice");
                Ok(SettlementState::Pending)
            }
            Err(e) => {
                warn!(payment_id = %record.id, error = %e, "CryptoBot status query failed");
                Ok(SettlementState::Pending)
            }
        }
    }
}
