//! Payment processor adapters.
//!
//! Each adapter is the only code aware of its processor's wire protocol. The
//! registry holds the ones that are enabled; anything not registered is treated
//! as unavailable.

pub mod cryptobot;
pub mod yookassa;
pub mod yoomoney;

use crate::config::Config;
use crate::domain::payment::PaymentMethod;
use crate::domain::ports::PaymentProviderRef;
use crate::error::{PaymentError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub use cryptobot::CryptoBotProvider;
pub use yookassa::YooKassaProvider;
pub use yoomoney::YooMoneyProvider;

/// Shared HTTP client with the per-call timeout applied.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| PaymentError::ConfigError(format!("cannot build HTTP client: {e}")))
}

pub(crate) fn trim_base(url: &str) -> &str {
    url.trim_end_matches('/')
}

/// Enabled payment providers keyed by method.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<PaymentMethod, PaymentProviderRef>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every provider enabled in `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let http = http_client(config.http_timeout)?;
        let mut registry = Self::new();

        if let Some(yookassa) = &config.yookassa {
            registry.register(Arc::new(YooKassaProvider::new(
                http.clone(),
                yookassa.clone(),
                config.currency.clone(),
                config.return_url.clone(),
            )));
        }
        if let Some(yoomoney) = &config.yoomoney {
            registry.register(Arc::new(YooMoneyProvider::new(
                http.clone(),
                yoomoney.clone(),
                config.return_url.clone(),
            )));
        }
        if let Some(cryptobot) = &config.cryptobot {
            registry.register(Arc::new(CryptoBotProvider::new(
                http,
                cryptobot.clone(),
                config.currency.clone(),
            )));
        }

        Ok(registry)
    }

    pub fn register(&mut self, provider: PaymentProviderRef) {
        self.providers.insert(provider.method(), provider);
    }

    /// Methods the front-end may offer, in a stable order.
    pub fn available_methods(&self) -> Vec<PaymentMethod> {
        self.providers.keys().copied().collect()
    }

    pub fn is_enabled(&self, method: PaymentMethod) -> bool {
        self.providers.contains_key(&method)
    }

    pub fn get(&self, method: PaymentMethod) -> Result<PaymentProviderRef> {
        self.providers.get(&method).cloned().ok_or_else(|| {
            PaymentError::ProviderUnavailable(format!("{} is not enabled", method.display_name()))
        })
    }
}
