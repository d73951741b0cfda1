//! Runtime configuration read from the process environment.

use crate::error::{PaymentError, Result};
use chrono::TimeDelta;
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::time::Duration;

pub const DEFAULT_CURRENCY: &str = "RUB";
pub const DEFAULT_RETURN_URL: &str = "https://t.me";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_LEASE_SECS: u64 = 120;
const HTTP_TIMEOUT_RANGE: RangeInclusive<u64> = 1..=600;
const LEASE_RANGE: RangeInclusive<u64> = 1..=86_400;

#[derive(Debug, Clone, PartialEq)]
pub struct YooKassaConfig {
    pub shop_id: String,
    pub secret_key: String,
    pub api_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct YooMoneyConfig {
    pub wallet_id: String,
    pub access_token: String,
    pub api_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CryptoBotConfig {
    pub token: String,
    pub api_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountServiceConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
}

/// Everything needed to assemble a [`crate::application::engine::PaymentEngine`].
///
/// A provider section is `Some` only when the provider is enabled; enabling a
/// provider without its credentials is rejected when the config is loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub currency: String,
    pub return_url: String,
    pub http_timeout: Duration,
    pub fulfillment_lease: TimeDelta,
    pub yookassa: Option<YooKassaConfig>,
    pub yoomoney: Option<YooMoneyConfig>,
    pub cryptobot: Option<CryptoBotConfig>,
    pub account_service: AccountServiceConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars().collect())
    }

    /// Same as [`Config::from_env`] over an explicit variable map.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self> {
        let env = Vars(vars);

        let yookassa = if env.flag("YOOKASSA_ENABLED") {
            Some(YooKassaConfig {
                shop_id: env.required("YOOKASSA_SHOP_ID")?,
                secret_key: env.required("YOOKASSA_SECRET_KEY")?,
                api_url: env.or("YOOKASSA_API_URL", "https://api.yookassa.ru"),
            })
        } else {
            None
        };

        let yoomoney = if env.flag("YOOMONEY_ENABLED") {
            Some(YooMoneyConfig {
                wallet_id: env.required("YOOMONEY_WALLET_ID")?,
                access_token: env.required("YOOMONEY_ACCESS_TOKEN")?,
                api_url: env.or("YOOMONEY_API_URL", "https://yoomoney.ru"),
            })
        } else {
            None
        };

        let cryptobot = if env.flag("CRYPTOBOT_ENABLED") {
            Some(CryptoBotConfig {
                token: env.required("CRYPTOBOT_TOKEN")?,
                api_url: env.or("CRYPTOBOT_API_URL", "https://pay.crypt.bot/api"),
            })
        } else {
            None
        };

        Ok(Self {
            currency: env.or("CURRENCY", DEFAULT_CURRENCY),
            return_url: env.or("RETURN_URL", DEFAULT_RETURN_URL),
            http_timeout: Duration::from_secs(env.seconds(
                "HTTP_TIMEOUT_SECS",
                DEFAULT_HTTP_TIMEOUT_SECS,
                HTTP_TIMEOUT_RANGE,
            )?),
            fulfillment_lease: TimeDelta::seconds(env.seconds(
                "FULFILLMENT_LEASE_SECS",
                DEFAULT_LEASE_SECS,
                LEASE_RANGE,
            )? as i64),
            yookassa,
            yoomoney,
            cryptobot,
            account_service: AccountServiceConfig {
                base_url: env.or("MARZBAN_URL", "http://127.0.0.1:8000"),
                username: env.or("MARZBAN_USERNAME", ""),
                password: env.or("MARZBAN_PASSWORD", ""),
            },
        })
    }
}

struct Vars(HashMap<String, String>);

impl Vars {
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| {
            matches!(
                v.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    fn required(&self, key: &str) -> Result<String> {
        self.get(key)
            .map(str::to_string)
            .ok_or_else(|| PaymentError::ConfigError(format!("{key} must be set")))
    }

    fn number<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.get(key) {
            Some(raw) => raw
                .parse()
                .map_err(|_| PaymentError::ConfigError(format!("{key} is not a number: {raw}"))),
            None => Ok(default),
        }
    }

    fn seconds(&self, key: &str, default: u64, range: RangeInclusive<u64>) -> Result<u64> {
        let secs = self.number(key, default)?;
        if !range.contains(&secs) {
            return Err(PaymentError::ConfigError(format!(
                "{key} must be between {} and {} seconds, got {secs}",
                range.start(),
                range.end()
            )));
        }
        Ok(secs)
    }
}
