use crate::error::PaymentError;
use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Chat-platform identifier of the paying user.
pub type UserId = i64;

/// Opaque payment identifier assigned by the store at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentId(pub u64);

impl fmt::Display for PaymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PaymentId {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|_| PaymentError::ValidationError(format!("invalid payment id: {s}")))
    }
}

/// Longest subscription period a single purchase or key may carry.
pub const MAX_DURATION_MONTHS: u32 = 120;

/// Represents a positive monetary amount to be charged.
///
/// This is a wrapper around `rust_decimal::Decimal` that guarantees the value is
/// strictly positive and has at most [`Amount::SCALE`] decimal places, so the
/// stored amount is exactly the sum every processor invoices.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub const SCALE: u32 = 2;

    pub fn new(value: Decimal) -> Result<Self, PaymentError> {
        if value <= Decimal::ZERO {
            return Err(PaymentError::ValidationError(
                "Amount must be positive".to_string(),
            ));
        }
        if value.normalize().scale() > Self::SCALE {
            return Err(PaymentError::ValidationError(format!(
                "Amount must have at most {} decimal places",
                Self::SCALE
            )));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Two-decimal rendering expected by processors (`"299.00"`).
    pub fn to_minor_string(&self) -> String {
        format!("{:.2}", self.0)
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = PaymentError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_minor_string())
    }
}

/// What the user is paying for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    #[serde(alias = "new")]
    NewSubscription,
    #[serde(alias = "renew")]
    Renewal,
    #[serde(alias = "key")]
    KeyPurchase,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::NewSubscription => "new_subscription",
            Intent::Renewal => "renewal",
            Intent::KeyPurchase => "key_purchase",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Intent {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "new_subscription" | "new" => Ok(Intent::NewSubscription),
            "renewal" | "renew" => Ok(Intent::Renewal),
            "key_purchase" | "key" => Ok(Intent::KeyPurchase),
            other => Err(PaymentError::ValidationError(format!(
                "unknown purchase intent: {other}"
            ))),
        }
    }
}

/// Local settlement status. Leaves `Pending` at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Approved,
    Rejected,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Approved => "approved",
            PaymentStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(PaymentStatus::Pending),
            "approved" => Ok(PaymentStatus::Approved),
            "rejected" => Ok(PaymentStatus::Rejected),
            other => Err(PaymentError::ValidationError(format!(
                "unknown payment status: {other}"
            ))),
        }
    }
}

/// A processor's verdict mapped onto the three outcomes we act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementState {
    Settled,
    Pending,
    Failed,
}

/// External payment processors we know how to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    YooKassa,
    YooMoney,
    CryptoBot,
}

impl PaymentMethod {
    pub const ALL: [PaymentMethod; 3] = [
        PaymentMethod::YooKassa,
        PaymentMethod::YooMoney,
        PaymentMethod::CryptoBot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::YooKassa => "yookassa",
            PaymentMethod::YooMoney => "yoomoney",
            PaymentMethod::CryptoBot => "cryptobot",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            PaymentMethod::YooKassa => "YooKassa",
            PaymentMethod::YooMoney => "YooMoney",
            PaymentMethod::CryptoBot => "CryptoBot",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PaymentMethod::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PaymentError::ProviderUnavailable(format!("unknown method: {s}")))
    }
}

/// Well-known metadata keys. Adapters may add their own.
pub mod keys {
    pub const VIA: &str = "via";
    pub const PROVIDER_REFERENCE: &str = "provider_reference";
    pub const PRODUCT_NAME: &str = "product_name";
    pub const PRODUCT_DESC: &str = "product_desc";
    pub const PAYMENT_URL: &str = "payment_url";
    pub const KEY_CODE: &str = "key_code";
    pub const RENEW_FROM: &str = "renew_from";
    pub const RENEW_UNTIL: &str = "renew_until";
    pub const ACCOUNT: &str = "account";
}

/// Open key-value bag persisted alongside a payment.
///
/// Providers and intents vary independently, so anything specific to one of them
/// lives here instead of in a dedicated column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(Map<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Shallow merge: keys in `patch` overwrite, every other key is kept.
    pub fn merge(&mut self, patch: Metadata) {
        self.0.extend(patch.0);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Metadata {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Typed input for creating a payment record.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPayment {
    pub user_id: UserId,
    pub intent: Intent,
    pub amount: Amount,
    pub duration_months: u32,
    pub target_account: Option<String>,
    pub metadata: Metadata,
}

/// A single payment attempt. The store is the only owner; everything else refers
/// to it by [`PaymentId`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: PaymentId,
    pub user_id: UserId,
    pub intent: Intent,
    pub amount: Amount,
    pub status: PaymentStatus,
    pub target_account: Option<String>,
    pub duration_months: u32,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    /// How many times fulfillment has been claimed for this record.
    #[serde(default)]
    pub fulfillment_attempts: u32,
    /// Lease held by an in-flight fulfillment.
    #[serde(default)]
    pub claimed_until: Option<DateTime<Utc>>,
}

impl PaymentRecord {
    pub fn new(id: PaymentId, payment: NewPayment, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            user_id: payment.user_id,
            intent: payment.intent,
            amount: payment.amount,
            status: PaymentStatus::Pending,
            target_account: payment.target_account,
            duration_months: payment.duration_months,
            metadata: payment.metadata,
            created_at,
            fulfillment_attempts: 0,
            claimed_until: None,
        }
    }

    pub fn provider_reference(&self) -> Option<&str> {
        self.metadata.get_str(keys::PROVIDER_REFERENCE)
    }

    /// Processor the charge was initiated with, if any.
    pub fn method(&self) -> Option<PaymentMethod> {
        self.metadata
            .get_str(keys::VIA)
            .and_then(|via| via.parse().ok())
    }

    pub fn product_name(&self) -> Option<&str> {
        self.metadata.get_str(keys::PRODUCT_NAME)
    }

    pub fn is_claimed_at(&self, now: DateTime<Utc>) -> bool {
        self.claimed_until.is_some_and(|until| until > now)
    }
}

/// Outcome of a status update request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    Applied,
    /// The record was already terminal (or the request was a no-op); it keeps this status.
    Unchanged(PaymentStatus),
}

/// Outcome of trying to take the fulfillment lease on a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// The caller owns the lease; the record reflects the incremented attempt counter.
    Claimed(PaymentRecord),
    /// Another fulfillment holds the lease.
    Busy { until: DateTime<Utc> },
    /// Nothing left to fulfill.
    Finalized(PaymentStatus),
}

impl PaymentRecord {
    /// One-way valve: only `Pending` may move, and only to a terminal status.
    ///
    /// Every store backend applies this under its own write serialization so two
    /// racing callers agree on a single winner.
    pub fn apply_status(&mut self, new_status: PaymentStatus) -> StatusChange {
        if self.status.is_terminal() || !new_status.is_terminal() {
            return StatusChange::Unchanged(self.status);
        }
        self.status = new_status;
        self.claimed_until = None;
        StatusChange::Applied
    }

    pub fn apply_claim(&mut self, now: DateTime<Utc>, lease: TimeDelta) -> Claim {
        if self.status.is_terminal() {
            return Claim::Finalized(self.status);
        }
        if let Some(until) = self.claimed_until
            && until > now
        {
            return Claim::Busy { until };
        }
        self.claimed_until = Some(now + lease);
        self.fulfillment_attempts += 1;
        Claim::Claimed(self.clone())
    }
}
