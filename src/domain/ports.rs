use super::key::ActivationKey;
use super::payment::{
    Claim, Metadata, NewPayment, PaymentId, PaymentMethod, PaymentRecord, PaymentStatus,
    SettlementState, StatusChange, UserId, keys,
};
use crate::error::{AccountError, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;

/// Durable table of payment attempts; the single source of truth for settlement.
///
/// Every mutation is durable before the call returns.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Inserts a new record with `status = pending`.
    async fn create(&self, payment: NewPayment) -> Result<PaymentId>;

    async fn get(&self, id: PaymentId) -> Result<Option<PaymentRecord>>;

    /// Moves a pending record to a terminal status.
    ///
    /// Requests against an already terminal record are no-ops reported as
    /// [`StatusChange::Unchanged`]; they never fail and never alter the record.
    async fn set_status(&self, id: PaymentId, new_status: PaymentStatus) -> Result<StatusChange>;

    /// Shallow-merges `patch` into the stored metadata.
    async fn merge_metadata(&self, id: PaymentId, patch: Metadata) -> Result<()>;

    /// Compare-and-set on the fulfillment lease; see [`PaymentRecord::apply_claim`].
    async fn claim_fulfillment(
        &self,
        id: PaymentId,
        now: DateTime<Utc>,
        lease: TimeDelta,
    ) -> Result<Claim>;

    async fn release_claim(&self, id: PaymentId) -> Result<()>;

    /// All records, optionally filtered by status, ordered by id.
    async fn list(&self, status: Option<PaymentStatus>) -> Result<Vec<PaymentRecord>>;
}

#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Creates a fresh key with a unique code.
    async fn issue(&self, months: u32, uses: u32) -> Result<ActivationKey>;
    async fn get(&self, code: &str) -> Result<Option<ActivationKey>>;
    /// Atomically spends one use; `None` if the code is unknown or exhausted.
    async fn consume(&self, code: &str, user_id: UserId) -> Result<Option<u32>>;
}

/// Length of a "month" of service on the account backend.
pub fn months_to_duration(months: u32) -> Option<TimeDelta> {
    TimeDelta::try_days(30 * i64::from(months))
}

/// Where an extension of `months` lands, starting from the later of the current
/// expiry and `now`. `None` when the result is not a representable instant.
pub fn extension_target(
    current: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    months: u32,
) -> Option<DateTime<Utc>> {
    let base = current.filter(|expiry| *expiry > now).unwrap_or(now);
    base.checked_add_signed(months_to_duration(months)?)
}

/// Remote backend that owns the actual VPN accounts.
#[async_trait]
pub trait AccountService: Send + Sync {
    async fn provision(&self, account_id: &str, months: u32) -> std::result::Result<(), AccountError>;

    /// Current expiry; `None` means the account does not expire.
    async fn expiry(&self, account_id: &str)
    -> std::result::Result<Option<DateTime<Utc>>, AccountError>;

    /// Sets an absolute expiry. Repeating the call with the same instant is harmless.
    async fn extend_to(
        &self,
        account_id: &str,
        until: DateTime<Utc>,
    ) -> std::result::Result<(), AccountError>;

    async fn get_link(&self, account_id: &str) -> std::result::Result<Option<String>, AccountError>;

    /// Adds `months` to the account. Not idempotent: callers that may retry should
    /// compute a target with [`extension_target`] once and use [`Self::extend_to`].
    async fn extend(&self, account_id: &str, months: u32) -> std::result::Result<(), AccountError> {
        let current = self.expiry(account_id).await?;
        let target = extension_target(current, Utc::now(), months)
            .ok_or(AccountError::DurationOutOfRange(months))?;
        self.extend_to(account_id, target).await
    }
}

/// What a processor handed back when a charge was created.
#[derive(Debug, Clone, PartialEq)]
pub struct Charge {
    /// Opaque identifier used later to query the processor.
    pub reference: String,
    /// Where the user goes to pay.
    pub url: String,
    /// Adapter-specific extras to persist with the record.
    pub extra: Metadata,
}

impl Charge {
    pub fn new(reference: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            url: url.into(),
            extra: Metadata::new(),
        }
    }

    /// Metadata patch the caller persists after initiation.
    pub fn into_metadata(self, method: PaymentMethod) -> Metadata {
        let mut patch = self.extra;
        patch.insert(keys::VIA, method.as_str());
        patch.insert(keys::PROVIDER_REFERENCE, self.reference);
        patch.insert(keys::PAYMENT_URL, self.url);
        patch
    }
}

/// One external payment processor.
///
/// `verify` must be free of side effects on the processor and must report an
/// unreachable processor as [`SettlementState::Pending`].
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn method(&self) -> PaymentMethod;

    async fn initiate(&self, record: &PaymentRecord) -> Result<Charge>;

    async fn verify(&self, record: &PaymentRecord) -> Result<SettlementState>;
}

pub type PaymentStoreRef = Arc<dyn PaymentStore>;
pub type KeyStoreRef = Arc<dyn KeyStore>;
pub type AccountServiceRef = Arc<dyn AccountService>;
pub type PaymentProviderRef = Arc<dyn PaymentProvider>;
