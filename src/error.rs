use crate::domain::payment::PaymentId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PaymentError>;

#[derive(Error, Debug)]
pub enum PaymentError {
    /// Malformed purchase intent. The user is asked to retry.
    #[error("Validation error: {0}")]
    ValidationError(String),
    /// Payment method disabled, misconfigured, or unreachable at initiation.
    #[error("Payment method unavailable: {0}")]
    ProviderUnavailable(String),
    /// Settlement could not be established either way.
    #[error("Verification inconclusive: {0}")]
    VerificationInconclusive(String),
    /// Money has moved but the purchased service could not be granted.
    #[error("Payment {payment_id} settled but fulfillment failed: {reason}")]
    FulfillmentFailure { payment_id: PaymentId, reason: String },
    #[error("Payment {0} not found")]
    NotFound(PaymentId),
    #[error("Account service error: {0}")]
    Account(#[from] AccountError),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Store error: {0}")]
    StoreError(Box<dyn std::error::Error + Send + Sync>),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl PaymentError {
    pub fn store(message: impl Into<String>) -> Self {
        Self::StoreError(message.into().into())
    }
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for PaymentError {
    fn from(e: rocksdb::Error) -> Self {
        Self::StoreError(Box::new(e))
    }
}

/// Failures reported by the remote subscription backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccountError {
    #[error("account {0} not found")]
    NotFound(String),
    #[error("account {0} already exists")]
    AlreadyExists(String),
    #[error("account service rejected credentials")]
    Unauthorized,
    #[error("account service unreachable: {0}")]
    Transport(String),
    #[error("account service returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("{0} months is beyond the supported expiry range")]
    DurationOutOfRange(u32),
}

impl From<reqwest::Error> for AccountError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
