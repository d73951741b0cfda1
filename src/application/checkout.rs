use super::reply::Reply;
use crate::domain::payment::{
    Amount, Intent, MAX_DURATION_MONTHS, Metadata, NewPayment, PaymentMethod, UserId, keys,
};
use crate::domain::ports::PaymentStoreRef;
use crate::domain::product::{ProductDescription, describe};
use crate::error::{PaymentError, Result};
use crate::infrastructure::providers::ProviderRegistry;
use rust_decimal::Decimal;
use tracing::{info, warn};

/// Purchase parameters already extracted from the conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct PurchaseRequest {
    pub user_id: UserId,
    pub intent: Intent,
    pub amount: Decimal,
    pub duration_months: u32,
    pub target_account: Option<String>,
}

impl PurchaseRequest {
    /// Checks the request and turns it into the store's typed input.
    ///
    /// `target_account` is kept only for renewals, where it must be non-blank.
    pub fn validate(self) -> Result<NewPayment> {
        let amount = Amount::new(self.amount)?;
        if !(1..=MAX_DURATION_MONTHS).contains(&self.duration_months) {
            return Err(PaymentError::ValidationError(format!(
                "duration must be between 1 and {MAX_DURATION_MONTHS} months"
            )));
        }

        let target_account = match self.intent {
            Intent::Renewal => {
                let target = self
                    .target_account
                    .as_deref()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| {
                        PaymentError::ValidationError(
                            "renewal needs the subscription to extend".to_string(),
                        )
                    })?;
                Some(target.to_string())
            }
            Intent::NewSubscription | Intent::KeyPurchase => None,
        };

        let product = describe(self.intent, self.duration_months, target_account.as_deref());
        Ok(NewPayment {
            user_id: self.user_id,
            intent: self.intent,
            amount,
            duration_months: self.duration_months,
            target_account,
            metadata: Metadata::new()
                .with(keys::PRODUCT_NAME, product.name)
                .with(keys::PRODUCT_DESC, product.description),
        })
    }
}

/// Creates pending records and hands them to the chosen processor.
#[derive(Clone)]
pub struct Checkout {
    store: PaymentStoreRef,
    providers: ProviderRegistry,
}

impl Checkout {
    pub fn new(store: PaymentStoreRef, providers: ProviderRegistry) -> Self {
        Self { store, providers }
    }

    /// Validates `request`, records it, and initiates a charge with `method`.
    ///
    /// A disabled method is refused before anything is stored. When the
    /// processor fails at initiation the record stays `pending` without a
    /// provider reference; no charge exists for it.
    pub async fn start(&self, request: PurchaseRequest, method: PaymentMethod) -> Result<Reply> {
        let provider = self.providers.get(method)?;
        let mut payment = request.validate()?;
        payment.metadata.insert(keys::VIA, method.as_str());

        let id = self.store.create(payment).await?;
        let record = self
            .store
            .get(id)
            .await?
            .ok_or(PaymentError::NotFound(id))?;
        info!(payment_id = %id, user_id = record.user_id, intent = %record.intent, %method, "Created pending payment");

        let charge = match provider.initiate(&record).await {
            Ok(charge) => charge,
            Err(e) => {
                warn!(payment_id = %id, %method, error = %e, "Charge initiation failed");
                return Err(e);
            }
        };
        let url = charge.url.clone();
        self.store
            .merge_metadata(id, charge.into_metadata(method))
            .await?;

        let product = ProductDescription::for_record(&record);
        Ok(Reply::Invoice {
            payment_id: id,
            method,
            title: product.name,
            description: product.description,
            amount: record.amount,
            url,
        })
    }
}
