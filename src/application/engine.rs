use super::account_locks::AccountLocks;
use super::checkout::{Checkout, PurchaseRequest};
use super::fulfillment::FulfillmentDispatcher;
use super::redemption::KeyRedemption;
use super::reply::Reply;
use crate::domain::key::ActivationKey;
use crate::domain::payment::{
    MAX_DURATION_MONTHS, PaymentId, PaymentMethod, PaymentRecord, PaymentStatus, UserId,
};
use crate::domain::ports::{AccountServiceRef, KeyStoreRef, PaymentStoreRef};
use crate::domain::summary::PaymentSummary;
use crate::error::{PaymentError, Result};
use crate::infrastructure::providers::ProviderRegistry;
use chrono::TimeDelta;
use tracing::{info, warn};

/// The entry point the conversational front-end calls in-process.
///
/// `PaymentEngine` wires the checkout, fulfillment and key redemption flows to
/// one set of stores, the account service and the enabled providers. Methods
/// return a [`Reply`] for every outcome the user should see; an `Err` means
/// the store itself failed and the operation was abandoned.
#[derive(Clone)]
pub struct PaymentEngine {
    store: PaymentStoreRef,
    keys: KeyStoreRef,
    providers: ProviderRegistry,
    checkout: Checkout,
    dispatcher: FulfillmentDispatcher,
    redemption: KeyRedemption,
}

impl PaymentEngine {
    /// Creates a new `PaymentEngine` instance.
    ///
    /// # Arguments
    ///
    /// * `store` - The payment record store.
    /// * `keys` - The activation key store.
    /// * `accounts` - The remote account service.
    /// * `providers` - The enabled payment processors.
    /// * `lease` - How long one fulfillment attempt may hold a record.
    pub fn new(
        store: PaymentStoreRef,
        keys: KeyStoreRef,
        accounts: AccountServiceRef,
        providers: ProviderRegistry,
        lease: TimeDelta,
    ) -> Self {
        let account_locks = AccountLocks::new();
        Self {
            checkout: Checkout::new(store.clone(), providers.clone()),
            dispatcher: FulfillmentDispatcher::new(
                store.clone(),
                keys.clone(),
                accounts.clone(),
                providers.clone(),
                account_locks.clone(),
                lease,
            ),
            redemption: KeyRedemption::new(keys.clone(), accounts, account_locks),
            store,
            keys,
            providers,
        }
    }

    /// Payment methods the front-end may offer.
    pub fn available_methods(&self) -> Vec<PaymentMethod> {
        self.providers.available_methods()
    }

    pub async fn checkout(&self, request: PurchaseRequest, method: PaymentMethod) -> Result<Reply> {
        user_facing(self.checkout.start(request, method).await)
    }

    /// Verifies one payment with its processor and fulfills or rejects it.
    pub async fn check(&self, id: PaymentId) -> Result<Reply> {
        user_facing(self.dispatcher.check(id).await)
    }

    /// Fulfills a payment already known to be settled.
    pub async fn fulfill(&self, id: PaymentId) -> Result<Reply> {
        self.dispatcher.fulfill(id).await
    }

    /// Re-checks every pending payment, oldest first.
    ///
    /// A failure on one record is logged and reported in its slot; the sweep
    /// carries on with the rest.
    pub async fn reconcile(&self) -> Result<Vec<(PaymentId, Result<Reply>)>> {
        let pending = self.store.list(Some(PaymentStatus::Pending)).await?;
        info!(count = pending.len(), "Reconciling pending payments");

        let mut outcomes = Vec::with_capacity(pending.len());
        for record in pending {
            let outcome = self.check(record.id).await;
            if let Err(e) = &outcome {
                warn!(payment_id = %record.id, error = %e, "Reconciliation failed for payment");
            }
            outcomes.push((record.id, outcome));
        }
        Ok(outcomes)
    }

    pub async fn payment(&self, id: PaymentId) -> Result<PaymentRecord> {
        self.store.get(id).await?.ok_or(PaymentError::NotFound(id))
    }

    pub async fn list(&self, status: Option<PaymentStatus>) -> Result<Vec<PaymentRecord>> {
        self.store.list(status).await
    }

    pub async fn summary(&self) -> Result<PaymentSummary> {
        let records = self.store.list(None).await?;
        Ok(PaymentSummary::from_records(&records))
    }

    pub async fn redeem(
        &self,
        code: &str,
        user_id: UserId,
        existing_account: Option<&str>,
    ) -> Result<Reply> {
        self.redemption.redeem(code, user_id, existing_account).await
    }

    /// Issues a key outside of a purchase, e.g. for a giveaway.
    pub async fn issue_key(&self, months: u32, uses: u32) -> Result<ActivationKey> {
        if !(1..=MAX_DURATION_MONTHS).contains(&months) || uses < 1 {
            return Err(PaymentError::ValidationError(format!(
                "a key needs 1 to {MAX_DURATION_MONTHS} months and at least one use"
            )));
        }
        self.keys.issue(months, uses).await
    }
}

/// Converts errors the user can act on into replies.
fn user_facing(result: Result<Reply>) -> Result<Reply> {
    match result {
        Err(PaymentError::ValidationError(reason)) => Ok(Reply::ValidationRetry { reason }),
        Err(PaymentError::ProviderUnavailable(reason)) => {
            Ok(Reply::MethodUnavailable { reason })
        }
        other => other,
    }
}
