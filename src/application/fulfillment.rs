//! Turns settled payments into granted service, at most once per record.
//!
//! Duplicate triggers are filtered by the store's fulfillment lease; retries
//! after a failure are made safe per intent:
//!
//! * renewal: a plan holding the expiry it starts from (`renew_from`) and the
//!   absolute target (`renew_until`) is persisted before the account service is
//!   called. A retry reads the current expiry: at the target means the earlier
//!   attempt landed, at the start means the target is sent again, anything
//!   else means the plan is redone. Before planning, renewals of the same
//!   account planned by other payments are completed first, so every plan
//!   starts from a known expiry.
//! * new subscription: the account id is derived from the user and payment ids,
//!   so "already exists" on a retry means an earlier attempt succeeded.
//! * key purchase: the issued code is persisted under `key_code` and
//!   re-delivered instead of issuing another one.

use super::account_locks::AccountLocks;
use super::reply::{Grant, Reply};
use crate::domain::payment::{
    Claim, Intent, Metadata, PaymentId, PaymentRecord, PaymentStatus, SettlementState,
    StatusChange, keys,
};
use crate::domain::ports::{
    AccountServiceRef, KeyStoreRef, PaymentStoreRef, extension_target,
};
use crate::error::{AccountError, PaymentError, Result};
use crate::infrastructure::providers::ProviderRegistry;
use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use serde_json::Value;
use tracing::{error, info, warn};

/// Account id for a subscription bought with payment `record`.
pub fn paid_account_id(record: &PaymentRecord) -> String {
    format!("paid_{}_{}", record.user_id, record.id)
}

fn already_final(payment_id: PaymentId, status: PaymentStatus) -> Reply {
    match status {
        PaymentStatus::Approved => Reply::AlreadyApproved { payment_id },
        PaymentStatus::Rejected => Reply::AlreadyRejected { payment_id },
        PaymentStatus::Pending => Reply::InProgress { payment_id },
    }
}

/// Expiry change a renewal committed to before calling the account service.
#[derive(Debug, Clone, Copy, PartialEq)]
struct RenewalPlan {
    /// Expiry observed when planning; the inner `None` is an account without
    /// expiry. The outer `None` is a plan stored before the start was recorded.
    from: Option<Option<DateTime<Utc>>>,
    until: DateTime<Utc>,
}

impl RenewalPlan {
    fn compute(current: Option<DateTime<Utc>>, now: DateTime<Utc>, months: u32) -> Option<Self> {
        // The panel keeps whole seconds.
        let until = extension_target(current, now, months)?.trunc_subsecs(0);
        Some(Self {
            from: Some(current),
            until,
        })
    }

    fn stored(record: &PaymentRecord) -> Option<Self> {
        let until = parse_instant(record.metadata.get_str(keys::RENEW_UNTIL)?)?;
        let from = match record.metadata.get(keys::RENEW_FROM) {
            Some(Value::Null) => Some(None),
            Some(Value::String(raw)) => parse_instant(raw).map(Some),
            _ => None,
        };
        Some(Self { from, until })
    }

    fn to_metadata(self) -> Metadata {
        Metadata::new()
            .with(
                keys::RENEW_FROM,
                self.from.flatten().map(|from| from.to_rfc3339()),
            )
            .with(keys::RENEW_UNTIL, self.until.to_rfc3339())
    }
}

fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|instant| instant.with_timezone(&Utc))
}

#[derive(Clone)]
pub struct FulfillmentDispatcher {
    store: PaymentStoreRef,
    keys: KeyStoreRef,
    accounts: AccountServiceRef,
    providers: ProviderRegistry,
    account_locks: AccountLocks,
    lease: TimeDelta,
}

impl FulfillmentDispatcher {
    pub fn new(
        store: PaymentStoreRef,
        keys: KeyStoreRef,
        accounts: AccountServiceRef,
        providers: ProviderRegistry,
        account_locks: AccountLocks,
        lease: TimeDelta,
    ) -> Self {
        Self {
            store,
            keys,
            accounts,
            providers,
            account_locks,
            lease,
        }
    }

    async fn load(&self, id: PaymentId) -> Result<PaymentRecord> {
        self.store.get(id).await?.ok_or(PaymentError::NotFound(id))
    }

    async fn release(&self, id: PaymentId) {
        if let Err(e) = self.store.release_claim(id).await {
            error!(payment_id = %id, error = %e, "Could not release fulfillment lease");
        }
    }

    /// Asks the processor about `id` and acts on the answer.
    ///
    /// Terminal records are answered from the store without contacting the
    /// processor. An inconclusive verification leaves the record untouched.
    pub async fn check(&self, id: PaymentId) -> Result<Reply> {
        let record = self.load(id).await?;
        if record.status.is_terminal() {
            return Ok(already_final(id, record.status));
        }

        let method = record.method().ok_or_else(|| {
            PaymentError::ProviderUnavailable(format!("payment {id} has no payment method"))
        })?;
        let provider = self.providers.get(method)?;

        match provider.verify(&record).await {
            Ok(SettlementState::Settled) => {
                info!(payment_id = %id, %method, "Payment settled");
                self.fulfill(id).await
            }
            Ok(SettlementState::Failed) => {
                info!(payment_id = %id, %method, "Payment failed at processor");
                self.reject(id).await
            }
            Ok(SettlementState::Pending) => Ok(Reply::NotYetConfirmed { payment_id: id }),
            Err(PaymentError::VerificationInconclusive(reason)) => {
                warn!(payment_id = %id, %method, %reason, "Verification inconclusive");
                Ok(Reply::NotYetConfirmed { payment_id: id })
            }
            Err(e) => Err(e),
        }
    }

    /// Grants the purchased service for a settled payment and approves it.
    ///
    /// Safe to call repeatedly: only a caller holding the lease dispatches,
    /// and a terminal record is a no-op. On failure the record stays
    /// `pending` and the lease is released for a later retry.
    pub async fn fulfill(&self, id: PaymentId) -> Result<Reply> {
        let record = match self
            .store
            .claim_fulfillment(id, Utc::now(), self.lease)
            .await?
        {
            Claim::Claimed(record) => record,
            Claim::Busy { until } => {
                info!(payment_id = %id, %until, "Fulfillment already in progress");
                return Ok(Reply::InProgress { payment_id: id });
            }
            Claim::Finalized(status) => return Ok(already_final(id, status)),
        };
        info!(payment_id = %id, intent = %record.intent, attempt = record.fulfillment_attempts, "Fulfilling payment");

        let grant = match self.dispatch(&record).await {
            Ok(grant) => grant,
            Err(e) => {
                self.release(id).await;
                return match e {
                    PaymentError::FulfillmentFailure { payment_id, reason } => {
                        error!(%payment_id, %reason, "Payment settled but fulfillment failed");
                        Ok(Reply::FulfillmentFailed { payment_id, reason })
                    }
                    other => Err(other),
                };
            }
        };

        let change = match self.store.set_status(id, PaymentStatus::Approved).await {
            Ok(change) => change,
            Err(e) => {
                self.release(id).await;
                return Err(e);
            }
        };
        match change {
            StatusChange::Applied => {
                info!(payment_id = %id, "Payment approved");
                Ok(Reply::Approved {
                    payment_id: id,
                    grant,
                })
            }
            StatusChange::Unchanged(status) => {
                warn!(payment_id = %id, %status, "Record left pending while fulfillment held the lease");
                Ok(already_final(id, status))
            }
        }
    }

    /// Marks a payment the processor declined. No provisioning happens.
    pub async fn reject(&self, id: PaymentId) -> Result<Reply> {
        match self.store.set_status(id, PaymentStatus::Rejected).await? {
            StatusChange::Applied => {
                info!(payment_id = %id, "Payment rejected");
                Ok(Reply::Rejected { payment_id: id })
            }
            StatusChange::Unchanged(status) => Ok(already_final(id, status)),
        }
    }

    async fn dispatch(&self, record: &PaymentRecord) -> Result<Grant> {
        match record.intent {
            Intent::NewSubscription => self.provision_new(record).await,
            Intent::Renewal => self.renew(record).await,
            Intent::KeyPurchase => self.issue_key(record).await,
        }
    }

    async fn provision_new(&self, record: &PaymentRecord) -> Result<Grant> {
        let account = paid_account_id(record);
        let months = record.duration_months;

        match self.accounts.provision(&account, months).await {
            Ok(()) => {}
            Err(AccountError::AlreadyExists(_)) => {
                info!(payment_id = %record.id, %account, "Account already provisioned by an earlier attempt");
            }
            Err(e) => return Err(failure(record, e)),
        }
        self.store
            .merge_metadata(record.id, Metadata::new().with(keys::ACCOUNT, account.as_str()))
            .await?;

        let link = self.link(record, &account).await;
        Ok(Grant::NewAccount {
            account,
            months,
            link,
        })
    }

    async fn renew(&self, record: &PaymentRecord) -> Result<Grant> {
        let account = record.target_account.clone().ok_or_else(|| {
            PaymentError::FulfillmentFailure {
                payment_id: record.id,
                reason: "renewal without a target account".to_string(),
            }
        })?;
        let months = record.duration_months;

        let until = {
            let _serial = self.account_locks.lock(&account).await;
            self.complete_planned_renewals(record, &account).await?;
            self.apply_renewal(record, &account).await?
        };

        let link = self.link(record, &account).await;
        Ok(Grant::Renewed {
            account,
            months,
            until,
            link,
        })
    }

    /// Brings `account` to the expiry `record` paid for. Caller holds the
    /// account lock.
    async fn apply_renewal(&self, record: &PaymentRecord, account: &str) -> Result<DateTime<Utc>> {
        let months = record.duration_months;
        let current = self
            .accounts
            .expiry(account)
            .await
            .map_err(|e| failure(record, e))?;

        let plan = match RenewalPlan::stored(record) {
            Some(plan) if current == Some(plan.until) => {
                info!(payment_id = %record.id, %account, until = %plan.until, "Renewal already applied by an earlier attempt");
                return Ok(plan.until);
            }
            Some(plan) if plan.from == Some(current) => {
                info!(payment_id = %record.id, %account, until = %plan.until, "Re-sending stored renewal target");
                plan
            }
            stored => {
                if stored.is_some() {
                    warn!(payment_id = %record.id, %account, "Account expiry moved since the renewal was planned; planning again");
                }
                let plan = RenewalPlan::compute(current, Utc::now(), months)
                    .ok_or_else(|| failure(record, AccountError::DurationOutOfRange(months)))?;
                self.store
                    .merge_metadata(record.id, plan.to_metadata())
                    .await?;
                plan
            }
        };

        self.accounts
            .extend_to(account, plan.until)
            .await
            .map_err(|e| failure(record, e))?;
        Ok(plan.until)
    }

    /// Finishes renewals of `account` that other settled payments planned but
    /// never confirmed. Caller holds the account lock.
    async fn complete_planned_renewals(&self, record: &PaymentRecord, account: &str) -> Result<()> {
        let planned: Vec<PaymentId> = self
            .store
            .list(Some(PaymentStatus::Pending))
            .await?
            .into_iter()
            .filter(|other| {
                other.id != record.id
                    && other.intent == Intent::Renewal
                    && other.target_account.as_deref() == Some(account)
                    && other.metadata.contains_key(keys::RENEW_UNTIL)
            })
            .map(|other| other.id)
            .collect();

        for id in planned {
            let other = match self.store.claim_fulfillment(id, Utc::now(), self.lease).await? {
                Claim::Claimed(other) => other,
                Claim::Finalized(_) => continue,
                Claim::Busy { .. } => {
                    return Err(PaymentError::FulfillmentFailure {
                        payment_id: record.id,
                        reason: format!("renewal #{id} of {account} is still in progress"),
                    });
                }
            };

            let outcome = match self.apply_renewal(&other, account).await {
                Ok(_) => self.store.set_status(id, PaymentStatus::Approved).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(_) => {
                    info!(payment_id = %id, completed_by = %record.id, %account, "Completed earlier planned renewal");
                }
                Err(e) => {
                    self.release(id).await;
                    return Err(match e {
                        PaymentError::FulfillmentFailure { reason, .. } => {
                            PaymentError::FulfillmentFailure {
                                payment_id: record.id,
                                reason: format!("earlier renewal #{id} could not be completed: {reason}"),
                            }
                        }
                        other => other,
                    });
                }
            }
        }
        Ok(())
    }

    async fn issue_key(&self, record: &PaymentRecord) -> Result<Grant> {
        let months = record.duration_months;
        if let Some(code) = record.metadata.get_str(keys::KEY_CODE) {
            info!(payment_id = %record.id, "Re-delivering previously issued key");
            return Ok(Grant::Key {
                code: code.to_string(),
                months,
            });
        }

        let key = self.keys.issue(months, 1).await?;
        self.store
            .merge_metadata(record.id, Metadata::new().with(keys::KEY_CODE, key.code.as_str()))
            .await?;
        info!(payment_id = %record.id, months, "Issued activation key");
        Ok(Grant::Key {
            code: key.code,
            months,
        })
    }

    /// Access link; a failure here does not undo the grant.
    async fn link(&self, record: &PaymentRecord, account: &str) -> Option<String> {
        match self.accounts.get_link(account).await {
            Ok(link) => link,
            Err(e) => {
                warn!(payment_id = %record.id, %account, error = %e, "Could not fetch access link");
                None
            }
        }
    }
}

fn failure(record: &PaymentRecord, e: AccountError) -> PaymentError {
    PaymentError::FulfillmentFailure {
        payment_id: record.id,
        reason: e.to_string(),
    }
}
