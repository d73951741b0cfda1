#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vpn_checkout::application::checkout::PurchaseRequest;
use vpn_checkout::application::engine::PaymentEngine;
use vpn_checkout::domain::payment::{
    Intent, PaymentMethod, PaymentRecord, SettlementState, UserId,
};
use vpn_checkout::domain::ports::{
    AccountService, Charge, PaymentProvider, extension_target,
};
use vpn_checkout::error::{AccountError, Result};
use vpn_checkout::infrastructure::in_memory::{InMemoryKeyStore, InMemoryPaymentStore};
use vpn_checkout::infrastructure::providers::ProviderRegistry;

/// Provider whose verification answers are queued up by the test.
///
/// Once the script runs out, the last answer repeats.
pub struct ScriptedProvider {
    method: PaymentMethod,
    script: Mutex<VecDeque<SettlementState>>,
    last: Mutex<SettlementState>,
    pub initiated: AtomicUsize,
    pub verified: AtomicUsize,
    verify_delay: Duration,
}

impl ScriptedProvider {
    pub fn new(method: PaymentMethod, script: &[SettlementState]) -> Self {
        Self {
            method,
            script: Mutex::new(script.iter().copied().collect()),
            last: Mutex::new(SettlementState::Pending),
            initiated: AtomicUsize::new(0),
            verified: AtomicUsize::new(0),
            verify_delay: Duration::ZERO,
        }
    }

    pub fn with_verify_delay(mut self, delay: Duration) -> Self {
        self.verify_delay = delay;
        self
    }
}

#[async_trait]
impl PaymentProvider for ScriptedProvider {
    fn method(&self) -> PaymentMethod {
        self.method
    }

    async fn initiate(&self, record: &PaymentRecord) -> Result<Charge> {
        self.initiated.fetch_add(1, Ordering::SeqCst);
        Ok(Charge::new(
            format!("ext-{}", record.id),
            format!("https://pay.example/{}", record.id),
        ))
    }

    async fn verify(&self, _record: &PaymentRecord) -> Result<SettlementState> {
        self.verified.fetch_add(1, Ordering::SeqCst);
        if !self.verify_delay.is_zero() {
            tokio::time::sleep(self.verify_delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(next) = next {
            *last = next;
        }
        Ok(*last)
    }
}

/// In-memory account backend that counts every mutating call.
///
/// Failures can be injected: `fail_next` makes the next mutating calls fail
/// without effect, `lose_next_response` applies the next mutation and then
/// reports a transport error, like a response lost on the wire.
#[derive(Default)]
pub struct CountingAccounts {
    pub accounts: Mutex<HashMap<String, DateTime<Utc>>>,
    pub provisions: AtomicUsize,
    pub extensions: AtomicUsize,
    fail_next: AtomicUsize,
    lose_next_response: AtomicUsize,
    call_delay: Mutex<Duration>,
}

impl CountingAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(self, name: &str, expiry: DateTime<Utc>) -> Self {
        self.accounts
            .lock()
            .unwrap()
            .insert(name.to_string(), expiry);
        self
    }

    pub fn fail_next(&self, calls: usize) {
        self.fail_next.store(calls, Ordering::SeqCst);
    }

    pub fn lose_next_response(&self) {
        self.lose_next_response.store(1, Ordering::SeqCst);
    }

    pub fn set_call_delay(&self, delay: Duration) {
        *self.call_delay.lock().unwrap() = delay;
    }

    pub fn expiry_of(&self, name: &str) -> Option<DateTime<Utc>> {
        self.accounts.lock().unwrap().get(name).copied()
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn pause(&self) {
        let delay = *self.call_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl AccountService for CountingAccounts {
    async fn provision(&self, account_id: &str, months: u32) -> std::result::Result<(), AccountError> {
        self.pause().await;
        if Self::take(&self.fail_next) {
            return Err(AccountError::Transport("connection refused".into()));
        }
        let expiry = extension_target(None, Utc::now(), months)
            .ok_or(AccountError::DurationOutOfRange(months))?;
        {
            let mut accounts = self.accounts.lock().unwrap();
            if accounts.contains_key(account_id) {
                return Err(AccountError::AlreadyExists(account_id.to_string()));
            }
            accounts.insert(account_id.to_string(), expiry);
        }
        self.provisions.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.lose_next_response) {
            return Err(AccountError::Transport("response lost".into()));
        }
        Ok(())
    }

    async fn expiry(&self, account_id: &str) -> std::result::Result<Option<DateTime<Utc>>, AccountError> {
        self.accounts
            .lock()
            .unwrap()
            .get(account_id)
            .copied()
            .map(Some)
            .ok_or_else(|| AccountError::NotFound(account_id.to_string()))
    }

    async fn extend_to(
        &self,
        account_id: &str,
        until: DateTime<Utc>,
    ) -> std::result::Result<(), AccountError> {
        self.pause().await;
        if Self::take(&self.fail_next) {
            return Err(AccountError::Transport("connection refused".into()));
        }
        {
            let mut accounts = self.accounts.lock().unwrap();
            let expiry = accounts
                .get_mut(account_id)
                .ok_or_else(|| AccountError::NotFound(account_id.to_string()))?;
            *expiry = until;
        }
        self.extensions.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.lose_next_response) {
            return Err(AccountError::Transport("response lost".into()));
        }
        Ok(())
    }

    async fn get_link(&self, account_id: &str) -> std::result::Result<Option<String>, AccountError> {
        Ok(self
            .accounts
            .lock()
            .unwrap()
            .contains_key(account_id)
            .then(|| format!("https://vpn.example/sub/{account_id}")))
    }
}

pub struct Harness {
    pub engine: PaymentEngine,
    pub store: InMemoryPaymentStore,
    pub keys: InMemoryKeyStore,
    pub provider: Arc<ScriptedProvider>,
    pub accounts: Arc<CountingAccounts>,
}

pub fn harness(provider: ScriptedProvider, accounts: CountingAccounts) -> Harness {
    let store = InMemoryPaymentStore::new();
    let keys = InMemoryKeyStore::new();
    let provider = Arc::new(provider);
    let accounts = Arc::new(accounts);

    let mut providers = ProviderRegistry::new();
    providers.register(provider.clone());
    let engine = PaymentEngine::new(
        Arc::new(store.clone()),
        Arc::new(keys.clone()),
        accounts.clone(),
        providers,
        TimeDelta::seconds(60),
    );

    Harness {
        engine,
        store,
        keys,
        provider,
        accounts,
    }
}

pub fn purchase(
    user_id: UserId,
    intent: Intent,
    amount: Decimal,
    months: u32,
    target: Option<&str>,
) -> PurchaseRequest {
    PurchaseRequest {
        user_id,
        intent,
        amount,
        duration_months: months,
        target_account: target.map(str::to_string),
    }
}
