use crate::domain::key::{ActivationKey, generate_code};
use crate::domain::payment::{
    Claim, Metadata, NewPayment, PaymentId, PaymentRecord, PaymentStatus, StatusChange, UserId,
};
use crate::domain::ports::{KeyStore, PaymentStore};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct PaymentTable {
    records: BTreeMap<PaymentId, PaymentRecord>,
    last_id: u64,
}

/// A thread-safe in-memory payment table.
///
/// Every read-modify-write happens under the write lock, so status transitions and
/// fulfillment claims are atomic with respect to each other.
/// Ideal for testing or for a front-end that does not need durability.
#[derive(Default, Clone)]
pub struct InMemoryPaymentStore {
    table: Arc<RwLock<PaymentTable>>,
}

impl InMemoryPaymentStore {
    /// Creates a new, empty in-memory payment store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn create(&self, payment: NewPayment) -> Result<PaymentId> {
        let mut table = self.table.write().await;
        table.last_id += 1;
        let id = PaymentId(table.last_id);
        table
            .records
            .insert(id, PaymentRecord::new(id, payment, Utc::now()));
        Ok(id)
    }

    async fn get(&self, id: PaymentId) -> Result<Option<PaymentRecord>> {
        let table = self.table.read().await;
        Ok(table.records.get(&id).cloned())
    }

    async fn set_status(&self, id: PaymentId, new_status: PaymentStatus) -> Result<StatusChange> {
        let mut table = self.table.write().await;
        let record = table
            .records
            .get_mut(&id)
            .ok_or(PaymentError::NotFound(id))?;
        Ok(record.apply_status(new_status))
    }

    async fn merge_metadata(&self, id: PaymentId, patch: Metadata) -> Result<()> {
        let mut table = self.table.write().await;
        let record = table
            .records
            .get_mut(&id)
            .ok_or(PaymentError::NotFound(id))?;
        record.metadata.merge(patch);
        Ok(())
    }

    async fn claim_fulfillment(
        &self,
        id: PaymentId,
        now: DateTime<Utc>,
        lease: TimeDelta,
    ) -> Result<Claim> {
        let mut table = self.table.write().await;
        let record = table
            .records
            .get_mut(&id)
            .ok_or(PaymentError::NotFound(id))?;
        Ok(record.apply_claim(now, lease))
    }

    async fn release_claim(&self, id: PaymentId) -> Result<()> {
        let mut table = self.table.write().await;
        if let Some(record) = table.records.get_mut(&id) {
            record.claimed_until = None;
        }
        Ok(())
    }

    async fn list(&self, status: Option<PaymentStatus>) -> Result<Vec<PaymentRecord>> {
        let table = self.table.read().await;
        Ok(table
            .records
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect())
    }
}

/// A thread-safe in-memory store for activation keys.
#[derive(Default, Clone)]
pub struct InMemoryKeyStore {
    keys: Arc<RwLock<HashMap<String, ActivationKey>>>,
}

impl InMemoryKeyStore {
    /// Creates a new, empty in-memory key store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn issue(&self, months: u32, uses: u32) -> Result<ActivationKey> {
        let mut keys = self.keys.write().await;
        let code = loop {
            let candidate = generate_code();
            if !keys.contains_key(&candidate) {
                break candidate;
            }
        };
        let key = ActivationKey::new(code.clone(), months, uses);
        keys.insert(code, key.clone());
        Ok(key)
    }

    async fn get(&self, code: &str) -> Result<Option<ActivationKey>> {
        let keys = self.keys.read().await;
        Ok(keys.get(code).cloned())
    }

    async fn consume(&self, code: &str, user_id: UserId) -> Result<Option<u32>> {
        let mut keys = self.keys.write().await;
        Ok(keys.get_mut(code).and_then(|key| key.consume(user_id)))
    }
}
