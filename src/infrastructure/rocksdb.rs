use super::record_codec;
use crate::domain::key::{ActivationKey, generate_code};
use crate::domain::payment::{
    Claim, Metadata, NewPayment, PaymentId, PaymentRecord, PaymentStatus, StatusChange, UserId,
};
use crate::domain::ports::{KeyStore, PaymentStore};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Options, WriteBatch};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Column Family for storing payment records.
pub const CF_PAYMENTS: &str = "payments";
/// Column Family for storing activation keys.
pub const CF_KEYS: &str = "keys";
/// Column Family for counters and other bookkeeping.
pub const CF_META: &str = "meta";

const PAYMENT_SEQ_KEY: &[u8] = b"payment_seq";

/// A persistent store implementation using RocksDB.
///
/// Handles storage for both `PaymentRecord` and `ActivationKey` entities using
/// separate Column Families. Read-modify-write operations are serialised through
/// one async mutex, which is what makes `set_status`, `claim_fulfillment` and
/// `consume` compare-and-set operations.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that the required column families exist.
    ///
    /// # Arguments
    ///
    /// * `path` - The filesystem path where the database will be stored.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = [CF_PAYMENTS, CF_KEYS, CF_META]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PaymentError::store(format!("{name} column family not found")))
    }

    fn read_record(&self, id: PaymentId) -> Result<Option<PaymentRecord>> {
        let cf = self.cf(CF_PAYMENTS)?;
        match self.db.get_cf(cf, id.0.to_be_bytes())? {
            Some(bytes) => record_codec::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn write_record(&self, record: &PaymentRecord) -> Result<()> {
        let cf = self.cf(CF_PAYMENTS)?;
        self.db
            .put_cf(cf, record.id.0.to_be_bytes(), record_codec::encode(record)?)?;
        Ok(())
    }

    /// Loads a record, lets `f` mutate it, and writes it back if it changed.
    /// Caller must hold `write_lock`.
    fn update_record<T>(
        &self,
        id: PaymentId,
        f: impl FnOnce(&mut PaymentRecord) -> T,
    ) -> Result<T> {
        let mut record = self.read_record(id)?.ok_or(PaymentError::NotFound(id))?;
        let before = record.clone();
        let out = f(&mut record);
        if record != before {
            self.write_record(&record)?;
        }
        Ok(out)
    }

    fn read_key(&self, code: &str) -> Result<Option<ActivationKey>> {
        let cf = self.cf(CF_KEYS)?;
        match self.db.get_cf(cf, code.as_bytes())? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| PaymentError::store(format!("Deserialization error: {e}"))),
            None => Ok(None),
        }
    }

    fn write_key(&self, key: &ActivationKey) -> Result<()> {
        let cf = self.cf(CF_KEYS)?;
        let value = serde_json::to_vec(key)
            .map_err(|e| PaymentError::store(format!("Serialization error: {e}")))?;
        self.db.put_cf(cf, key.code.as_bytes(), value)?;
        Ok(())
    }
}

#[async_trait]
impl PaymentStore for RocksDBStore {
    async fn create(&self, payment: NewPayment) -> Result<PaymentId> {
        let _guard = self.write_lock.lock().await;
        let meta = self.cf(CF_META)?;

        let last = match self.db.get_cf(meta, PAYMENT_SEQ_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| PaymentError::store("corrupt payment sequence"))?;
                u64::from_be_bytes(raw)
            }
            None => 0,
        };
        let id = PaymentId(last + 1);
        let record = PaymentRecord::new(id, payment, Utc::now());

        // Sequence and record land together or not at all.
        let mut batch = WriteBatch::default();
        batch.put_cf(meta, PAYMENT_SEQ_KEY, id.0.to_be_bytes());
        batch.put_cf(
            self.cf(CF_PAYMENTS)?,
            id.0.to_be_bytes(),
            record_codec::encode(&record)?,
        );
        self.db.write(batch)?;

        Ok(id)
    }

    async fn get(&self, id: PaymentId) -> Result<Option<PaymentRecord>> {
        self.read_record(id)
    }

    async fn set_status(&self, id: PaymentId, new_status: PaymentStatus) -> Result<StatusChange> {
        let _guard = self.write_lock.lock().await;
        self.update_record(id, |record| record.apply_status(new_status))
    }

    async fn merge_metadata(&self, id: PaymentId, patch: Metadata) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.update_record(id, |record| record.metadata.merge(patch))
    }

    async fn claim_fulfillment(
        &self,
        id: PaymentId,
        now: DateTime<Utc>,
        lease: TimeDelta,
    ) -> Result<Claim> {
        let _guard = self.write_lock.lock().await;
        self.update_record(id, |record| record.apply_claim(now, lease))
    }

    async fn release_claim(&self, id: PaymentId) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match self.update_record(id, |record| record.claimed_until = None) {
            Err(PaymentError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn list(&self, status: Option<PaymentStatus>) -> Result<Vec<PaymentRecord>> {
        let cf = self.cf(CF_PAYMENTS)?;
        let mut records = Vec::new();

        // Big-endian keys iterate in id order.
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (_key, value) = item?;
            let record = record_codec::decode(&value)?;
            if status.is_none_or(|s| record.status == s) {
                records.push(record);
            }
        }

        Ok(records)
    }
}

#[async_trait]
impl KeyStore for RocksDBStore {
    async fn issue(&self, months: u32, uses: u32) -> Result<ActivationKey> {
        let _guard = self.write_lock.lock().await;
        let code = loop {
            let candidate = generate_code();
            if self.read_key(&candidate)?.is_none() {
                break candidate;
            }
        };
        let key = ActivationKey::new(code, months, uses);
        self.write_key(&key)?;
        Ok(key)
    }

    async fn get(&self, code: &str) -> Result<Option<ActivationKey>> {
        self.read_key(code)
    }

    async fn consume(&self, code: &str, user_id: UserId) -> Result<Option<u32>> {
        let _guard = self.write_lock.lock().await;
        let Some(mut key) = self.read_key(code)? else {
            return Ok(None);
        };
        let granted = key.consume(user_id);
        if granted.is_some() {
            self.write_key(&key)?;
        }
        Ok(granted)
    }
}
