//! Serialized form of payment records.
//!
//! Records are written as a versioned envelope. Rows written by the earlier bot
//! (flat shape with a `purpose` column and the intent hidden in an `extra` JSON
//! string) are still readable; they are translated here and nowhere else.

use crate::domain::payment::{
    Amount, Intent, Metadata, PaymentId, PaymentRecord, PaymentStatus, UserId, keys,
};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CURRENT_VERSION: u32 = 2;

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    v: u32,
    record: &'a PaymentRecord,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredPayment {
    Current { v: u32, record: PaymentRecord },
    Legacy(LegacyPayment),
}

#[derive(Deserialize)]
struct LegacyPayment {
    id: u64,
    user_id: UserId,
    amount: rust_decimal::Decimal,
    status: String,
    #[serde(default)]
    purpose: Option<String>,
    #[serde(default)]
    extra: Option<String>,
    created_at: String,
}

pub fn encode(record: &PaymentRecord) -> Result<Vec<u8>> {
    serde_json::to_vec(&EnvelopeRef {
        v: CURRENT_VERSION,
        record,
    })
    .map_err(|e| PaymentError::store(format!("Serialization error: {e}")))
}

pub fn decode(bytes: &[u8]) -> Result<PaymentRecord> {
    let stored: StoredPayment = serde_json::from_slice(bytes)
        .map_err(|e| PaymentError::store(format!("Deserialization error: {e}")))?;
    match stored {
        StoredPayment::Current { v, record } if v == CURRENT_VERSION => Ok(record),
        StoredPayment::Current { v, .. } => Err(PaymentError::store(format!(
            "unsupported payment record version {v}"
        ))),
        StoredPayment::Legacy(legacy) => legacy.into_record(),
    }
}

impl LegacyPayment {
    fn into_record(self) -> Result<PaymentRecord> {
        let mut extra: Map<String, Value> = match self.extra.as_deref() {
            Some(raw) if !raw.trim().is_empty() => match serde_json::from_str(raw) {
                Ok(Value::Object(map)) => map,
                _ => Map::new(),
            },
            _ => Map::new(),
        };

        let intent = self
            .purpose
            .as_deref()
            .or_else(|| extra.get("ptype").and_then(Value::as_str))
            .map(str::parse::<Intent>)
            .transpose()?
            .unwrap_or(Intent::NewSubscription);

        let duration_months = extra
            .get("months")
            .and_then(|m| m.as_u64().or_else(|| m.as_str()?.parse().ok()))
            .map(|m| m.max(1) as u32)
            .unwrap_or(1);

        let target_account = extra
            .get("username")
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty())
            .map(str::to_string);

        for key in ["ptype", "months", "username"] {
            extra.remove(key);
        }
        let mut metadata = Metadata::from(extra);
        // Older YooKassa and YooMoney rows kept their references under their own keys.
        if !metadata.contains_key(keys::PROVIDER_REFERENCE) {
            if let Some(reference) = metadata.get_str("yk_payment_id").map(str::to_string) {
                metadata.insert(keys::VIA, "yookassa");
                metadata.insert(keys::PROVIDER_REFERENCE, reference);
            } else if let Some(label) = metadata.get_str("label").map(str::to_string) {
                metadata.insert(keys::VIA, "yoomoney");
                metadata.insert(keys::PROVIDER_REFERENCE, label);
            }
        }

        Ok(PaymentRecord {
            id: PaymentId(self.id),
            user_id: self.user_id,
            intent,
            // Legacy rows stored floats.
            amount: Amount::new(self.amount.round_dp(Amount::SCALE))?,
            status: self.status.parse::<PaymentStatus>()?,
            target_account,
            duration_months,
            metadata,
            created_at: parse_timestamp(&self.created_at)?,
            fulfillment_attempts: 0,
            claimed_until: None,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|e| PaymentError::store(format!("invalid created_at {raw:?}: {e}")))
}
