use crate::domain::payment::PaymentRecord;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

const HEADER: [&str; 11] = [
    "id",
    "user_id",
    "intent",
    "amount",
    "status",
    "method",
    "provider_reference",
    "target_account",
    "duration_months",
    "fulfillment_attempts",
    "created_at",
];

#[derive(Serialize)]
struct PaymentRow<'a> {
    id: u64,
    user_id: i64,
    intent: &'a str,
    amount: String,
    status: &'a str,
    method: &'a str,
    provider_reference: &'a str,
    target_account: &'a str,
    duration_months: u32,
    fulfillment_attempts: u32,
    created_at: String,
}

impl<'a> From<&'a PaymentRecord> for PaymentRow<'a> {
    fn from(record: &'a PaymentRecord) -> Self {
        Self {
            id: record.id.0,
            user_id: record.user_id,
            intent: record.intent.as_str(),
            amount: record.amount.to_minor_string(),
            status: record.status.as_str(),
            method: record.method().map(|m| m.as_str()).unwrap_or(""),
            provider_reference: record.provider_reference().unwrap_or(""),
            target_account: record.target_account.as_deref().unwrap_or(""),
            duration_months: record.duration_months,
            fulfillment_attempts: record.fulfillment_attempts,
            created_at: record.created_at.to_rfc3339(),
        }
    }
}

/// Writes payment records as a CSV report, one row per record.
///
/// The header is always written, so an empty report is still well-formed.
pub struct PaymentWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> PaymentWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(sink),
        }
    }

    pub fn write_payments<'a>(
        &mut self,
        records: impl IntoIterator<Item = &'a PaymentRecord>,
    ) -> Result<()> {
        self.writer.write_record(HEADER)?;
        for record in records {
            self.writer.serialize(PaymentRow::from(record))?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::payment::{
        Amount, Intent, Metadata, NewPayment, PaymentId, PaymentStatus, keys,
    };
    use chrono::{DateTime, Utc};
    use rust_decimal_macros::dec;

    fn record(id: u64, intent: Intent, target: Option<&str>) -> PaymentRecord {
        PaymentRecord::new(
            PaymentId(id),
            NewPayment {
                user_id: 42,
                intent,
                amount: Amount::new(dec!(299)).unwrap(),
                duration_months: 3,
                target_account: target.map(str::to_string),
                metadata: Metadata::new()
                    .with(keys::VIA, "yoomoney")
                    .with(keys::PROVIDER_REFERENCE, format!("YM-{id}-42")),
            },
            DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
        )
    }

    #[test]
    fn test_writer_output() {
        let mut approved = record(2, Intent::Renewal, Some("alice"));
        approved.apply_status(PaymentStatus::Approved);
        let records = vec![record(1, Intent::NewSubscription, None), approved];

        let mut buf = Vec::new();
        PaymentWriter::new(&mut buf).write_payments(&records).unwrap();
        let output = String::from_utf8(buf).unwrap();

        let mut lines = output.lines();
        assert_eq!(
            lines.next(),
            Some("id,user_id,intent,amount,status,method,provider_reference,target_account,duration_months,fulfillment_attempts,created_at")
        );
        assert_eq!(
            lines.next(),
            Some("1,42,new_subscription,299.00,pending,yoomoney,YM-1-42,,3,0,2023-11-14T22:13:20+00:00")
        );
        assert_eq!(
            lines.next(),
            Some("2,42,renewal,299.00,approved,yoomoney,YM-2-42,alice,3,0,2023-11-14T22:13:20+00:00")
        );
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn test_empty_report_keeps_header() {
        let mut buf = Vec::new();
        let none: Vec<PaymentRecord> = Vec::new();
        PaymentWriter::new(&mut buf).write_payments(&none).unwrap();
        let output = String::from_utf8(buf).unwrap();
        assert_eq!(output.lines().count(), 1);
        assert!(output.starts_with("id,user_id,intent"));
    }
}
