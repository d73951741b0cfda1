use super::payment::{PaymentRecord, PaymentStatus};
use rust_decimal::Decimal;
use serde::Serialize;

/// Aggregate view over the payment table for operators.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PaymentSummary {
    pub pending: usize,
    pub approved: usize,
    pub rejected: usize,
    /// Sum of approved amounts.
    pub revenue: Decimal,
}

impl PaymentSummary {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a PaymentRecord>) -> Self {
        records
            .into_iter()
            .fold(Self::default(), |mut summary, record| {
                match record.status {
                    PaymentStatus::Pending => summary.pending += 1,
                    PaymentStatus::Approved => {
                        summary.approved += 1;
                        summary.revenue += record.amount.value();
                    }
                    PaymentStatus::Rejected => summary.rejected += 1,
                }
                summary
            })
    }

    pub fn total(&self) -> usize {
        self.pending + self.approved + self.rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::payment::{Amount, Intent, Metadata, NewPayment, PaymentId};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn record(id: u64, amount: Decimal, status: PaymentStatus) -> PaymentRecord {
        let mut record = PaymentRecord::new(
            PaymentId(id),
            NewPayment {
                user_id: 1,
                intent: Intent::NewSubscription,
                amount: Amount::new(amount).unwrap(),
                duration_months: 1,
                target_account: None,
                metadata: Metadata::new(),
            },
            Utc::now(),
        );
        record.status = status;
        record
    }

    #[test]
    fn test_revenue_counts_only_approved() {
        let records = vec![
            record(1, dec!(299.00), PaymentStatus::Approved),
            record(2, dec!(799.00), PaymentStatus::Approved),
            record(3, dec!(299.00), PaymentStatus::Rejected),
            record(4, dec!(149.00), PaymentStatus::Pending),
        ];
        let summary = PaymentSummary::from_records(&records);
        assert_eq!(summary.approved, 2);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.total(), 4);
        assert_eq!(summary.revenue, dec!(1098.00));
    }
}
