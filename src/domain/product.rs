use super::payment::{Intent, PaymentRecord, keys};

/// Name and blurb shown to the user and forwarded to the processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductDescription {
    pub name: String,
    pub description: String,
}

pub fn describe(intent: Intent, months: u32, target_account: Option<&str>) -> ProductDescription {
    match intent {
        Intent::NewSubscription => ProductDescription {
            name: format!("VPN subscription, {months} mo."),
            description: "Unlimited VPN access for the selected period. Up to 5 devices, \
                          stable servers, 24/7 support. Activated by the link in the bot."
                .to_string(),
        },
        Intent::Renewal => ProductDescription {
            name: format!("VPN renewal, {months} mo."),
            description: format!(
                "Renewal of subscription {} for {months} months. Remaining time is kept.",
                target_account.unwrap_or("-")
            ),
        },
        Intent::KeyPurchase => ProductDescription {
            name: format!("VPN key, {months} mo."),
            description: "Activation key for the selected period. Can be gifted: \
                          the recipient redeems it in the bot."
                .to_string(),
        },
    }
}

impl ProductDescription {
    /// Stored description, falling back to the generated one for older records.
    pub fn for_record(record: &PaymentRecord) -> Self {
        let fallback = describe(
            record.intent,
            record.duration_months,
            record.target_account.as_deref(),
        );
        Self {
            name: record
                .metadata
                .get_str(keys::PRODUCT_NAME)
                .map(str::to_string)
                .unwrap_or(fallback.name),
            description: record
                .metadata
                .get_str(keys::PRODUCT_DESC)
                .map(str::to_string)
                .unwrap_or(fallback.description),
        }
    }
}

/// Cuts `text` to at most `max` characters; processors reject longer fields.
pub fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
