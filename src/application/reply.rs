//! Outcomes handed back to the conversational front-end.
//!
//! Every terminal outcome of checkout, verification or redemption maps to one
//! variant; the front-end renders it and never has to inspect a raw error.

use crate::domain::payment::{Amount, PaymentId, PaymentMethod};
use chrono::{DateTime, Utc};
use std::fmt;

/// What the user received after a successful fulfillment.
#[derive(Debug, Clone, PartialEq)]
pub enum Grant {
    NewAccount {
        account: String,
        months: u32,
        link: Option<String>,
    },
    Renewed {
        account: String,
        months: u32,
        until: DateTime<Utc>,
        link: Option<String>,
    },
    Key {
        code: String,
        months: u32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Invoice {
        payment_id: PaymentId,
        method: PaymentMethod,
        title: String,
        description: String,
        amount: Amount,
        url: String,
    },
    Approved {
        payment_id: PaymentId,
        grant: Grant,
    },
    Rejected {
        payment_id: PaymentId,
    },
    NotYetConfirmed {
        payment_id: PaymentId,
    },
    AlreadyApproved {
        payment_id: PaymentId,
    },
    AlreadyRejected {
        payment_id: PaymentId,
    },
    InProgress {
        payment_id: PaymentId,
    },
    FulfillmentFailed {
        payment_id: PaymentId,
        reason: String,
    },
    MethodUnavailable {
        reason: String,
    },
    ValidationRetry {
        reason: String,
    },
    KeyRedeemed {
        account: String,
        months: u32,
        link: Option<String>,
    },
    KeyUnknown,
    KeyExhausted,
    /// The key use was spent but the account service failed.
    RedemptionFailed {
        code: String,
    },
}

impl Reply {
    pub fn payment_id(&self) -> Option<PaymentId> {
        match self {
            Reply::Invoice { payment_id, .. }
            | Reply::Approved { payment_id, .. }
            | Reply::Rejected { payment_id }
            | Reply::NotYetConfirmed { payment_id }
            | Reply::AlreadyApproved { payment_id }
            | Reply::AlreadyRejected { payment_id }
            | Reply::InProgress { payment_id }
            | Reply::FulfillmentFailed { payment_id, .. } => Some(*payment_id),
            _ => None,
        }
    }

    /// Payment URL for an invoice reply.
    pub fn url(&self) -> Option<&str> {
        match self {
            Reply::Invoice { url, .. } => Some(url),
            _ => None,
        }
    }
}

fn write_link(f: &mut fmt::Formatter<'_>, link: Option<&str>) -> fmt::Result {
    match link {
        Some(link) => write!(f, "\nLink: {link}"),
        None => Ok(()),
    }
}

impl fmt::Display for Grant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grant::NewAccount {
                account,
                months,
                link,
            } => {
                write!(f, "Subscription {account} created for {months} mo.")?;
                write_link(f, link.as_deref())
            }
            Grant::Renewed {
                account,
                months,
                until,
                link,
            } => {
                write!(
                    f,
                    "Subscription {account} extended by {months} mo., valid until {}.",
                    until.format("%Y-%m-%d")
                )?;
                write_link(f, link.as_deref())
            }
            Grant::Key { code, months } => write!(
                f,
                "Your activation key for {months} mo.: {code}\nRedeem it in the bot or gift it to a friend."
            ),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Invoice {
                payment_id,
                method,
                title,
                description,
                amount,
                url,
            } => write!(
                f,
                "{title}\n{description}\n\nAmount due: {amount} via {}\nPay here: {url}\n\
                 After paying, check payment #{payment_id}.",
                method.display_name()
            ),
            Reply::Approved { grant, .. } => write!(f, "Payment received. {grant}"),
            Reply::Rejected { payment_id } => {
                write!(f, "Payment #{payment_id} was declined or has expired.")
            }
            Reply::NotYetConfirmed { payment_id } => write!(
                f,
                "Payment #{payment_id} is not confirmed yet. Please try again later."
            ),
            Reply::AlreadyApproved { payment_id } => {
                write!(f, "Payment #{payment_id} is already paid.")
            }
            Reply::AlreadyRejected { payment_id } => {
                write!(f, "Payment #{payment_id} was rejected.")
            }
            Reply::InProgress { payment_id } => write!(
                f,
                "Payment #{payment_id} is being processed. Please wait a moment."
            ),
            Reply::FulfillmentFailed { payment_id, .. } => write!(
                f,
                "Payment #{payment_id} went through, but we could not activate your service. \
                 Please contact support."
            ),
            Reply::MethodUnavailable { reason } => write!(
                f,
                "This payment method is unavailable right now ({reason}). Please choose another one or contact support."
            ),
            Reply::ValidationRetry { reason } => {
                write!(f, "Could not start the purchase: {reason}. Please try again.")
            }
            Reply::KeyRedeemed {
                account,
                months,
                link,
            } => {
                write!(f, "Key accepted. Subscription {account} gained {months} mo.")?;
                write_link(f, link.as_deref())
            }
            Reply::KeyUnknown => f.write_str("This key does not exist."),
            Reply::KeyExhausted => f.write_str("This key has already been used."),
            Reply::RedemptionFailed { code } => write!(
                f,
                "Key {code} was accepted, but we could not activate your service. Please contact support."
            ),
        }
    }
}
