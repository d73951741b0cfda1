//! Application layer containing the payment flow orchestration.
//!
//! `PaymentEngine` is the entry point used by the conversational front-end. It
//! delegates to the purchase intent collector (`checkout`), the fulfillment
//! dispatcher and key redemption, and answers with `Reply` values.

pub mod account_locks;
pub mod checkout;
pub mod engine;
pub mod fulfillment;
pub mod redemption;
pub mod reply;
