//! Domain types and the ports the application layer talks through.
//!
//! Nothing in here performs I/O; storage backends, the account service client and
//! payment processors live in `infrastructure`.

pub mod key;
pub mod payment;
pub mod ports;
pub mod product;
pub mod summary;
