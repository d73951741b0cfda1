//! Adapters behind the domain ports: stores, the account service client and
//! the payment processors.

pub mod in_memory;
pub mod marzban;
pub mod providers;
pub mod record_codec;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
