//! anticache: demotes cold tuples of in-memory tables to block devices and
//! merges them back when a transaction touches them.
//!
//! Each partition drives one [`cache::manager::AntiCacheManager`]; devices
//! live in a [`device::registry::DeviceRegistry`] that partitions share.

pub mod cache;
pub mod config;
pub mod device;
pub mod error;
pub mod table;

pub use cache::access::TouchOutcome;
pub use cache::manager::AntiCacheManager;
pub use config::Config;
pub use device::registry::DeviceRegistry;
pub use error::{AntiCacheError, Result};
