//! Anti-cache devices.
//!
//! - [`store`]: the block store backend trait and the in-memory backend
//! - [`disk`]: file-per-block backend
//! - [`registry`]: numbered devices, placement and block migration

pub mod disk;
pub mod registry;
pub mod store;
