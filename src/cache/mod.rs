//! Anti-cache core.
//!
//! - [`lru`]: per-table LRU chains of resident tuples
//! - [`sketch`]: count-min access-frequency sketch
//! - [`block`]: evicted block model and codec
//! - [`evictor`]: packs cold tuples into blocks and writes them out
//! - [`access`]: evicted-access tracking and blocking policies
//! - [`merger`]: reads blocks back and restores their tuples
//! - [`manager`]: per-partition façade over all of the above
//! - [`metrics`]: prometheus counters

pub mod access;
pub mod block;
pub mod evictor;
pub mod lru;
pub mod manager;
pub mod merger;
pub mod metrics;
pub mod sketch;
