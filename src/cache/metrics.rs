//! Prometheus counters for eviction, merge and migration activity.
//!
//! Each manager owns a private registry so several partitions (or tests) can
//! coexist without colliding on global metric names.

use prometheus::{Encoder, IntCounter, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::device::registry::DeviceRegistry;

pub struct AntiCacheMetrics {
    registry: Registry,
    pub tuples_evicted: IntCounter,
    pub blocks_evicted: IntCounter,
    pub bytes_evicted: IntCounter,
    pub eviction_failures: IntCounter,
    pub evicted_accesses: IntCounter,
    pub blocks_merged: IntCounter,
    pub tuples_merged: IntCounter,
    pub blocks_migrated: IntCounter,
    pub device_used_bytes: IntGaugeVec,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let c = IntCounter::new(name, help)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

impl AntiCacheMetrics {
    pub fn new(partition: u32) -> prometheus::Result<Self> {
        let registry = Registry::new_custom(
            None,
            Some(
                [("partition".to_string(), partition.to_string())]
                    .into_iter()
                    .collect(),
            ),
        )?;
        let device_used_bytes = IntGaugeVec::new(
            Opts::new("anticache_device_used_bytes", "Bytes held per anti-cache device"),
            &["device"],
        )?;
        registry.register(Box::new(device_used_bytes.clone()))?;

        Ok(Self {
            tuples_evicted: counter(&registry, "anticache_tuples_evicted_total", "Tuples written to devices")?,
            blocks_evicted: counter(&registry, "anticache_blocks_evicted_total", "Blocks written to devices")?,
            bytes_evicted: counter(&registry, "anticache_bytes_evicted_total", "Encoded block bytes written")?,
            eviction_failures: counter(
                &registry,
                "anticache_eviction_failures_total",
                "Eviction rounds abandoned for lack of device capacity",
            )?,
            evicted_accesses: counter(
                &registry,
                "anticache_evicted_accesses_total",
                "Dereferences of evicted tuples",
            )?,
            blocks_merged: counter(&registry, "anticache_blocks_merged_total", "Blocks read back by merges")?,
            tuples_merged: counter(&registry, "anticache_tuples_merged_total", "Tuples made resident by merges")?,
            blocks_migrated: counter(
                &registry,
                "anticache_blocks_migrated_total",
                "Blocks moved between devices",
            )?,
            device_used_bytes,
            registry,
        })
    }

    /// Refresh per-device gauges.
    pub fn observe_devices(&self, devices: &DeviceRegistry) {
        for dev in devices.devices() {
            self.device_used_bytes
                .with_label_values(&[dev.name()])
                .set(dev.used() as i64);
        }
    }

    /// Render all metrics in the text exposition format.
    pub fn gather_text(&self) -> String {
        let mut buf = Vec::new();
        if TextEncoder::new().encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl std::fmt::Debug for AntiCacheMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AntiCacheMetrics")
            .field("tuples_evicted", &self.tuples_evicted.get())
            .field("tuples_merged", &self.tuples_merged.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_text() {
        let metrics = AntiCacheMetrics::new(3).unwrap();
        metrics.tuples_evicted.inc_by(5);
        let text = metrics.gather_text();
        assert!(text.contains("anticache_tuples_evicted_total{partition=\"3\"} 5"));
    }
}
