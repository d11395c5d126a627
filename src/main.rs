use std::sync::Arc;

use clap::Parser;
use tracing::{debug, info, warn};

use anticache::cache::access::TouchOutcome;
use anticache::config::{Cli, Config, DeviceConfig};
use anticache::table::{TableId, Tuple, TupleId};
use anticache::{AntiCacheManager, DeviceRegistry};

/// Attempts per transaction before giving up.
const MAX_ATTEMPTS: usize = 4;

/// Keys read per transaction.
const KEYS_PER_TXN: usize = 8;

#[derive(Debug, Default)]
struct WorkloadStats {
    committed: usize,
    inline_merges: usize,
    aborts: usize,
    gave_up: usize,
}

/// Deterministic xorshift stream, skewed toward low tuple ids (the oldest
/// rows, which are the first to be evicted).
struct SkewedKeys {
    state: u64,
    n: u64,
}

impl SkewedKeys {
    fn new(seed: u64, n: usize) -> Self {
        Self {
            state: seed.max(1),
            n: n.max(1) as u64,
        }
    }

    fn next_key(&mut self) -> TupleId {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        let r = self.state % self.n;
        (r * r / self.n) as TupleId
    }
}

/// Run one read-only transaction through the touch/merge/retry loop.
async fn run_transaction(
    mgr: &mut AntiCacheManager,
    table: TableId,
    keys: &[TupleId],
    stats: &mut WorkloadStats,
) -> anticache::Result<()> {
    for attempt in 0..MAX_ATTEMPTS {
        mgr.init_evicted_access_tracker();
        let mut touched_evicted = false;
        for &key in keys {
            if mgr.read_tuple(table, key)? == TouchOutcome::RequiresMerge {
                touched_evicted = true;
            }
        }
        if !touched_evicted {
            stats.committed += 1;
            return Ok(());
        }

        if mgr.has_blockable_evicted_accesses() {
            stats.inline_merges += 1;
        } else {
            let signal = mgr.evicted_access_interrupt();
            debug!(attempt, error = %signal, "Transaction aborted");
            stats.aborts += 1;
        }
        mgr.blocking_merge().await?;
    }
    warn!(keys = ?keys, "Transaction gave up after {MAX_ATTEMPTS} attempts");
    stats.gave_up += 1;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "anticache=debug,anticache_sim=debug"
    } else {
        "anticache=info,anticache_sim=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("anticache-sim v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&cli.config)?;
    if config.devices.is_empty() {
        warn!("No devices configured, using one in-memory device");
        config.devices.push(DeviceConfig::memory("nvm0", 64 << 20));
    }
    let block_size = config.anticache.block_size;
    info!(
        devices = config.devices.len(),
        block_size,
        merge_mode = ?config.anticache.merge_mode,
        sketch = config.sketch.enabled,
        "Configuration loaded"
    );

    let registry = Arc::new(DeviceRegistry::from_config(&config.devices).await?);
    let mut mgr = AntiCacheManager::new(&config, registry)?;

    // Load a parent/child table pair; every other order has one line.
    let orders = mgr.create_table("orders");
    let lines = mgr.create_child_table("order_lines", orders)?;
    for i in 0..cli.tuples {
        let payload = vec![(i % 251) as u8; cli.tuple_size];
        let id = mgr.insert_tuple(orders, Tuple::new(payload.clone()))?;
        if i % 2 == 0 {
            let half = payload[..cli.tuple_size / 2].to_vec();
            mgr.insert_tuple(lines, Tuple::with_parent(id, half))?;
        }
    }
    info!(orders = cli.tuples, lines = cli.tuples.div_ceil(2), "Tables loaded");

    for round in 0..cli.rounds {
        let placed = if round % 2 == 0 {
            mgr.evict_block_to_disk_in_batch(orders, lines, block_size, 1)
                .await?
        } else {
            mgr.evict_block_to_disk(orders, block_size, 1).await?
        };
        if !placed {
            warn!(round, "Eviction stopped, devices are full");
            break;
        }
    }
    if let Some(result) = mgr.last_eviction() {
        println!("{}", serde_json::to_string_pretty(result)?);
    }

    let mut stats = WorkloadStats::default();
    let mut keys = SkewedKeys::new(0x5eed, cli.tuples);
    for _ in 0..cli.tuples.min(1_000) {
        let batch: Vec<TupleId> = (0..KEYS_PER_TXN).map(|_| keys.next_key()).collect();
        run_transaction(&mut mgr, orders, &batch, &mut stats).await?;
    }
    info!(
        committed = stats.committed,
        inline_merges = stats.inline_merges,
        aborts = stats.aborts,
        gave_up = stats.gave_up,
        "Workload complete"
    );

    for table in [orders, lines] {
        if let Err(violation) = mgr.check_invariants(table).await {
            warn!(table = %table, violation, "Invariant check failed");
        }
    }
    for id in 0..mgr.num_anticache_dbs() as u16 {
        if let Some(info) = mgr.get_anticache_db(id) {
            println!("{}", serde_json::to_string(&info)?);
        }
    }
    print!("{}", mgr.metrics().gather_text());

    Ok(())
}
