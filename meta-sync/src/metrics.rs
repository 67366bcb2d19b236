use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGaugeVec, Opts, Registry};

/// Synced-state label values.
pub const CORRUPTED_META: &str = "corrupted-meta-json";
pub const NO_META: &str = "no-meta-json";
pub const LOADED_META: &str = "loaded";
pub const FAILED_META: &str = "failed";
pub const LABEL_EXCLUDED_META: &str = "label-excluded";
pub const TIME_EXCLUDED_META: &str = "time-excluded";

/// Label for blocks that are contained in other compacted blocks.
pub const DUPLICATE_META: &str = "duplicate";

/// Blocks that are marked for deletion can be loaded as well. This is done to
/// make sure that we load blocks that are meant to be deleted, but don't have
/// a replacement block yet.
pub const MARKED_FOR_DELETION_META: &str = "marked-for-deletion";

/// Label for blocks which are loaded but also marked for no compaction. This
/// label is also counted in the `loaded` label metric.
pub const MARKED_FOR_NO_COMPACTION_META: &str = "marked-for-no-compact";

/// Label for blocks which are not loaded because their ULID pre-dates the
/// fetcher's configured lookback period.
pub const LOOKBACK_EXCLUDED_META: &str = "lookback-excluded";

const SYNCED_STATES: &[&str] = &[
    CORRUPTED_META,
    NO_META,
    LOADED_META,
    FAILED_META,
    LABEL_EXCLUDED_META,
    TIME_EXCLUDED_META,
    DUPLICATE_META,
    MARKED_FOR_DELETION_META,
    MARKED_FOR_NO_COMPACTION_META,
    LOOKBACK_EXCLUDED_META,
];

/// A gauge vector whose updates are buffered during a fetch pass and swapped
/// into the exported gauges in one go, so scrapers never observe a
/// half-updated classification snapshot.
pub struct TxGaugeVec {
    gauge: IntGaugeVec,
    tx: Mutex<TxState>,
}

#[derive(Default)]
struct TxState {
    staged: HashMap<String, i64>,
    /// Every state ever staged; `submit` writes all of them so states absent
    /// from the current transaction drop back to zero.
    states: HashSet<String>,
}

impl TxGaugeVec {
    pub fn new(registry: &Registry, opts: Opts, initial_states: &[&str]) -> Self {
        let gauge = IntGaugeVec::new(opts, &["state"]).expect("failed to create synced gauge");
        registry
            .register(Box::new(gauge.clone()))
            .expect("failed to register synced gauge");

        let states: HashSet<String> = initial_states.iter().map(|s| s.to_string()).collect();
        for state in &states {
            gauge.with_label_values(&[state.as_str()]).set(0);
        }

        Self {
            gauge,
            tx: Mutex::new(TxState {
                staged: HashMap::new(),
                states,
            }),
        }
    }

    /// Starts a new transaction, discarding anything staged so far.
    pub fn reset_tx(&self) {
        self.tx.lock().staged.clear();
    }

    pub fn set(&self, state: &str, value: i64) {
        let mut tx = self.tx.lock();
        tx.states.insert(state.to_string());
        tx.staged.insert(state.to_string(), value);
    }

    pub fn inc(&self, state: &str) {
        let mut tx = self.tx.lock();
        tx.states.insert(state.to_string());
        *tx.staged.entry(state.to_string()).or_insert(0) += 1;
    }

    /// Applies the staged values to the exported gauges.
    pub fn submit(&self) {
        let tx = self.tx.lock();
        for state in &tx.states {
            let value = tx.staged.get(state).copied().unwrap_or(0);
            self.gauge.with_label_values(&[state.as_str()]).set(value);
        }
    }

    /// Current exported value for a state, unaffected by staged updates.
    pub fn get(&self, state: &str) -> i64 {
        self.gauge.with_label_values(&[state]).get()
    }
}

/// Metrics tracked by the metadata fetcher. The struct and its fields are
/// public so custom fetchers can track compatible metrics.
pub struct FetcherMetrics {
    pub syncs: IntCounter,
    pub sync_failures: IntCounter,
    pub sync_duration: Histogram,
    pub synced: TxGaugeVec,
}

impl FetcherMetrics {
    pub fn new(registry: &Registry, extra_synced_states: &[&str]) -> Self {
        let syncs = IntCounter::with_opts(Opts::new(
            "blocks_meta_syncs_total",
            "Total blocks metadata synchronization attempts",
        ))
        .expect("failed to create syncs counter");
        registry
            .register(Box::new(syncs.clone()))
            .expect("failed to register syncs counter");

        let sync_failures = IntCounter::with_opts(Opts::new(
            "blocks_meta_sync_failures_total",
            "Total blocks metadata synchronization failures",
        ))
        .expect("failed to create sync failures counter");
        registry
            .register(Box::new(sync_failures.clone()))
            .expect("failed to register sync failures counter");

        // Syncing has been seen taking even hours in extreme cases. The
        // buckets are configured to track such high latency.
        let sync_duration = Histogram::with_opts(
            HistogramOpts::new(
                "blocks_meta_sync_duration_seconds",
                "Duration of the blocks metadata synchronization in seconds",
            )
            .buckets(vec![
                0.01, 1.0, 10.0, 100.0, 300.0, 600.0, 1200.0, 2400.0, 3600.0, 7200.0, 14400.0,
                21600.0,
            ]),
        )
        .expect("failed to create sync duration histogram");
        registry
            .register(Box::new(sync_duration.clone()))
            .expect("failed to register sync duration histogram");

        let mut states: Vec<&str> = SYNCED_STATES.to_vec();
        states.extend_from_slice(extra_synced_states);
        let synced = TxGaugeVec::new(
            registry,
            Opts::new("blocks_meta_synced", "Number of block metadata synced"),
            &states,
        );

        Self {
            syncs,
            sync_failures,
            sync_duration,
            synced,
        }
    }

    /// Starts a new transaction for the synced gauge vector.
    pub fn reset_tx(&self) {
        self.synced.reset_tx();
    }

    /// Applies the staged synced values to the exported gauges.
    pub fn submit(&self) {
        self.synced.submit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_gauge_swaps_on_submit() {
        let registry = Registry::new();
        let gauge = TxGaugeVec::new(&registry, Opts::new("test_synced", "help"), &[LOADED_META]);

        gauge.set(LOADED_META, 5);
        gauge.inc(NO_META);
        gauge.inc(NO_META);

        // Nothing visible until submit.
        assert_eq!(gauge.get(LOADED_META), 0);

        gauge.submit();
        assert_eq!(gauge.get(LOADED_META), 5);
        assert_eq!(gauge.get(NO_META), 2);
    }

    #[test]
    fn tx_gauge_zeroes_states_absent_from_transaction() {
        let registry = Registry::new();
        let gauge = TxGaugeVec::new(&registry, Opts::new("test_synced", "help"), &[]);

        gauge.set(LOADED_META, 3);
        gauge.submit();
        assert_eq!(gauge.get(LOADED_META), 3);

        gauge.reset_tx();
        gauge.set(NO_META, 1);
        gauge.submit();
        assert_eq!(gauge.get(LOADED_META), 0);
        assert_eq!(gauge.get(NO_META), 1);
    }

    #[test]
    fn fetcher_metrics_register_on_fresh_registry() {
        let registry = Registry::new();
        let metrics = FetcherMetrics::new(&registry, &["user-defined"]);
        metrics.syncs.inc();
        metrics.synced.set("user-defined", 4);
        metrics.synced.submit();

        assert_eq!(metrics.syncs.get(), 1);
        assert_eq!(metrics.synced.get("user-defined"), 4);
        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|mf| mf.get_name().to_string())
            .collect();
        assert!(names.contains(&"blocks_meta_syncs_total".to_string()));
        assert!(names.contains(&"blocks_meta_synced".to_string()));
    }
}
