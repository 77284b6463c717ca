//! BGP feature aggregation.
//!
//! Folds the restartable stream of decoded updates into one [`FeatureBin`]
//! per device per fixed-length time bin, aligned to bin boundaries. Bins
//! close either when the event-time watermark moves past their lag window
//! or when the wall clock passes their flush deadline; known devices that
//! were idle for a closed bin still produce a zero-valued bin so the
//! downstream detector rings stay contiguous.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::record::BgpUpdate;

/// Aggregation parameters; see the binning section of the runtime config.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub bin_seconds: u64,
    /// Bins are emitted at most this long after their end.
    pub flush_delay_seconds: u64,
    /// Out-of-order tolerance; updates older than this past their bin are shed.
    pub max_bin_lag_seconds: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        let bin_seconds = 30;
        Self {
            bin_seconds,
            flush_delay_seconds: 5,
            max_bin_lag_seconds: bin_seconds * 2,
        }
    }
}

/// Aggregated BGP features for one device over one bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureBin {
    pub device: String,
    /// Bin bounds, epoch ms; `bin_end = bin_start + bin_seconds`.
    pub bin_start: i64,
    pub bin_end: i64,
    pub withdrawals_total: u64,
    pub announcements_total: u64,
    /// Unique AS-path strings over update count, in [0, 1]. Zero for idle bins.
    pub as_path_churn: f64,
    /// Distinct peers that emitted at least one update in the bin.
    pub peer_count: usize,
}

impl FeatureBin {
    fn zero(device: &str, bin_start: i64, bin_ms: i64) -> Self {
        Self {
            device: device.to_string(),
            bin_start,
            bin_end: bin_start + bin_ms,
            withdrawals_total: 0,
            announcements_total: 0,
            as_path_churn: 0.0,
            peer_count: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregatorStats {
    pub updates_ingested: u64,
    pub malformed_records: u64,
    pub bgp_lag_drops: u64,
    pub bins_emitted: u64,
}

#[derive(Debug, Default)]
struct BinAccum {
    withdrawals: u64,
    announcements: u64,
    update_count: u64,
    as_paths: HashSet<Vec<u32>>,
    peers: HashSet<String>,
}

impl BinAccum {
    fn into_bin(self, device: &str, bin_start: i64, bin_ms: i64) -> FeatureBin {
        let churn = if self.update_count == 0 {
            0.0
        } else {
            self.as_paths.len() as f64 / self.update_count as f64
        };
        FeatureBin {
            device: device.to_string(),
            bin_start,
            bin_end: bin_start + bin_ms,
            withdrawals_total: self.withdrawals,
            announcements_total: self.announcements,
            as_path_churn: churn,
            peer_count: self.peers.len(),
        }
    }
}

pub struct FeatureAggregator {
    bin_ms: i64,
    lag_ms: i64,
    flush_delay_ms: i64,
    /// Open accumulators, keyed device then bin start.
    open: HashMap<String, BTreeMap<i64, BinAccum>>,
    /// Devices ever seen, with the first bin they appeared in.
    devices: BTreeMap<String, i64>,
    /// Highest event timestamp observed.
    watermark: i64,
    /// Start of the oldest unemitted bin; `None` until the first update.
    frontier: Option<i64>,
    stats: AggregatorStats,
}

impl FeatureAggregator {
    pub fn new(config: &AggregatorConfig) -> Self {
        Self {
            bin_ms: config.bin_seconds as i64 * 1000,
            lag_ms: config.max_bin_lag_seconds as i64 * 1000,
            flush_delay_ms: config.flush_delay_seconds as i64 * 1000,
            open: HashMap::new(),
            devices: BTreeMap::new(),
            watermark: 0,
            frontier: None,
            stats: AggregatorStats::default(),
        }
    }

    fn bin_of(&self, ts: i64) -> i64 {
        ts - ts.rem_euclid(self.bin_ms)
    }

    /// Ingest one update; returns any bins this closed, oldest first.
    pub fn ingest(&mut self, update: &BgpUpdate) -> Vec<FeatureBin> {
        if !update.is_well_formed() {
            self.stats.malformed_records += 1;
            return Vec::new();
        }
        self.stats.updates_ingested += 1;
        self.watermark = self.watermark.max(update.ts);

        let bin_start = self.bin_of(update.ts);
        let frontier = *self.frontier.get_or_insert(bin_start);

        if bin_start < frontier {
            // Bin already emitted (or shed); too stale to accept.
            self.stats.bgp_lag_drops += 1;
            debug!(peer = %update.peer, ts = update.ts, "dropping update past lag window");
            return self.close_ready();
        }

        let device = update.device().to_string();
        self.devices.entry(device.clone()).or_insert(bin_start);
        let accum = self
            .open
            .entry(device)
            .or_default()
            .entry(bin_start)
            .or_default();
        accum.update_count += 1;
        accum.withdrawals += update.withdraw.len() as u64;
        accum.announcements += update.announce.len() as u64;
        accum.peers.insert(update.peer.clone());
        accum.as_paths.insert(update.as_path.clone());

        self.close_ready()
    }

    /// Close bins whose lag window has passed the event-time watermark.
    fn close_ready(&mut self) -> Vec<FeatureBin> {
        self.close_before(self.watermark - self.lag_ms)
    }

    /// Wall-clock flush: close bins whose flush deadline has passed even if
    /// the stream is idle, keeping idle devices at their expected cadence.
    pub fn flush(&mut self, now_ms: i64) -> Vec<FeatureBin> {
        self.close_before(now_ms - self.flush_delay_ms)
    }

    /// Emit, in order, every bin with `bin_end <= cutoff`.
    fn close_before(&mut self, cutoff: i64) -> Vec<FeatureBin> {
        let Some(mut frontier) = self.frontier else {
            return Vec::new();
        };
        let mut out = Vec::new();
        while frontier + self.bin_ms <= cutoff {
            for (device, first_bin) in &self.devices {
                if *first_bin > frontier {
                    continue;
                }
                let bin = match self.open.get_mut(device).and_then(|bins| bins.remove(&frontier)) {
                    Some(accum) => accum.into_bin(device, frontier, self.bin_ms),
                    None => FeatureBin::zero(device, frontier, self.bin_ms),
                };
                out.push(bin);
            }
            frontier += self.bin_ms;
        }
        self.frontier = Some(frontier);
        self.stats.bins_emitted += out.len() as u64;
        out
    }

    pub fn stats(&self) -> &AggregatorStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::BgpMessageKind;

    const T0: i64 = 1_700_000_000_000 - (1_700_000_000_000 % 30_000);

    fn update(ts: i64, peer: &str, ann: usize, wdr: usize, path: &[u32]) -> BgpUpdate {
        BgpUpdate {
            ts,
            peer: peer.to_string(),
            kind: if wdr > 0 { BgpMessageKind::Withdraw } else { BgpMessageKind::Update },
            announce: (0..ann).map(|i| format!("10.{i}.0.0/24")).collect(),
            withdraw: (0..wdr).map(|i| format!("10.25{i}.0.0/24")).collect(),
            as_path: path.to_vec(),
            next_hop: None,
        }
    }

    fn aggregator() -> FeatureAggregator {
        FeatureAggregator::new(&AggregatorConfig::default())
    }

    #[test]
    fn test_bin_counts_and_churn() {
        let mut agg = aggregator();
        assert!(agg.ingest(&update(T0 + 1_000, "spine-01:p1", 2, 0, &[65001, 65002])).is_empty());
        assert!(agg.ingest(&update(T0 + 5_000, "spine-01:p2", 0, 3, &[65001, 65002])).is_empty());
        assert!(agg.ingest(&update(T0 + 9_000, "spine-01:p1", 1, 0, &[65001, 65003])).is_empty());

        // An update two bins later pushes the watermark past the lag window.
        let bins = agg.ingest(&update(T0 + 121_000, "spine-01:p1", 0, 0, &[65001]));
        let first = bins.iter().find(|b| b.bin_start == T0).unwrap();
        assert_eq!(first.announcements_total, 3);
        assert_eq!(first.withdrawals_total, 3);
        assert_eq!(first.peer_count, 2);
        // Two unique AS paths over three updates.
        assert!((first.as_path_churn - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(first.bin_end, first.bin_start + 30_000);
    }

    #[test]
    fn test_out_of_order_within_lag_accepted() {
        let mut agg = aggregator();
        agg.ingest(&update(T0 + 1_000, "tor-01", 1, 0, &[65001]));
        agg.ingest(&update(T0 + 65_000, "tor-01", 1, 0, &[65001]));
        // 63 s behind the watermark but its bin is still open (lag 60 s
        // only sheds bins whose end passed the watermark minus lag).
        let late = agg.ingest(&update(T0 + 2_000, "tor-01", 5, 0, &[65002]));
        assert!(late.is_empty());
        assert_eq!(agg.stats().bgp_lag_drops, 0);

        let bins = agg.ingest(&update(T0 + 151_000, "tor-01", 0, 0, &[65001]));
        let first = bins.iter().find(|b| b.bin_start == T0).unwrap();
        assert_eq!(first.announcements_total, 6);
    }

    #[test]
    fn test_stale_update_dropped_and_counted() {
        let mut agg = aggregator();
        agg.ingest(&update(T0 + 1_000, "tor-01", 1, 0, &[65001]));
        // Jump the watermark far ahead, emitting the first bin.
        let bins = agg.ingest(&update(T0 + 200_000, "tor-01", 1, 0, &[65001]));
        assert!(bins.iter().any(|b| b.bin_start == T0));

        let before = agg.stats().bins_emitted;
        agg.ingest(&update(T0 + 3_000, "tor-01", 9, 0, &[65009]));
        assert_eq!(agg.stats().bgp_lag_drops, 1);
        // The stale update contributed nothing.
        assert_eq!(agg.stats().bins_emitted, before);
    }

    #[test]
    fn test_idle_devices_emit_zero_bins() {
        let mut agg = aggregator();
        agg.ingest(&update(T0 + 1_000, "spine-01", 1, 0, &[65001]));
        agg.ingest(&update(T0 + 2_000, "tor-01", 1, 0, &[65001]));
        // Only spine-01 stays active for the next two bins.
        agg.ingest(&update(T0 + 31_000, "spine-01", 1, 0, &[65001]));
        let bins = agg.ingest(&update(T0 + 181_000, "spine-01", 1, 0, &[65001]));

        let tor_bins: Vec<&FeatureBin> =
            bins.iter().filter(|b| b.device == "tor-01").collect();
        assert!(tor_bins.len() >= 2);
        assert!(tor_bins[1..].iter().all(|b| b.peer_count == 0 && b.announcements_total == 0));
        // Contiguous cadence.
        for pair in tor_bins.windows(2) {
            assert_eq!(pair[0].bin_end, pair[1].bin_start);
        }
    }

    #[test]
    fn test_wall_clock_flush() {
        let mut agg = aggregator();
        agg.ingest(&update(T0 + 1_000, "spine-01", 2, 1, &[65001]));
        // Nothing closes on event time alone.
        assert!(agg.flush(T0 + 30_000).is_empty());
        // Past bin end + flush delay, the bin is emitted.
        let bins = agg.flush(T0 + 36_000);
        assert_eq!(bins.len(), 1);
        assert_eq!(bins[0].withdrawals_total, 1);
    }

    #[test]
    fn test_malformed_update_counted_not_fatal() {
        let mut agg = aggregator();
        let mut bad = update(T0 + 1_000, "spine-01", 1, 1, &[65001]);
        bad.withdraw = bad.announce.clone();
        assert!(agg.ingest(&bad).is_empty());
        assert_eq!(agg.stats().malformed_records, 1);
        assert_eq!(agg.stats().updates_ingested, 0);
    }
}
