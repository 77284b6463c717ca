//! Streaming matrix profile detector.
//!
//! Keeps a fixed-capacity ring per (device, series) and recomputes the
//! profile's discord score on every closed bin. A series is flagged when
//! its discord distance reaches the configured threshold; warmup (fewer
//! than two subsequence lengths of history) emits nothing.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use tracing::{debug, warn};

use crate::bgp::aggregator::FeatureBin;
use crate::bgp::profile;
use crate::core::event::{BgpAnomaly, BgpSeries};

#[derive(Debug, Clone)]
pub struct MpDetectorConfig {
    /// Subsequence length W, in bins.
    pub window_bins: usize,
    /// Discord threshold in z-normalized distance units.
    pub discord_threshold: f64,
}

impl Default for MpDetectorConfig {
    fn default() -> Self {
        Self { window_bins: 64, discord_threshold: 2.5 }
    }
}

impl MpDetectorConfig {
    /// Ring capacity: three subsequence lengths of history.
    pub fn ring_capacity(&self) -> usize {
        self.window_bins * 3
    }

    fn warmup_len(&self) -> usize {
        self.window_bins * 2
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MpStats {
    pub bins_processed: u64,
    pub anomalies_emitted: u64,
    pub clamped_inputs: u64,
    pub mp_compute_errors: u64,
}

#[derive(Debug)]
struct SeriesRing {
    values: VecDeque<f64>,
    capacity: usize,
    last_valid: f64,
}

impl SeriesRing {
    fn new(capacity: usize) -> Self {
        Self { values: VecDeque::with_capacity(capacity), capacity, last_valid: 0.0 }
    }

    /// Push a sample, clamping non-finite input to the last valid value.
    /// Returns true when the input had to be clamped.
    fn push(&mut self, value: f64) -> bool {
        let clamped = !value.is_finite();
        let value = if clamped { self.last_valid } else { value };
        self.last_valid = value;
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
        clamped
    }

    fn as_slice(&mut self) -> &[f64] {
        self.values.make_contiguous()
    }

    fn len(&self) -> usize {
        self.values.len()
    }
}

#[derive(Debug)]
struct DeviceState {
    rings: [SeriesRing; 3],
    /// Timestamps of recently flagged bins, bounded by the ring span.
    recent_flags: VecDeque<i64>,
}

impl DeviceState {
    fn new(capacity: usize) -> Self {
        Self {
            rings: [
                SeriesRing::new(capacity),
                SeriesRing::new(capacity),
                SeriesRing::new(capacity),
            ],
            recent_flags: VecDeque::new(),
        }
    }
}

pub struct MatrixProfileDetector {
    config: MpDetectorConfig,
    devices: HashMap<String, DeviceState>,
    stats: MpStats,
}

impl MatrixProfileDetector {
    pub fn new(config: MpDetectorConfig) -> Self {
        Self { config, devices: HashMap::new(), stats: MpStats::default() }
    }

    /// Ingest one closed bin; `Some` iff any monitored series produced a
    /// discord at or above the threshold this step.
    pub fn update(&mut self, bin: &FeatureBin) -> Option<BgpAnomaly> {
        self.stats.bins_processed += 1;
        let capacity = self.config.ring_capacity();
        let state = self
            .devices
            .entry(bin.device.clone())
            .or_insert_with(|| DeviceState::new(capacity));

        let samples = [
            bin.withdrawals_total as f64,
            bin.announcements_total as f64,
            bin.as_path_churn,
        ];
        for (ring, sample) in state.rings.iter_mut().zip(samples) {
            if ring.push(sample) {
                self.stats.clamped_inputs += 1;
            }
        }

        if state.rings[0].len() < self.config.warmup_len() {
            return None;
        }

        let mut series_distances = Vec::with_capacity(3);
        let mut detected = Vec::new();
        let mut peak = 0.0f64;
        for (ring, series) in state.rings.iter_mut().zip(BgpSeries::ALL) {
            let Some(discord) = profile::max_discord(ring.as_slice(), self.config.window_bins)
            else {
                self.stats.mp_compute_errors += 1;
                return None;
            };
            if !discord.is_finite() {
                self.stats.mp_compute_errors += 1;
                warn!(device = %bin.device, series = %series, "non-finite discord score");
                return None;
            }
            series_distances.push((series, discord));
            peak = peak.max(discord);
            if discord >= self.config.discord_threshold {
                detected.push(series);
            }
        }

        if detected.is_empty() {
            return None;
        }

        // Track flagged bins inside the current ring span so the correlator
        // can recognize periodic flapping.
        let ring_span_ms =
            (bin.bin_end - bin.bin_start) * self.config.ring_capacity() as i64;
        state.recent_flags.push_back(bin.bin_end);
        while let Some(&front) = state.recent_flags.front() {
            if front < bin.bin_end - ring_span_ms {
                state.recent_flags.pop_front();
            } else {
                break;
            }
        }

        let threshold = self.config.discord_threshold;
        let confidence = ((peak - threshold) / threshold + 0.5).clamp(0.0, 1.0);
        let min_distance = detected
            .iter()
            .filter_map(|s| {
                series_distances.iter().find(|(series, _)| series == s).map(|(_, d)| *d)
            })
            .fold(0.0, f64::max);

        self.stats.anomalies_emitted += 1;
        debug!(
            device = %bin.device,
            series = ?detected,
            min_distance,
            confidence,
            "BGP discord detected"
        );
        Some(BgpAnomaly {
            ts: bin.bin_end,
            device: bin.device.clone(),
            confidence,
            detected_series: detected,
            min_distance,
            series_distances,
            recent_discords: state.recent_flags.len() as u32,
            bin: bin.clone(),
        })
    }

    pub fn stats(&self) -> &MpStats {
        &self.stats
    }
}
