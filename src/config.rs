//! Runtime configuration.
//!
//! Loaded from a TOML file at startup, with environment overrides for the
//! deployment-specific knobs (`TRANSPORT_URL`, `LOG_LEVEL`, `METRICS_ADDR`).
//! Invalid values fail at load, not at use.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::bgp::aggregator::AggregatorConfig;
use crate::bgp::detector::MpDetectorConfig;
use crate::correlation::CorrelatorConfig;
use crate::snmp::features::ExtractorConfig;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub binning: BinningConfig,

    #[serde(default)]
    pub snmp: SnmpConfig,

    #[serde(default)]
    pub thresholds: ThresholdConfig,

    #[serde(default)]
    pub correlation: CorrelationConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from file and apply environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path.as_ref().display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.as_ref().display()))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Environment wins over the file for deployment-specific settings.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("TRANSPORT_URL") {
            if !url.is_empty() {
                self.transport.url = url;
            }
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            if !level.is_empty() {
                self.general.log_level = level;
            }
        }
        if let Ok(addr) = std::env::var("METRICS_ADDR") {
            if !addr.is_empty() {
                self.metrics.addr = Some(addr);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.binning.bin_seconds == 0 {
            bail!("binning.bin_seconds must be positive");
        }
        if self.binning.window_bins < 4 {
            bail!("binning.window_bins must be at least 4");
        }
        if !(0.0 < self.thresholds.if_contamination && self.thresholds.if_contamination < 0.5) {
            bail!("thresholds.if_contamination must be in (0, 0.5)");
        }
        if self.thresholds.mp_discord <= 0.0 {
            bail!("thresholds.mp_discord must be positive");
        }
        if self.thresholds.correlation_window_secs == 0 {
            bail!("thresholds.correlation_window_secs must be positive");
        }
        for (name, w) in [
            ("w_time", self.correlation.w_time),
            ("w_conf", self.correlation.w_conf),
            ("w_adj", self.correlation.w_adj),
        ] {
            if !(0.0..=1.0).contains(&w) {
                bail!("correlation.{name} must be in [0, 1]");
            }
        }
        if self.correlation.channel_capacity == 0 {
            bail!("correlation.channel_capacity must be positive");
        }
        Ok(())
    }

    pub fn aggregator(&self) -> AggregatorConfig {
        AggregatorConfig {
            bin_seconds: self.binning.bin_seconds,
            flush_delay_seconds: self.binning.flush_delay_seconds,
            max_bin_lag_seconds: self
                .binning
                .max_bin_lag_seconds
                .unwrap_or(self.binning.bin_seconds * 2),
        }
    }

    pub fn mp_detector(&self) -> MpDetectorConfig {
        MpDetectorConfig {
            window_bins: self.binning.window_bins,
            discord_threshold: self.thresholds.mp_discord,
        }
    }

    pub fn snmp_extractor(&self) -> ExtractorConfig {
        ExtractorConfig { window_seconds: self.snmp.window_seconds }
    }

    pub fn correlator(&self) -> CorrelatorConfig {
        CorrelatorConfig {
            correlation_window_secs: self.thresholds.correlation_window_secs,
            cooldown_seconds: self.thresholds.cooldown_seconds,
            adjacency_hops: self.correlation.adjacency_hops,
            w_time: self.correlation.w_time,
            w_conf: self.correlation.w_conf,
            w_adj: self.correlation.w_adj,
            single_source_bgp_confidence: self.thresholds.single_source_bgp_confidence,
            spine_blast_threshold: self.thresholds.spine_blast_threshold,
            tor_blast_threshold: self.thresholds.tor_blast_threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Path to the topology + roles file.
    #[serde(default = "default_topology_path")]
    pub topology_path: PathBuf,

    /// Path to the isolation forest model; `--model` on the CLI overrides.
    #[serde(default)]
    pub model_path: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            topology_path: default_topology_path(),
            model_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinningConfig {
    #[serde(default = "default_bin_seconds")]
    pub bin_seconds: u64,

    /// Matrix profile subsequence length, in bins.
    #[serde(default = "default_window_bins")]
    pub window_bins: usize,

    #[serde(default = "default_flush_delay")]
    pub flush_delay_seconds: u64,

    /// Defaults to `2 * bin_seconds` when unset.
    #[serde(default)]
    pub max_bin_lag_seconds: Option<u64>,
}

impl Default for BinningConfig {
    fn default() -> Self {
        Self {
            bin_seconds: default_bin_seconds(),
            window_bins: default_window_bins(),
            flush_delay_seconds: default_flush_delay(),
            max_bin_lag_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnmpConfig {
    /// Feature window per device, seconds.
    #[serde(default = "default_snmp_window")]
    pub window_seconds: u64,
}

impl Default for SnmpConfig {
    fn default() -> Self {
        Self { window_seconds: default_snmp_window() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Discord threshold, z-normalized distance units.
    #[serde(default = "default_mp_discord")]
    pub mp_discord: f64,

    /// Contamination rate used when fitting models.
    #[serde(default = "default_contamination")]
    pub if_contamination: f64,

    #[serde(default = "default_correlation_window")]
    pub correlation_window_secs: u64,

    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,

    #[serde(default = "default_spine_blast")]
    pub spine_blast_threshold: usize,

    #[serde(default = "default_tor_blast")]
    pub tor_blast_threshold: usize,

    /// BGP-only alerts need at least this confidence.
    #[serde(default = "default_single_source_confidence")]
    pub single_source_bgp_confidence: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            mp_discord: default_mp_discord(),
            if_contamination: default_contamination(),
            correlation_window_secs: default_correlation_window(),
            cooldown_seconds: default_cooldown(),
            spine_blast_threshold: default_spine_blast(),
            tor_blast_threshold: default_tor_blast(),
            single_source_bgp_confidence: default_single_source_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationConfig {
    /// Cross-device join reach in hops; 0 disables adjacency joins.
    #[serde(default = "default_adjacency_hops")]
    pub adjacency_hops: usize,

    #[serde(default = "default_w_time")]
    pub w_time: f64,

    #[serde(default = "default_w_conf")]
    pub w_conf: f64,

    #[serde(default = "default_w_adj")]
    pub w_adj: f64,

    /// Capacity of the detector-to-correlator channels.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Input drain deadline on shutdown, seconds.
    #[serde(default = "default_shutdown_drain")]
    pub shutdown_drain_secs: u64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            adjacency_hops: default_adjacency_hops(),
            w_time: default_w_time(),
            w_conf: default_w_conf(),
            w_adj: default_w_adj(),
            channel_capacity: default_channel_capacity(),
            shutdown_drain_secs: default_shutdown_drain(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Bus endpoint; `TRANSPORT_URL` overrides.
    #[serde(default = "default_transport_url")]
    pub url: String,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default = "default_bgp_topic")]
    pub bgp_topic: String,

    #[serde(default = "default_snmp_topic")]
    pub snmp_topic: String,

    #[serde(default = "default_alert_topic")]
    pub alert_topic: String,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,

    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,

    /// Runtime publish failures become fatal after this long.
    #[serde(default = "default_fatal_after")]
    pub fatal_after_secs: u64,

    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: default_transport_url(),
            client_id: default_client_id(),
            bgp_topic: default_bgp_topic(),
            snmp_topic: default_snmp_topic(),
            alert_topic: default_alert_topic(),
            backoff_base_secs: default_backoff_base(),
            backoff_cap_secs: default_backoff_cap(),
            fatal_after_secs: default_fatal_after(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsConfig {
    /// Observability endpoint, e.g. `127.0.0.1:9464`; `METRICS_ADDR`
    /// overrides. Disabled when unset.
    #[serde(default)]
    pub addr: Option<String>,
}

// Default value functions

fn default_log_level() -> String {
    "info".to_string()
}

fn default_topology_path() -> PathBuf {
    PathBuf::from("/etc/fabricmon/topology.yml")
}

fn default_bin_seconds() -> u64 {
    30
}

fn default_window_bins() -> usize {
    64
}

fn default_flush_delay() -> u64 {
    5
}

fn default_snmp_window() -> u64 {
    60
}

fn default_mp_discord() -> f64 {
    2.5
}

fn default_contamination() -> f64 {
    0.02
}

fn default_correlation_window() -> u64 {
    60
}

fn default_cooldown() -> u64 {
    120
}

fn default_spine_blast() -> usize {
    12
}

fn default_tor_blast() -> usize {
    4
}

fn default_single_source_confidence() -> f64 {
    0.85
}

fn default_adjacency_hops() -> usize {
    1
}

fn default_w_time() -> f64 {
    0.4
}

fn default_w_conf() -> f64 {
    0.5
}

fn default_w_adj() -> f64 {
    0.1
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_shutdown_drain() -> u64 {
    5
}

fn default_transport_url() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_client_id() -> String {
    "fabricmon".to_string()
}

fn default_bgp_topic() -> String {
    "fabric/telemetry/bgp".to_string()
}

fn default_snmp_topic() -> String {
    "fabric/telemetry/snmp".to_string()
}

fn default_alert_topic() -> String {
    "fabric/alerts".to_string()
}

fn default_backoff_base() -> u64 {
    1
}

fn default_backoff_cap() -> u64 {
    30
}

fn default_fatal_after() -> u64 {
    300
}
