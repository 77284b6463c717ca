//! Command-line surface.
//!
//! Exit codes: 0 success, 2 invalid configuration, 3 model load failure,
//! 4 transport unavailable.

use std::io::BufRead;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use fabricmon::config::Config;
use fabricmon::core::SnmpSample;
use fabricmon::snmp::features::{schema_hash, ExtractorConfig, SnmpFeatureExtractor, FEATURE_NAMES};
use fabricmon::snmp::forest::{ForestConfig, ForestModel};
use fabricmon::topology::Topology;
use fabricmon::transport::MqttTransport;
use fabricmon::Fabricmon;

/// Startup failures mapped to process exit codes.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("invalid configuration: {0:#}")]
    Config(anyhow::Error),
    #[error("model load failure: {0:#}")]
    Model(anyhow::Error),
    #[error("transport unavailable: {0:#}")]
    Transport(anyhow::Error),
    #[error("{0:#}")]
    Other(anyhow::Error),
}

impl FatalError {
    pub fn exit_code(&self) -> i32 {
        match self {
            FatalError::Config(_) => 2,
            FatalError::Model(_) => 3,
            FatalError::Transport(_) => 4,
            FatalError::Other(_) => 1,
        }
    }
}

#[derive(Parser)]
#[command(name = "fabricmon")]
#[command(author, version, about = "multimodal anomaly detection for routed fabrics")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the detection pipeline
    Run {
        /// Path to the runtime configuration file
        #[arg(long)]
        config: PathBuf,

        /// Path to the isolation forest model (overrides the config)
        #[arg(long)]
        model: Option<PathBuf>,

        /// Keep running without SNMP detection when the model fails to load
        #[arg(long)]
        allow_bgp_only: bool,
    },

    /// Validate the configuration and topology, then exit
    ValidateConfig {
        /// Path to the runtime configuration file
        #[arg(long)]
        config: PathBuf,
    },

    /// Fit an isolation forest from a JSONL capture of SNMP samples
    TrainModel {
        /// Path to the runtime configuration file
        #[arg(long)]
        config: PathBuf,

        /// JSONL file with one SNMP sample record per line
        #[arg(long)]
        samples: PathBuf,

        /// Where to write the fitted model
        #[arg(long)]
        output: PathBuf,
    },
}

pub async fn run_command(cli: Cli) -> Result<(), FatalError> {
    match cli.command {
        Commands::Run { config, model, allow_bgp_only } => {
            run(config, model, allow_bgp_only).await
        }
        Commands::ValidateConfig { config } => validate_config(config),
        Commands::TrainModel { config, samples, output } => {
            train_model(config, samples, output).map_err(FatalError::Other)
        }
    }
}

async fn run(
    config_path: PathBuf,
    model_override: Option<PathBuf>,
    allow_bgp_only: bool,
) -> Result<(), FatalError> {
    let config = Config::load(&config_path).map_err(FatalError::Config)?;
    let topology = Topology::load(&config.general.topology_path).map_err(FatalError::Config)?;
    info!(
        devices = topology.device_count(),
        topology = %config.general.topology_path.display(),
        "topology loaded"
    );

    let model_path = model_override.or_else(|| config.general.model_path.clone());
    let model = match model_path {
        Some(path) => match ForestModel::load(&path) {
            Ok(model) => {
                if model.metadata.schema_hash != schema_hash() {
                    let err = anyhow::anyhow!(
                        "model feature schema {} does not match runtime schema {}",
                        model.metadata.schema_hash,
                        schema_hash()
                    );
                    if !allow_bgp_only {
                        return Err(FatalError::Model(err));
                    }
                    warn!("{err:#}; continuing BGP-only");
                    None
                } else {
                    info!(model = %path.display(), threshold = model.metadata.threshold, "model loaded");
                    Some(model)
                }
            }
            Err(e) if allow_bgp_only => {
                warn!("model load failed ({e:#}); continuing BGP-only");
                None
            }
            Err(e) => return Err(FatalError::Model(e)),
        },
        None if allow_bgp_only => {
            warn!("no model configured; continuing BGP-only");
            None
        }
        None => {
            return Err(FatalError::Model(anyhow::anyhow!(
                "no model path given; pass --model or set general.model_path (or --allow-bgp-only)"
            )))
        }
    };

    let transport = MqttTransport::connect(&config.transport)
        .await
        .map_err(|e| FatalError::Transport(e.into()))?;
    info!(url = %config.transport.url, "transport connected");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let pipeline = Fabricmon::new(config, topology, model);
    pipeline
        .run(transport, shutdown_rx)
        .await
        .map_err(FatalError::Transport)
}

fn validate_config(config_path: PathBuf) -> Result<(), FatalError> {
    let config = Config::load(&config_path).map_err(FatalError::Config)?;
    let topology = Topology::load(&config.general.topology_path).map_err(FatalError::Config)?;
    println!(
        "configuration valid: {} devices, bin {}s, correlation window {}s",
        topology.device_count(),
        config.binning.bin_seconds,
        config.thresholds.correlation_window_secs,
    );
    Ok(())
}

/// Replay a JSONL capture through the feature extractor and fit a forest
/// on the resulting vectors.
fn train_model(config_path: PathBuf, samples_path: PathBuf, output: PathBuf) -> Result<()> {
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config {}", config_path.display()))?;

    let file = std::fs::File::open(&samples_path)
        .with_context(|| format!("failed to open samples file {}", samples_path.display()))?;
    let reader = std::io::BufReader::new(file);

    let mut extractor =
        SnmpFeatureExtractor::new(&ExtractorConfig { window_seconds: config.snmp.window_seconds }, None);
    let mut rows = Vec::new();
    let mut skipped = 0usize;
    let mut last_ts = 0i64;
    for line in reader.lines() {
        let line = line.context("failed to read samples file")?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SnmpSample>(&line) {
            Ok(sample) => {
                last_ts = last_ts.max(sample.ts);
                if let Some(vector) = extractor.ingest(&sample) {
                    rows.push(vector.values);
                }
            }
            Err(_) => skipped += 1,
        }
    }
    for vector in extractor.flush(last_ts + config.snmp.window_seconds as i64 * 1000) {
        rows.push(vector.values);
    }
    if skipped > 0 {
        warn!(skipped, "ignored undecodable sample records");
    }

    let feature_names: Vec<String> = FEATURE_NAMES.iter().map(|s| s.to_string()).collect();
    let forest_config = ForestConfig {
        contamination: config.thresholds.if_contamination,
        ..Default::default()
    };
    let model = ForestModel::fit(&rows, &feature_names, &schema_hash(), &forest_config)?;
    model.save(&output)?;
    println!(
        "fitted {} vectors, threshold {:.4}, wrote {}",
        rows.len(),
        model.metadata.threshold,
        output.display()
    );
    Ok(())
}
