//! fabricmon: multimodal failure detection for routed data-center fabrics.
//!
//! Fuses BGP control-plane updates and SNMP device metrics into enriched,
//! topology-aware alerts. Three tasks run in parallel: the BGP path
//! (aggregation + matrix profile detection), the SNMP path (feature
//! extraction + isolation forest scoring), and the correlator, joined by
//! bounded channels. The topology graph and the fitted model are loaded
//! once at startup and shared read-only.

pub mod bgp;
pub mod config;
pub mod core;
pub mod correlation;
pub mod metrics;
pub mod snmp;
pub mod topology;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bgp::{FeatureAggregator, MatrixProfileDetector};
use crate::config::Config;
use crate::correlation::{AnomalySignal, Correlator};
use crate::metrics::SharedStats;
use crate::snmp::{ForestModel, SnmpFeatureExtractor};
use crate::topology::Topology;
use crate::transport::{publish_with_backoff, Transport};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The assembled pipeline, ready to run against a transport.
pub struct Fabricmon {
    config: Config,
    topology: Arc<Topology>,
    model: Option<ForestModel>,
    stats: SharedStats,
}

impl Fabricmon {
    /// `model` is `None` only in BGP-only mode.
    pub fn new(config: Config, topology: Topology, model: Option<ForestModel>) -> Self {
        Self {
            config,
            topology: Arc::new(topology),
            model,
            stats: metrics::shared_stats(),
        }
    }

    pub fn stats(&self) -> SharedStats {
        self.stats.clone()
    }

    /// Run all tasks until the shutdown signal flips or a runtime-fatal
    /// transport failure occurs. On shutdown every task drains its input
    /// for at most the configured deadline; armed correlator windows that
    /// never confirmed are dropped without emission.
    pub async fn run<T: Transport>(
        mut self,
        transport: T,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let model = self.model.take();
        let transport = Arc::new(transport);
        let drain = Duration::from_secs(self.config.correlation.shutdown_drain_secs);
        let capacity = self.config.correlation.channel_capacity;
        let (bgp_sig_tx, bgp_sig_rx) = mpsc::channel::<AnomalySignal>(capacity);
        let (snmp_sig_tx, snmp_sig_rx) = mpsc::channel::<AnomalySignal>(capacity);

        // All tasks watch one internal signal so that a runtime-fatal
        // transport failure in the correlator unwinds the detectors too.
        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);
        {
            let stop_tx = stop_tx.clone();
            let mut external = shutdown;
            tokio::spawn(async move {
                loop {
                    if external.changed().await.is_err() {
                        break;
                    }
                    if *external.borrow() {
                        let _ = stop_tx.send(true);
                        break;
                    }
                }
            });
        }

        if let Some(addr) = self.config.metrics.addr.clone() {
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = metrics::serve(&addr, stats).await {
                    warn!("metrics endpoint failed: {e:#}");
                }
            });
        }

        let bgp_updates = transport
            .subscribe_bgp()
            .await
            .context("failed to subscribe to BGP updates")?;
        let bgp_task = self.spawn_bgp_task(bgp_updates, bgp_sig_tx, stop_rx.clone(), drain);

        let snmp_task = if let Some(model) = model {
            let samples = transport
                .subscribe_snmp()
                .await
                .context("failed to subscribe to SNMP samples")?;
            Some(self.spawn_snmp_task(model, samples, snmp_sig_tx, stop_rx.clone(), drain))
        } else {
            warn!("running BGP-only: SNMP detection disabled, no model loaded");
            drop(snmp_sig_tx);
            None
        };

        let correlator_task = self.spawn_correlator_task(
            bgp_sig_rx,
            snmp_sig_rx,
            transport.clone(),
            stop_rx,
            stop_tx,
            drain,
        );

        info!(
            devices = self.topology.device_count(),
            "fabricmon pipeline started"
        );

        bgp_task.await.context("BGP task panicked")?;
        if let Some(task) = snmp_task {
            task.await.context("SNMP task panicked")?;
        }
        correlator_task.await.context("correlator task panicked")??;
        info!("fabricmon pipeline stopped");
        Ok(())
    }

    fn spawn_bgp_task(
        &self,
        mut updates: mpsc::Receiver<crate::core::BgpUpdate>,
        signals: mpsc::Sender<AnomalySignal>,
        mut shutdown: watch::Receiver<bool>,
        drain: Duration,
    ) -> JoinHandle<()> {
        let mut aggregator = FeatureAggregator::new(&self.config.aggregator());
        let mut detector = MatrixProfileDetector::new(self.config.mp_detector());
        let stats = self.stats.clone();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    maybe_update = updates.recv() => {
                        let Some(update) = maybe_update else { break };
                        let bins = aggregator.ingest(&update);
                        for bin in bins {
                            if let Some(anomaly) = detector.update(&bin) {
                                if signals.send(AnomalySignal::Bgp(anomaly)).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    _ = tick.tick() => {
                        for bin in aggregator.flush(now_ms()) {
                            if let Some(anomaly) = detector.update(&bin) {
                                if signals.send(AnomalySignal::Bgp(anomaly)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        let mut shared = stats.write().await;
                        shared.aggregator = aggregator.stats().clone();
                        shared.mp_detector = detector.stats().clone();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() { break }
                    }
                }
            }

            // Drain what is already queued, then stop.
            let deadline = tokio::time::Instant::now() + drain;
            while let Ok(Some(update)) = tokio::time::timeout_at(deadline, updates.recv()).await {
                for bin in aggregator.ingest(&update) {
                    if let Some(anomaly) = detector.update(&bin) {
                        if signals.send(AnomalySignal::Bgp(anomaly)).await.is_err() {
                            return;
                        }
                    }
                }
            }
            info!("BGP task drained and stopped");
        })
    }

    fn spawn_snmp_task(
        &self,
        mut model: ForestModel,
        mut samples: mpsc::Receiver<crate::core::SnmpSample>,
        signals: mpsc::Sender<AnomalySignal>,
        mut shutdown: watch::Receiver<bool>,
        drain: Duration,
    ) -> JoinHandle<()> {
        let mut extractor =
            SnmpFeatureExtractor::new(&self.config.snmp_extractor(), Some(&model.metadata));
        let stats = self.stats.clone();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    maybe_sample = samples.recv() => {
                        let Some(sample) = maybe_sample else { break };
                        if let Some(vector) = extractor.ingest(&sample) {
                            if let Some(anomaly) = model.predict(&vector) {
                                if signals.send(AnomalySignal::Snmp(anomaly)).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    _ = tick.tick() => {
                        for vector in extractor.flush(now_ms()) {
                            if let Some(anomaly) = model.predict(&vector) {
                                if signals.send(AnomalySignal::Snmp(anomaly)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        let mut shared = stats.write().await;
                        shared.snmp_extractor = extractor.stats().clone();
                        shared.forest = model.stats().clone();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() { break }
                    }
                }
            }

            let deadline = tokio::time::Instant::now() + drain;
            while let Ok(Some(sample)) = tokio::time::timeout_at(deadline, samples.recv()).await {
                if let Some(vector) = extractor.ingest(&sample) {
                    if let Some(anomaly) = model.predict(&vector) {
                        if signals.send(AnomalySignal::Snmp(anomaly)).await.is_err() {
                            return;
                        }
                    }
                }
            }
            info!("SNMP task drained and stopped");
        })
    }

    fn spawn_correlator_task<T: Transport>(
        &self,
        mut bgp_signals: mpsc::Receiver<AnomalySignal>,
        mut snmp_signals: mpsc::Receiver<AnomalySignal>,
        transport: Arc<T>,
        mut shutdown: watch::Receiver<bool>,
        stop_tx: Arc<watch::Sender<bool>>,
        drain: Duration,
    ) -> JoinHandle<Result<()>> {
        let mut correlator =
            Correlator::new(self.config.correlator(), self.topology.clone());
        let stats = self.stats.clone();
        let backoff_base = Duration::from_secs(self.config.transport.backoff_base_secs);
        let backoff_cap = Duration::from_secs(self.config.transport.backoff_cap_secs);
        let fatal_after = Duration::from_secs(self.config.transport.fatal_after_secs);

        tokio::spawn(async move {
            let publish = |alerts: Vec<correlation::EnrichedAlert>,
                           transport: Arc<T>,
                           stats: SharedStats| async move {
                for alert in alerts {
                    publish_with_backoff(&*transport, &alert, backoff_base, backoff_cap, fatal_after)
                        .await
                        .context("transport unavailable, giving up on publishing")?;
                    stats.write().await.alerts_published += 1;
                }
                Ok::<(), anyhow::Error>(())
            };

            let mut tick = tokio::time::interval(Duration::from_secs(1));
            let mut bgp_open = true;
            let mut snmp_open = true;
            let result: Result<()> = 'main: loop {
                if !bgp_open && !snmp_open {
                    break Ok(());
                }
                tokio::select! {
                    maybe = bgp_signals.recv(), if bgp_open => {
                        match maybe {
                            Some(signal) => {
                                let alerts = correlator.process(signal);
                                if let Err(e) = publish(alerts, transport.clone(), stats.clone()).await {
                                    break 'main Err(e);
                                }
                            }
                            None => bgp_open = false,
                        }
                    }
                    maybe = snmp_signals.recv(), if snmp_open => {
                        match maybe {
                            Some(signal) => {
                                let alerts = correlator.process(signal);
                                if let Err(e) = publish(alerts, transport.clone(), stats.clone()).await {
                                    break 'main Err(e);
                                }
                            }
                            None => snmp_open = false,
                        }
                    }
                    _ = tick.tick() => {
                        let alerts = correlator.tick(now_ms());
                        if let Err(e) = publish(alerts, transport.clone(), stats.clone()).await {
                            break 'main Err(e);
                        }
                        stats.write().await.correlation = correlator.stats().clone();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() { break Ok(()) }
                    }
                }
            };
            if let Err(e) = result {
                // Unwind the whole pipeline on a fatal transport failure.
                let _ = stop_tx.send(true);
                return Err(e);
            }

            // Drain queued anomalies; confirmed joins still publish, armed
            // windows that never confirm are dropped.
            let deadline = tokio::time::Instant::now() + drain;
            while bgp_open || snmp_open {
                let signal = tokio::select! {
                    maybe = bgp_signals.recv(), if bgp_open => match maybe {
                        Some(signal) => signal,
                        None => { bgp_open = false; continue }
                    },
                    maybe = snmp_signals.recv(), if snmp_open => match maybe {
                        Some(signal) => signal,
                        None => { snmp_open = false; continue }
                    },
                    _ = tokio::time::sleep_until(deadline) => break,
                };
                let alerts = correlator.process(signal);
                publish(alerts, transport.clone(), stats.clone()).await?;
            }
            stats.write().await.correlation = correlator.stats().clone();
            info!("correlator drained and stopped");
            Ok(())
        })
    }
}
