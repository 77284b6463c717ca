//! Optional observability endpoint.
//!
//! Serves JSON snapshots of the per-component counters at `/metrics` plus a
//! trivial `/healthz`. Operators observe all local error conditions through
//! these counters and the logs; there is no degraded-alert class.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::bgp::aggregator::AggregatorStats;
use crate::bgp::detector::MpStats;
use crate::correlation::CorrelationStats;
use crate::snmp::features::ExtractorStats;
use crate::snmp::forest::ForestStats;

/// Aggregated counters from every pipeline component.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub aggregator: AggregatorStats,
    pub mp_detector: MpStats,
    pub snmp_extractor: ExtractorStats,
    pub forest: ForestStats,
    pub correlation: CorrelationStats,
    pub alerts_published: u64,
}

pub type SharedStats = Arc<RwLock<PipelineStats>>;

pub fn shared_stats() -> SharedStats {
    Arc::new(RwLock::new(PipelineStats::default()))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics(State(stats): State<SharedStats>) -> Json<PipelineStats> {
    Json(stats.read().await.clone())
}

/// Serve the observability endpoint until the process exits.
pub async fn serve(addr: &str, stats: SharedStats) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics endpoint on {addr}"))?;
    info!("metrics endpoint listening on {addr}");
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(stats);
    axum::serve(listener, app).await.context("metrics server failed")
}
