//! Multi-modal correlation and topology triage.
//!
//! Buffers recent BGP and SNMP anomalies per device, joins them across
//! modalities within the correlation window and one adjacency hop, enriches
//! the result with topology context, classifies a probable failure kind,
//! and emits deduplicated alerts.
//!
//! State machine per device window:
//! - first anomaly arms a window;
//! - an opposite-modality anomaly inside the window (same or adjacent
//!   device) confirms it and emits a multimodal alert immediately;
//! - an armed window that expires emits a single-source alert only when
//!   its strongest anomaly clears the single-source gate, otherwise it is
//!   dropped;
//! - after any emission the `(device, kind)` pair cools down; further
//!   emissions for the pair inside the cooldown are absorbed as evidence.

pub mod alert;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::event::{
    BgpAnomaly, FailureKind, JoinKind, Priority, Severity, SnmpAnomaly,
};
use crate::topology::{Role, Topology};

pub use alert::{CorrelatedSummary, EnrichedAlert, Triage};

/// One anomaly from either detector.
#[derive(Debug, Clone)]
pub enum AnomalySignal {
    Bgp(BgpAnomaly),
    Snmp(SnmpAnomaly),
}

impl AnomalySignal {
    pub fn ts(&self) -> i64 {
        match self {
            AnomalySignal::Bgp(a) => a.ts,
            AnomalySignal::Snmp(a) => a.ts,
        }
    }

    pub fn device(&self) -> &str {
        match self {
            AnomalySignal::Bgp(a) => &a.device,
            AnomalySignal::Snmp(a) => &a.device,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    pub correlation_window_secs: u64,
    pub cooldown_seconds: u64,
    /// Cross-device join reach; zero disables adjacency joins.
    pub adjacency_hops: usize,
    pub w_time: f64,
    pub w_conf: f64,
    pub w_adj: f64,
    /// BGP-only emission gate; the SNMP-only gate is critical severity.
    pub single_source_bgp_confidence: f64,
    pub spine_blast_threshold: usize,
    pub tor_blast_threshold: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            correlation_window_secs: 60,
            cooldown_seconds: 120,
            adjacency_hops: 1,
            w_time: 0.4,
            w_conf: 0.5,
            w_adj: 0.1,
            single_source_bgp_confidence: 0.85,
            spine_blast_threshold: 12,
            tor_blast_threshold: 4,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CorrelationStats {
    pub bgp_anomalies: u64,
    pub snmp_anomalies: u64,
    pub multimodal_joins: u64,
    pub single_source_emissions: u64,
    pub armed_expired: u64,
    pub cooldown_suppressed: u64,
    pub alerts_emitted: u64,
    pub topology_unknown_device: u64,
}

/// An armed per-device window holding not-yet-correlated anomalies.
#[derive(Debug, Default)]
struct PendingWindow {
    window_start: i64,
    bgp: Vec<BgpAnomaly>,
    snmp: Vec<SnmpAnomaly>,
}

/// Dedup record for an emitted `(device, kind)`. Anomalies suppressed
/// during the cooldown are absorbed here and folded into the next alert
/// emitted for the pair.
#[derive(Debug)]
struct CooldownState {
    last_emit_ts: i64,
    absorbed: u32,
    peak_confidence: f64,
}

pub struct Correlator {
    config: CorrelatorConfig,
    topology: Arc<Topology>,
    pending: HashMap<String, PendingWindow>,
    cooldowns: HashMap<(String, FailureKind), CooldownState>,
    /// Highest event timestamp observed, drives window expiry.
    watermark: i64,
    stats: CorrelationStats,
}

impl Correlator {
    pub fn new(config: CorrelatorConfig, topology: Arc<Topology>) -> Self {
        Self {
            config,
            topology,
            pending: HashMap::new(),
            cooldowns: HashMap::new(),
            watermark: 0,
            stats: CorrelationStats::default(),
        }
    }

    fn window_ms(&self) -> i64 {
        self.config.correlation_window_secs as i64 * 1000
    }

    fn cooldown_ms(&self) -> i64 {
        self.config.cooldown_seconds as i64 * 1000
    }

    /// Ingest one anomaly. Returns alerts produced by this step, including
    /// any armed windows the advancing watermark expired.
    pub fn process(&mut self, signal: AnomalySignal) -> Vec<EnrichedAlert> {
        match &signal {
            AnomalySignal::Bgp(_) => self.stats.bgp_anomalies += 1,
            AnomalySignal::Snmp(_) => self.stats.snmp_anomalies += 1,
        }
        self.watermark = self.watermark.max(signal.ts());
        let mut out = self.expire_windows(self.watermark);

        if let Some(partner_device) = self.find_join_partner(&signal) {
            let window = self.pending.remove(&partner_device).expect("partner listed");
            let (bgp, snmp) = match signal {
                AnomalySignal::Bgp(b) => {
                    let s = best_snmp(&window.snmp, b.ts).expect("partner has snmp");
                    (b, s)
                }
                AnomalySignal::Snmp(s) => {
                    let b = best_bgp(&window.bgp, s.ts).expect("partner has bgp");
                    (b, s)
                }
            };
            self.stats.multimodal_joins += 1;
            if let Some(alert) = self.emit(Some(bgp), Some(snmp), JoinKind::Multimodal) {
                out.push(alert);
            }
        } else {
            let ts = signal.ts();
            let window = self
                .pending
                .entry(signal.device().to_string())
                .or_insert_with(|| PendingWindow { window_start: ts, ..Default::default() });
            match signal {
                AnomalySignal::Bgp(a) => window.bgp.push(a),
                AnomalySignal::Snmp(a) => window.snmp.push(a),
            }
        }
        out
    }

    /// Wall-clock housekeeping for idle streams. The wall-driven watermark
    /// lags a full window behind real time so that cross-modal partners
    /// delayed by bin closing still get their chance to join.
    pub fn tick(&mut self, now_ms: i64) -> Vec<EnrichedAlert> {
        self.watermark = self.watermark.max(now_ms - self.window_ms());
        let alerts = self.expire_windows(self.watermark);
        let horizon = now_ms - 2 * self.cooldown_ms();
        self.cooldowns.retain(|_, state| state.last_emit_ts >= horizon);
        alerts
    }

    /// Armed window holding an opposite-modality anomaly within the
    /// correlation window, on the same or an adjacent device.
    fn find_join_partner(&self, signal: &AnomalySignal) -> Option<String> {
        let ts = signal.ts();
        let device = signal.device();
        let window_ms = self.window_ms();
        let wants_snmp = matches!(signal, AnomalySignal::Bgp(_));

        let has_partner = |candidate: &str| {
            self.pending.get(candidate).is_some_and(|w| {
                if wants_snmp {
                    w.snmp.iter().any(|a| (a.ts - ts).abs() <= window_ms)
                } else {
                    w.bgp.iter().any(|a| (a.ts - ts).abs() <= window_ms)
                }
            })
        };

        if has_partner(device) {
            return Some(device.to_string());
        }
        if self.config.adjacency_hops == 0 {
            return None;
        }
        let mut adjacent: Vec<&String> = self
            .pending
            .keys()
            .filter(|candidate| candidate.as_str() != device)
            .filter(|candidate| {
                self.topology.within_hops(device, candidate, self.config.adjacency_hops)
            })
            .filter(|candidate| has_partner(candidate))
            .collect();
        adjacent.sort();
        adjacent.first().map(|s| (*s).clone())
    }

    /// Expire armed windows the watermark has moved past; emit the ones
    /// whose strongest anomaly clears the single-source gate.
    fn expire_windows(&mut self, watermark: i64) -> Vec<EnrichedAlert> {
        let window_ms = self.window_ms();
        let mut due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, w)| watermark - w.window_start > window_ms)
            .map(|(device, _)| device.clone())
            .collect();
        due.sort();

        let mut out = Vec::new();
        for device in due {
            let window = self.pending.remove(&device).expect("listed above");
            let best_snmp = window
                .snmp
                .into_iter()
                .max_by(|a, b| a.severity.cmp(&b.severity).then(a.confidence.total_cmp(&b.confidence)));
            let best_bgp = window
                .bgp
                .into_iter()
                .max_by(|a, b| a.confidence.total_cmp(&b.confidence));

            if let Some(s) = best_snmp.filter(|s| s.severity >= Severity::Critical) {
                self.stats.single_source_emissions += 1;
                if let Some(alert) = self.emit(None, Some(s), JoinKind::SnmpOnly) {
                    out.push(alert);
                }
            } else if let Some(b) =
                best_bgp.filter(|b| b.confidence >= self.config.single_source_bgp_confidence)
            {
                self.stats.single_source_emissions += 1;
                if let Some(alert) = self.emit(Some(b), None, JoinKind::BgpOnly) {
                    out.push(alert);
                }
            } else {
                self.stats.armed_expired += 1;
                debug!(device, "armed window expired without emission");
            }
        }
        out
    }

    fn emit(
        &mut self,
        bgp: Option<BgpAnomaly>,
        snmp: Option<SnmpAnomaly>,
        join_kind: JoinKind,
    ) -> Option<EnrichedAlert> {
        // Hardware locality wins for naming the device: the SNMP side is
        // the box itself, the BGP side may be the far end of a link.
        let device = snmp
            .as_ref()
            .map(|s| s.device.clone())
            .or_else(|| bgp.as_ref().map(|b| b.device.clone()))?;
        let ts = bgp.iter().map(|b| b.ts).chain(snmp.iter().map(|s| s.ts)).max()?;
        let kind = classify(bgp.as_ref(), snmp.as_ref());

        let dedup_key = (device.clone(), kind);
        let cooldown_ms = self.cooldown_ms();
        if let Some(state) = self.cooldowns.get_mut(&dedup_key) {
            if ts - state.last_emit_ts < cooldown_ms {
                state.absorbed += 1;
                let confidence = combined_confidence(bgp.as_ref(), snmp.as_ref(), 0.0);
                state.peak_confidence = state.peak_confidence.max(confidence);
                self.stats.cooldown_suppressed += 1;
                debug!(
                    device,
                    kind = %kind,
                    absorbed = state.absorbed,
                    peak_confidence = state.peak_confidence,
                    "suppressed by cooldown"
                );
                return None;
            }
        }

        let triage = self.triage(&device);
        let severity = match (&bgp, &snmp) {
            (Some(b), Some(s)) => b.severity().max(s.severity),
            (Some(b), None) => b.severity(),
            (None, Some(s)) => s.severity,
            (None, None) => return None,
        };
        let strength = correlation_strength(
            &self.config,
            bgp.as_ref(),
            snmp.as_ref(),
            bgp.as_ref().map(|b| b.device == device).unwrap_or(true),
        );
        let mut confidence = combined_confidence(bgp.as_ref(), snmp.as_ref(), strength);
        let priority = derive_priority(
            triage.role,
            triage.blast_radius,
            join_kind,
            severity,
            self.config.spine_blast_threshold,
            self.config.tor_blast_threshold,
        );
        let mut evidence = alert::build_evidence(bgp.as_ref(), snmp.as_ref(), strength);

        // Anomalies absorbed during the previous cooldown for this pair
        // carry over: the new alert's confidence never reads lower than
        // what was suppressed, and the repeats show up as evidence.
        if let Some(prior) = self.cooldowns.get(&dedup_key) {
            if prior.absorbed > 0 {
                confidence = confidence.max(prior.peak_confidence).clamp(0.0, 1.0);
                evidence.push(format!(
                    "anomalies absorbed during cooldown: {} (peak confidence {:.2})",
                    prior.absorbed, prior.peak_confidence
                ));
            }
        }

        // peak_confidence starts at zero: it tracks only what the cooldown
        // goes on to absorb, not the alert just emitted.
        self.cooldowns.insert(
            dedup_key,
            CooldownState { last_emit_ts: ts, absorbed: 0, peak_confidence: 0.0 },
        );
        self.stats.alerts_emitted += 1;
        info!(
            device,
            kind = %kind,
            priority = %priority,
            severity = %severity,
            join = %join_kind,
            "alert emitted"
        );
        Some(EnrichedAlert {
            alert_id: Uuid::new_v4(),
            ts,
            kind,
            severity,
            priority,
            confidence,
            correlated: CorrelatedSummary { join_kind, strength, bgp_anomaly: bgp, snmp_anomaly: snmp },
            triage,
            probable_root_cause: alert::probable_root_cause(kind, &device),
            evidence,
            recommended_actions: alert::recommended_actions(kind, &device, priority),
            estimated_resolution: alert::estimated_resolution(kind, priority),
        })
    }

    fn triage(&mut self, device: &str) -> Triage {
        match self.topology.node(device) {
            Some(node) => Triage {
                device: device.to_string(),
                role: node.role,
                blast_radius: node.blast_radius,
                affected_layers: node.affected_layers.iter().copied().collect(),
                spof: node.spof,
                redundancy: if node.spof { "none" } else { "available" }.to_string(),
            },
            None => {
                self.stats.topology_unknown_device += 1;
                Triage {
                    device: device.to_string(),
                    role: Role::Unknown,
                    blast_radius: 1,
                    affected_layers: Vec::new(),
                    spof: false,
                    redundancy: "unknown".to_string(),
                }
            }
        }
    }

    pub fn stats(&self) -> &CorrelationStats {
        &self.stats
    }
}

fn best_snmp(candidates: &[SnmpAnomaly], ts: i64) -> Option<SnmpAnomaly> {
    candidates.iter().min_by_key(|a| (a.ts - ts).abs()).cloned()
}

fn best_bgp(candidates: &[BgpAnomaly], ts: i64) -> Option<BgpAnomaly> {
    candidates.iter().min_by_key(|a| (a.ts - ts).abs()).cloned()
}

/// Deterministic failure-kind classification over the contributing feature
/// set and the cross-modal pattern.
pub fn classify(bgp: Option<&BgpAnomaly>, snmp: Option<&SnmpAnomaly>) -> FailureKind {
    use crate::core::event::BgpSeries::{AsPathChurn, Withdrawals};

    match (bgp, snmp) {
        (Some(b), Some(s)) => {
            // Withdrawals co-occurring with interface errors mean the link
            // itself; churn without withdrawals points at the control
            // plane, not the wire.
            if b.has_series(Withdrawals) && s.has_contributing("interface_error_rate") {
                FailureKind::LinkFailure
            } else if b.has_series(AsPathChurn)
                && (s.has_contributing("cpu") || s.has_contributing("memory"))
            {
                FailureKind::RouterOverload
            } else {
                FailureKind::UnclassifiedAnomaly
            }
        }
        (None, Some(s)) => {
            if s.has_contributing("temperature_")
                || s.contributing_features.iter().any(|f| f == "cpu_utilization_max")
            {
                FailureKind::HardwareDegradation
            } else {
                FailureKind::UnclassifiedAnomaly
            }
        }
        (Some(b), None) => {
            if b.recent_discords >= 2 {
                FailureKind::BgpFlapping
            } else {
                FailureKind::UnclassifiedAnomaly
            }
        }
        (None, None) => FailureKind::UnclassifiedAnomaly,
    }
}

/// Priority is a pure function of role, blast radius, join kind, and
/// severity; unknown devices degrade to P3.
pub fn derive_priority(
    role: Role,
    blast_radius: usize,
    join_kind: JoinKind,
    severity: Severity,
    spine_blast_threshold: usize,
    tor_blast_threshold: usize,
) -> Priority {
    if matches!(role, Role::Spine | Role::Rr)
        || blast_radius >= spine_blast_threshold
        || (join_kind == JoinKind::Multimodal && severity == Severity::Critical)
    {
        Priority::P1
    } else if role == Role::Tor || blast_radius >= tor_blast_threshold {
        Priority::P2
    } else if role == Role::Unknown || role == Role::Leaf || blast_radius >= 2 {
        Priority::P3
    } else {
        Priority::P4
    }
}

/// `w_time * (1 - dt/window) + w_conf * mean(conf) + w_adj * adjacency`,
/// clipped to [0, 1]. Single-source events only carry the confidence term.
fn correlation_strength(
    config: &CorrelatorConfig,
    bgp: Option<&BgpAnomaly>,
    snmp: Option<&SnmpAnomaly>,
    same_device: bool,
) -> f64 {
    let strength = match (bgp, snmp) {
        (Some(b), Some(s)) => {
            let window_ms = (config.correlation_window_secs as f64) * 1000.0;
            let dt = (b.ts - s.ts).abs() as f64;
            let time_term = (1.0 - dt / window_ms).max(0.0);
            let conf_term = (b.confidence + s.confidence) / 2.0;
            let adjacency_bonus = if same_device { 1.0 } else { 0.5 };
            config.w_time * time_term + config.w_conf * conf_term + config.w_adj * adjacency_bonus
        }
        (Some(b), None) => config.w_conf * b.confidence,
        (None, Some(s)) => config.w_conf * s.confidence,
        (None, None) => 0.0,
    };
    strength.clamp(0.0, 1.0)
}

/// Mean source confidence, boosted by multimodal confirmation and scaled
/// by correlation strength.
fn combined_confidence(
    bgp: Option<&BgpAnomaly>,
    snmp: Option<&SnmpAnomaly>,
    strength: f64,
) -> f64 {
    let confidences: Vec<f64> = bgp
        .iter()
        .map(|b| b.confidence)
        .chain(snmp.iter().map(|s| s.confidence))
        .collect();
    if confidences.is_empty() {
        return 0.0;
    }
    let mut mean = confidences.iter().sum::<f64>() / confidences.len() as f64;
    if bgp.is_some() && snmp.is_some() {
        mean = (mean * 1.3).min(1.0);
    }
    (mean * (0.7 + 0.3 * strength)).clamp(0.0, 1.0)
}
