//! Enriched alerts and their operator-facing text.
//!
//! An alert is only built once every required field can be populated; a
//! partially-enriched alert is never emitted.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::event::{
    BgpAnomaly, FailureKind, JoinKind, Priority, Severity, SnmpAnomaly,
};
use crate::topology::{Layer, Role};

/// The correlation block published with the alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelatedSummary {
    pub join_kind: JoinKind,
    /// Correlation strength in [0, 1].
    pub strength: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bgp_anomaly: Option<BgpAnomaly>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snmp_anomaly: Option<SnmpAnomaly>,
}

/// Topology triage block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Triage {
    pub device: String,
    pub role: Role,
    pub blast_radius: usize,
    pub affected_layers: Vec<Layer>,
    pub spof: bool,
    pub redundancy: String,
}

/// The alert published on the bus. All fields are always populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedAlert {
    pub alert_id: Uuid,
    pub ts: i64,
    pub kind: FailureKind,
    pub severity: Severity,
    pub priority: Priority,
    pub confidence: f64,
    pub correlated: CorrelatedSummary,
    pub triage: Triage,
    pub probable_root_cause: String,
    pub evidence: Vec<String>,
    pub recommended_actions: Vec<String>,
    pub estimated_resolution: String,
}

pub fn probable_root_cause(kind: FailureKind, device: &str) -> String {
    match kind {
        FailureKind::LinkFailure => format!("physical link failure at {device}"),
        FailureKind::HardwareDegradation => {
            format!("thermal or resource degradation on {device}")
        }
        FailureKind::BgpFlapping => format!("unstable BGP session at {device}"),
        FailureKind::RouterOverload => format!("control-plane overload on {device}"),
        FailureKind::UnclassifiedAnomaly => format!("anomalous behavior observed at {device}"),
    }
}

pub fn recommended_actions(kind: FailureKind, device: &str, priority: Priority) -> Vec<String> {
    let mut actions = match kind {
        FailureKind::LinkFailure => vec![
            format!("Check physical link status on {device}"),
            format!("Inspect interface error counters on {device}"),
            format!("Verify BGP session health toward {device}"),
        ],
        FailureKind::HardwareDegradation => vec![
            format!("Inspect cooling and fan trays on {device}"),
            format!("Review CPU and memory load on {device}"),
            format!("Schedule hardware diagnostics for {device}"),
        ],
        FailureKind::BgpFlapping => vec![
            format!("Verify BGP session stability on {device}"),
            format!("Check for interface instability on {device}"),
            format!("Review recent route policy changes affecting {device}"),
        ],
        FailureKind::RouterOverload => vec![
            format!("Review control-plane load on {device}"),
            format!("Check BGP table churn toward {device}"),
            format!("Consider draining traffic away from {device}"),
        ],
        FailureKind::UnclassifiedAnomaly => vec![
            format!("Inspect device health on {device}"),
            format!("Correlate with recent maintenance work around {device}"),
        ],
    };
    if priority == Priority::P1 {
        actions.push("Escalate to the on-call network engineer".to_string());
    }
    actions
}

pub fn estimated_resolution(kind: FailureKind, priority: Priority) -> String {
    let base = match kind {
        FailureKind::LinkFailure => "30-60 minutes",
        FailureKind::HardwareDegradation => "1-4 hours",
        FailureKind::BgpFlapping => "15-30 minutes",
        FailureKind::RouterOverload => "15-30 minutes",
        FailureKind::UnclassifiedAnomaly => "30-60 minutes",
    };
    if priority == Priority::P1 {
        format!("{base} (urgent)")
    } else {
        base.to_string()
    }
}

/// Human-readable evidence lines; one per contributing source, plus the
/// cross-modal confirmation when both fired.
pub fn build_evidence(
    bgp: Option<&BgpAnomaly>,
    snmp: Option<&SnmpAnomaly>,
    strength: f64,
) -> Vec<String> {
    let mut evidence = Vec::new();
    if let Some(b) = bgp {
        let series: Vec<&str> = b.detected_series.iter().map(|s| s.as_str()).collect();
        evidence.push(format!(
            "bgp: discord on {} (distance {:.2}, confidence {:.2})",
            series.join(", "),
            b.min_distance,
            b.confidence,
        ));
    }
    if let Some(s) = snmp {
        evidence.push(format!(
            "snmp: {} contributing (score {:.2}, severity {})",
            s.contributing_features.join(", "),
            s.score,
            s.severity,
        ));
    }
    if bgp.is_some() && snmp.is_some() {
        evidence.push(format!("multimodal confirmation (correlation strength {strength:.2})"));
    }
    evidence
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_cause_names_the_device() {
        let cause = probable_root_cause(FailureKind::LinkFailure, "spine-01");
        assert!(cause.contains("spine-01"));
    }

    #[test]
    fn test_p1_gets_escalation_action() {
        let p1 = recommended_actions(FailureKind::LinkFailure, "spine-01", Priority::P1);
        assert!(p1.iter().any(|a| a.contains("Escalate")));
        let p3 = recommended_actions(FailureKind::LinkFailure, "leaf-01", Priority::P3);
        assert!(!p3.iter().any(|a| a.contains("Escalate")));
        assert!(!p3.is_empty());
    }

    #[test]
    fn test_resolution_marks_urgency() {
        assert!(estimated_resolution(FailureKind::LinkFailure, Priority::P1).contains("urgent"));
        assert!(!estimated_resolution(FailureKind::LinkFailure, Priority::P2).contains("urgent"));
    }
}
