//! Anomaly signals and alert classification types.
//!
//! The detectors emit [`BgpAnomaly`] and [`SnmpAnomaly`] values over bounded
//! channels; everything downstream of the detectors speaks these types.

use serde::{Deserialize, Serialize};

use crate::bgp::aggregator::FeatureBin;

/// Severity levels, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }

    /// Severity of a BGP anomaly, derived from detection confidence.
    pub fn from_bgp_confidence(confidence: f64) -> Self {
        if confidence > 0.85 {
            Severity::Critical
        } else if confidence > 0.7 {
            Severity::Error
        } else if confidence > 0.5 {
            Severity::Warning
        } else {
            Severity::Info
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// BGP feature series monitored by the matrix profile detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BgpSeries {
    Withdrawals,
    Announcements,
    AsPathChurn,
}

impl BgpSeries {
    pub const ALL: [BgpSeries; 3] =
        [BgpSeries::Withdrawals, BgpSeries::Announcements, BgpSeries::AsPathChurn];

    pub fn as_str(&self) -> &'static str {
        match self {
            BgpSeries::Withdrawals => "withdrawals",
            BgpSeries::Announcements => "announcements",
            BgpSeries::AsPathChurn => "as_path_churn",
        }
    }
}

impl std::fmt::Display for BgpSeries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Discord signal from the matrix profile detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BgpAnomaly {
    /// End of the bin that produced the discord, epoch ms.
    pub ts: i64,
    pub device: String,
    /// Detection confidence in [0, 1].
    pub confidence: f64,
    /// Series whose discord distance crossed the threshold.
    pub detected_series: Vec<BgpSeries>,
    /// Largest discord distance among the flagged series.
    pub min_distance: f64,
    /// Raw per-series discord distances, kept as evidence.
    pub series_distances: Vec<(BgpSeries, f64)>,
    /// Flagged bins currently inside the ring span for this device.
    pub recent_discords: u32,
    /// The feature bin that triggered detection.
    pub bin: FeatureBin,
}

impl BgpAnomaly {
    pub fn severity(&self) -> Severity {
        Severity::from_bgp_confidence(self.confidence)
    }

    pub fn has_series(&self, series: BgpSeries) -> bool {
        self.detected_series.contains(&series)
    }
}

/// Outlier signal from the isolation forest detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnmpAnomaly {
    pub ts: i64,
    pub device: String,
    /// Detection confidence in [0, 1].
    pub confidence: f64,
    pub severity: Severity,
    /// Anomaly score in (0, 1]; higher is more anomalous.
    pub score: f64,
    /// Feature names ranked by |z-score| against the training baseline.
    pub contributing_features: Vec<String>,
}

impl SnmpAnomaly {
    pub fn has_contributing(&self, prefix: &str) -> bool {
        self.contributing_features.iter().any(|f| f.starts_with(prefix))
    }
}

/// Probable failure category assigned by the correlator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    LinkFailure,
    HardwareDegradation,
    BgpFlapping,
    RouterOverload,
    UnclassifiedAnomaly,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::LinkFailure => "link_failure",
            FailureKind::HardwareDegradation => "hardware_degradation",
            FailureKind::BgpFlapping => "bgp_flapping",
            FailureKind::RouterOverload => "router_overload",
            FailureKind::UnclassifiedAnomaly => "unclassified_anomaly",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How an alert's sources were joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    BgpOnly,
    SnmpOnly,
    Multimodal,
}

impl JoinKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinKind::BgpOnly => "bgp_only",
            JoinKind::SnmpOnly => "snmp_only",
            JoinKind::Multimodal => "multimodal",
        }
    }
}

impl std::fmt::Display for JoinKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Operator-facing priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    P1,
    P2,
    P3,
    P4,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
            Priority::P4 => "P4",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
