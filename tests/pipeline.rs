//! End-to-end scenarios: injected telemetry in, enriched alerts out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use fabricmon::bgp::aggregator::FeatureBin;
use fabricmon::config::Config;
use fabricmon::core::{
    BgpAnomaly, BgpMessageKind, BgpSeries, BgpUpdate, FailureKind, JoinKind, Priority, Severity,
    SnmpAnomaly, SnmpSample,
};
use fabricmon::correlation::{AnomalySignal, Correlator, EnrichedAlert};
use fabricmon::snmp::features::{schema_hash, FEATURE_NAMES};
use fabricmon::snmp::forest::{ForestConfig, ForestModel};
use fabricmon::topology::{Role, Topology};
use fabricmon::transport::ChannelTransport;
use fabricmon::Fabricmon;

const T0: i64 = 1_700_000_400_000;

/// A leaf-spine fabric where spine-01 fans out to sixteen downstream
/// devices and tor-01 carries a rack of four.
fn fabric() -> Topology {
    let mut yaml = String::from("devices:\n");
    yaml.push_str("  spine-01: { role: spine, neighbors: [tor-01, tor-02, tor-03, tor-04], priority: critical }\n");
    yaml.push_str("  spine-02: { role: spine, neighbors: [tor-01, tor-02, tor-03, tor-04], priority: critical }\n");
    for tor in 1..=4 {
        yaml.push_str(&format!(
            "  tor-0{tor}: {{ role: tor, neighbors: [leaf-0{tor}], priority: high }}\n"
        ));
        yaml.push_str(&format!(
            "  leaf-0{tor}: {{ role: leaf, neighbors: [server-0{a}, server-0{b}] }}\n",
            a = tor * 2 - 1,
            b = tor * 2,
        ));
    }
    for server in 1..=8 {
        yaml.push_str(&format!("  server-0{server}: {{ role: server }}\n"));
    }
    yaml.push_str("bgp_peers:\n  - [spine-01, tor-01]\n  - [spine-02, tor-01]\n");
    Topology::from_yaml(&yaml).unwrap()
}

fn correlator() -> Correlator {
    Correlator::new(Config::default().correlator(), Arc::new(fabric()))
}

fn bgp_anomaly(device: &str, ts: i64, series: &[BgpSeries], confidence: f64) -> BgpAnomaly {
    BgpAnomaly {
        ts,
        device: device.to_string(),
        confidence,
        detected_series: series.to_vec(),
        min_distance: 4.1,
        series_distances: series.iter().map(|s| (*s, 4.1)).collect(),
        recent_discords: 1,
        bin: FeatureBin {
            device: device.to_string(),
            bin_start: ts - 30_000,
            bin_end: ts,
            withdrawals_total: 47,
            announcements_total: 0,
            as_path_churn: 0.3,
            peer_count: 3,
        },
    }
}

fn snmp_anomaly(device: &str, ts: i64, features: &[&str], severity: Severity) -> SnmpAnomaly {
    SnmpAnomaly {
        ts,
        device: device.to_string(),
        confidence: 0.82,
        severity,
        score: 0.77,
        contributing_features: features.iter().map(|f| f.to_string()).collect(),
    }
}

/// Every published alert carries its full contract.
fn assert_well_formed(alert: &EnrichedAlert) {
    assert!(!alert.evidence.is_empty());
    assert!(!alert.recommended_actions.is_empty());
    assert!(!alert.probable_root_cause.is_empty());
    assert!(!alert.estimated_resolution.is_empty());
    assert!((0.0..=1.0).contains(&alert.confidence));
    assert!((0.0..=1.0).contains(&alert.correlated.strength));
    assert!(!alert.triage.device.is_empty());
}

#[test]
fn scenario_s2_bgp_only_flapping_on_tor() {
    let mut corr = correlator();
    let mut alerts = Vec::new();

    // Periodic announce/withdraw flagged every 30 s for ten minutes.
    for i in 0..20 {
        let ts = T0 + i * 30_000;
        let mut anomaly = bgp_anomaly(
            "tor-01",
            ts,
            &[BgpSeries::Announcements, BgpSeries::Withdrawals],
            0.95,
        );
        anomaly.recent_discords = (i + 1).min(8) as u32;
        alerts.extend(corr.process(AnomalySignal::Bgp(anomaly)));
    }
    alerts.extend(corr.tick(T0 + 800_000));

    assert!(alerts.len() >= 3, "got {} alerts", alerts.len());
    for alert in &alerts {
        assert_well_formed(alert);
        assert_eq!(alert.kind, FailureKind::BgpFlapping);
        assert_eq!(alert.correlated.join_kind, JoinKind::BgpOnly);
        assert_eq!(alert.priority, Priority::P2);
        assert!(alert.evidence.iter().any(|e| e.contains("announcements")));
        assert!(alert.evidence.iter().any(|e| e.contains("withdrawals")));
    }
    // At most one alert per (device, kind) per cooldown window.
    for pair in alerts.windows(2) {
        assert!(pair[1].ts - pair[0].ts >= 120_000);
    }
}

#[test]
fn scenario_s3_snmp_only_hardware_degradation_on_spine() {
    let mut corr = correlator();
    let mut alerts = corr.process(AnomalySignal::Snmp(snmp_anomaly(
        "spine-02",
        T0,
        &["temperature_max", "temperature_mean", "cpu_utilization_max"],
        Severity::Critical,
    )));
    alerts.extend(corr.tick(T0 + 300_000));

    assert_eq!(alerts.len(), 1);
    let alert = &alerts[0];
    assert_well_formed(alert);
    assert_eq!(alert.kind, FailureKind::HardwareDegradation);
    assert_eq!(alert.correlated.join_kind, JoinKind::SnmpOnly);
    assert_eq!(alert.severity, Severity::Critical);
    assert_eq!(alert.priority, Priority::P1);
    assert!(alert.evidence.iter().any(|e| e.contains("temperature_")));
    assert!(alert.evidence.iter().any(|e| e.contains("cpu_utilization_max")));
}

#[test]
fn scenario_s4_server_failure_stays_quiet() {
    let mut corr = correlator();
    // A marginal SNMP anomaly is all a dead server produces.
    let mut alerts = corr.process(AnomalySignal::Snmp(snmp_anomaly(
        "server-05",
        T0,
        &["interface_utilization"],
        Severity::Warning,
    )));
    alerts.extend(corr.tick(T0 + 300_000));
    assert!(alerts.is_empty());

    // Even a critical one stays local: P4, blast radius 1.
    let mut alerts = corr.process(AnomalySignal::Snmp(snmp_anomaly(
        "server-05",
        T0 + 400_000,
        &["temperature_max"],
        Severity::Critical,
    )));
    alerts.extend(corr.tick(T0 + 800_000));
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].priority, Priority::P4);
    assert_eq!(alerts[0].triage.blast_radius, 1);
}

#[test]
fn scenario_s5_dedup_under_repeated_anomaly() {
    let mut corr = correlator();
    let mut alerts = Vec::new();
    for round in 0..3 {
        let ts = T0 + round * 120_000;
        alerts.extend(corr.process(AnomalySignal::Bgp(bgp_anomaly(
            "spine-01",
            ts,
            &[BgpSeries::Withdrawals, BgpSeries::AsPathChurn],
            0.9,
        ))));
        alerts.extend(corr.process(AnomalySignal::Snmp(snmp_anomaly(
            "spine-01",
            ts + 5_000,
            &["interface_error_rate"],
            Severity::Error,
        ))));
    }

    assert_eq!(alerts.len(), 3);
    let mut ids: Vec<_> = alerts.iter().map(|a| a.alert_id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3, "alert ids must be unique");
    for alert in &alerts {
        assert_eq!(alert.triage.device, "spine-01");
        assert_eq!(alert.kind, FailureKind::LinkFailure);
    }
}

#[test]
fn scenario_s6_topology_miss() {
    let mut corr = correlator();
    let mut alerts = corr.process(AnomalySignal::Snmp(snmp_anomaly(
        "not-in-topology",
        T0,
        &["temperature_max"],
        Severity::Critical,
    )));
    alerts.extend(corr.tick(T0 + 300_000));

    assert_eq!(alerts.len(), 1);
    let alert = &alerts[0];
    assert_well_formed(alert);
    assert_eq!(alert.triage.role, Role::Unknown);
    assert_eq!(alert.triage.blast_radius, 1);
    assert_eq!(alert.priority, Priority::P3);
    assert_eq!(corr.stats().topology_unknown_device, 1);
}

/// Replaying the same inputs into a fresh correlator yields the same
/// alerts, alert ids aside.
#[test]
fn replay_determinism() {
    let run = || {
        let mut corr = correlator();
        let mut alerts = Vec::new();
        for round in 0..4 {
            let ts = T0 + round * 70_000;
            alerts.extend(corr.process(AnomalySignal::Bgp(bgp_anomaly(
                "spine-01",
                ts,
                &[BgpSeries::Withdrawals],
                0.92,
            ))));
            alerts.extend(corr.process(AnomalySignal::Snmp(snmp_anomaly(
                "tor-01",
                ts + 9_000,
                &["interface_error_rate"],
                Severity::Error,
            ))));
        }
        alerts.extend(corr.tick(T0 + 900_000));
        alerts
            .into_iter()
            .map(|a| {
                (a.triage.device.clone(), a.kind, a.priority, a.severity, a.ts, a.evidence.len())
            })
            .collect::<Vec<_>>()
    };
    assert_eq!(run(), run());
}

// Scenario S1, full pipeline: a withdrawal burst from spine-01's peers
// plus an interface error spike on spine-01, in through the transport
// boundary, out as one multimodal P1 link-failure alert.

fn bgp_update(ts: i64, peer: &str, announce: usize, withdraw: usize, path: &[u32]) -> BgpUpdate {
    BgpUpdate {
        ts,
        peer: peer.to_string(),
        kind: if withdraw > 0 { BgpMessageKind::Withdraw } else { BgpMessageKind::Update },
        announce: (0..announce).map(|i| format!("10.{i}.0.0/24")).collect(),
        withdraw: (0..withdraw).map(|i| format!("10.2{i}.0.0/24")).collect(),
        as_path: path.to_vec(),
        next_hop: Some("192.0.2.1".to_string()),
    }
}

fn snmp_sample(ts: i64, device: &str, cpu: f64, error_rate: f64, utilization: f64) -> SnmpSample {
    SnmpSample {
        ts,
        device: device.to_string(),
        metrics: [
            ("cpu_util".to_string(), cpu),
            ("mem_util".to_string(), 50.0),
            ("temperature_c".to_string(), 42.0),
            ("if_error_rate".to_string(), error_rate),
            ("if_utilization".to_string(), utilization),
        ]
        .into_iter()
        .collect(),
    }
}

/// Baseline rows shaped like what the extractor produces for the healthy
/// samples above, with enough wiggle for nonzero stds.
fn baseline_model() -> ForestModel {
    let rows: Vec<Vec<f64>> = (0..240)
        .map(|k| {
            let w = |scale: f64, j: usize| scale * (((k + j) % 9) as f64 / 9.0 - 0.5);
            vec![
                30.0 + w(4.0, 0),
                32.0 + w(4.0, 1),
                50.0 + w(3.0, 2),
                51.0 + w(3.0, 3),
                42.0 + w(2.0, 4),
                43.0 + w(2.0, 5),
                0.02 + w(0.01, 6),
                0.40 + w(0.06, 7),
                0.0,
                0.4 + w(0.04, 8),
            ]
        })
        .collect();
    let names: Vec<String> = FEATURE_NAMES.iter().map(|s| s.to_string()).collect();
    ForestModel::fit(&rows, &names, &schema_hash(), &ForestConfig::default()).unwrap()
}

fn s1_config() -> Config {
    let mut config = Config::default();
    config.binning.window_bins = 8;
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_s1_multimodal_link_failure_end_to_end() {
    let config = s1_config();
    let model = baseline_model();
    let pipeline = Fabricmon::new(config, fabric(), Some(model));
    let (transport, handles) = ChannelTransport::new(4096);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(pipeline.run(transport, shutdown_rx));

    // Event time sits in the wall-clock future so every bin and window
    // closes through event-time watermarks alone and the periodic
    // wall-clock flushes can never race the ingest path.
    let now = chrono::Utc::now().timestamp_millis();
    let base = (now + 600_000) - (now + 600_000).rem_euclid(30_000);

    for i in 0..33 {
        let ts = base + i * 30_000 + 3_000;
        let update = if i % 2 == 0 {
            bgp_update(ts, "spine-01:peer-a", 0, 4, &[65010, 65020])
        } else {
            bgp_update(ts, "spine-01:peer-a", 2, 0, &[65010, 65020])
        };
        handles.bgp_tx.send(update).await.unwrap();
    }
    // The burst: 47 withdrawals over ten seconds from spine-01's peers.
    let burst_start = base + 33 * 30_000;
    for (offset, withdrawn) in [(1_000, 10), (3_000, 10), (5_000, 9), (7_000, 9), (9_000, 9)] {
        handles
            .bgp_tx
            .send(bgp_update(burst_start + offset, "spine-01:peer-a", 0, withdrawn, &[65010, 65020]))
            .await
            .unwrap();
    }
    // Event-time closer so the burst bin is emitted without waiting for
    // the wall clock.
    handles
        .bgp_tx
        .send(bgp_update(burst_start + 120_000, "aux-probe", 0, 0, &[65099]))
        .await
        .unwrap();

    // SNMP: one healthy window, then the error spike in the 60 s window
    // that overlaps the burst. Windows align to 60 s boundaries, not bins.
    let w0 = burst_start - burst_start.rem_euclid(60_000);
    for offset in [5_000, 25_000, 45_000] {
        handles
            .snmp_tx
            .send(snmp_sample(w0 - 60_000 + offset, "spine-01", 30.0, 0.02, 0.4))
            .await
            .unwrap();
    }
    for offset in [5_000, 25_000, 45_000] {
        handles
            .snmp_tx
            .send(snmp_sample(w0 + offset, "spine-01", 38.0, 0.45, 0.95))
            .await
            .unwrap();
    }
    // Closer for the spike window.
    handles
        .snmp_tx
        .send(snmp_sample(w0 + 65_000, "spine-01", 30.0, 0.02, 0.4))
        .await
        .unwrap();

    // Wait for the alert to come out of the publish side.
    let mut published = Vec::new();
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        published = handles.alerts.lock().await.clone();
        if !published.is_empty() {
            break;
        }
    }

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("pipeline should stop on shutdown")
        .unwrap()
        .unwrap();

    assert!(!published.is_empty(), "no alert published");
    let alert = &published[0];
    assert_well_formed(alert);
    assert_eq!(alert.kind, FailureKind::LinkFailure);
    assert_eq!(alert.correlated.join_kind, JoinKind::Multimodal);
    assert_eq!(alert.priority, Priority::P1);
    assert_eq!(alert.triage.device, "spine-01");
    assert_eq!(alert.triage.role, Role::Spine);
    assert!(alert.triage.blast_radius >= 12);
    assert!(alert.evidence.iter().any(|e| e.contains("withdrawals")));
    assert!(alert.evidence.iter().any(|e| e.contains("interface_error_rate")));
    assert!(alert.correlated.bgp_anomaly.is_some());
    assert!(alert.correlated.snmp_anomaly.is_some());
    // Emitted within the correlation window plus one bin of the fault.
    assert!(alert.ts <= burst_start + 90_000);
}
