//! Transport boundary.
//!
//! The core consumes already-decoded records from a pub/sub bus and
//! publishes enriched alerts back onto it; everything else about the bus is
//! someone else's problem. The shipped implementation speaks MQTT with JSON
//! payloads; an in-process channel transport backs the tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::core::record::{BgpUpdate, SnmpSample};
use crate::correlation::EnrichedAlert;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport connect failed: {0}")]
    Connect(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscription already taken")]
    SubscriptionTaken,
}

/// The narrow interface the pipeline requires from the surrounding bus.
/// Subscriptions are at-least-once; duplicated records are tolerated
/// downstream, and publishing is idempotent via the alert id.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn subscribe_bgp(&self) -> Result<mpsc::Receiver<BgpUpdate>, TransportError>;
    async fn subscribe_snmp(&self) -> Result<mpsc::Receiver<SnmpSample>, TransportError>;
    async fn publish_alert(&self, alert: &EnrichedAlert) -> Result<(), TransportError>;
}

/// MQTT-backed transport. A background task owns the event loop, decodes
/// payloads by topic, and feeds the typed channels; decode failures are
/// counted and skipped.
pub struct MqttTransport {
    client: AsyncClient,
    alert_topic: String,
    bgp_rx: Mutex<Option<mpsc::Receiver<BgpUpdate>>>,
    snmp_rx: Mutex<Option<mpsc::Receiver<SnmpSample>>>,
    decode_errors: Arc<AtomicU64>,
}

impl MqttTransport {
    pub async fn connect(config: &TransportConfig) -> Result<Self, TransportError> {
        let (host, port) = parse_broker_url(&config.url)
            .ok_or_else(|| TransportError::Connect(format!("unparseable broker url: {}", config.url)))?;

        let mut options = MqttOptions::new(config.client_id.clone(), host, port);
        options.set_keep_alive(Duration::from_secs(15));
        let (client, mut eventloop) = AsyncClient::new(options, 64);

        for topic in [&config.bgp_topic, &config.snmp_topic] {
            client
                .subscribe(topic.clone(), QoS::AtLeastOnce)
                .await
                .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        }

        let (bgp_tx, bgp_rx) = mpsc::channel(config.channel_capacity);
        let (snmp_tx, snmp_rx) = mpsc::channel(config.channel_capacity);
        let decode_errors = Arc::new(AtomicU64::new(0));

        let bgp_topic = config.bgp_topic.clone();
        let snmp_topic = config.snmp_topic.clone();
        let errors = decode_errors.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        if publish.topic == bgp_topic {
                            match serde_json::from_slice::<BgpUpdate>(&publish.payload) {
                                Ok(update) => {
                                    if bgp_tx.send(update).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    errors.fetch_add(1, Ordering::Relaxed);
                                    debug!("undecodable BGP record: {e}");
                                }
                            }
                        } else if publish.topic == snmp_topic {
                            match serde_json::from_slice::<SnmpSample>(&publish.payload) {
                                Ok(sample) => {
                                    if snmp_tx.send(sample).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    errors.fetch_add(1, Ordering::Relaxed);
                                    debug!("undecodable SNMP record: {e}");
                                }
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // rumqttc reconnects on the next poll; just pace it.
                        warn!("MQTT event loop error: {e}");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
            info!("MQTT decode task stopped");
        });

        Ok(Self {
            client,
            alert_topic: config.alert_topic.clone(),
            bgp_rx: Mutex::new(Some(bgp_rx)),
            snmp_rx: Mutex::new(Some(snmp_rx)),
            decode_errors,
        })
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn subscribe_bgp(&self) -> Result<mpsc::Receiver<BgpUpdate>, TransportError> {
        self.bgp_rx.lock().await.take().ok_or(TransportError::SubscriptionTaken)
    }

    async fn subscribe_snmp(&self) -> Result<mpsc::Receiver<SnmpSample>, TransportError> {
        self.snmp_rx.lock().await.take().ok_or(TransportError::SubscriptionTaken)
    }

    async fn publish_alert(&self, alert: &EnrichedAlert) -> Result<(), TransportError> {
        let payload =
            serde_json::to_vec(alert).map_err(|e| TransportError::Publish(e.to_string()))?;
        self.client
            .publish(self.alert_topic.clone(), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }
}

/// Accepts `mqtt://host:port`, `tcp://host:port`, or bare `host:port`.
fn parse_broker_url(url: &str) -> Option<(String, u16)> {
    let rest = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);
    match rest.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            Some((host.to_string(), port.parse().ok()?))
        }
        None if !rest.is_empty() => Some((rest.to_string(), 1883)),
        _ => None,
    }
}

/// Publish with exponential backoff and jitter. Gives up once the retries
/// have consumed `fatal_after`; the caller treats that as a runtime-fatal
/// transport failure.
pub async fn publish_with_backoff<T: Transport + ?Sized>(
    transport: &T,
    alert: &EnrichedAlert,
    base: Duration,
    cap: Duration,
    fatal_after: Duration,
) -> Result<(), TransportError> {
    let started = tokio::time::Instant::now();
    let mut attempt = 0u32;
    loop {
        match transport.publish_alert(alert).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                if started.elapsed() >= fatal_after {
                    return Err(e);
                }
                let backoff = base.saturating_mul(2u32.saturating_pow(attempt)).min(cap);
                let jitter = rand::rng().random_range(0.5..1.0);
                let delay = backoff.mul_f64(jitter);
                warn!(attempt, ?delay, "alert publish failed, retrying: {e}");
                tokio::time::sleep(delay).await;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

/// In-process transport for tests and replay harnesses: records are fed
/// through plain channels and published alerts are collected in memory.
pub struct ChannelTransport {
    bgp_rx: Mutex<Option<mpsc::Receiver<BgpUpdate>>>,
    snmp_rx: Mutex<Option<mpsc::Receiver<SnmpSample>>>,
    alerts: Arc<Mutex<Vec<EnrichedAlert>>>,
}

/// Producer-side handles for a [`ChannelTransport`].
pub struct ChannelTransportHandles {
    pub bgp_tx: mpsc::Sender<BgpUpdate>,
    pub snmp_tx: mpsc::Sender<SnmpSample>,
    pub alerts: Arc<Mutex<Vec<EnrichedAlert>>>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, ChannelTransportHandles) {
        let (bgp_tx, bgp_rx) = mpsc::channel(capacity);
        let (snmp_tx, snmp_rx) = mpsc::channel(capacity);
        let alerts = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                bgp_rx: Mutex::new(Some(bgp_rx)),
                snmp_rx: Mutex::new(Some(snmp_rx)),
                alerts: alerts.clone(),
            },
            ChannelTransportHandles { bgp_tx, snmp_tx, alerts },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn subscribe_bgp(&self) -> Result<mpsc::Receiver<BgpUpdate>, TransportError> {
        self.bgp_rx.lock().await.take().ok_or(TransportError::SubscriptionTaken)
    }

    async fn subscribe_snmp(&self) -> Result<mpsc::Receiver<SnmpSample>, TransportError> {
        self.snmp_rx.lock().await.take().ok_or(TransportError::SubscriptionTaken)
    }

    async fn publish_alert(&self, alert: &EnrichedAlert) -> Result<(), TransportError> {
        self.alerts.lock().await.push(alert.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_url_parsing() {
        assert_eq!(parse_broker_url("mqtt://bus:1883"), Some(("bus".to_string(), 1883)));
        assert_eq!(parse_broker_url("tcp://10.0.0.5:11883"), Some(("10.0.0.5".to_string(), 11883)));
        assert_eq!(parse_broker_url("broker.fabric.local"), Some(("broker.fabric.local".to_string(), 1883)));
        assert_eq!(parse_broker_url("mqtt://:1883"), None);
        assert_eq!(parse_broker_url("bus:notaport"), None);
    }
}
