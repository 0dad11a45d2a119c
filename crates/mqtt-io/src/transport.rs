//! Broker transport over rumqttc

use crate::topics;
use rumqttc::{AsyncClient, ClientError, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;

/// How long to wait for the broker's CONNACK before giving up
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport errors
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("invalid broker URL '{0}': expected tcp://host:port")]
    InvalidUrl(String),

    #[error("connection to broker failed: {0}")]
    Connect(String),

    #[error("subscription failed: {0}")]
    Subscribe(#[source] ClientError),

    #[error("publish to '{topic}' failed: {source}")]
    Publish {
        topic: String,
        #[source]
        source: ClientError,
    },

    #[error("QoS out of range: {0}")]
    BadQos(u8),
}

/// Outbound publish capability, separated from the transport so the
/// engine can run against a recording stub in tests.
pub trait Publisher: Send + Sync {
    fn publish(
        &self,
        topic: &str,
        payload: &str,
        qos: u8,
        retained: bool,
    ) -> Result<(), TransportError>;
}

/// A message delivered by the broker
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub topic: String,
    pub payload: String,
    pub retained: bool,
}

fn to_qos(qos: u8) -> Result<QoS, TransportError> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(TransportError::BadQos(other)),
    }
}

/// Parse `tcp://host:port` (port optional, default 1883).
fn parse_broker_url(url: &str) -> Result<(String, u16), TransportError> {
    let rest = url
        .strip_prefix("tcp://")
        .ok_or_else(|| TransportError::InvalidUrl(url.to_string()))?;
    match rest.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port
                .parse::<u16>()
                .map_err(|_| TransportError::InvalidUrl(url.to_string()))?;
            Ok((host.to_string(), port))
        }
        None if !rest.is_empty() => Ok((rest.to_string(), 1883)),
        _ => Err(TransportError::InvalidUrl(url.to_string())),
    }
}

/// MQTT transport for the engine
///
/// Owns the rumqttc client; the event loop runs in a background task that
/// forwards publishes to the channel returned from [`MqttTransport::connect`].
pub struct MqttTransport {
    client: AsyncClient,
}

impl MqttTransport {
    /// Connect to the broker and start the event loop task.
    ///
    /// Returns once the broker has acknowledged the connection; an
    /// unreachable broker is reported as [`TransportError::Connect`].
    pub async fn connect(
        broker_url: &str,
        client_id: &str,
        mqtt_debug: bool,
    ) -> Result<(Self, mpsc::UnboundedReceiver<IncomingMessage>), TransportError> {
        let (host, port) = parse_broker_url(broker_url)?;

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();

        // Wait for CONNACK before handing the transport out, so the daemon
        // can exit early when the broker is unreachable.
        let connack = tokio::time::timeout(CONNECT_TIMEOUT, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(TransportError::Connect(e.to_string())),
                }
            }
        })
        .await;
        match connack {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(TransportError::Connect(format!(
                    "timed out after {CONNECT_TIMEOUT:?}"
                )))
            }
        }
        tracing::info!("connected to MQTT broker at {}", broker_url);

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let payload = String::from_utf8_lossy(&publish.payload).to_string();
                        if mqtt_debug {
                            tracing::debug!("mqtt <- {} '{}'", publish.topic, payload);
                        }
                        let message = IncomingMessage {
                            topic: publish.topic,
                            payload,
                            retained: publish.retain,
                        };
                        if msg_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Ok(event) => {
                        if mqtt_debug {
                            tracing::debug!("mqtt event: {:?}", event);
                        }
                    }
                    Err(e) => {
                        // rumqttc reconnects on the next poll; keep going
                        tracing::error!("MQTT connection error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok((Self { client }, msg_rx))
    }

    /// Subscribe to the engine's standard topic filters.
    pub async fn subscribe_all(&self) -> Result<(), TransportError> {
        for filter in topics::SUBSCRIPTIONS {
            self.client
                .subscribe(*filter, QoS::AtLeastOnce)
                .await
                .map_err(TransportError::Subscribe)?;
        }
        Ok(())
    }

    /// Subscribe to a single additional topic.
    pub async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(TransportError::Subscribe)
    }
}

impl Publisher for MqttTransport {
    fn publish(
        &self,
        topic: &str,
        payload: &str,
        qos: u8,
        retained: bool,
    ) -> Result<(), TransportError> {
        let qos = to_qos(qos)?;
        self.client
            .try_publish(topic, qos, retained, payload)
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                source: e,
            })
    }
}
