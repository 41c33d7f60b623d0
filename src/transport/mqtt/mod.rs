//! MQTT transport over mutual TLS.
//!
//! Authenticates with the claim certificate and key, trusting the configured
//! root CA. One spawned task polls the rumqttc event loop and dispatches
//! incoming publishes to the subscription table, so handlers run serially in
//! the order the broker delivered.
//!
//! `subscribe` returns once the broker's SUBACK grants the subscription, and
//! `publish` at QoS 1 or 2 once the broker acknowledged it. Both waits are
//! bounded by the connect timeout.

mod acks;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, SubscribeReasonCode,
    TlsConfiguration,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use self::acks::AckTracker;
use super::{
    Message, MessageHandler, MqttConfig, QoS, Result, SubscriptionTable, Transport,
    TransportError,
};

/// Pause between polls after a connection error; the next poll reconnects.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn from_mqtt_qos(qos: rumqttc::QoS) -> QoS {
    match qos {
        rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
        rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
        rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Whether a SUBACK refused any of the requested filters.
fn refused(return_codes: &[SubscribeReasonCode]) -> bool {
    return_codes
        .iter()
        .any(|code| matches!(code, SubscribeReasonCode::Failure))
}

async fn read_pem(path: &str) -> Result<Vec<u8>> {
    tokio::fs::read(Path::new(path))
        .await
        .map_err(|e| TransportError::Connection(format!("Failed to read '{path}': {e}")))
}

/// Connected MQTT session.
pub struct MqttTransport {
    client: AsyncClient,
    subscriptions: Arc<SubscriptionTable>,
    acks: Arc<AckTracker>,
    ack_timeout: Duration,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Connect to the broker and wait for its CONNACK.
    pub async fn connect(config: &MqttConfig, client_id: &str) -> Result<Self> {
        let ca = read_pem(&config.root_ca).await?;
        let certificate = read_pem(&config.claim_certificate).await?;
        let private_key = read_pem(&config.claim_private_key).await?;

        let mut options = MqttOptions::new(client_id, &config.endpoint, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_session(true);
        options.set_transport(rumqttc::Transport::tls_with_config(
            TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: Some((certificate, private_key)),
            },
        ));

        let (client, mut event_loop) = AsyncClient::new(options, config.channel_capacity);

        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
        let handshake = async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(_) => continue,
                    Err(e) => return Err(TransportError::Connection(e.to_string())),
                }
            }
        };
        tokio::time::timeout(connect_timeout, handshake)
            .await
            .map_err(|_| {
                TransportError::Connection(format!(
                    "No CONNACK from {}:{} within {:?}",
                    config.endpoint, config.port, connect_timeout
                ))
            })??;

        info!(
            endpoint = %config.endpoint,
            port = config.port,
            client_id = %client_id,
            "Connected to MQTT broker"
        );

        let subscriptions = Arc::new(SubscriptionTable::new());
        let acks = Arc::new(AckTracker::new());
        let handle = spawn_event_loop(
            event_loop,
            Arc::clone(&subscriptions),
            Arc::clone(&acks),
        );

        Ok(Self {
            client,
            subscriptions,
            acks,
            ack_timeout: connect_timeout,
            event_loop: Mutex::new(Some(handle)),
        })
    }

    /// Send SUBSCRIBE and wait for a SUBACK granting it.
    async fn subscribe_acknowledged(&self, filter: &str, qos: QoS) -> Result<()> {
        let failed = |detail: String| TransportError::Subscribe {
            topic: filter.to_string(),
            detail,
        };

        let ack = {
            let _request = self.acks.request_lock().await;
            let ack = self.acks.expect_suback().await;
            if let Err(e) = self.client.subscribe(filter, to_mqtt_qos(qos)).await {
                self.acks.abandon_subscribe().await;
                return Err(failed(e.to_string()));
            }
            ack
        };

        let return_codes = match tokio::time::timeout(self.ack_timeout, ack).await {
            Ok(Ok(return_codes)) => return_codes,
            Ok(Err(_)) => return Err(failed("connection closed before SUBACK".to_string())),
            Err(_) => return Err(failed(format!("no SUBACK within {:?}", self.ack_timeout))),
        };

        if refused(&return_codes) {
            return Err(failed("broker refused the subscription".to_string()));
        }
        Ok(())
    }

    /// Send PUBLISH and, above QoS 0, wait for the broker's acknowledgement.
    async fn publish_acknowledged(
        &self,
        topic: &str,
        qos: QoS,
        payload: Vec<u8>,
    ) -> Result<()> {
        let failed = |detail: String| TransportError::Publish {
            topic: topic.to_string(),
            detail,
        };

        if qos == QoS::AtMostOnce {
            return self
                .client
                .publish(topic, to_mqtt_qos(qos), false, payload)
                .await
                .map_err(|e| failed(e.to_string()));
        }

        let ack = {
            let _request = self.acks.request_lock().await;
            let ack = self.acks.expect_puback().await;
            if let Err(e) = self
                .client
                .publish(topic, to_mqtt_qos(qos), false, payload)
                .await
            {
                self.acks.abandon_publish().await;
                return Err(failed(e.to_string()));
            }
            ack
        };

        match tokio::time::timeout(self.ack_timeout, ack).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(failed("connection closed before acknowledgement".to_string())),
            Err(_) => Err(failed(format!(
                "no acknowledgement within {:?}",
                self.ack_timeout
            ))),
        }
    }
}

fn spawn_event_loop(
    mut event_loop: EventLoop,
    subscriptions: Arc<SubscriptionTable>,
    acks: Arc<AckTracker>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = Message {
                        topic: publish.topic,
                        payload: publish.payload,
                        qos: from_mqtt_qos(publish.qos),
                    };
                    debug!(
                        topic = %message.topic,
                        bytes = message.payload.len(),
                        "Received MQTT publish"
                    );
                    subscriptions.dispatch(&message).await;
                }
                Ok(Event::Incoming(Packet::SubAck(suback))) => {
                    acks.suback(suback.pkid, suback.return_codes).await;
                }
                Ok(Event::Incoming(Packet::PubAck(puback))) => {
                    acks.puback(puback.pkid).await;
                }
                Ok(Event::Incoming(Packet::PubComp(pubcomp))) => {
                    acks.puback(pubcomp.pkid).await;
                }
                Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                    acks.subscribe_sent(pkid).await;
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                    acks.publish_sent(pkid).await;
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("MQTT disconnect sent, stopping event loop");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "MQTT connection error, retrying");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
        acks.clear().await;
    })
}

#[async_trait]
impl Transport for MqttTransport {
    async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        // Handler goes in first so deliveries racing the SUBACK are kept.
        self.subscriptions.insert(filter, handler).await;

        if let Err(e) = self.subscribe_acknowledged(filter, qos).await {
            self.subscriptions.remove(filter).await;
            return Err(e);
        }

        debug!(filter = %filter, qos = %qos, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.subscriptions.remove(filter).await;
        self.client
            .unsubscribe(filter)
            .await
            .map_err(|e| TransportError::Unsubscribe {
                topic: filter.to_string(),
                detail: e.to_string(),
            })?;

        debug!(filter = %filter, "Unsubscribed");
        Ok(())
    }

    #[tracing::instrument(name = "transport.publish", skip_all, fields(topic = %topic))]
    async fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<()> {
        self.publish_acknowledged(topic, qos, payload.to_vec()).await?;

        debug!(bytes = payload.len(), qos = %qos, "Published");
        Ok(())
    }

    async fn disconnect(&self, grace: Duration) -> Result<()> {
        let requested = self.client.disconnect().await;
        self.subscriptions.clear().await;
        self.acks.clear().await;

        if let Some(mut handle) = self.event_loop.lock().await.take() {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                debug!(?grace, "Event loop still running after grace period, aborting");
                handle.abort();
            }
        }

        requested.map_err(|e| TransportError::Connection(format!("Disconnect failed: {e}")))?;
        info!("Disconnected from MQTT broker");
        Ok(())
    }
}
