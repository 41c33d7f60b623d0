//! In-memory channel-based transport.
//!
//! Uses a tokio broadcast channel as a broker shared by every client created
//! from the same root via [`ChannelTransport::peer`]. Each client runs one
//! delivery task, so its handlers see messages serially and in publish order.
//! Ideal for local development and testing without a broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{Message, MessageHandler, QoS, Result, SubscriptionTable, Transport, TransportError};

/// Channel capacity for broadcast.
const CHANNEL_CAPACITY: usize = 1024;

/// Client of an in-process broker.
pub struct ChannelTransport {
    /// Broadcast sender shared with all peers.
    sender: broadcast::Sender<Arc<Message>>,
    /// Handlers registered by this client.
    subscriptions: Arc<SubscriptionTable>,
    /// Delivery task, started on first subscribe.
    consumer: Mutex<Option<JoinHandle<()>>>,
    /// Set once `disconnect` has been called.
    closed: Mutex<bool>,
}

impl ChannelTransport {
    /// Create a new broker and return its first client.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        info!("Channel transport initialized");
        Self::with_sender(sender)
    }

    fn with_sender(sender: broadcast::Sender<Arc<Message>>) -> Self {
        Self {
            sender,
            subscriptions: Arc::new(SubscriptionTable::new()),
            consumer: Mutex::new(None),
            closed: Mutex::new(false),
        }
    }

    /// Create another client on the same broker with its own subscriptions.
    pub fn peer(&self) -> Self {
        Self::with_sender(self.sender.clone())
    }

    async fn ensure_open(&self) -> Result<()> {
        if *self.closed.lock().await {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }

    /// Start the delivery task if it is not running yet.
    async fn ensure_consuming(&self) {
        let mut consumer = self.consumer.lock().await;
        if consumer.is_some() {
            return;
        }

        // Receiver is created before returning so nothing published after
        // subscribe() can be missed.
        let mut receiver = self.sender.subscribe();
        let subscriptions = Arc::clone(&self.subscriptions);

        *consumer = Some(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => {
                        debug!(topic = %message.topic, "Received message via channel");
                        subscriptions.dispatch(&message).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        error!(skipped = n, "Channel consumer lagged, skipped messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Channel closed, stopping consumer");
                        break;
                    }
                }
            }
        }));

        debug!("Channel consumer started");
    }
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn subscribe(
        &self,
        filter: &str,
        _qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        self.ensure_open().await?;
        self.subscriptions.insert(filter, handler).await;
        self.ensure_consuming().await;
        debug!(filter = %filter, "Subscribed on channel transport");
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        let removed = self.subscriptions.remove(filter).await;
        debug!(filter = %filter, removed, "Unsubscribed on channel transport");
        Ok(())
    }

    #[tracing::instrument(name = "transport.publish", skip_all, fields(topic = %topic))]
    async fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<()> {
        self.ensure_open().await?;
        let message = Arc::new(Message::new(topic, payload, qos));

        // Send to channel (ignore error if no receivers)
        match self.sender.send(message) {
            Ok(receiver_count) => {
                debug!(receivers = receiver_count, "Published message to channel");
            }
            Err(_) => {
                debug!("Published message (no receivers)");
            }
        }
        Ok(())
    }

    async fn disconnect(&self, grace: Duration) -> Result<()> {
        *self.closed.lock().await = true;
        self.subscriptions.clear().await;

        if let Some(handle) = self.consumer.lock().await.take() {
            // Give already-queued deliveries a chance before stopping.
            tokio::time::sleep(grace).await;
            handle.abort();
        }

        info!("Channel transport disconnected");
        Ok(())
    }
}
