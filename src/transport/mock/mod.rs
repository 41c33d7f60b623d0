//! Mock transport implementation for testing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use super::{Message, MessageHandler, QoS, Result, SubscriptionTable, Transport, TransportError};

/// A transport call, as recorded by [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Subscribe(String),
    Unsubscribe(String),
    Publish(String),
}

impl Operation {
    pub fn topic(&self) -> &str {
        match self {
            Operation::Subscribe(t) | Operation::Unsubscribe(t) | Operation::Publish(t) => t,
        }
    }
}

/// Mock transport for testing.
///
/// Scripted replies registered with [`reply_on`](Self::reply_on) are delivered
/// to subscribers, in order, while the matching `publish` call is in progress.
#[derive(Default)]
pub struct MockTransport {
    subscriptions: SubscriptionTable,
    operations: RwLock<Vec<Operation>>,
    published: RwLock<Vec<Message>>,
    replies: RwLock<HashMap<String, Vec<Message>>>,
    fail_on_publish: RwLock<bool>,
    fail_on_subscribe: RwLock<Option<String>>,
    disconnected: RwLock<bool>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `replies` each time `topic` is published.
    pub async fn reply_on(&self, topic: impl Into<String>, replies: Vec<Message>) {
        self.replies.write().await.insert(topic.into(), replies);
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    /// Fail subscriptions to `filter`.
    pub async fn set_fail_on_subscribe(&self, filter: impl Into<String>) {
        *self.fail_on_subscribe.write().await = Some(filter.into());
    }

    /// Deliver a message to current subscribers, as if it arrived from the broker.
    pub async fn deliver(&self, message: Message) -> usize {
        self.subscriptions.dispatch(&message).await
    }

    pub async fn operations(&self) -> Vec<Operation> {
        self.operations.read().await.clone()
    }

    pub async fn published(&self) -> Vec<Message> {
        self.published.read().await.clone()
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.len().await
    }

    pub async fn is_disconnected(&self) -> bool {
        *self.disconnected.read().await
    }

    async fn record(&self, operation: Operation) {
        self.operations.write().await.push(operation);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn subscribe(
        &self,
        filter: &str,
        _qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        self.record(Operation::Subscribe(filter.to_string())).await;
        if self.fail_on_subscribe.read().await.as_deref() == Some(filter) {
            return Err(TransportError::Subscribe {
                topic: filter.to_string(),
                detail: "Mock subscribe failure".to_string(),
            });
        }
        self.subscriptions.insert(filter, handler).await;
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.record(Operation::Unsubscribe(filter.to_string())).await;
        self.subscriptions.remove(filter).await;
        Ok(())
    }

    async fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<()> {
        self.record(Operation::Publish(topic.to_string())).await;
        if *self.fail_on_publish.read().await {
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                detail: "Mock publish failure".to_string(),
            });
        }
        self.published
            .write()
            .await
            .push(Message::new(topic, payload, qos));

        let replies = self
            .replies
            .read()
            .await
            .get(topic)
            .cloned()
            .unwrap_or_default();
        for reply in replies {
            self.subscriptions.dispatch(&reply).await;
        }
        Ok(())
    }

    async fn disconnect(&self, _grace: Duration) -> Result<()> {
        *self.disconnected.write().await = true;
        self.subscriptions.clear().await;
        Ok(())
    }
}
