//! Correlated request/response over publish/subscribe.
//!
//! A publish-only transport has no notion of a reply. An exchange pairs one
//! publish with subscriptions to its `accepted` and `rejected` topics and
//! waits, with a deadline, for whichever delivery arrives first.
//!
//! Each call allocates a fresh capacity-one hand-off channel. Both callbacks
//! `try_send` into it: the first delivery fills it, a second one finds it
//! full, and anything arriving after resolution finds it closed. The
//! exchange therefore resolves exactly once without shared mutable state.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::transport::{Message, MessageHandler, QoS, Transport};

/// Suffix of the topic on which a request is accepted.
pub const ACCEPTED_SUFFIX: &str = "accepted";
/// Suffix of the topic on which a request is rejected.
pub const REJECTED_SUFFIX: &str = "rejected";

// ============================================================================
// Types
// ============================================================================

/// A request to publish, and the topics its outcome arrives on.
#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    topic: String,
    accepted_topic: String,
    rejected_topic: String,
    payload: Bytes,
    qos: QoS,
}

impl ExchangeRequest {
    /// Request on `topic`, answered on `<topic>/accepted` or `<topic>/rejected`.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        let topic = topic.into();
        Self {
            accepted_topic: format!("{topic}/{ACCEPTED_SUFFIX}"),
            rejected_topic: format!("{topic}/{REJECTED_SUFFIX}"),
            topic,
            payload: payload.into(),
            qos,
        }
    }

    /// Request whose payload is `body` serialized as JSON.
    pub fn json<T: Serialize>(
        topic: impl Into<String>,
        body: &T,
        qos: QoS,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(topic, serde_json::to_vec(body)?, qos))
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn accepted_topic(&self) -> &str {
        &self.accepted_topic
    }

    pub fn rejected_topic(&self) -> &str {
        &self.rejected_topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }
}

/// Why an exchange failed. Every variant names the topic involved.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeFailure {
    #[error("publish failed: {detail}")]
    Publish { topic: String, detail: String },

    #[error("subscribe failed: {detail}")]
    Subscribe { topic: String, detail: String },

    /// The accepted payload did not parse as the expected response.
    #[error("malformed accepted response: {detail}")]
    Malformed {
        topic: String,
        detail: String,
        payload: String,
    },

    /// The service answered on the rejected topic; `body` is its raw payload.
    #[error("{body}")]
    Rejected { topic: String, body: String },
}

impl ExchangeFailure {
    pub fn topic(&self) -> &str {
        match self {
            ExchangeFailure::Publish { topic, .. }
            | ExchangeFailure::Subscribe { topic, .. }
            | ExchangeFailure::Malformed { topic, .. }
            | ExchangeFailure::Rejected { topic, .. } => topic,
        }
    }
}

/// The single result of an exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeOutcome<T> {
    Success(T),
    Failure(ExchangeFailure),
    TimedOut,
}

impl<T> ExchangeOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, ExchangeOutcome::Success(_))
    }

    fn kind(&self) -> &'static str {
        match self {
            ExchangeOutcome::Success(_) => "success",
            ExchangeOutcome::Failure(ExchangeFailure::Rejected { .. }) => "rejected",
            ExchangeOutcome::Failure(ExchangeFailure::Malformed { .. }) => "malformed",
            ExchangeOutcome::Failure(ExchangeFailure::Publish { .. }) => "publish_failed",
            ExchangeOutcome::Failure(ExchangeFailure::Subscribe { .. }) => "subscribe_failed",
            ExchangeOutcome::TimedOut => "timed_out",
        }
    }
}

/// Which response topic a delivery arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Accepted,
    Rejected,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Accepted => f.write_str(ACCEPTED_SUFFIX),
            Verdict::Rejected => f.write_str(REJECTED_SUFFIX),
        }
    }
}

/// Subscription callback feeding one exchange's hand-off channel.
struct ResponseHandler {
    verdict: Verdict,
    sender: mpsc::Sender<(Verdict, Message)>,
}

impl MessageHandler for ResponseHandler {
    fn handle(&self, message: &Message) {
        // Full: the exchange already has its answer. Closed: it has finished.
        if let Err(e) = self.sender.try_send((self.verdict, message.clone())) {
            debug!(
                topic = %message.topic,
                verdict = %self.verdict,
                reason = %e,
                "Ignoring delivery for resolved exchange"
            );
        }
    }
}

// ============================================================================
// Exchange
// ============================================================================

/// Turns publish + accept/reject subscriptions into one awaited call.
pub struct CorrelatedExchange {
    transport: Arc<dyn Transport>,
}

impl CorrelatedExchange {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Publish `request` and wait up to `timeout` for its outcome.
    ///
    /// Both response topics are subscribed before publishing and unsubscribed
    /// once the outcome is known, whatever it is. The deadline starts when
    /// the request is published.
    #[tracing::instrument(name = "exchange.execute", skip_all, fields(topic = %request.topic()))]
    pub async fn execute<T: DeserializeOwned>(
        &self,
        request: &ExchangeRequest,
        timeout: Duration,
    ) -> ExchangeOutcome<T> {
        let (sender, mut receiver) = mpsc::channel(1);

        if let Err(failure) = self.subscribe_responses(request, sender).await {
            return ExchangeOutcome::Failure(failure);
        }

        let started = Instant::now();
        let deadline = started + timeout;

        let outcome = match self
            .transport
            .publish(request.topic(), request.qos(), request.payload().clone())
            .await
        {
            Err(e) => ExchangeOutcome::Failure(ExchangeFailure::Publish {
                topic: request.topic().to_string(),
                detail: e.to_string(),
            }),
            Ok(()) => {
                debug!(timeout = ?timeout, "Request published, awaiting response");
                match tokio::time::timeout_at(deadline, receiver.recv()).await {
                    Ok(Some((verdict, message))) => resolve(verdict, &message),
                    // Senders live in the subscription table until unsubscribe
                    // below, so the channel cannot close while waiting.
                    Ok(None) | Err(_) => ExchangeOutcome::TimedOut,
                }
            }
        };

        // Late deliveries find the channel closed.
        drop(receiver);
        self.unsubscribe_responses(request).await;

        info!(
            outcome = outcome.kind(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Exchange resolved"
        );
        outcome
    }

    async fn subscribe_responses(
        &self,
        request: &ExchangeRequest,
        sender: mpsc::Sender<(Verdict, Message)>,
    ) -> Result<(), ExchangeFailure> {
        let accepted = Arc::new(ResponseHandler {
            verdict: Verdict::Accepted,
            sender: sender.clone(),
        });
        let rejected = Arc::new(ResponseHandler {
            verdict: Verdict::Rejected,
            sender,
        });

        self.transport
            .subscribe(request.accepted_topic(), request.qos(), accepted)
            .await
            .map_err(|e| ExchangeFailure::Subscribe {
                topic: request.accepted_topic().to_string(),
                detail: e.to_string(),
            })?;

        if let Err(e) = self
            .transport
            .subscribe(request.rejected_topic(), request.qos(), rejected)
            .await
        {
            self.unsubscribe(request.accepted_topic()).await;
            return Err(ExchangeFailure::Subscribe {
                topic: request.rejected_topic().to_string(),
                detail: e.to_string(),
            });
        }
        Ok(())
    }

    async fn unsubscribe_responses(&self, request: &ExchangeRequest) {
        self.unsubscribe(request.accepted_topic()).await;
        self.unsubscribe(request.rejected_topic()).await;
    }

    async fn unsubscribe(&self, topic: &str) {
        if let Err(e) = self.transport.unsubscribe(topic).await {
            warn!(topic = %topic, error = %e, "Failed to unsubscribe response topic");
        }
    }
}

/// Turn the winning delivery into the exchange outcome.
fn resolve<T: DeserializeOwned>(verdict: Verdict, message: &Message) -> ExchangeOutcome<T> {
    match verdict {
        Verdict::Accepted => match serde_json::from_slice(&message.payload) {
            Ok(response) => ExchangeOutcome::Success(response),
            Err(e) => ExchangeOutcome::Failure(ExchangeFailure::Malformed {
                topic: message.topic.clone(),
                detail: e.to_string(),
                payload: message.payload_str(),
            }),
        },
        Verdict::Rejected => ExchangeOutcome::Failure(ExchangeFailure::Rejected {
            topic: message.topic.clone(),
            body: message.payload_str(),
        }),
    }
}
