//! Correlation of client requests with broker acknowledgements.
//!
//! rumqttc assigns packet ids inside its event loop, after the request has
//! left the client. Waiters are therefore queued in request order and bound
//! to a packet id when the event loop reports the outgoing packet, then
//! resolved by the matching SUBACK, PUBACK or PUBCOMP.
//!
//! Callers must hold [`AckTracker::request_lock`] from queueing a waiter
//! until the request is handed to the client, so queue order and request
//! order agree.

use std::collections::{HashMap, VecDeque};

use rumqttc::SubscribeReasonCode;
use tokio::sync::{oneshot, Mutex, MutexGuard};
use tracing::{debug, warn};

type SubAckSender = oneshot::Sender<Vec<SubscribeReasonCode>>;
type PubAckSender = oneshot::Sender<()>;

#[derive(Default)]
struct Pending {
    queued_subscribes: VecDeque<SubAckSender>,
    queued_publishes: VecDeque<PubAckSender>,
    subscribes: HashMap<u16, SubAckSender>,
    publishes: HashMap<u16, PubAckSender>,
}

/// Waiters for acknowledgements that have not arrived yet.
#[derive(Default)]
pub(super) struct AckTracker {
    request: Mutex<()>,
    pending: Mutex<Pending>,
}

impl AckTracker {
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Serializes "queue waiter, then send request" across callers.
    pub(super) async fn request_lock(&self) -> MutexGuard<'_, ()> {
        self.request.lock().await
    }

    /// Queue a waiter for the next outgoing SUBSCRIBE.
    pub(super) async fn expect_suback(&self) -> oneshot::Receiver<Vec<SubscribeReasonCode>> {
        let (sender, receiver) = oneshot::channel();
        self.pending.lock().await.queued_subscribes.push_back(sender);
        receiver
    }

    /// Queue a waiter for the next outgoing PUBLISH with a packet id.
    pub(super) async fn expect_puback(&self) -> oneshot::Receiver<()> {
        let (sender, receiver) = oneshot::channel();
        self.pending.lock().await.queued_publishes.push_back(sender);
        receiver
    }

    /// Drop the most recently queued SUBSCRIBE waiter; its request never left.
    pub(super) async fn abandon_subscribe(&self) {
        self.pending.lock().await.queued_subscribes.pop_back();
    }

    /// Drop the most recently queued PUBLISH waiter; its request never left.
    pub(super) async fn abandon_publish(&self) {
        self.pending.lock().await.queued_publishes.pop_back();
    }

    pub(super) async fn subscribe_sent(&self, pkid: u16) {
        let mut pending = self.pending.lock().await;
        // Resent after reconnect: already bound.
        if pending.subscribes.contains_key(&pkid) {
            return;
        }
        match pending.queued_subscribes.pop_front() {
            Some(waiter) => {
                pending.subscribes.insert(pkid, waiter);
            }
            None => warn!(pkid, "SUBSCRIBE sent with no waiter"),
        }
    }

    pub(super) async fn publish_sent(&self, pkid: u16) {
        // QoS 0 publishes carry no packet id and are never acknowledged.
        if pkid == 0 {
            return;
        }
        let mut pending = self.pending.lock().await;
        if pending.publishes.contains_key(&pkid) {
            return;
        }
        match pending.queued_publishes.pop_front() {
            Some(waiter) => {
                pending.publishes.insert(pkid, waiter);
            }
            None => warn!(pkid, "PUBLISH sent with no waiter"),
        }
    }

    pub(super) async fn suback(&self, pkid: u16, return_codes: Vec<SubscribeReasonCode>) {
        match self.pending.lock().await.subscribes.remove(&pkid) {
            Some(waiter) => {
                let _ = waiter.send(return_codes);
            }
            None => debug!(pkid, "SUBACK for unknown packet"),
        }
    }

    /// PUBACK for QoS 1, PUBCOMP for QoS 2.
    pub(super) async fn puback(&self, pkid: u16) {
        match self.pending.lock().await.publishes.remove(&pkid) {
            Some(waiter) => {
                let _ = waiter.send(());
            }
            None => debug!(pkid, "Publish acknowledgement for unknown packet"),
        }
    }

    /// Fail every waiter; their receivers see the sender dropped.
    pub(super) async fn clear(&self) {
        let mut pending = self.pending.lock().await;
        *pending = Pending::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::QoS as MqttQoS;

    #[tokio::test]
    async fn test_suback_resolves_waiter_in_request_order() {
        let tracker = AckTracker::new();
        let first = tracker.expect_suback().await;
        let second = tracker.expect_suback().await;

        tracker.subscribe_sent(7).await;
        tracker.subscribe_sent(8).await;
        tracker
            .suback(8, vec![SubscribeReasonCode::Failure])
            .await;
        tracker
            .suback(7, vec![SubscribeReasonCode::Success(MqttQoS::AtLeastOnce)])
            .await;

        assert_eq!(
            first.await.unwrap(),
            vec![SubscribeReasonCode::Success(MqttQoS::AtLeastOnce)]
        );
        assert_eq!(second.await.unwrap(), vec![SubscribeReasonCode::Failure]);
    }

    #[tokio::test]
    async fn test_qos0_publish_does_not_consume_waiter() {
        let tracker = AckTracker::new();
        let waiter = tracker.expect_puback().await;

        tracker.publish_sent(0).await;
        tracker.publish_sent(3).await;
        tracker.puback(3).await;

        assert!(waiter.await.is_ok());
    }

    #[tokio::test]
    async fn test_resent_packet_keeps_original_waiter() {
        let tracker = AckTracker::new();
        let first = tracker.expect_puback().await;
        tracker.publish_sent(4).await;
        let second = tracker.expect_puback().await;

        // Retransmission of packet 4 must not bind the second waiter.
        tracker.publish_sent(4).await;
        tracker.publish_sent(5).await;
        tracker.puback(4).await;
        tracker.puback(5).await;

        assert!(first.await.is_ok());
        assert!(second.await.is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_request_is_not_matched() {
        let tracker = AckTracker::new();
        let kept = tracker.expect_suback().await;
        let abandoned = tracker.expect_suback().await;
        tracker.abandon_subscribe().await;

        tracker.subscribe_sent(1).await;
        tracker.suback(1, vec![SubscribeReasonCode::Failure]).await;

        assert_eq!(kept.await.unwrap(), vec![SubscribeReasonCode::Failure]);
        assert!(abandoned.await.is_err());
    }

    #[tokio::test]
    async fn test_clear_fails_outstanding_waiters() {
        let tracker = AckTracker::new();
        let queued = tracker.expect_puback().await;
        let bound = tracker.expect_suback().await;
        tracker.subscribe_sent(2).await;

        tracker.clear().await;

        assert!(queued.await.is_err());
        assert!(bound.await.is_err());
    }
}
