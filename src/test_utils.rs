//! Test utilities.
//!
//! Provides a fake fleet provisioning service that answers certificate and
//! registration requests over any [`Transport`], so the full handshake can
//! run in-process without a broker.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde_json::json;
use tracing::warn;

use crate::exchange::{ACCEPTED_SUFFIX, REJECTED_SUFFIX};
use crate::provisioning::{register_thing_topic, CREATE_CERTIFICATE_TOPIC};
use crate::transport::{Message, MessageHandler, QoS, Result, Transport};

/// How the fake service answers one kind of request.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Publish this body on the `accepted` topic.
    Accept(String),
    /// Publish this body on the `rejected` topic.
    Reject(String),
    /// Never answer.
    Silent,
}

/// Accepted body for a certificate request.
pub fn issuance_body(certificate_pem: &str, private_key: &str, ownership_token: &str) -> String {
    json!({
        "certificateId": "abc",
        "certificatePem": certificate_pem,
        "privateKey": private_key,
        "certificateOwnershipToken": ownership_token,
        "resourceArns": {},
    })
    .to_string()
}

/// Accepted body for a registration request.
pub fn registration_body(thing_name: &str, device_configuration: serde_json::Value) -> String {
    json!({
        "thingName": thing_name,
        "deviceConfiguration": device_configuration,
    })
    .to_string()
}

/// In-process stand-in for the provisioning service.
pub struct FakeProvisioningService {
    transport: Arc<dyn Transport>,
    issuance: Reply,
    registration: Reply,
    requests: Arc<Mutex<Vec<Message>>>,
}

impl FakeProvisioningService {
    /// Service that accepts both requests with `CERTDATA`/`KEYDATA`/`tok123`
    /// and registers `thing-1`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            issuance: Reply::Accept(issuance_body("CERTDATA", "KEYDATA", "tok123")),
            registration: Reply::Accept(registration_body("thing-1", json!({ "x": 1 }))),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_issuance(mut self, reply: Reply) -> Self {
        self.issuance = reply;
        self
    }

    pub fn with_registration(mut self, reply: Reply) -> Self {
        self.registration = reply;
        self
    }

    /// Subscribe to the request topics for `template_name`.
    pub async fn start(&self, template_name: &str) -> Result<()> {
        self.listen(CREATE_CERTIFICATE_TOPIC, self.issuance.clone())
            .await?;
        self.listen(&register_thing_topic(template_name), self.registration.clone())
            .await
    }

    /// Requests received so far, in arrival order.
    pub fn requests(&self) -> Vec<Message> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn listen(&self, topic: &str, reply: Reply) -> Result<()> {
        let transport = Arc::clone(&self.transport);
        let requests = Arc::clone(&self.requests);
        let handler: Arc<dyn MessageHandler> = Arc::new(move |request: &Message| {
            requests
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(request.clone());

            let (suffix, body) = match &reply {
                Reply::Accept(body) => (ACCEPTED_SUFFIX, body.clone()),
                Reply::Reject(body) => (REJECTED_SUFFIX, body.clone()),
                Reply::Silent => return,
            };
            let topic = format!("{}/{suffix}", request.topic);
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                if let Err(e) = transport
                    .publish(&topic, QoS::AtLeastOnce, Bytes::from(body))
                    .await
                {
                    warn!(topic = %topic, error = %e, "Fake service failed to reply");
                }
            });
        });

        self.transport
            .subscribe(topic, QoS::AtLeastOnce, handler)
            .await
    }
}
