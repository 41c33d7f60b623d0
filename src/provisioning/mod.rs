//! Fleet provisioning by claim.
//!
//! Runs the two-step handshake over a connected transport:
//!
//! ```text
//! Idle -> IssuingCertificate -> CertificateIssued -> Registering -> Registered
//!                 |                                       |
//!                 v                                       v
//!          IssuanceFailed                        RegistrationFailed
//! ```
//!
//! The certificate and key are persisted between the steps. Any failure ends
//! the run; retrying is left to the caller.

pub mod messages;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, error, info};

use crate::credentials::{CredentialStore, FileMode};
use crate::error::{ProvisionError, Step};
use crate::exchange::{CorrelatedExchange, ExchangeOutcome, ExchangeRequest};
use crate::transport::{QoS, Transport};

pub use messages::{
    register_thing_topic, CertificateIssuance, CreateCertificateRequest, RegisterThingRequest,
    RegistrationResult, CREATE_CERTIFICATE_TOPIC,
};

/// Template parameter carrying the device serial number.
pub const SERIAL_NUMBER_PARAMETER: &str = "SerialNumber";

// ============================================================================
// Configuration
// ============================================================================

/// A named provisioning template parameter.
///
/// Kept as a list of pairs rather than a map so parameter names keep their
/// case through every configuration source.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TemplateParameter {
    pub name: String,
    pub value: String,
}

impl TemplateParameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Provisioning configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Name of the provisioning template to register against.
    pub template_name: String,
    /// Device serial number, sent as the `SerialNumber` template parameter.
    pub serial_number: String,
    /// Additional template parameters. An explicit `SerialNumber` wins.
    pub parameters: Vec<TemplateParameter>,
    /// Where the issued certificate is written.
    pub certificate_path: PathBuf,
    /// Where the issued private key is written.
    pub private_key_path: PathBuf,
    /// Wait budget for each exchange, in milliseconds.
    pub response_timeout_ms: u64,
    /// Delivery quality for requests and response subscriptions.
    pub qos: QoS,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            template_name: String::new(),
            serial_number: String::new(),
            parameters: Vec::new(),
            certificate_path: PathBuf::from("permanent_cert.pem"),
            private_key_path: PathBuf::from("permanent_key.pem"),
            response_timeout_ms: 10_000,
            qos: QoS::AtLeastOnce,
        }
    }
}

impl ProvisioningConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Template parameters sent with the registration request.
    pub fn template_parameters(&self) -> HashMap<String, String> {
        let mut parameters: HashMap<String, String> = self
            .parameters
            .iter()
            .map(|p| (p.name.clone(), p.value.clone()))
            .collect();
        parameters
            .entry(SERIAL_NUMBER_PARAMETER.to_string())
            .or_insert_with(|| self.serial_number.clone());
        parameters
    }
}

// ============================================================================
// Session
// ============================================================================

/// Progress of a provisioning session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    Idle,
    IssuingCertificate,
    CertificateIssued,
    Registering,
    Registered,
    IssuanceFailed,
    RegistrationFailed,
}

impl ProvisioningState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProvisioningState::Registered
                | ProvisioningState::IssuanceFailed
                | ProvisioningState::RegistrationFailed
        )
    }
}

/// Result of a completed handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisioningReport {
    pub certificate_id: String,
    pub thing_name: String,
    pub device_configuration: HashMap<String, serde_json::Value>,
    pub resource_arns: HashMap<String, String>,
}

/// One provisioning run over a connected transport.
pub struct ProvisioningSession {
    exchange: CorrelatedExchange,
    store: Arc<dyn CredentialStore>,
    config: ProvisioningConfig,
    state: ProvisioningState,
}

impl ProvisioningSession {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
        config: ProvisioningConfig,
    ) -> Self {
        Self {
            exchange: CorrelatedExchange::new(transport),
            store,
            config,
            state: ProvisioningState::Idle,
        }
    }

    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    /// Issue a certificate, persist it, then register the thing.
    pub async fn run(&mut self) -> Result<ProvisioningReport, ProvisionError> {
        if self.state != ProvisioningState::Idle {
            return Err(ProvisionError::SessionFinished);
        }

        info!(
            template = %self.config.template_name,
            serial_number = %self.config.serial_number,
            "Starting provisioning"
        );

        self.transition(ProvisioningState::IssuingCertificate);
        let issuance = match self.issue_certificate().await {
            Ok(issuance) => issuance,
            Err(e) => {
                self.transition(ProvisioningState::IssuanceFailed);
                return Err(e);
            }
        };
        self.transition(ProvisioningState::CertificateIssued);

        self.transition(ProvisioningState::Registering);
        let registration = match self
            .register_thing(&issuance.certificate_ownership_token)
            .await
        {
            Ok(registration) => registration,
            Err(e) => {
                self.transition(ProvisioningState::RegistrationFailed);
                return Err(e);
            }
        };
        self.transition(ProvisioningState::Registered);

        info!(
            thing_name = %registration.thing_name,
            device_configuration = ?registration.device_configuration,
            "Thing registered"
        );

        Ok(ProvisioningReport {
            certificate_id: issuance.certificate_id,
            thing_name: registration.thing_name,
            device_configuration: registration.device_configuration,
            resource_arns: issuance.resource_arns,
        })
    }

    fn transition(&mut self, next: ProvisioningState) {
        debug!(from = ?self.state, to = ?next, "Provisioning state changed");
        self.state = next;
    }

    async fn issue_certificate(&self) -> Result<CertificateIssuance, ProvisionError> {
        let request = ExchangeRequest::json(
            CREATE_CERTIFICATE_TOPIC,
            &CreateCertificateRequest::default(),
            self.config.qos,
        )
        .map_err(|e| ProvisionError::Transport {
            step: Step::IssueCertificate,
            topic: CREATE_CERTIFICATE_TOPIC.to_string(),
            detail: format!("failed to encode request: {e}"),
        })?;

        let issuance: CertificateIssuance =
            self.round_trip(Step::IssueCertificate, &request).await?;
        info!(certificate_id = %issuance.certificate_id, "Certificate issued");

        self.persist_credentials(&issuance).await?;
        Ok(issuance)
    }

    /// Write certificate then key. Failing to store either ends the run.
    async fn persist_credentials(
        &self,
        issuance: &CertificateIssuance,
    ) -> Result<(), ProvisionError> {
        let writes = [
            (
                &self.config.certificate_path,
                issuance.certificate_pem.as_bytes(),
                FileMode::PublicReadable,
            ),
            (
                &self.config.private_key_path,
                issuance.private_key.as_bytes(),
                FileMode::OwnerOnly,
            ),
        ];

        for (path, contents, mode) in writes {
            self.store
                .write(path, contents, mode)
                .await
                .map_err(|source| {
                    error!(path = %path.display(), error = %source, "Failed to persist credential");
                    ProvisionError::Persistence {
                        path: path.clone(),
                        source,
                    }
                })?;
        }

        info!(
            certificate = %self.config.certificate_path.display(),
            private_key = %self.config.private_key_path.display(),
            "Credentials persisted"
        );
        Ok(())
    }

    async fn register_thing(
        &self,
        ownership_token: &str,
    ) -> Result<RegistrationResult, ProvisionError> {
        let topic = register_thing_topic(&self.config.template_name);
        let body = RegisterThingRequest {
            certificate_ownership_token: ownership_token.to_string(),
            parameters: self.config.template_parameters(),
        };
        let request = ExchangeRequest::json(&topic, &body, self.config.qos).map_err(|e| {
            ProvisionError::Transport {
                step: Step::RegisterThing,
                topic: topic.clone(),
                detail: format!("failed to encode request: {e}"),
            }
        })?;

        self.round_trip(Step::RegisterThing, &request).await
    }

    async fn round_trip<T: serde::de::DeserializeOwned>(
        &self,
        step: Step,
        request: &ExchangeRequest,
    ) -> Result<T, ProvisionError> {
        let timeout = self.config.response_timeout();
        match self.exchange.execute(request, timeout).await {
            ExchangeOutcome::Success(response) => Ok(response),
            ExchangeOutcome::Failure(failure) => Err(ProvisionError::from_exchange(step, failure)),
            ExchangeOutcome::TimedOut => Err(ProvisionError::Timeout {
                step,
                topic: request.topic().to_string(),
                waited: timeout,
            }),
        }
    }
}
