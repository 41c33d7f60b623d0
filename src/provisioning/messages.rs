//! Wire messages and topics of the fleet provisioning service.
//!
//! Field names are fixed by the service and serialized in camelCase.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Topic on which a new certificate and key are requested.
pub const CREATE_CERTIFICATE_TOPIC: &str = "$aws/certificates/create/json";

/// Topic on which a thing is registered against `template_name`.
pub fn register_thing_topic(template_name: &str) -> String {
    format!("$aws/provisioning-templates/{template_name}/provision/json")
}

/// Certificate request. An empty signing request asks the service to
/// generate the key pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCertificateRequest {
    pub certificate_signing_request: String,
}

/// Newly issued certificate, key and ownership token.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateIssuance {
    pub certificate_id: String,
    pub certificate_pem: String,
    pub private_key: String,
    pub certificate_ownership_token: String,
    #[serde(default)]
    pub resource_arns: HashMap<String, String>,
}

impl fmt::Debug for CertificateIssuance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateIssuance")
            .field("certificate_id", &self.certificate_id)
            .field("certificate_pem", &format_args!("<{} bytes>", self.certificate_pem.len()))
            .field("private_key", &format_args!("<redacted>"))
            .field("certificate_ownership_token", &format_args!("<redacted>"))
            .field("resource_arns", &self.resource_arns)
            .finish()
    }
}

/// Registration request proving ownership of the issued certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterThingRequest {
    pub certificate_ownership_token: String,
    pub parameters: HashMap<String, String>,
}

/// Identity and configuration assigned by the provisioning template.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResult {
    pub thing_name: String,
    #[serde(default)]
    pub device_configuration: HashMap<String, serde_json::Value>,
}
