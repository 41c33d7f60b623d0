//! Provisioning errors.
//!
//! Every failure of a run falls into one of five kinds so operators can tell,
//! from logs alone, whether the transport broke, the service refused, the
//! two sides disagree on the schema, nobody answered, or the device could
//! not store what it was given.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::credentials::CredentialError;
use crate::exchange::ExchangeFailure;

/// Handshake step a failure occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    IssueCertificate,
    RegisterThing,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::IssueCertificate => f.write_str("certificate issuance"),
            Step::RegisterThing => f.write_str("thing registration"),
        }
    }
}

/// Failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    ProtocolRejection,
    MalformedResponse,
    Timeout,
    Persistence,
    SessionFinished,
}

/// Errors that end a provisioning run.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("{step} failed: transport error on '{topic}': {detail}")]
    Transport {
        step: Step,
        topic: String,
        detail: String,
    },

    #[error("{step} rejected on '{topic}': {body}")]
    Rejected {
        step: Step,
        topic: String,
        body: String,
    },

    #[error("{step} failed: malformed response on '{topic}': {detail} (payload: {payload})")]
    MalformedResponse {
        step: Step,
        topic: String,
        detail: String,
        payload: String,
    },

    #[error("{step} timed out after {waited:?} waiting on '{topic}'")]
    Timeout {
        step: Step,
        topic: String,
        waited: Duration,
    },

    #[error("failed to persist '{path}': {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: CredentialError,
    },

    #[error("provisioning session already finished")]
    SessionFinished,
}

impl ProvisionError {
    /// Map a failed exchange to the error for `step`.
    pub fn from_exchange(step: Step, failure: ExchangeFailure) -> Self {
        match failure {
            ExchangeFailure::Publish { topic, detail }
            | ExchangeFailure::Subscribe { topic, detail } => {
                ProvisionError::Transport { step, topic, detail }
            }
            ExchangeFailure::Rejected { topic, body } => {
                ProvisionError::Rejected { step, topic, body }
            }
            ExchangeFailure::Malformed {
                topic,
                detail,
                payload,
            } => ProvisionError::MalformedResponse {
                step,
                topic,
                detail,
                payload,
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProvisionError::Transport { .. } => ErrorKind::Transport,
            ProvisionError::Rejected { .. } => ErrorKind::ProtocolRejection,
            ProvisionError::MalformedResponse { .. } => ErrorKind::MalformedResponse,
            ProvisionError::Timeout { .. } => ErrorKind::Timeout,
            ProvisionError::Persistence { .. } => ErrorKind::Persistence,
            ProvisionError::SessionFinished => ErrorKind::SessionFinished,
        }
    }

    /// Step the failure occurred in, if it belongs to one.
    pub fn step(&self) -> Option<Step> {
        match self {
            ProvisionError::Transport { step, .. }
            | ProvisionError::Rejected { step, .. }
            | ProvisionError::MalformedResponse { step, .. }
            | ProvisionError::Timeout { step, .. } => Some(*step),
            ProvisionError::Persistence { .. } => Some(Step::IssueCertificate),
            ProvisionError::SessionFinished => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_exchange_rejected_keeps_body() {
        let error = ProvisionError::from_exchange(
            Step::IssueCertificate,
            ExchangeFailure::Rejected {
                topic: "$aws/certificates/create/json/rejected".to_string(),
                body: "quota exceeded".to_string(),
            },
        );

        assert_eq!(error.kind(), ErrorKind::ProtocolRejection);
        assert_eq!(error.step(), Some(Step::IssueCertificate));
        let message = error.to_string();
        assert!(message.contains("quota exceeded"));
        assert!(message.contains("$aws/certificates/create/json/rejected"));
    }

    #[test]
    fn test_from_exchange_transport_kinds() {
        for failure in [
            ExchangeFailure::Publish {
                topic: "t".to_string(),
                detail: "down".to_string(),
            },
            ExchangeFailure::Subscribe {
                topic: "t/accepted".to_string(),
                detail: "down".to_string(),
            },
        ] {
            let error = ProvisionError::from_exchange(Step::RegisterThing, failure);
            assert_eq!(error.kind(), ErrorKind::Transport);
        }
    }

    #[test]
    fn test_malformed_includes_payload() {
        let error = ProvisionError::from_exchange(
            Step::RegisterThing,
            ExchangeFailure::Malformed {
                topic: "t/accepted".to_string(),
                detail: "missing field `thingName`".to_string(),
                payload: "{}".to_string(),
            },
        );

        assert_eq!(error.kind(), ErrorKind::MalformedResponse);
        assert_eq!(
            error.to_string(),
            "thing registration failed: malformed response on 't/accepted': \
             missing field `thingName` (payload: {})"
        );
    }

    #[test]
    fn test_timeout_display() {
        let error = ProvisionError::Timeout {
            step: Step::IssueCertificate,
            topic: "$aws/certificates/create/json".to_string(),
            waited: Duration::from_secs(10),
        };
        assert_eq!(error.kind(), ErrorKind::Timeout);
        assert_eq!(
            error.to_string(),
            "certificate issuance timed out after 10s waiting on '$aws/certificates/create/json'"
        );
    }
}
