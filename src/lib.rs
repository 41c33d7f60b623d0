//! claimprov - Fleet provisioning by claim
//!
//! Bootstraps a device's long-lived identity from a short-lived claim
//! certificate, using MQTT publish/subscribe as the only channel. Two
//! correlated exchanges run in sequence: certificate issuance, then thing
//! registration against a provisioning template.

pub mod config;
pub mod credentials;
pub mod error;
pub mod exchange;
pub mod provisioning;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transport;
pub mod utils;

pub use error::{ErrorKind, ProvisionError, Step};
pub use exchange::{CorrelatedExchange, ExchangeFailure, ExchangeOutcome, ExchangeRequest};
pub use provisioning::{ProvisioningReport, ProvisioningSession, ProvisioningState};
