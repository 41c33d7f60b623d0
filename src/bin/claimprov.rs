//! claimprov: provision a device by claim certificate
//!
//! Connects to the broker with the shared claim certificate, obtains a
//! permanent certificate and key, stores them, and registers the thing.
//!
//! ## Architecture
//! ```text
//! [claimprov] --(MQTT/TLS, claim cert)--> [provisioning service]
//!      |
//!      v
//! permanent_cert.pem / permanent_key.pem
//! ```
//!
//! ## Configuration
//! - First argument: YAML config file (optional)
//! - CLAIMPROV_CONFIG: YAML config file (optional)
//! - CLAIMPROV__SECTION__FIELD: per-field overrides
//! - CLAIMPROV_LOG: log filter (default: info)
//!
//! Exits non-zero if any step fails.

use std::sync::Arc;

use tracing::{error, info};

use claimprov::config::Config;
use claimprov::credentials::{CredentialStore, FileCredentialStore};
use claimprov::transport::{MqttTransport, Transport};
use claimprov::utils::bootstrap::init_tracing;
use claimprov::ProvisioningSession;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(std::env::args().nth(1).as_deref())?;
    let client_id = config.client_id();

    info!(
        endpoint = %config.mqtt.endpoint,
        port = config.mqtt.port,
        client_id = %client_id,
        "claimprov starting"
    );

    let transport: Arc<dyn Transport> =
        Arc::new(MqttTransport::connect(&config.mqtt, &client_id).await?);
    let store: Arc<dyn CredentialStore> = Arc::new(FileCredentialStore::new());

    let mut session = ProvisioningSession::new(
        Arc::clone(&transport),
        store,
        config.provisioning.clone(),
    );
    let result = session.run().await;

    if let Err(e) = transport.disconnect(config.mqtt.disconnect_grace()).await {
        error!(error = %e, "Disconnect failed");
    }

    match result {
        Ok(report) => {
            info!(
                thing_name = %report.thing_name,
                certificate_id = %report.certificate_id,
                "Provisioning complete"
            );
            Ok(())
        }
        Err(e) => {
            error!(kind = ?e.kind(), state = ?session.state(), error = %e, "Provisioning failed");
            Err(e.into())
        }
    }
}
