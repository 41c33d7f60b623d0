//! Application configuration.
//!
//! Aggregates the transport and provisioning sections into a single Config
//! struct that can be loaded from YAML files or environment variables.

use serde::Deserialize;

use crate::provisioning::ProvisioningConfig;
use crate::transport::MqttConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "claimprov.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "CLAIMPROV_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "CLAIMPROV";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "CLAIMPROV_LOG";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection.
    pub mqtt: MqttConfig,
    /// Handshake parameters and credential output paths.
    pub provisioning: ProvisioningConfig,
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Missing required setting '{0}'")]
    Missing(&'static str),

    #[error("Invalid setting '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl Config {
    /// Load configuration from file and environment, then validate it.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `claimprov.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix,
    ///    e.g. `CLAIMPROV__PROVISIONING__SERIAL_NUMBER`
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check settings the handshake cannot run without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.endpoint.is_empty() {
            return Err(ConfigError::Missing("mqtt.endpoint"));
        }
        if self.provisioning.serial_number.is_empty() {
            return Err(ConfigError::Missing("provisioning.serial_number"));
        }

        let template = &self.provisioning.template_name;
        if template.is_empty() {
            return Err(ConfigError::Missing("provisioning.template_name"));
        }
        if template.contains(['/', '+', '#']) {
            return Err(ConfigError::Invalid {
                field: "provisioning.template_name",
                reason: format!("'{template}' must not contain '/', '+' or '#'"),
            });
        }

        if self.provisioning.response_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "provisioning.response_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// MQTT client identifier for this device.
    pub fn client_id(&self) -> String {
        self.mqtt.client_id_for(&self.provisioning.serial_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::QoS;
    use serial_test::serial;
    use std::path::PathBuf;

    const YAML: &str = r#"
mqtt:
  endpoint: example-ats.iot.us-east-1.amazonaws.com
  claim_certificate: /etc/device/claim.pem
  claim_private_key: /etc/device/claim.key
  root_ca: /etc/device/AmazonRootCA1.pem

provisioning:
  template_name: testing_template
  serial_number: SN-0001
  parameters:
    - name: Site
      value: plant-7
  certificate_path: /var/lib/device/cert.pem
  private_key_path: /var/lib/device/key.pem
  response_timeout_ms: 5000
  qos: 0
"#;

    fn valid() -> Config {
        serde_yaml::from_str(YAML).unwrap()
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.root_ca, "root_ca.pem");
        assert_eq!(config.provisioning.response_timeout_ms, 10_000);
        assert_eq!(config.provisioning.qos, QoS::AtLeastOnce);
        assert_eq!(
            config.provisioning.certificate_path,
            PathBuf::from("permanent_cert.pem")
        );
        assert_eq!(
            config.provisioning.private_key_path,
            PathBuf::from("permanent_key.pem")
        );
    }

    #[test]
    fn test_parse_yaml() {
        let config = valid();
        assert_eq!(config.mqtt.endpoint, "example-ats.iot.us-east-1.amazonaws.com");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.provisioning.template_name, "testing_template");
        assert_eq!(
            config.provisioning.template_parameters()["Site"],
            "plant-7"
        );
        assert_eq!(config.provisioning.qos, QoS::AtMostOnce);
        assert_eq!(config.client_id(), "device-SN-0001");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml_rejects_bad_qos() {
        let yaml = YAML.replace("qos: 0", "qos: 3");
        assert!(serde_yaml::from_str::<Config>(&yaml).is_err());
    }

    #[test]
    fn test_validate_missing_endpoint() {
        let mut config = valid();
        config.mqtt.endpoint.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("mqtt.endpoint"))
        ));
    }

    #[test]
    fn test_validate_missing_serial_number() {
        let mut config = valid();
        config.provisioning.serial_number.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("provisioning.serial_number"))
        ));
    }

    #[test]
    fn test_validate_template_name_wildcards() {
        for bad in ["a/b", "a+", "#"] {
            let mut config = valid();
            config.provisioning.template_name = bad.to_string();
            assert!(matches!(
                config.validate(),
                Err(ConfigError::Invalid {
                    field: "provisioning.template_name",
                    ..
                })
            ));
        }
    }

    #[test]
    fn test_validate_zero_timeout() {
        let mut config = valid();
        config.provisioning.response_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_load_file_with_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.yaml");
        std::fs::write(&path, YAML).unwrap();

        std::env::set_var("CLAIMPROV__PROVISIONING__SERIAL_NUMBER", "SN-9999");
        let loaded = Config::load(Some(path.to_str().unwrap()));
        std::env::remove_var("CLAIMPROV__PROVISIONING__SERIAL_NUMBER");

        let config = loaded.unwrap();
        assert_eq!(config.provisioning.serial_number, "SN-9999");
        assert_eq!(config.provisioning.template_name, "testing_template");
        assert_eq!(config.mqtt.claim_certificate, "/etc/device/claim.pem");
        assert_eq!(config.provisioning.template_parameters()["Site"], "plant-7");
    }

    #[test]
    #[serial]
    fn test_load_env_keeps_numeric_looking_strings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.yaml");
        std::fs::write(&path, YAML).unwrap();

        std::env::set_var("CLAIMPROV__PROVISIONING__SERIAL_NUMBER", "000123");
        std::env::set_var("CLAIMPROV__MQTT__PORT", "443");
        std::env::set_var("CLAIMPROV__PROVISIONING__RESPONSE_TIMEOUT_MS", "2500");
        let loaded = Config::load(Some(path.to_str().unwrap()));
        std::env::remove_var("CLAIMPROV__PROVISIONING__SERIAL_NUMBER");
        std::env::remove_var("CLAIMPROV__MQTT__PORT");
        std::env::remove_var("CLAIMPROV__PROVISIONING__RESPONSE_TIMEOUT_MS");

        let config = loaded.unwrap();
        assert_eq!(config.provisioning.serial_number, "000123");
        assert_eq!(config.client_id(), "device-000123");
        assert_eq!(
            config.provisioning.template_parameters()["SerialNumber"],
            "000123"
        );
        assert_eq!(config.mqtt.port, 443);
        assert_eq!(config.provisioning.response_timeout_ms, 2500);
    }

    #[test]
    #[serial]
    fn test_load_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.yaml");

        let result = Config::load(Some(path.to_str().unwrap()));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }
}
