// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::path::Path;

use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};

pub mod collection;
pub mod log;
pub mod mqtt;
pub mod server;

pub use collection::Collection;
pub use log::Log;
pub use mqtt::Mqtt;
pub use server::Server;

/// Top-level configuration, loaded from a TOML file and layered with a handful of
/// environment variable overrides.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: Server,

    #[serde(default)]
    pub mqtt: Mqtt,

    #[serde(default)]
    pub collection: Collection,

    #[serde(default)]
    pub log: Log,
}

impl Config {
    /// Read and parse a configuration file, apply environment variable overrides,
    /// then validate it.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, does not parse as TOML, or
    /// fails validation.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            Error::from_string(
                ErrorKind::ConfigError,
                format!("failed to read {}: {err}", path.display()),
            )
        })?;
        let mut config: Self = toml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Overlay the handful of environment variables this system recognises on top
    /// of whatever the config file declared.
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("NAS_PANEL_MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Ok(port) = std::env::var("NAS_PANEL_MQTT_PORT") {
            if let Ok(port) = port.parse() {
                self.mqtt.port = port;
            }
        }
        if let Ok(topic) = std::env::var("NAS_PANEL_MQTT_TOPIC") {
            self.mqtt.topic = topic;
        }
        if let Ok(interval) = std::env::var("NAS_PANEL_COLLECTION_INTERVAL") {
            if let Ok(interval) = interval.parse() {
                self.collection.interval = interval;
            }
        }
    }

    /// Run every eager validation check that ought to fail fast at startup rather
    /// than at first use.
    ///
    /// # Errors
    /// Returns `ConfigError` if `mqtt.qos` is out of range, `collection.interval`
    /// is zero, or any custom collector declaration is malformed.
    pub fn validate(&self) -> Result<(), Error> {
        self.mqtt.parsed_qos()?;
        self.collection.validated_collectors()?;
        Ok(())
    }

    /// Render the default configuration as TOML, for `--generate-config`.
    ///
    /// # Errors
    /// Returns `ConfigError` if the default configuration somehow fails to
    /// serialize, which would indicate a bug in this type's `Serialize` impl.
    pub fn generate_default_toml() -> Result<String, Error> {
        toml::to_string_pretty(&Self::default())
            .map_err(|err| Error::from_string(ErrorKind::ConfigError, format!("{err}")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    // Environment variable overrides mutate process-global state, so tests that
    // touch them are serialized against each other.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_interval_fails_validation() {
        let mut config = Config::default();
        config.collection.interval = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn out_of_range_qos_fails_validation() {
        let mut config = Config::default();
        config.mqtt.qos = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_take_precedence_over_file_values() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("NAS_PANEL_MQTT_HOST", "10.0.0.5");
        std::env::set_var("NAS_PANEL_MQTT_PORT", "9001");
        std::env::set_var("NAS_PANEL_MQTT_TOPIC", "override/topic");
        std::env::set_var("NAS_PANEL_COLLECTION_INTERVAL", "30");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.mqtt.host, "10.0.0.5");
        assert_eq!(config.mqtt.port, 9001);
        assert_eq!(config.mqtt.topic, "override/topic");
        assert_eq!(config.collection.interval, 30);

        std::env::remove_var("NAS_PANEL_MQTT_HOST");
        std::env::remove_var("NAS_PANEL_MQTT_PORT");
        std::env::remove_var("NAS_PANEL_MQTT_TOPIC");
        std::env::remove_var("NAS_PANEL_COLLECTION_INTERVAL");
    }

    #[test]
    fn unparseable_numeric_override_is_ignored() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("NAS_PANEL_MQTT_PORT", "not-a-number");

        let mut config = Config::default();
        let original_port = config.mqtt.port;
        config.apply_env_overrides();

        assert_eq!(config.mqtt.port, original_port);
        std::env::remove_var("NAS_PANEL_MQTT_PORT");
    }

    #[test]
    fn generate_default_toml_round_trips() {
        let rendered = Config::generate_default_toml().unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.mqtt.port, Config::default().mqtt.port);
    }
}
