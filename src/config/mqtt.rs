// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use serde_derive::Deserialize;

use codec::QoS;

use crate::error::{Error, ErrorKind};

/// Whether this process runs the embedded broker or only speaks to one.
#[derive(Debug, Deserialize, serde_derive::Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MqttMode {
    Builtin,
    External,
}

#[derive(Debug, Deserialize, serde_derive::Serialize, Clone)]
pub struct Mqtt {
    /// Whether to run the embedded broker or act purely as a client of one.
    ///
    /// Default is `builtin`.
    #[serde(default = "Mqtt::default_mode")]
    pub mode: MqttMode,

    /// Address to bind to in builtin mode, or to dial in external mode.
    ///
    /// Default is "0.0.0.0".
    #[serde(default = "Mqtt::default_host")]
    pub host: String,

    /// Default is 1883.
    #[serde(default = "Mqtt::default_port")]
    pub port: u16,

    /// Topic telemetry payloads are published on.
    ///
    /// Default is "nas/panel/data".
    #[serde(default = "Mqtt::default_topic")]
    pub topic: String,

    /// QoS used to publish telemetry. Only 0 and 1 are supported.
    ///
    /// Default is 0.
    #[serde(default = "Mqtt::default_qos")]
    pub qos: u8,

    /// Username presented in external mode. Ignored in builtin mode.
    #[serde(default = "Mqtt::default_credential")]
    pub username: Option<String>,

    /// Password presented in external mode. Ignored in builtin mode.
    #[serde(default = "Mqtt::default_credential")]
    pub password: Option<String>,

    /// Client id presented in external mode. Empty means server-assigned.
    #[serde(default = "Mqtt::default_client_id")]
    pub client_id: String,

    /// Keep-alive interval, in seconds, negotiated in external mode.
    ///
    /// Default is 60.
    #[serde(default = "Mqtt::default_keep_alive")]
    pub keep_alive: u16,
}

impl Mqtt {
    pub const fn default_mode() -> MqttMode {
        MqttMode::Builtin
    }

    pub fn default_host() -> String {
        "0.0.0.0".to_string()
    }

    pub const fn default_port() -> u16 {
        1883
    }

    pub fn default_topic() -> String {
        "nas/panel/data".to_string()
    }

    pub const fn default_qos() -> u8 {
        0
    }

    pub const fn default_credential() -> Option<String> {
        None
    }

    pub fn default_client_id() -> String {
        String::new()
    }

    pub const fn default_keep_alive() -> u16 {
        60
    }

    /// # Errors
    /// Returns `ConfigError` if `qos` is outside `{0, 1}`.
    pub fn parsed_qos(&self) -> Result<QoS, Error> {
        match self.qos {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            other => Err(Error::from_string(
                ErrorKind::ConfigError,
                format!("mqtt.qos must be 0 or 1, got {other}"),
            )),
        }
    }
}

impl Default for Mqtt {
    fn default() -> Self {
        Self {
            mode: Self::default_mode(),
            host: Self::default_host(),
            port: Self::default_port(),
            topic: Self::default_topic(),
            qos: Self::default_qos(),
            username: Self::default_credential(),
            password: Self::default_credential(),
            client_id: Self::default_client_id(),
            keep_alive: Self::default_keep_alive(),
        }
    }
}
