// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use serde_derive::Deserialize;

/// Either a literal value or a request to sniff it from the host at startup.
#[derive(Debug, Clone, PartialEq)]
pub enum Sniffable {
    Literal(String),
    Auto,
}

impl<'de> serde::Deserialize<'de> for Sniffable {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(if s == "auto" { Self::Auto } else { Self::Literal(s) })
    }
}

impl serde::Serialize for Sniffable {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Self::Auto => serializer.serialize_str("auto"),
            Self::Literal(s) => serializer.serialize_str(s),
        }
    }
}

/// Identity this host reports in every telemetry payload, and optional
/// broker-side credential check applied at CONNECT.
#[derive(Debug, Deserialize, serde_derive::Serialize, Clone)]
pub struct Server {
    /// Reported hostname, or `auto` to sniff it from the OS at startup.
    #[serde(default = "Server::default_hostname")]
    pub hostname: Sniffable,

    /// Reported IPv4 address, or `auto` to use the first non-loopback interface.
    #[serde(default = "Server::default_ip")]
    pub ip: Sniffable,

    /// Optional plaintext username required at CONNECT. `None` allows anonymous
    /// connections.
    #[serde(default = "Server::default_credential")]
    pub username: Option<String>,

    /// Optional plaintext password required alongside `username`.
    #[serde(default = "Server::default_credential")]
    pub password: Option<String>,
}

impl Server {
    pub fn default_hostname() -> Sniffable {
        Sniffable::Auto
    }

    pub fn default_ip() -> Sniffable {
        Sniffable::Auto
    }

    pub const fn default_credential() -> Option<String> {
        None
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            hostname: Self::default_hostname(),
            ip: Self::default_ip(),
            username: Self::default_credential(),
            password: Self::default_credential(),
        }
    }
}
