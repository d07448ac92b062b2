// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use serde_derive::Deserialize;

use crate::error::{Error, ErrorKind};
use crate::probes::transform::Transform;

/// Raw form of a declared custom probe, as it appears in the configuration file.
/// Validated into a [`Collector`] at config-load time.
#[derive(Debug, Deserialize, serde_derive::Serialize, Clone)]
pub struct CollectorDecl {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: String,

    pub path: Option<String>,
    pub command: Option<String>,
    pub env: Option<String>,
    pub default: Option<String>,
    pub transform: Option<String>,
    pub unit: Option<String>,
}

/// Where a custom probe reads its raw value from.
#[derive(Debug, Clone)]
pub enum CollectorKind {
    File(String),
    Command(String),
    Env { name: String, default: Option<String> },
}

/// A fully validated custom probe declaration, ready to be sampled.
#[derive(Debug, Clone)]
pub struct Collector {
    pub name: String,
    pub kind: CollectorKind,
    pub transform: Transform,
    pub unit: Option<String>,
}

impl CollectorDecl {
    /// # Errors
    /// Returns `ConfigError` if `type` is unrecognised, a type-specific field is
    /// missing, or `transform` does not name a transform in the declared set.
    pub fn validate(&self) -> Result<Collector, Error> {
        let kind = match self.kind.as_str() {
            "file" => CollectorKind::File(self.required_field("path", &self.path)?),
            "command" => CollectorKind::Command(self.required_field("command", &self.command)?),
            "env" => CollectorKind::Env {
                name: self.required_field("env", &self.env)?,
                default: self.default.clone(),
            },
            other => {
                return Err(config_error(&format!(
                    "custom_collectors[{}]: unsupported type {other:?}",
                    self.name
                )))
            }
        };

        let transform = match &self.transform {
            Some(name) => Transform::parse(name)?,
            None => Transform::Identity,
        };

        Ok(Collector {
            name: self.name.clone(),
            kind,
            transform,
            unit: self.unit.clone(),
        })
    }

    fn required_field(&self, field: &str, value: &Option<String>) -> Result<String, Error> {
        value.clone().ok_or_else(|| {
            config_error(&format!(
                "custom_collectors[{}]: type {:?} requires field {field:?}",
                self.name, self.kind
            ))
        })
    }
}

fn config_error(message: &str) -> Error {
    Error::from_string(ErrorKind::ConfigError, message.to_string())
}

#[derive(Debug, Deserialize, serde_derive::Serialize, Clone)]
pub struct Collection {
    /// Seconds between sampling ticks. Must be positive.
    #[serde(default = "Collection::default_interval")]
    pub interval: u64,

    /// User-declared probes, sampled alongside the built-in ones.
    #[serde(default = "Collection::default_custom_collectors")]
    pub custom_collectors: Vec<CollectorDecl>,
}

impl Collection {
    pub const fn default_interval() -> u64 {
        5
    }

    pub fn default_custom_collectors() -> Vec<CollectorDecl> {
        Vec::new()
    }

    /// # Errors
    /// Returns `ConfigError` if `interval` is zero, or any custom collector fails
    /// validation.
    pub fn validated_collectors(&self) -> Result<Vec<Collector>, Error> {
        if self.interval == 0 {
            return Err(config_error("collection.interval must be positive"));
        }
        self.custom_collectors.iter().map(CollectorDecl::validate).collect()
    }
}

impl Default for Collection {
    fn default() -> Self {
        Self {
            interval: Self::default_interval(),
            custom_collectors: Self::default_custom_collectors(),
        }
    }
}
