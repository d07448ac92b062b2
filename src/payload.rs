// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Serialize, Clone)]
pub struct CpuTelemetry {
    pub usage: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

#[derive(Debug, Serialize, Clone)]
pub struct MemoryTelemetry {
    pub usage: f64,
    pub total: u64,
    pub used: u64,
}

#[derive(Debug, Serialize, Clone)]
pub struct Disk {
    pub id: String,
    pub status: &'static str,
}

#[derive(Debug, Serialize, Clone)]
pub struct StorageTelemetry {
    pub capacity: u64,
    pub used: u64,
    pub disks: Vec<Disk>,
}

#[derive(Debug, Serialize, Clone)]
pub struct NetworkTelemetry {
    pub upload: u64,
    pub download: u64,
}

/// One sampling tick, serialized verbatim as the publish payload.
///
/// `custom` holds one entry per custom collector, keyed by its declared name,
/// nested under its own `"custom"` object; the field is omitted entirely when
/// no custom collectors are configured, matching the canonical payload.
#[derive(Debug, Serialize, Clone)]
pub struct Telemetry {
    pub hostname: String,
    pub ip: String,
    pub timestamp: String,
    pub cpu: CpuTelemetry,
    pub memory: MemoryTelemetry,
    pub storage: StorageTelemetry,
    pub network: NetworkTelemetry,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub custom: Map<String, Value>,
}

impl Telemetry {
    /// # Errors
    /// Returns an error if the payload fails to serialize, which should not
    /// happen for a value built entirely from this type's own fields.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample() -> Telemetry {
        Telemetry {
            hostname: "nas-01".to_string(),
            ip: "192.168.1.10".to_string(),
            timestamp: "2023-12-01T22:58:00".to_string(),
            cpu: CpuTelemetry { usage: 12.5, temperature: Some(45.0) },
            memory: MemoryTelemetry { usage: 40.0, total: 8_000_000_000, used: 3_200_000_000 },
            storage: StorageTelemetry {
                capacity: 1_000_000_000_000,
                used: 400_000_000_000,
                disks: vec![Disk { id: "hdd1".to_string(), status: "normal" }],
            },
            network: NetworkTelemetry { upload: 1024, download: 2048 },
            custom: Map::new(),
        }
    }

    #[test]
    fn serializes_core_fields() {
        let bytes = sample().to_json_bytes().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["hostname"], json!("nas-01"));
        assert_eq!(value["cpu"]["usage"], json!(12.5));
        assert_eq!(value["storage"]["disks"][0]["id"], json!("hdd1"));
    }

    #[test]
    fn missing_temperature_is_omitted() {
        let mut telemetry = sample();
        telemetry.cpu.temperature = None;
        let bytes = telemetry.to_json_bytes().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value["cpu"].get("temperature").is_none());
    }

    #[test]
    fn custom_fields_nest_under_custom_key() {
        let mut telemetry = sample();
        telemetry.custom.insert("ups_battery".to_string(), json!({"value": 87, "unit": "%"}));
        let bytes = telemetry.to_json_bytes().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["custom"]["ups_battery"]["value"], json!(87));
        assert!(value.get("ups_battery").is_none());
    }

    #[test]
    fn empty_custom_map_is_omitted() {
        let bytes = sample().to_json_bytes().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        let expected_keys = ["hostname", "ip", "timestamp", "cpu", "memory", "storage", "network"];
        let actual: std::collections::BTreeSet<_> = value.as_object().unwrap().keys().collect();
        let expected: std::collections::BTreeSet<_> =
            expected_keys.iter().map(ToString::to_string).collect();
        assert_eq!(actual, expected.iter().collect());
        assert!(value.get("custom").is_none());
    }
}
