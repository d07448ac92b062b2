// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::net::UdpSocket;
use std::time::Duration;

use codec::QoS;
use serde_json::{Map, Value};
use sysinfo::System;
use tokio::sync::mpsc::Sender;
use tokio::time::interval;

use crate::commands::SchedulerToListenerCmd;
use crate::config::collection::Collector;
use crate::config::server::Sniffable;
use crate::config::Config;
use crate::error::Error;
use crate::payload::{CpuTelemetry, Disk, MemoryTelemetry, NetworkTelemetry, StorageTelemetry, Telemetry};
use crate::probes::{self, Probes};

/// Drives one collection tick at a fixed interval, assembling a [`Telemetry`]
/// payload and handing it to whatever is publishing (the embedded broker or an
/// external-client connection) without needing to know which.
pub struct Scheduler {
    interval: Duration,
    topic: String,
    qos: QoS,
    hostname: String,
    ip: String,
    collectors: Vec<Collector>,
    probes: Probes,
    publisher: Sender<SchedulerToListenerCmd>,
}

impl Scheduler {
    /// # Errors
    /// Returns `ConfigError` if `config.mqtt.qos` or any custom collector
    /// declaration fails validation.
    pub fn new(config: &Config, publisher: Sender<SchedulerToListenerCmd>) -> Result<Self, Error> {
        Ok(Self {
            interval: Duration::from_secs(config.collection.interval),
            topic: config.mqtt.topic.clone(),
            qos: config.mqtt.parsed_qos()?,
            hostname: resolve_hostname(&config.server.hostname),
            ip: resolve_ip(&config.server.ip),
            collectors: config.collection.validated_collectors()?,
            probes: Probes::new(),
            publisher,
        })
    }

    pub async fn run_loop(mut self) {
        let mut ticker = interval(self.interval);
        loop {
            ticker.tick().await;
            let telemetry = self.sample_once().await;
            match telemetry.to_json_bytes() {
                Ok(payload) => {
                    let cmd = SchedulerToListenerCmd {
                        topic: self.topic.clone(),
                        payload,
                        qos: self.qos,
                        retain: false,
                    };
                    if self.publisher.send(cmd).await.is_err() {
                        log::error!("scheduler: publisher channel closed, stopping");
                        return;
                    }
                }
                Err(err) => log::error!("scheduler: failed to serialize telemetry: {err}"),
            }
        }
    }

    /// Sample every built-in and custom probe for one tick. A failing custom
    /// probe never aborts the tick; its error is recorded in its own field.
    pub async fn sample_once(&mut self) -> Telemetry {
        let (cpu_usage, cpu_temperature) = self.probes.sample_cpu();
        let (memory_usage, memory_total, memory_used) = self.probes.sample_memory();
        let (storage_capacity, storage_used, disks) = Probes::sample_storage();
        let (upload, download) = self.probes.sample_network();

        let mut custom = Map::new();
        for collector in &self.collectors {
            let value = match probes::sample_custom(collector).await {
                Ok(value) => match &collector.unit {
                    Some(unit) => {
                        let mut entry = Map::new();
                        entry.insert("value".to_string(), value);
                        entry.insert("unit".to_string(), Value::String(unit.clone()));
                        Value::Object(entry)
                    }
                    None => value,
                },
                Err(err) => {
                    log::debug!("scheduler: custom probe {:?} failed: {err}", collector.name);
                    let mut entry = Map::new();
                    entry.insert("error".to_string(), Value::String(err.to_string()));
                    Value::Object(entry)
                }
            };
            custom.insert(collector.name.clone(), value);
        }

        Telemetry {
            hostname: self.hostname.clone(),
            ip: self.ip.clone(),
            timestamp: chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
            cpu: CpuTelemetry { usage: cpu_usage, temperature: cpu_temperature },
            memory: MemoryTelemetry { usage: memory_usage, total: memory_total, used: memory_used },
            storage: StorageTelemetry {
                capacity: storage_capacity,
                used: storage_used,
                disks: disks.into_iter().map(|(id, status)| Disk { id, status }).collect(),
            },
            network: NetworkTelemetry { upload, download },
            custom,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::collection::{Collector, CollectorKind};
    use crate::probes::transform::Transform;

    #[test]
    fn resolve_hostname_prefers_literal_value() {
        assert_eq!(resolve_hostname(&Sniffable::Literal("nas-01".to_string())), "nas-01");
    }

    #[test]
    fn resolve_ip_prefers_literal_value() {
        assert_eq!(resolve_ip(&Sniffable::Literal("10.0.0.9".to_string())), "10.0.0.9");
    }

    #[tokio::test]
    async fn sample_once_wraps_unit_declaring_collectors() {
        let (tx, _rx) = mpsc::channel(1);
        let mut scheduler = Scheduler {
            interval: Duration::from_secs(1),
            topic: "nas/panel/data".to_string(),
            qos: QoS::AtMostOnce,
            hostname: "nas-01".to_string(),
            ip: "127.0.0.1".to_string(),
            collectors: vec![Collector {
                name: "ups_battery".to_string(),
                kind: CollectorKind::Env { name: "__NAS_PANEL_TEST_VAR__".to_string(), default: Some("87".to_string()) },
                transform: Transform::Identity,
                unit: Some("%".to_string()),
            }],
            probes: Probes::new(),
            publisher: tx,
        };

        let telemetry = scheduler.sample_once().await;
        let entry = telemetry.custom.get("ups_battery").unwrap();
        assert_eq!(entry["value"], serde_json::json!("87"));
        assert_eq!(entry["unit"], serde_json::json!("%"));
    }

    #[tokio::test]
    async fn sample_once_isolates_failing_custom_probes() {
        let (tx, _rx) = mpsc::channel(1);
        let mut scheduler = Scheduler {
            interval: Duration::from_secs(1),
            topic: "nas/panel/data".to_string(),
            qos: QoS::AtMostOnce,
            hostname: "nas-01".to_string(),
            ip: "127.0.0.1".to_string(),
            collectors: vec![Collector {
                name: "missing_env".to_string(),
                kind: CollectorKind::Env { name: "__NAS_PANEL_DEFINITELY_UNSET__".to_string(), default: None },
                transform: Transform::Identity,
                unit: None,
            }],
            probes: Probes::new(),
            publisher: tx,
        };

        let telemetry = scheduler.sample_once().await;
        let entry = telemetry.custom.get("missing_env").unwrap();
        assert!(entry.get("error").is_some());
    }
}

fn resolve_hostname(hostname: &Sniffable) -> String {
    match hostname {
        Sniffable::Literal(value) => value.clone(),
        Sniffable::Auto => System::host_name().unwrap_or_else(|| "unknown-host".to_string()),
    }
}

/// Discover the local IPv4 address by opening a UDP socket toward a public
/// address and reading back the kernel-chosen source address; no packet is
/// ever actually sent.
fn resolve_ip(ip: &Sniffable) -> String {
    match ip {
        Sniffable::Literal(value) => value.clone(),
        Sniffable::Auto => UdpSocket::bind("0.0.0.0:0")
            .and_then(|socket| {
                socket.connect("8.8.8.8:80")?;
                socket.local_addr()
            })
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|_| "127.0.0.1".to_string()),
    }
}
