// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::process::Stdio;
use std::time::{Duration, Instant};

use serde_json::Value;
use sysinfo::{Components, Disks, Networks, System};
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::collection::{Collector, CollectorKind};
use crate::error::{Error, ErrorKind};

pub mod transform;

const COMMAND_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

struct NetworkBaseline {
    at: Instant,
    received: u64,
    transmitted: u64,
}

/// Holds onto whatever state sampling the built-in probes needs across ticks: the
/// `sysinfo` handle and the previous network byte counters used to derive a
/// bytes-per-second rate.
pub struct Probes {
    system: System,
    network_baseline: Option<NetworkBaseline>,
}

impl Probes {
    #[must_use]
    pub fn new() -> Self {
        Self { system: System::new_all(), network_baseline: None }
    }

    #[must_use]
    pub fn sample_cpu(&mut self) -> (f64, Option<f64>) {
        self.system.refresh_cpu_usage();
        let usage = f64::from(self.system.global_cpu_info().cpu_usage());
        let temperature = Components::new_with_refreshed_list()
            .iter()
            .find(|component| component.label().to_lowercase().contains("cpu"))
            .map(|component| f64::from(component.temperature()));
        (usage, temperature)
    }

    #[must_use]
    pub fn sample_memory(&mut self) -> (f64, u64, u64) {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        let used = self.system.used_memory();
        #[allow(clippy::cast_precision_loss)]
        let usage = if total == 0 { 0.0 } else { (used as f64 / total as f64) * 100.0 };
        (usage, total, used)
    }

    #[must_use]
    pub fn sample_storage() -> (u64, u64, Vec<(String, &'static str)>) {
        let disks = Disks::new_with_refreshed_list();
        let mut capacity = 0_u64;
        let mut used = 0_u64;
        let mut entries = Vec::new();
        for (index, disk) in disks.iter().enumerate() {
            let total = disk.total_space();
            let available = disk.available_space();
            capacity += total;
            used += total.saturating_sub(available);
            #[allow(clippy::cast_precision_loss)]
            let free_ratio = if total == 0 { 1.0 } else { available as f64 / total as f64 };
            let status = if free_ratio < 0.05 {
                "error"
            } else if free_ratio < 0.15 {
                "warning"
            } else {
                "normal"
            };
            entries.push((format!("hdd{}", index + 1), status));
        }
        (capacity, used, entries)
    }

    #[must_use]
    pub fn sample_network(&mut self) -> (u64, u64) {
        let networks = Networks::new_with_refreshed_list();
        let (received, transmitted) = networks
            .iter()
            .fold((0_u64, 0_u64), |(r, t), (_, data)| {
                (r + data.total_received(), t + data.total_transmitted())
            });

        let now = Instant::now();
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let rates = self.network_baseline.as_ref().map_or((0, 0), |baseline| {
            let elapsed = now.duration_since(baseline.at).as_secs_f64().max(1.0);
            let upload = (transmitted.saturating_sub(baseline.transmitted) as f64 / elapsed) as u64;
            let download = (received.saturating_sub(baseline.received) as f64 / elapsed) as u64;
            (upload, download)
        });
        self.network_baseline = Some(NetworkBaseline { at: now, received, transmitted });
        rates
    }
}

impl Default for Probes {
    fn default() -> Self {
        Self::new()
    }
}

/// Sample one declared custom probe and apply its transform.
///
/// # Errors
/// Returns `ProbeError` if the probe's source cannot be read, its command times
/// out, or its transform rejects the raw value.
pub async fn sample_custom(collector: &Collector) -> Result<Value, Error> {
    let raw = match &collector.kind {
        CollectorKind::File(path) => {
            std::fs::read_to_string(path).map_err(|err| probe_error(&format!("{path}: {err}")))?
        }
        CollectorKind::Command(command) => run_command(command).await?,
        CollectorKind::Env { name, default } => match std::env::var(name) {
            Ok(value) => value,
            Err(_) => default
                .clone()
                .ok_or_else(|| probe_error(&format!("environment variable {name} is unset")))?,
        },
    };
    collector.transform.apply(&raw)
}

async fn run_command(command: &str) -> Result<String, Error> {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .output();

    let output = timeout(COMMAND_PROBE_TIMEOUT, child)
        .await
        .map_err(|_| probe_error(&format!("command {command:?} timed out")))?
        .map_err(|err| probe_error(&format!("command {command:?} failed: {err}")))?;

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn probe_error(message: &str) -> Error {
    Error::from_string(ErrorKind::ProbeError, message.to_string())
}
