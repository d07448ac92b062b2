// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Wires the configured components together and runs them to completion.

use tokio::sync::mpsc;

use crate::config::mqtt::MqttMode;
use crate::config::Config;
use crate::error::Error;
use crate::listener::{Listener, CHANNEL_CAPACITY};
use crate::payload::Telemetry;
use crate::scheduler::Scheduler;

/// Run forever: start the embedded broker or external client per
/// `config.mqtt.mode`, alongside the sampling scheduler.
///
/// # Errors
/// Returns `BindError` if running in builtin mode and the listen address cannot
/// be bound.
pub async fn run(config: Config) -> Result<(), Error> {
    let (publisher, publish_receiver) = mpsc::channel(CHANNEL_CAPACITY);

    match config.mqtt.mode {
        MqttMode::Builtin => {
            let bind_addr = format!("{}:{}", config.mqtt.host, config.mqtt.port);
            let credentials = config
                .server
                .username
                .clone()
                .zip(config.server.password.clone());
            let listener = Listener::bind(&bind_addr, credentials, publish_receiver).await?;
            tokio::spawn(listener.run_loop());
        }
        MqttMode::External => {
            let client = crate::client::ExternalClient::new(config.mqtt.clone(), publish_receiver);
            tokio::spawn(client.run_loop());
        }
    }

    let scheduler = Scheduler::new(&config, publisher)?;
    scheduler.run_loop().await;
    Ok(())
}

/// Run a single collection tick and return the sampled payload, without ever
/// touching the network. Used by `--test`.
///
/// # Errors
/// Returns `ConfigError` if `config.mqtt.qos` or a custom collector declaration
/// fails validation.
pub async fn run_once(config: &Config) -> Result<Telemetry, Error> {
    let (publisher, _receiver) = mpsc::channel(1);
    let mut scheduler = Scheduler::new(config, publisher)?;
    Ok(scheduler.sample_once().await)
}
