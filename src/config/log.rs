// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use serde_derive::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, serde_derive::Serialize, Clone)]
pub struct Log {
    /// Also print log records to stderr.
    ///
    /// Default is true.
    #[serde(default = "Log::default_console_log")]
    pub console_log: bool,

    /// Minimum log level. One of off, error, warn, info, debug, trace.
    ///
    /// Default is "info".
    #[serde(default = "Log::default_level")]
    pub level: LogLevel,

    /// Optional path to a log file. When unset, only `console_log` applies.
    #[serde(default = "Log::default_log_file")]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize, serde_derive::Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    #[must_use]
    pub const fn as_filter_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl Log {
    pub const fn default_console_log() -> bool {
        true
    }

    pub const fn default_level() -> LogLevel {
        LogLevel::Info
    }

    pub const fn default_log_file() -> Option<PathBuf> {
        None
    }
}

impl Default for Log {
    fn default() -> Self {
        Self {
            console_log: Self::default_console_log(),
            level: Self::default_level(),
            log_file: Self::default_log_file(),
        }
    }
}
