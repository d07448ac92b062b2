// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::fmt::{self, Display};
use std::io;
use tokio::sync::mpsc;

/// Represent the types of errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Error occurred while performing I/O, scoped to a single Session.
    IoError,

    /// Malformed packet, reserved-flag violation or disallowed packet sequence.
    /// Scoped to a single Session.
    ProtocolError,

    /// Socket read/write failure or unexpected EOF. Scoped to a single Session.
    TransportError,

    /// Bad credentials or a rejected identifier at CONNECT time.
    AuthError,

    /// A probe sample failed or timed out. Never fatal.
    ProbeError,

    /// Unrecognised option, illegal combination or unsupported transform.
    /// Fatal at startup.
    ConfigError,

    /// Listener socket failed to bind. Fatal at startup.
    BindError,

    /// mpsc channel error, usually meaning the receiving task has already exited.
    ChannelError,
}

#[derive(Clone, Debug)]
pub struct Error {
    /// Type of current error.
    kind: ErrorKind,

    /// Detail message about this error.
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: &str) -> Self {
        Error {
            kind,
            message: message.to_owned(),
        }
    }

    pub fn from_string(kind: ErrorKind, message: String) -> Self {
        Error { kind, message }
    }

    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::from_string(ErrorKind::IoError, format!("{}", err))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::from_string(ErrorKind::ConfigError, format!("{}", err))
    }
}

impl From<codec::EncodeError> for Error {
    fn from(err: codec::EncodeError) -> Self {
        Error::from_string(ErrorKind::ProtocolError, format!("{}", err))
    }
}

impl From<codec::DecodeError> for Error {
    fn from(err: codec::DecodeError) -> Self {
        Error::from_string(ErrorKind::ProtocolError, format!("{}", err))
    }
}

impl<T> From<mpsc::error::SendError<T>> for Error {
    fn from(err: mpsc::error::SendError<T>) -> Self {
        Error::from_string(ErrorKind::ChannelError, format!("channel closed: {}", err))
    }
}
