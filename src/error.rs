// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error kinds shared by every subsystem (wire codec, connection, router,
//! policy engine, config parser). Mirrors the set of error names a peer can
//! observe on the wire as an `errn` field.

use thiserror::Error;

/// A bus-wide error kind, always carrying a free-text message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("no memory: {0}")]
    NoMemory(String),

    #[error("io error: {0}")]
    IoError(String),

    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("invalid args: {0}")]
    InvalidArgs(String),

    #[error("limits exceeded: {0}")]
    LimitsExceeded(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("auth failed: {0}")]
    AuthFailed(String),

    #[error("name has no owner: {0}")]
    NameHasNoOwner(String),

    #[error("name in use: {0}")]
    NameInUse(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("timeout: {0}")]
    Timeout(String),
}

impl BusError {
    /// The error-name token placed in a message's `errn` field, e.g.
    /// `"org.freedesktop.DBus.Error.AccessDenied"`-shaped but kept short
    /// since this crate does not model the full namespacing convention.
    pub fn wire_name(&self) -> &'static str {
        match self {
            BusError::NoMemory(_) => "NoMemory",
            BusError::IoError(_) => "IOError",
            BusError::Disconnected(_) => "Disconnected",
            BusError::InvalidArgs(_) => "InvalidArgs",
            BusError::LimitsExceeded(_) => "LimitsExceeded",
            BusError::AccessDenied(_) => "AccessDenied",
            BusError::AuthFailed(_) => "AuthFailed",
            BusError::NameHasNoOwner(_) => "NameHasNoOwner",
            BusError::NameInUse(_) => "NameInUse",
            BusError::FileNotFound(_) => "FileNotFound",
            BusError::ParseError(_) => "ParseError",
            BusError::UnknownMethod(_) => "UnknownMethod",
            BusError::Timeout(_) => "Timeout",
        }
    }

    pub fn message(&self) -> String {
        self.to_string()
    }
}

pub type BusResult<T> = Result<T, BusError>;
