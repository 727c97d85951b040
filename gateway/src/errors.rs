/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Per-subsystem error taxonomy. One `thiserror` enum per concern, mirroring
//! `cameleon`'s `u3v::Error` / `DeviceError` split rather than a single
//! catch-all.

use thiserror::Error;

/// Errors raised by the connection/device registries.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum RegistryError {
    #[error("connection is already bound to a different device group")]
    DuplicateBinding,
    #[error("no device group exists for this connection")]
    GroupNotFound,
    #[error("device id {device_id} is already registered under a different ICCID")]
    IdConflict { device_id: String },
    #[error("{entity} not found")]
    NotFound { entity: String },
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// Errors raised by the command dispatcher.
#[derive(Debug, Error, Clone)]
pub enum DispatchError {
    #[error("{priority} priority queue is full")]
    QueueFull { priority: String },
    #[error("command {command_key} timed out waiting for a reply")]
    Timeout { command_key: String },
    #[error("command {command_key} was not confirmed after exhausting retries")]
    Unconfirmed { command_key: String },
    #[error("connection for command {command_key} is gone")]
    ConnectionGone { command_key: String },
}

pub type DispatchResult<T> = std::result::Result<T, DispatchError>;

/// Errors raised by the response waiter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WaitError {
    #[error("a waiter already exists for this (device, message) pair")]
    DuplicateWait,
    #[error("timed out waiting for a response")]
    Timeout,
    #[error("wait was cancelled")]
    Cancelled,
}

pub type WaitResult<T> = std::result::Result<T, WaitError>;

/// Transport-level errors, classified from `std::io::Error` in the
/// connection hooks. Drives the dispatcher's retry decision.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("write timed out")]
    WriteTimeout,
    #[error("peer reset the connection")]
    PeerReset,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("peer closed the connection (EOF)")]
    Eof,
    #[error("connection was already closed locally")]
    Closed,
    #[error("other I/O error")]
    Other,
}

impl TransportError {
    /// Whether the dispatcher should retry a write that failed this way.
    /// `WriteTimeout`, `PeerReset`, and `BrokenPipe` are transient and
    /// retryable; `Closed`/`Eof` mean the peer is gone and resending would
    /// never succeed.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::WriteTimeout | Self::PeerReset | Self::BrokenPipe | Self::Other
        )
    }

    #[must_use]
    pub fn classify(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => Self::WriteTimeout,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => Self::PeerReset,
            ErrorKind::BrokenPipe => Self::BrokenPipe,
            ErrorKind::UnexpectedEof => Self::Eof,
            ErrorKind::NotConnected => Self::Closed,
            _ => Self::Other,
        }
    }
}

/// Top-level error returned from the gateway facade.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Wait(#[from] WaitError),
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_classification_drives_retry_decisions() {
        use std::io::{Error, ErrorKind};
        assert!(TransportError::classify(&Error::from(ErrorKind::TimedOut)).is_retryable());
        assert!(TransportError::classify(&Error::from(ErrorKind::ConnectionReset)).is_retryable());
        assert!(TransportError::classify(&Error::from(ErrorKind::BrokenPipe)).is_retryable());
        assert!(!TransportError::classify(&Error::from(ErrorKind::UnexpectedEof)).is_retryable());
        assert!(!TransportError::classify(&Error::from(ErrorKind::NotConnected)).is_retryable());
    }
}
