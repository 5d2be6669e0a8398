use mqtt_wire::{describe, to_hex, ProtocolVersion, WireError};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::process::{BrokerSignal, ExitState};

pub type Result<T> = std::result::Result<T, HarnessError>;

/// Why a wire expectation was not met.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchFailure {
    /// A received byte differs from the expected byte at the same offset.
    Mismatch,
    /// The deadline elapsed before enough bytes arrived.
    TimedOut,
    /// The peer closed the connection before enough bytes arrived.
    Closed,
}

impl fmt::Display for MatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mismatch => f.write_str("bytes differ"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Closed => f.write_str("connection closed"),
        }
    }
}

/// Expected and received bytes of a failed wire expectation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireDiff {
    pub expected: Vec<u8>,
    pub received: Vec<u8>,
    pub protocol_version: ProtocolVersion,
}

impl WireDiff {
    /// Offset of the first byte that differs, if any byte was compared.
    #[must_use]
    pub fn first_difference(&self) -> Option<usize> {
        self.expected
            .iter()
            .zip(&self.received)
            .position(|(expected, received)| expected != received)
    }
}

impl fmt::Display for WireDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "expected [{}] {}, received [{}] {}",
            to_hex(&self.expected),
            describe(&self.expected, self.protocol_version),
            to_hex(&self.received),
            describe(&self.received, self.protocol_version),
        )?;
        if let Some(offset) = self.first_difference() {
            write!(f, " (first difference at byte {offset})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Failed to load harness configuration {path:?}: {reason}")]
    ConfigLoad { path: PathBuf, reason: String },

    #[error("Invalid harness configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to write broker configuration: {source}")]
    ConfigWrite {
        #[source]
        source: std::io::Error,
    },

    #[error("No free port at or above {base}")]
    PortsExhausted { base: u16 },

    #[error("Failed to spawn broker {program:?}: {source}")]
    ProcessSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Broker process is not running")]
    ProcessNotRunning,

    #[error("Failed to query broker process status: {source}")]
    ProcessStatus {
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to deliver {signal} to broker pid {pid}: {reason}")]
    Signal {
        signal: BrokerSignal,
        pid: u32,
        reason: String,
    },

    #[error("Connection refused by {addr} after {attempts} attempt(s)")]
    ConnectionRefused { addr: SocketAddr, attempts: u32 },

    #[error("Connection I/O error: {source}")]
    ConnectionIo {
        #[source]
        source: std::io::Error,
    },

    #[error("Handshake mismatch ({reason}): {diff}")]
    HandshakeMismatch {
        reason: MatchFailure,
        diff: Box<WireDiff>,
    },

    #[error("Handshake timed out after {timeout:?}: {diff}")]
    HandshakeTimeout {
        timeout: Duration,
        diff: Box<WireDiff>,
    },

    #[error("Unexpected message while waiting for {label} ({reason}): {diff}")]
    UnexpectedMessage {
        label: String,
        reason: MatchFailure,
        diff: Box<WireDiff>,
    },

    #[error("Broker exited early ({status})")]
    ProcessExitedEarly { status: ExitState },

    #[error("Packet encoding failed: {0}")]
    Wire(#[from] WireError),
}

impl HarnessError {
    /// Whether the failure was a deadline elapsing rather than wrong bytes.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::HandshakeTimeout { .. }
                | Self::UnexpectedMessage {
                    reason: MatchFailure::TimedOut,
                    ..
                }
        )
    }

    /// Failures that may really be the broker dying underneath the harness.
    /// Wrong bytes that did arrive are never one of them.
    #[must_use]
    pub fn may_hide_process_exit(&self) -> bool {
        match self {
            Self::ProcessNotRunning
            | Self::ConnectionRefused { .. }
            | Self::ConnectionIo { .. }
            | Self::HandshakeTimeout { .. }
            | Self::Signal { .. } => true,
            Self::HandshakeMismatch { reason, .. } | Self::UnexpectedMessage { reason, .. } => {
                *reason != MatchFailure::Mismatch
            }
            _ => false,
        }
    }

    /// Short machine-friendly name of the failure kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigLoad { .. } => "config_load",
            Self::InvalidConfig(_) => "invalid_config",
            Self::ConfigWrite { .. } => "config_write",
            Self::PortsExhausted { .. } => "ports_exhausted",
            Self::ProcessSpawn { .. } => "process_spawn",
            Self::ProcessNotRunning => "process_not_running",
            Self::ProcessStatus { .. } => "process_status",
            Self::Signal { .. } => "signal",
            Self::ConnectionRefused { .. } => "connection_refused",
            Self::ConnectionIo { .. } => "connection_io",
            Self::HandshakeMismatch { .. } => "handshake_mismatch",
            Self::HandshakeTimeout { .. } => "handshake_timeout",
            Self::UnexpectedMessage { .. } => "unexpected_message",
            Self::ProcessExitedEarly { .. } => "process_exited_early",
            Self::Wire(_) => "wire",
        }
    }
}
