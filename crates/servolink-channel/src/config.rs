// Copyright 2026 Servolink Developers
// SPDX-License-Identifier: Apache-2.0

//! Channel configuration.

use crate::error::{ChannelError, Result};
use std::time::Duration;

/// Default cadence of the liveness probe.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(5000);

/// Default deadline for a heartbeat reply.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Connection parameters for one controller channel.
///
/// Only the RPC port is supplied here; the notification and stream ports are
/// obtained from the controller itself during bring-up.
///
/// # Example
/// ```
/// use servolink_channel::ChannelConfig;
///
/// let config = ChannelConfig::new("192.168.1.20", 5000)
///     .with_display_name("table 3 lock-box");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Controller host name or address
    pub host: String,

    /// Port of the msgpack-rpc request/reply endpoint
    pub rpc_port: u16,

    /// Human-readable name used in log output
    pub display_name: Option<String>,

    /// Cadence of the repeating liveness probe
    pub heartbeat_interval: Duration,

    /// Deadline for a single heartbeat reply
    pub heartbeat_timeout: Duration,
}

impl ChannelConfig {
    pub fn new(host: impl Into<String>, rpc_port: u16) -> Self {
        Self {
            host: host.into(),
            rpc_port,
            display_name: None,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Validate configuration before opening a channel.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(ChannelError::InvalidConfig("host must not be empty".into()));
        }
        if self.host.contains(['/', ' ']) {
            return Err(ChannelError::InvalidConfig(format!(
                "host contains invalid characters: {}",
                self.host
            )));
        }
        if self.rpc_port == 0 {
            return Err(ChannelError::InvalidConfig("rpc_port must be non-zero".into()));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_timeout.is_zero() {
            return Err(ChannelError::InvalidConfig(
                "heartbeat timing must be non-zero".into(),
            ));
        }
        if self.heartbeat_timeout >= self.heartbeat_interval {
            return Err(ChannelError::InvalidConfig(
                "heartbeat_timeout must be shorter than heartbeat_interval".into(),
            ));
        }
        Ok(())
    }

    /// Name used in log output; falls back to `host:rpc_port`.
    pub fn label(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.host, self.rpc_port))
    }

    /// Endpoint of the RPC request/reply socket.
    pub fn rpc_endpoint(&self) -> String {
        self.endpoint(self.rpc_port)
    }

    /// Endpoint for an arbitrary port on the same controller.
    pub(crate) fn endpoint(&self, port: u16) -> String {
        format!("tcp://{}:{}", self.host, port)
    }
}
