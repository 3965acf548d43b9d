// Copyright 2026 Servolink Developers
// SPDX-License-Identifier: Apache-2.0

//! Error types for the channel protocol engine.

/// Result type alias using ChannelError
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Fault that terminates a channel (or, for `InvalidConfig`, prevents one
/// from being opened).
///
/// Every variant except `InvalidConfig` is fatal to a running channel: it is
/// reported through a single `ConnectionFailed` event and followed by full
/// teardown. There is no automatic reconnect; collaborators re-discover the
/// device and open a new channel if they want one.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Socket-level failure on any of the channel's endpoints
    #[error("socket error: {0}")]
    Transport(#[from] zeromq::ZmqError),

    /// Malformed frame, wrong message kind, or undecodable payload
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Non-null error field in an RPC response
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Heartbeat reply did not arrive within the reply deadline
    #[error("connection timed out")]
    ConnectionTimedOut,

    /// Invalid channel configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Decode-level fault in msgpack-rpc traffic.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    /// Payload was not valid msgpack
    #[error("undecodable payload: {0}")]
    Decode(String),

    /// Message had a kind tag other than the one the endpoint expects
    #[error("unexpected message kind {found} (expected {expected})")]
    UnexpectedKind { expected: u64, found: u64 },

    /// Message structure did not match the protocol contract
    #[error("malformed {what}: {detail}")]
    Malformed {
        what: &'static str,
        detail: String,
    },

    /// Sample buffer carried an ext type the client does not know
    #[error("unknown stream sample encoding: {0}")]
    UnknownSampleEncoding(i8),
}

impl ProtocolError {
    pub(crate) fn malformed(what: &'static str, detail: impl Into<String>) -> Self {
        ProtocolError::Malformed {
            what,
            detail: detail.into(),
        }
    }
}
