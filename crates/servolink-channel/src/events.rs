// Copyright 2026 Servolink Developers
// SPDX-License-Identifier: Apache-2.0

//! Events a channel reports to its collaborators.

use crate::profile::{ChannelStatus, ErrorCondition};
use crate::streams::StreamPacket;

/// Everything observable about a channel, delivered in processing order on
/// the event receiver returned by [`Channel::open`](crate::Channel::open).
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Bring-up finished and the heartbeat is armed. Fired exactly once per
    /// channel; no other way to reach a usable state exists.
    ConnectionReady,

    /// The channel hit a fatal fault (socket, protocol, RPC or liveness).
    /// Fired exactly once, always followed by `ShuttingDown`.
    ConnectionFailed { reason: String },

    /// Terminal event of every channel, on both error and graceful paths.
    /// All sockets, timers and feeds are gone when this fires.
    ShuttingDown,

    /// A register value changed: a local write was applied, a remote change
    /// arrived, or an authoritative read completed. Carries the signed view.
    RegisterChanged { index: u8, value: i32 },

    /// A write conflict invalidated the local value; a targeted re-read is
    /// already underway.
    RegisterDesynchronized { index: u8 },

    /// The profile-derived device status crossed a boundary.
    StatusChanged(ChannelStatus),

    /// The condition register changed; carries the currently active error
    /// conditions.
    ErrorConditionsChanged(Vec<ErrorCondition>),

    /// The controller reported a new stream acquisition window.
    StreamAcquisitionConfigChanged {
        time_span_seconds: f64,
        points: u32,
    },

    /// One burst of samples from a subscribed stream.
    StreamPacket(StreamPacket),
}
