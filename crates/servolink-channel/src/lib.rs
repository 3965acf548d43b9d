// Copyright 2026 Servolink Developers
// SPDX-License-Identifier: Apache-2.0

//! Client protocol engine for MK-series lock-box controllers.
//!
//! One [`Channel`] maintains a live, bidirectionally synchronized session
//! with one controller: msgpack-rpc over a ZeroMQ REQ endpoint with strictly
//! serialized requests, an asynchronous notification feed, optimistic
//! register synchronization with echo suppression, refcounted sample-stream
//! subscriptions and heartbeat-based liveness checking.
//!
//! The per-device register map and flag semantics are supplied by a
//! [`DeviceProfile`]; concrete profiles live in the `servolink-profiles`
//! crate. UI, persistence and device discovery are out of scope — collaborators
//! consume [`ChannelEvent`]s and drive the channel through its handle.
//!
//! The protocol rules themselves live in
//! [`state_machine::ChannelStateMachine`], a pure event-in/action-out core
//! that alternative drivers (or tests) can run without any I/O.

mod channel;
mod config;
mod error;
mod events;
mod heartbeat;
mod notify;
mod profile;
mod register;
mod rpc;
pub mod state_machine;
mod streams;
mod wire;

pub use channel::Channel;
pub use config::{ChannelConfig, HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT};
pub use error::{ChannelError, ProtocolError, Result};
pub use events::ChannelEvent;
pub use notify::Notification;
pub use profile::{ChannelStatus, DeviceProfile, ErrorCondition};
pub use register::{LocalWrite, Register, RegisterBank, RegisterDescriptor};
pub use streams::StreamPacket;
