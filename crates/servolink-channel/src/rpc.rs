// Copyright 2026 Servolink Developers
// SPDX-License-Identifier: Apache-2.0

//! Serialized RPC transport.
//!
//! All calls to the controller go through one REQ socket with strict
//! one-at-a-time semantics: a call is transmitted immediately only if no
//! other call is on the wire, otherwise it waits in a FIFO. Because replies
//! therefore always belong to the oldest transmitted call, no sequence-id
//! matching is needed.

use crate::error::ChannelError;
use crate::state_machine::Input;
use crate::wire;
use rmpv::Value;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use zeromq::{ReqSocket, SocketRecv, SocketSend, ZmqMessage};

/// RPC methods the channel invokes on the controller.
pub(crate) mod methods {
    pub const NOTIFICATION_PORT: &str = "notificationPort";
    pub const STREAM_PORTS: &str = "streamPorts";
    pub const STREAM_ACQUISITION_CONFIG: &str = "streamAcquisitionConfig";
    pub const SET_STREAM_ACQUISITION_CONFIG: &str = "setStreamAcquisitionConfig";
    pub const READ_REGISTER: &str = "readRegister";
    pub const MODIFY_REGISTER: &str = "modifyRegister";
    pub const PING: &str = "ping";
}

/// Identifies what a completed call was for, so the state machine can route
/// the result. Replies correspond to tags strictly in FIFO order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcTag {
    NotificationPort,
    StreamPorts,
    /// Bring-up read, or a targeted re-read after a write conflict
    ReadRegister { index: u8, resync: bool },
    StreamAcquisitionConfig,
    SetStreamAcquisitionConfig,
    ModifyRegister { index: u8 },
    Ping,
}

/// One queued call.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RpcCall {
    pub tag: RpcTag,
    pub method: &'static str,
    pub args: Vec<Value>,
}

impl RpcCall {
    pub fn new(tag: RpcTag, method: &'static str, args: Vec<Value>) -> Self {
        Self { tag, method, args }
    }
}

/// FIFO of pending calls with at most one on the wire.
#[derive(Debug, Default)]
pub(crate) struct RpcQueue {
    queue: VecDeque<RpcCall>,
    in_flight: Option<RpcTag>,
}

impl RpcQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a call. Returns the call to transmit right away if the wire
    /// was free, `None` if it has to wait its turn.
    pub fn invoke(&mut self, call: RpcCall) -> Option<RpcCall> {
        trace!("[RPC] queueing {} ({:?})", call.method, call.tag);
        self.queue.push_back(call);
        if self.in_flight.is_none() {
            self.dispatch_next()
        } else {
            None
        }
    }

    /// Take the completed call's tag off the wire.
    pub fn complete(&mut self) -> Option<RpcTag> {
        self.in_flight.take()
    }

    /// Move the next queued call onto the wire. `None` while a call is still
    /// outstanding or the queue is empty.
    pub fn dispatch_next(&mut self) -> Option<RpcCall> {
        if self.in_flight.is_some() {
            return None;
        }
        let call = self.queue.pop_front()?;
        self.in_flight = Some(call.tag);
        Some(call)
    }

    pub fn in_flight(&self) -> Option<RpcTag> {
        self.in_flight
    }
}

/// Socket half of the transport.
///
/// Owns the REQ socket for the lifetime of the channel; receives encoded
/// request frames, forwards decoded outcomes. The queue above guarantees a
/// new frame only ever arrives here after the previous reply was delivered,
/// so send/recv lockstep always holds.
pub(crate) async fn run_rpc_endpoint(
    mut socket: ReqSocket,
    mut requests: mpsc::UnboundedReceiver<Vec<u8>>,
    inputs: mpsc::UnboundedSender<Input>,
) {
    while let Some(frame) = requests.recv().await {
        if let Err(e) = socket.send(ZmqMessage::from(frame)).await {
            let _ = inputs.send(Input::Fault(ChannelError::Transport(e)));
            return;
        }
        let reply = match socket.recv().await {
            Ok(reply) => reply,
            Err(e) => {
                let _ = inputs.send(Input::Fault(ChannelError::Transport(e)));
                return;
            }
        };

        // ROUTER-style peers may prepend delimiter frames; the payload is
        // always the last one.
        let frames = reply.into_vec();
        let outcome = match frames.last() {
            Some(payload) => decode_reply(payload),
            None => Err(ChannelError::Rpc("empty reply message".into())),
        };
        let fatal = outcome.is_err();
        if inputs.send(Input::RpcReply(outcome)).is_err() || fatal {
            // Channel gone, or it is about to tear us down.
            return;
        }
    }
    debug!("[RPC] request queue closed, endpoint task exiting");
}

fn decode_reply(payload: &[u8]) -> Result<Value, ChannelError> {
    let response = wire::decode_response(payload)?;
    match response.error {
        Some(error) => Err(ChannelError::Rpc(error)),
        None => Ok(response.result),
    }
}
