// Copyright 2026 Servolink Developers
// SPDX-License-Identifier: Apache-2.0

//! Notification feed decoding.
//!
//! The controller pushes asynchronous state changes on a dedicated PUB
//! socket whose port is the first thing the channel asks for during
//! bring-up. Every message on the feed must be a msgpack-rpc notification;
//! anything else terminates the channel. Unknown notification *methods* are
//! tolerated (logged and dropped) so that newer controller firmware can add
//! notifications without breaking older clients.

use crate::error::{ChannelError, ProtocolError};
use crate::state_machine::Input;
use crate::wire;
use rmpv::Value;
use tokio::sync::mpsc;
use zeromq::{SocketRecv, SubSocket};

const METHOD_REGISTER_CHANGED: &str = "registerChanged";
const METHOD_ACQUISITION_CONFIG_CHANGED: &str = "streamAcquisitionConfigChanged";
const METHOD_SHUTDOWN: &str = "shutdown";

/// A routed notification from the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A register changed on the controller side (or our own write echoed
    /// back)
    RegisterChanged { index: u8, wire_value: u16 },

    /// The stream acquisition window changed
    StreamAcquisitionConfigChanged {
        time_span_seconds: f64,
        points: u32,
    },

    /// The controller is shutting down; tear the channel down gracefully
    Shutdown,

    /// A method this client does not know. Not an error.
    Unknown { method: String, params: Vec<Value> },
}

/// Decode and route one message from the notification feed.
pub fn decode_notification_message(bytes: &[u8]) -> Result<Notification, ProtocolError> {
    let raw = wire::decode_notification(bytes)?;
    match raw.method.as_str() {
        METHOD_REGISTER_CHANGED => {
            let [index, value] = raw.params.as_slice() else {
                return Err(ProtocolError::malformed(
                    "registerChanged",
                    format!("expected 2 parameters, got {}", raw.params.len()),
                ));
            };
            let index = wire::as_u64(index, "registerChanged")?;
            let index = u8::try_from(index).map_err(|_| {
                ProtocolError::malformed("registerChanged", format!("index out of range: {index}"))
            })?;
            Ok(Notification::RegisterChanged {
                index,
                wire_value: wire::as_wire_value(value, "registerChanged")?,
            })
        }
        METHOD_ACQUISITION_CONFIG_CHANGED => {
            let value = Value::Array(raw.params);
            let (time_span_seconds, points) =
                wire::as_acquisition_config(&value, "streamAcquisitionConfigChanged")?;
            Ok(Notification::StreamAcquisitionConfigChanged {
                time_span_seconds,
                points,
            })
        }
        METHOD_SHUTDOWN => Ok(Notification::Shutdown),
        _ => Ok(Notification::Unknown {
            method: raw.method,
            params: raw.params,
        }),
    }
}

/// Pump the notification SUB socket until the channel goes away or the feed
/// turns bad. Decode failures are fatal to the channel, not just dropped.
pub(crate) async fn run_notification_feed(
    mut socket: SubSocket,
    inputs: mpsc::UnboundedSender<Input>,
) {
    loop {
        let message = match socket.recv().await {
            Ok(message) => message,
            Err(e) => {
                let _ = inputs.send(Input::Fault(ChannelError::Transport(e)));
                return;
            }
        };
        let frames = message.into_vec();
        let Some(payload) = frames.last() else {
            let _ = inputs.send(Input::Fault(ChannelError::Protocol(
                ProtocolError::malformed("notification", "empty message"),
            )));
            return;
        };
        match decode_notification_message(payload) {
            Ok(notification) => {
                if inputs.send(Input::Notification(notification)).is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = inputs.send(Input::Fault(ChannelError::Protocol(e)));
                return;
            }
        }
    }
}
