// Copyright 2026 Servolink Developers
// SPDX-License-Identifier: Apache-2.0

//! Sample-stream subscriptions.
//!
//! Each controller exposes a PUB socket per logical signal. Subscriptions are
//! refcounted: the first subscriber opens the feed, the last one closes it.
//! Closing is deliberately order-insensitive with respect to channel
//! teardown — unsubscribing after the channel already tore the feed down is a
//! no-op, not an error.

use crate::error::{ChannelError, ProtocolError};
use crate::state_machine::Input;
use crate::wire;
use rmpv::Value;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use zeromq::{SocketRecv, SubSocket};

/// Msgpack ext code for int8 sample arrays.
pub(crate) const EXT_INT8_ARRAY: i8 = 1;

const METHOD_STREAM_PACKET: &str = "streamPacket";

/// One decoded burst of samples from a stream feed.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamPacket {
    pub stream_index: usize,
    pub sample_interval_seconds: f64,
    /// Sample offset of the trigger point within the burst
    pub trigger_offset: i32,
    pub samples: Vec<i16>,
}

/// Decode one message from a stream feed.
///
/// The message must be a `streamPacket` notification with a single map
/// parameter carrying the sample interval, trigger offset and a typed sample
/// buffer. Anything else terminates the channel.
pub(crate) fn decode_stream_packet(
    stream_index: usize,
    bytes: &[u8],
) -> Result<StreamPacket, ProtocolError> {
    let notification = wire::decode_notification(bytes)?;
    if notification.method != METHOD_STREAM_PACKET {
        return Err(ProtocolError::malformed(
            "stream packet",
            format!("unexpected method on stream feed: {}", notification.method),
        ));
    }
    let [param] = notification.params.as_slice() else {
        return Err(ProtocolError::malformed(
            "stream packet",
            format!("expected 1 parameter, got {}", notification.params.len()),
        ));
    };
    let fields = param.as_map().ok_or_else(|| {
        ProtocolError::malformed("stream packet", "parameter is not a map")
    })?;

    let mut sample_interval_seconds = None;
    let mut trigger_offset = None;
    let mut samples = None;
    for (key, value) in fields {
        match key.as_str() {
            Some("sampleIntervalSeconds") => {
                sample_interval_seconds = Some(wire::as_f64(value, "stream packet")?);
            }
            Some("triggerOffset") => {
                let offset = value.as_i64().ok_or_else(|| {
                    ProtocolError::malformed("stream packet", "triggerOffset is not an integer")
                })?;
                trigger_offset = Some(offset as i32);
            }
            Some("samples") => match value {
                Value::Ext(code, data) => samples = Some(widen_samples(*code, data)?),
                other => {
                    return Err(ProtocolError::malformed(
                        "stream packet",
                        format!("samples is not an ext payload: {other}"),
                    ))
                }
            },
            _ => {}
        }
    }

    match (sample_interval_seconds, trigger_offset, samples) {
        (Some(sample_interval_seconds), Some(trigger_offset), Some(samples)) => Ok(StreamPacket {
            stream_index,
            sample_interval_seconds,
            trigger_offset,
            samples,
        }),
        _ => Err(ProtocolError::malformed(
            "stream packet",
            "missing sampleIntervalSeconds, triggerOffset or samples",
        )),
    }
}

/// Widen an int8 sample buffer to the 16-bit range consumers expect.
///
/// The ADC resolution is 10 bit; multiplying by 4 keeps the original
/// resolution while matching the value range of newer hardware revisions.
fn widen_samples(code: i8, data: &[u8]) -> Result<Vec<i16>, ProtocolError> {
    if code != EXT_INT8_ARRAY {
        return Err(ProtocolError::UnknownSampleEncoding(code));
    }
    Ok(data.iter().map(|&b| i16::from(b as i8) * 4).collect())
}

/// Pump one stream SUB socket. Packets are decoded here so a malformed feed
/// terminates the channel without a round-trip through the actor.
pub(crate) async fn run_stream_feed(
    stream_index: usize,
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
                ProtocolError::malformed("stream packet", "empty message"),
            )));
            return;
        };
        match decode_stream_packet(stream_index, payload) {
            Ok(packet) => {
                if inputs.send(Input::StreamPacketReceived(packet)).is_err() {
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

/// Refcount bookkeeping for stream subscriptions.
///
/// Pure bookkeeping only — the state machine turns the transition reports
/// into feed open/close actions, and the driver owns the sockets.
#[derive(Debug, Default)]
pub(crate) struct StreamSubscriptions {
    counts: HashMap<usize, usize>,
    active: HashSet<usize>,
}

impl StreamSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the refcount. Returns true on the 0→1 transition, i.e. when
    /// the feed must be opened.
    pub fn subscribe(&mut self, stream_index: usize) -> bool {
        let count = self.counts.entry(stream_index).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Decrement the refcount. Returns true when the feed must be closed now
    /// (last subscriber gone and the feed is still open).
    pub fn unsubscribe(&mut self, stream_index: usize) -> bool {
        let Some(count) = self.counts.get_mut(&stream_index) else {
            return false;
        };
        *count = count.saturating_sub(1);
        *count == 0 && self.active.remove(&stream_index)
    }

    /// Record that the feed for `stream_index` is open.
    pub fn mark_open(&mut self, stream_index: usize) {
        self.active.insert(stream_index);
    }

    /// Drop all active feeds (teardown). Refcounts are kept so that late
    /// unsubscribes stay harmless no-ops.
    pub fn close_all(&mut self) {
        self.active.clear();
    }

    #[cfg(test)]
    pub fn is_open(&self, stream_index: usize) -> bool {
        self.active.contains(&stream_index)
    }
}
