// Copyright 2026 Servolink Developers
// SPDX-License-Identifier: Apache-2.0

//! msgpack-rpc framing.
//!
//! The controller speaks classic msgpack-rpc over ZeroMQ: requests and
//! responses on a REQ/REP pair, notifications on PUB/SUB feeds. A request is
//! the array `[0, seq, method, args]`, a response `[1, seq, error, result]`
//! and a notification `[2, method, params]`. The sequence id is carried but
//! never matched against; correctness relies on the transport serializing
//! requests strictly one at a time.

use crate::error::ProtocolError;
use rmpv::Value;

pub(crate) const KIND_REQUEST: u64 = 0;
pub(crate) const KIND_RESPONSE: u64 = 1;
pub(crate) const KIND_NOTIFICATION: u64 = 2;

/// A decoded msgpack-rpc response.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Response {
    /// Error string reported by the remote, if any
    pub error: Option<String>,
    pub result: Value,
}

/// A decoded msgpack-rpc notification.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RawNotification {
    pub method: String,
    pub params: Vec<Value>,
}

/// Encode a request frame. The sequence id is fixed at zero.
pub(crate) fn encode_request(method: &str, args: Vec<Value>) -> Result<Vec<u8>, ProtocolError> {
    let frame = Value::Array(vec![
        Value::from(KIND_REQUEST),
        Value::from(0u64),
        Value::from(method),
        Value::Array(args),
    ]);
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &frame)
        .map_err(|e| ProtocolError::Decode(e.to_string()))?;
    Ok(buf)
}

/// Decode a response frame received on the request socket.
pub(crate) fn decode_response(bytes: &[u8]) -> Result<Response, ProtocolError> {
    let fields = decode_array(bytes, "response", 4)?;
    expect_kind(&fields[0], KIND_RESPONSE)?;

    let error = match &fields[2] {
        Value::Nil => None,
        Value::String(s) => Some(s.as_str().unwrap_or("<non-utf8 error>").to_owned()),
        other => Some(format!("{other}")),
    };
    Ok(Response {
        error,
        result: fields[3].clone(),
    })
}

/// Decode a notification frame from a one-way feed.
pub(crate) fn decode_notification(bytes: &[u8]) -> Result<RawNotification, ProtocolError> {
    let fields = decode_array(bytes, "notification", 3)?;
    expect_kind(&fields[0], KIND_NOTIFICATION)?;

    let method = fields[1]
        .as_str()
        .ok_or_else(|| ProtocolError::malformed("notification", "method is not a string"))?
        .to_owned();
    let params = match &fields[2] {
        Value::Array(params) => params.clone(),
        other => {
            return Err(ProtocolError::malformed(
                "notification",
                format!("params is not an array: {other}"),
            ))
        }
    };
    Ok(RawNotification { method, params })
}

fn decode_array(
    bytes: &[u8],
    what: &'static str,
    expected_len: usize,
) -> Result<Vec<Value>, ProtocolError> {
    let mut cursor = bytes;
    let value = rmpv::decode::read_value(&mut cursor)
        .map_err(|e| ProtocolError::Decode(e.to_string()))?;
    match value {
        Value::Array(fields) if fields.len() == expected_len => Ok(fields),
        Value::Array(fields) => Err(ProtocolError::malformed(
            what,
            format!("expected {expected_len} fields, got {}", fields.len()),
        )),
        other => Err(ProtocolError::malformed(
            what,
            format!("not an array: {other}"),
        )),
    }
}

fn expect_kind(value: &Value, expected: u64) -> Result<(), ProtocolError> {
    let found = value
        .as_u64()
        .ok_or_else(|| ProtocolError::malformed("frame", "kind tag is not an integer"))?;
    if found != expected {
        return Err(ProtocolError::UnexpectedKind { expected, found });
    }
    Ok(())
}

// Shape helpers for RPC results. Every mismatch is a protocol fault that
// terminates the channel, so the messages name what was being parsed.

pub(crate) fn as_u64(value: &Value, what: &'static str) -> Result<u64, ProtocolError> {
    value
        .as_u64()
        .ok_or_else(|| ProtocolError::malformed(what, format!("expected unsigned integer, got {value}")))
}

pub(crate) fn as_port(value: &Value, what: &'static str) -> Result<u16, ProtocolError> {
    let port = as_u64(value, what)?;
    u16::try_from(port)
        .map_err(|_| ProtocolError::malformed(what, format!("port out of range: {port}")))
}

pub(crate) fn as_wire_value(value: &Value, what: &'static str) -> Result<u16, ProtocolError> {
    let raw = as_u64(value, what)?;
    u16::try_from(raw)
        .map_err(|_| ProtocolError::malformed(what, format!("register value out of range: {raw}")))
}

pub(crate) fn as_f64(value: &Value, what: &'static str) -> Result<f64, ProtocolError> {
    value
        .as_f64()
        .ok_or_else(|| ProtocolError::malformed(what, format!("expected number, got {value}")))
}

pub(crate) fn as_bool(value: &Value, what: &'static str) -> Result<bool, ProtocolError> {
    value
        .as_bool()
        .ok_or_else(|| ProtocolError::malformed(what, format!("expected bool, got {value}")))
}

/// Parse the `[timeSpanSeconds, points]` pair used by the acquisition config
/// RPC and notification.
pub(crate) fn as_acquisition_config(
    value: &Value,
    what: &'static str,
) -> Result<(f64, u32), ProtocolError> {
    let fields = value
        .as_array()
        .ok_or_else(|| ProtocolError::malformed(what, format!("expected array, got {value}")))?;
    if fields.len() != 2 {
        return Err(ProtocolError::malformed(
            what,
            format!("expected 2 fields, got {}", fields.len()),
        ));
    }
    let time_span = as_f64(&fields[0], what)?;
    let points = as_u64(&fields[1], what)?;
    let points = u32::try_from(points)
        .map_err(|_| ProtocolError::malformed(what, format!("point count out of range: {points}")))?;
    Ok((time_span, points))
}

pub(crate) fn as_port_list(value: &Value, what: &'static str) -> Result<Vec<u16>, ProtocolError> {
    let fields = value
        .as_array()
        .ok_or_else(|| ProtocolError::malformed(what, format!("expected array, got {value}")))?;
    fields.iter().map(|v| as_port(v, what)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack(value: &Value) -> Vec<u8> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, value).unwrap();
        buf
    }

    #[test]
    fn request_framing() {
        let bytes = encode_request("readRegister", vec![Value::from(3u64)]).unwrap();
        let mut cursor = &bytes[..];
        let frame = rmpv::decode::read_value(&mut cursor).unwrap();
        assert_eq!(
            frame,
            Value::Array(vec![
                Value::from(0u64),
                Value::from(0u64),
                Value::from("readRegister"),
                Value::Array(vec![Value::from(3u64)]),
            ])
        );
    }

    #[test]
    fn response_result_and_error() {
        let ok = pack(&Value::Array(vec![
            Value::from(1u64),
            Value::from(0u64),
            Value::Nil,
            Value::from(42u64),
        ]));
        let response = decode_response(&ok).unwrap();
        assert_eq!(response.error, None);
        assert_eq!(response.result, Value::from(42u64));

        let failed = pack(&Value::Array(vec![
            Value::from(1u64),
            Value::from(0u64),
            Value::from("register locked"),
            Value::Nil,
        ]));
        let response = decode_response(&failed).unwrap();
        assert_eq!(response.error.as_deref(), Some("register locked"));
    }

    #[test]
    fn response_with_wrong_kind_is_rejected() {
        let bad = pack(&Value::Array(vec![
            Value::from(2u64),
            Value::from(0u64),
            Value::Nil,
            Value::Nil,
        ]));
        assert_eq!(
            decode_response(&bad),
            Err(ProtocolError::UnexpectedKind {
                expected: 1,
                found: 2
            })
        );
    }

    #[test]
    fn notification_decoding() {
        let bytes = pack(&Value::Array(vec![
            Value::from(2u64),
            Value::from("registerChanged"),
            Value::Array(vec![Value::from(4u64), Value::from(100u64)]),
        ]));
        let n = decode_notification(&bytes).unwrap();
        assert_eq!(n.method, "registerChanged");
        assert_eq!(n.params.len(), 2);
    }

    #[test]
    fn notification_must_be_three_fields() {
        let bytes = pack(&Value::Array(vec![
            Value::from(2u64),
            Value::from("ping"),
        ]));
        assert!(matches!(
            decode_notification(&bytes),
            Err(ProtocolError::Malformed { what: "notification", .. })
        ));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            decode_response(&[0xc1]),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn acquisition_config_accepts_integer_time_span() {
        // Controllers pack whole-second spans as integers.
        let value = Value::Array(vec![Value::from(2u64), Value::from(512u64)]);
        assert_eq!(as_acquisition_config(&value, "config").unwrap(), (2.0, 512));
    }
}
