//! # Protocol Frames
//!
//! Defines the structure of the RPC envelope (Call vs Reply).
//!
//! ## Invariants
//! - **Panic Safety**: All decoding paths return `Result`, never panicking on unknown data.
//! - **Forward Compatibility**: Unknown envelope fields are safely skipped.
//! - **Null Fidelity**: A reply whose `result` is JSON `null` is a success, not a missing field.

use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::error::Error;
use crate::error::FailureReason;
use crate::error::Result;

/// The protocol version string every frame carries.
pub const VERSION: &str = "2.0";

/// Encodes an outbound Call frame.
pub struct CallEncoder<'a> {
    pub seq: u64,
    pub method: &'a str,
    pub params: &'a Value,
}

#[derive(Serialize)]
struct CallOut<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a Value,
}

impl<'a> CallEncoder<'a> {
    pub fn new(seq: u64, method: &'a str, params: &'a Value) -> Self {
        Self { seq, method, params }
    }

    /// Encode this call into a frame body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let out = CallOut {
            jsonrpc: VERSION,
            id: self.seq,
            method: self.method,
            params: self.params,
        };
        Ok(serde_json::to_vec(&out)?)
    }
}

/// Encodes an outbound Reply frame (success).
pub struct ReplyOkEncoder<'a> {
    pub seq: u64,
    pub result: &'a Value,
}

#[derive(Serialize)]
struct ReplyOkOut<'a> {
    jsonrpc: &'static str,
    id: u64,
    result: &'a Value,
}

impl<'a> ReplyOkEncoder<'a> {
    pub fn new(seq: u64, result: &'a Value) -> Self {
        Self { seq, result }
    }

    /// Encode this success reply into a frame body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let out = ReplyOkOut {
            jsonrpc: VERSION,
            id: self.seq,
            result: self.result,
        };
        Ok(serde_json::to_vec(&out)?)
    }
}

/// Encodes an outbound Reply frame (failure).
///
/// A `seq` of `None` is written as `"id": null`, used when the failing frame
/// was too broken to recover its id.
pub struct ReplyErrEncoder<'a> {
    pub seq: Option<u64>,
    pub reason: &'a FailureReason,
}

#[derive(Serialize)]
struct ReplyErrOut<'a> {
    jsonrpc: &'static str,
    id: Option<u64>,
    error: ErrorOut<'a>,
}

#[derive(Serialize)]
struct ErrorOut<'a> {
    code: i64,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a Value>,
}

impl<'a> ReplyErrEncoder<'a> {
    pub fn new(seq: Option<u64>, reason: &'a FailureReason) -> Self {
        Self { seq, reason }
    }

    /// Encode this failure reply into a frame body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let out = ReplyErrOut {
            jsonrpc: VERSION,
            id: self.seq,
            error: ErrorOut {
                code: self.reason.code(),
                message: self.reason.message(),
                data: self.reason.data(),
            },
        };
        Ok(serde_json::to_vec(&out)?)
    }
}

/// A decoded inbound Call.
///
/// Only unsigned integer ids are accepted; a string or fractional id decodes
/// as a protocol violation and gets an `InvalidRequest` reply with a null id.
#[derive(Debug, Clone, PartialEq)]
pub struct CallFrame {
    pub seq: u64,
    pub method: String,
    /// Absent params decode as `Value::Null`.
    pub params: Value,
}

/// A decoded inbound Reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyFrame {
    /// `None` only when the remote could not identify the call it answers.
    pub seq: Option<u64>,
    /// - `Ok(Value)`: Success.
    /// - `Err(FailureReason)`: Remote failure.
    pub status: std::result::Result<Value, FailureReason>,
}

/// Top-level frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcFrame {
    Call(CallFrame),
    Reply(ReplyFrame),
}

impl RpcFrame {
    /// Decode an RPC frame from a frame body.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut map = decode_object(bytes)?;
        check_version(&map)?;

        if map.contains_key("method") {
            Ok(RpcFrame::Call(decode_call(&mut map)?))
        } else if map.contains_key("result") || map.contains_key("error") {
            Ok(RpcFrame::Reply(decode_reply(&mut map)?))
        } else {
            Err(Error::UnknownVariant("neither call nor reply".into()))
        }
    }
}

/// Decodes just the sequence number from a raw frame.
/// This is useful for routing replies when the full decoding might fail.
pub fn decode_seq(bytes: &[u8]) -> Result<u64> {
    let map = decode_object(bytes)?;
    match map.get("id") {
        Some(id) => id_to_seq(id),
        None => Err(Error::ProtocolViolation("Missing id".into())),
    }
}

fn decode_object(bytes: &[u8]) -> Result<Map<String, Value>> {
    match serde_json::from_slice::<Value>(bytes)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::UnknownVariant(format!("Top-level frame: {}", kind_of(&other)))),
    }
}

fn check_version(map: &Map<String, Value>) -> Result<()> {
    match map.get("jsonrpc") {
        Some(Value::String(v)) if v == VERSION => Ok(()),
        Some(other) => Err(Error::ProtocolViolation(format!("Unsupported version: {}", other))),
        None => Err(Error::ProtocolViolation("Missing jsonrpc".into())),
    }
}

fn decode_call(map: &mut Map<String, Value>) -> Result<CallFrame> {
    let seq = match map.get("id") {
        Some(id) => id_to_seq(id)?,
        None => return Err(Error::ProtocolViolation("Missing id".into())),
    };

    let method = match map.remove("method") {
        Some(Value::String(m)) => m,
        _ => return Err(Error::ProtocolViolation("Method must be a string".into())),
    };

    let params = map.remove("params").unwrap_or(Value::Null);

    Ok(CallFrame { seq, method, params })
}

fn decode_reply(map: &mut Map<String, Value>) -> Result<ReplyFrame> {
    let seq = match map.get("id") {
        Some(Value::Null) => None,
        Some(id) => Some(id_to_seq(id)?),
        None => return Err(Error::ProtocolViolation("Missing id".into())),
    };

    if let Some(result) = map.remove("result") {
        return Ok(ReplyFrame { seq, status: Ok(result) });
    }

    let Some(Value::Object(mut error)) = map.remove("error") else {
        return Err(Error::ProtocolViolation("Error must be an object".into()));
    };

    let code = error
        .get("code")
        .and_then(Value::as_i64)
        .ok_or(Error::ProtocolViolation("Missing error code".into()))?;

    let message = match error.remove("message") {
        Some(Value::String(m)) => m,
        _ => String::new(),
    };

    let reason = FailureReason::from_wire(code, message, error.remove("data"));
    Ok(ReplyFrame { seq, status: Err(reason) })
}

fn id_to_seq(id: &Value) -> Result<u64> {
    id.as_u64()
        .ok_or_else(|| Error::ProtocolViolation(format!("Id must be an unsigned integer, got {}", kind_of(id))))
}

fn kind_of(val: &Value) -> &'static str {
    match val {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
