//! Packet codec: the atomic wire unit and its MessagePack encoding.
//!
//! Every packet is one msgpack array. The first slot is the callback id
//! (`nil` for fire-and-forget notifications); the second slot is
//! overloaded by design: a string names a procedure (the packet is a
//! request), an integer echoes a callback id (the packet is a reply).
//! The two directions share one symmetric shape:
//!
//! ```text
//! -> [cb, name, ...args]
//! <- [nil, cb, result, error|nil]
//! ```
//!
//! Decoding resolves the overload into an explicit [`Packet`] variant;
//! whether a reply's id is still live is the dispatcher's business, not
//! the codec's.

use std::io::Write;

use rmpv::Value;

use crate::error::{Error, Fault, Result};

/// A decoded protocol packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// An inbound or outbound procedure invocation.
    ///
    /// `id` is `None` for notifications: no reply is ever expected or
    /// produced for those, even when the handler fails.
    Request {
        /// Callback id chosen by the sender, `None` for notifications.
        id: Option<u64>,
        /// Procedure name.
        name: String,
        /// Already-decoded argument values, in order.
        args: Vec<Value>,
    },
    /// A reply to a previously sent call.
    Reply {
        /// The echoed callback id.
        id: u64,
        /// Result value (`nil` when the call failed).
        result: Value,
        /// Structured failure, if the call failed.
        error: Option<Fault>,
    },
}

impl Packet {
    /// Build a request packet.
    pub fn request(id: Option<u64>, name: impl Into<String>, args: Vec<Value>) -> Self {
        Packet::Request {
            id,
            name: name.into(),
            args,
        }
    }

    /// Build a reply packet.
    pub fn reply(id: u64, result: Value, error: Option<Fault>) -> Self {
        Packet::Reply { id, result, error }
    }

    /// Convert to the wire tuple.
    pub fn to_value(&self) -> Value {
        match self {
            Packet::Request { id, name, args } => {
                let mut items = Vec::with_capacity(2 + args.len());
                items.push(match id {
                    Some(id) => Value::from(*id),
                    None => Value::Nil,
                });
                items.push(Value::from(name.as_str()));
                items.extend(args.iter().cloned());
                Value::Array(items)
            }
            Packet::Reply { id, result, error } => Value::Array(vec![
                Value::Nil,
                Value::from(*id),
                result.clone(),
                match error {
                    Some(fault) => fault_to_value(fault),
                    None => Value::Nil,
                },
            ]),
        }
    }

    /// Parse the wire tuple into a packet.
    ///
    /// The second slot decides the variant: a string is a request name, a
    /// non-negative integer an echoed callback id. Anything else, or a
    /// tuple shorter than two slots, is a protocol error.
    pub fn from_value(value: Value) -> Result<Self> {
        let items = match value {
            Value::Array(items) => items,
            other => {
                return Err(Error::Protocol(format!(
                    "packet must be an array, got {other}"
                )))
            }
        };
        if items.len() < 2 {
            return Err(Error::Protocol(format!(
                "packet needs at least 2 slots, got {}",
                items.len()
            )));
        }

        let mut items = items.into_iter();
        let cb_slot = items.next().expect("length checked");
        let fn_slot = items.next().expect("length checked");

        let cb = match &cb_slot {
            Value::Nil => None,
            v => Some(v.as_u64().ok_or_else(|| {
                Error::Protocol(format!("callback id must be nil or a non-negative integer, got {v}"))
            })?),
        };

        match fn_slot {
            Value::String(name) => {
                let name = name
                    .into_str()
                    .ok_or_else(|| Error::Protocol("procedure name is not valid UTF-8".into()))?;
                Ok(Packet::Request {
                    id: cb,
                    name,
                    args: items.collect(),
                })
            }
            Value::Integer(int) => {
                let id = int.as_u64().ok_or_else(|| {
                    Error::Protocol(format!("echoed callback id must be non-negative, got {int}"))
                })?;
                let result = items.next().unwrap_or(Value::Nil);
                let error = match items.next() {
                    None | Some(Value::Nil) => None,
                    Some(tuple) => Some(fault_from_value(tuple)?),
                };
                Ok(Packet::Reply { id, result, error })
            }
            v => Err(Error::Protocol(format!(
                "second slot must be a name or an echoed callback id, got {v}"
            ))),
        }
    }

    /// Encode this packet as msgpack bytes, ready for the stream.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let value = self.to_value();
        let mut buf = Vec::new();
        write_packet(&mut buf, &value)?;
        Ok(buf)
    }
}

/// Write one wire tuple to `wr`.
pub fn write_packet<W: Write>(wr: &mut W, value: &Value) -> Result<()> {
    rmpv::encode::write_value(wr, value)?;
    Ok(())
}

/// Convert a fault to its wire tuple `[code, message, ...args]`.
pub fn fault_to_value(fault: &Fault) -> Value {
    let mut items = Vec::with_capacity(2 + fault.args.len());
    items.push(Value::from(fault.code.as_str()));
    items.push(Value::from(fault.message.as_str()));
    items.extend(fault.args.iter().cloned());
    Value::Array(items)
}

/// Parse a wire tuple `[code, message, ...args]` into a fault.
pub fn fault_from_value(value: Value) -> Result<Fault> {
    let items = match value {
        Value::Array(items) => items,
        other => {
            return Err(Error::Protocol(format!(
                "error tuple must be an array, got {other}"
            )))
        }
    };
    if items.len() < 2 {
        return Err(Error::Protocol(format!(
            "error tuple needs at least 2 slots, got {}",
            items.len()
        )));
    }

    let mut items = items.into_iter();
    let code = items
        .next()
        .and_then(|v| match v {
            Value::String(s) => s.into_str(),
            _ => None,
        })
        .ok_or_else(|| Error::Protocol("error code must be a string".into()))?;
    let message = items
        .next()
        .and_then(|v| match v {
            Value::String(s) => s.into_str(),
            _ => None,
        })
        .ok_or_else(|| Error::Protocol("error message must be a string".into()))?;

    Ok(Fault {
        code,
        message,
        args: items.collect(),
    })
}
