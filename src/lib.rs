//! # wirecall
//!
//! Symmetric, bidirectional RPC over any duplex byte stream.
//!
//! Two connected endpoints are peers: each registers named procedures and
//! invokes the other's over the same connection. One packet shape serves
//! both directions — a msgpack tuple whose second slot is either a
//! procedure name (request) or an echoed callback id (reply):
//!
//! ```text
//! -> [cb, name, ...args]
//! <- [nil, cb, result, error|nil]
//! ```
//!
//! The engine provides request/response correlation by callback id,
//! fire-and-forget notifications, per-call timeouts, structured error
//! propagation, and lifecycle hooks for observability. It does not do
//! connection management: hand it an established stream's read and write
//! halves and run [`Context::listen`].
//!
//! ## Example
//!
//! ```ignore
//! use wirecall::{Context, Fault, Value};
//!
//! let (reader, writer) = tokio::io::split(stream);
//! let ctx = Context::builder()
//!     .handle_typed("sum", |(a, b): (i64, i64), _ctx| async move {
//!         Ok::<_, Fault>(a + b)
//!     })
//!     .build(reader, writer);
//!
//! let listener = {
//!     let ctx = ctx.clone();
//!     tokio::spawn(async move { ctx.listen().await })
//! };
//!
//! let sum = ctx.call("sum", vec![Value::from(2), Value::from(3)]).await?;
//! assert_eq!(sum, Value::from(5));
//! ```
//!
//! ## Guarantees and limits
//!
//! - Every call settles exactly once: by its reply, by its timeout, or by
//!   forced settlement with `CONNECTION_CLOSED` when the stream ends.
//! - Correlation is id-based; replies may arrive in any order.
//! - Handler invocations are concurrent, not serialized.
//! - No delivery ordering beyond per-id correlation, no reconnection, no
//!   backpressure, no authentication.

pub mod error;
pub mod events;
pub mod handler;
pub mod protocol;

mod calls;
mod context;
mod writer;

pub use context::{Context, ContextBuilder, ContextConfig, DEFAULT_READ_BUFFER_SIZE};
pub use error::{codes, Error, Fault, Result};
pub use events::{PacketEvent, PacketSource};
pub use handler::{BoxFuture, FnHandler, Handler, HandlerRegistry, HandlerResult, TypedHandler};
pub use protocol::{FrameBuffer, Packet};

/// Self-describing value type used for arguments, results, and error
/// details (re-exported from `rmpv`).
pub use rmpv::Value;
