//! Error types for wirecall.
//!
//! Two layers of failure exist in the protocol:
//!
//! - [`Fault`] is the structured error that travels on the wire inside a
//!   reply: `[code, message, ...detailArgs]`. Handlers fail by returning
//!   one, and a remote fault surfaces to the caller as [`Error::Remote`].
//! - [`Error`] covers everything a local operation can fail with: I/O,
//!   codec errors, protocol violations, timeouts, and the connection
//!   closing underneath a pending call.
//!
//! Faults cross the dispatch boundary as return values, never as unwinds.

use rmpv::Value;
use thiserror::Error;

/// Well-known fault codes used by the engine itself.
///
/// Handlers are free to raise their own codes; these are the ones the
/// engine produces or recognizes.
pub mod codes {
    /// Requested procedure name is not registered on the receiving side.
    pub const UNKNOWN_HANDLER: &str = "UNKNOWN_HANDLER";
    /// Local wait for a reply exceeded the requested timeout.
    pub const CALL_TIMEOUT: &str = "CALL_TIMEOUT";
    /// Low-level wait timeout, normalized to `CALL_TIMEOUT` before surfacing.
    pub const WAIT_TIMEOUT: &str = "WAIT_TIMEOUT";
    /// Stream ended while a call was outstanding.
    pub const CONNECTION_CLOSED: &str = "CONNECTION_CLOSED";
    /// Catch-all for handler failures without a recognized structure.
    pub const SERVER_ERROR: &str = "SERVER_ERROR";
}

/// Structured failure carried inside a reply's error slot.
///
/// Wire representation: `[code, message, ...args]` where `code` is a
/// machine-readable identifier, `message` a human-readable description,
/// and `args` optional detail values (e.g. for localization).
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code}: {message}")]
pub struct Fault {
    /// Machine-readable error identifier.
    pub code: String,
    /// Human-readable description.
    pub message: String,
    /// Detail arguments, forwarded verbatim.
    pub args: Vec<Value>,
}

impl Fault {
    /// Create a fault with no detail arguments.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            args: Vec::new(),
        }
    }

    /// Attach detail arguments.
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Fault for a request naming an unregistered procedure.
    ///
    /// Carries the requested name as a detail argument.
    pub fn unknown_handler(name: &str) -> Self {
        Self::new(codes::UNKNOWN_HANDLER, format!("Cannot find handler '{name}'"))
            .with_args(vec![Value::from(name)])
    }

    /// Generic fault for handler failures without a recognized structure.
    ///
    /// Deliberately carries no internal detail.
    pub fn server_error() -> Self {
        Self::new(codes::SERVER_ERROR, "Server error")
    }
}

/// Main error type for all wirecall operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the underlying stream.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// MessagePack encode error.
    #[error("encode error: {0}")]
    Encode(#[from] rmpv::encode::Error),

    /// MessagePack decode error (not the "need more data" case, which the
    /// frame assembler absorbs).
    #[error("decode error: {0}")]
    Decode(#[from] rmpv::decode::Error),

    /// Malformed packet or stream (bad tuple shape, oversized frame, ...).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Stream ended while the operation was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// Low-level wait for a callback id timed out.
    ///
    /// `call_with_timeout` normalizes this to [`Error::CallTimeout`] with
    /// the procedure context attached before surfacing it.
    #[error("timeout waiting {id}")]
    WaitTimeout {
        /// The callback id that was being awaited.
        id: u64,
    },

    /// A timed call did not receive its reply in time.
    #[error("timeout calling {name}")]
    CallTimeout {
        /// Procedure name, for diagnostics.
        name: String,
        /// Arguments the call was made with, for diagnostics.
        args: Vec<Value>,
    },

    /// `listen` was invoked a second time on the same context.
    #[error("listen may only be invoked once per context")]
    AlreadyListening,

    /// The peer replied with a structured fault.
    #[error(transparent)]
    Remote(#[from] Fault),
}

impl Error {
    /// Map the structured subset of errors onto a [`Fault`].
    ///
    /// Used when reporting call outcomes through lifecycle events, so
    /// observers see one error representation on both paths. Local
    /// I/O and codec errors have no fault equivalent and map to `None`.
    pub fn to_fault(&self) -> Option<Fault> {
        match self {
            Error::Remote(fault) => Some(fault.clone()),
            Error::CallTimeout { name, args } => Some(
                Fault::new(codes::CALL_TIMEOUT, format!("Timeout calling {name}")).with_args(vec![
                    Value::from(name.as_str()),
                    Value::Array(args.clone()),
                ]),
            ),
            Error::WaitTimeout { id } => {
                Some(Fault::new(codes::WAIT_TIMEOUT, format!("Timeout waiting {id}")))
            }
            Error::ConnectionClosed => {
                Some(Fault::new(codes::CONNECTION_CLOSED, "Reader is closed"))
            }
            _ => None,
        }
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
