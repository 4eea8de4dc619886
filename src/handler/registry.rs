//! Handler registry for dispatching requests by procedure name.
//!
//! Handlers have one fixed signature: an ordered list of self-describing
//! values in, one value or a structured [`Fault`] out. [`TypedHandler`]
//! layers serde on top of that for handlers that want real types.
//!
//! The registry may be populated before the connection starts or extended
//! at any point during its life; registration is last-write-wins per name.
//!
//! # Example
//!
//! ```
//! use wirecall::{HandlerRegistry, Value};
//!
//! let registry = HandlerRegistry::new();
//! registry.register_fn("echo", |args, _ctx| async move {
//!     Ok(args.into_iter().next().unwrap_or(Value::Nil))
//! });
//! assert!(registry.get("echo").is_some());
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::Context;
use crate::error::Fault;

/// Result type for handler functions: a value, or a structured fault that
/// is forwarded verbatim to the remote caller.
pub type HandlerResult = std::result::Result<Value, Fault>;

/// Boxed future, as returned by trait-object handlers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for procedure handlers.
///
/// The context is a clone of the connection's own handle, so a handler
/// can `send`, `call`, or register further handlers while it runs.
pub trait Handler: Send + Sync + 'static {
    /// Invoke the handler with already-decoded argument values.
    fn call(&self, args: Vec<Value>, ctx: Context) -> BoxFuture<'static, HandlerResult>;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<F> {
    handler: F,
}

impl<F> FnHandler<F> {
    /// Wrap a closure.
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Vec<Value>, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, args: Vec<Value>, ctx: Context) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.handler)(args, ctx))
    }
}

/// Wrapper that maps the argument list onto a deserializable type and the
/// result back onto a value.
///
/// Arguments decode as a tuple: a handler of two integers takes
/// `(i64, i64)`. Decode or encode failures are reported to the remote
/// side as a generic `SERVER_ERROR` with the detail kept local.
pub struct TypedHandler<F, T, R, Fut>
where
    F: Fn(T, Context) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = std::result::Result<R, Fault>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> (R, Fut)>,
}

impl<F, T, R, Fut> TypedHandler<F, T, R, Fut>
where
    F: Fn(T, Context) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = std::result::Result<R, Fault>> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, R, Fut> Handler for TypedHandler<F, T, R, Fut>
where
    F: Fn(T, Context) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = std::result::Result<R, Fault>> + Send + 'static,
{
    fn call(&self, args: Vec<Value>, ctx: Context) -> BoxFuture<'static, HandlerResult> {
        let parsed: T = match rmpv::ext::from_value(Value::Array(args)) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::debug!("argument decode failed: {err}");
                return Box::pin(async { Err(Fault::server_error()) });
            }
        };

        let fut = (self.handler)(parsed, ctx);
        Box::pin(async move {
            let result = fut.await?;
            match rmpv::ext::to_value(result) {
                Ok(value) => Ok(value),
                Err(err) => {
                    tracing::error!("result encode failed: {err}");
                    Err(Fault::server_error())
                }
            }
        })
    }
}

/// Registry mapping procedure names to handlers.
///
/// Lookups clone the handler `Arc` out of the lock, so dispatch never
/// holds it across an await.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler for `name`, replacing any previous one.
    pub fn register(&self, name: &str, handler: impl Handler) {
        self.handlers
            .write()
            .expect("handler registry lock poisoned")
            .insert(name.to_string(), Arc::new(handler));
    }

    /// Register an async closure taking raw values.
    pub fn register_fn<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Vec<Value>, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(name, FnHandler::new(handler));
    }

    /// Register an async closure with serde-typed arguments and result.
    pub fn register_typed<F, T, R, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(T, Context) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = std::result::Result<R, Fault>> + Send + 'static,
    {
        self.register(name, TypedHandler::new(handler));
    }

    /// Look up a handler by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .read()
            .expect("handler registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Check whether a handler is registered for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers
            .read()
            .expect("handler registry lock poisoned")
            .contains_key(name)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .expect("handler registry lock poisoned")
            .len()
    }

    /// Check if no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
