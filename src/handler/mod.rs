//! Handler module - procedure registration and invocation.
//!
//! Provides:
//! - [`Handler`] - the fixed value-in/value-out handler signature
//! - [`HandlerRegistry`] - name-to-handler mapping, extendable while the
//!   connection is live
//! - [`FnHandler`] / [`TypedHandler`] - closure and serde-typed adapters

mod registry;

pub use registry::{BoxFuture, FnHandler, Handler, HandlerRegistry, HandlerResult, TypedHandler};
