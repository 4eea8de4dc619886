//! Connection context: the read/dispatch loop and the calling surface.
//!
//! A [`Context`] binds one duplex byte stream. Both endpoints are peers:
//! each side registers handlers with [`Context::on`] and invokes the
//! other's with [`Context::call`] or fires notifications with
//! [`Context::send`]. Accepting sockets and dialing peers is a concern of
//! the surrounding application; the context only wants an
//! `AsyncRead`/`AsyncWrite` pair.
//!
//! # Example
//!
//! ```ignore
//! use wirecall::{Context, Fault, Value};
//!
//! let (reader, writer) = tokio::io::split(stream);
//! let ctx = Context::builder()
//!     .handle_typed("sum", |(a, b): (i64, i64), _ctx| async move {
//!         Ok::<_, Fault>(a + b)
//!     })
//!     .on_closed(|_ctx| tracing::info!("peer went away"))
//!     .build(reader, writer);
//!
//! let listener = {
//!     let ctx = ctx.clone();
//!     tokio::spawn(async move { ctx.listen().await })
//! };
//!
//! let five = ctx.call("sum", vec![Value::from(2), Value::from(3)]).await?;
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::calls::CallTable;
use crate::error::{Error, Fault, Result};
use crate::events::{Hooks, PacketEvent, PacketSource};
use crate::handler::{FnHandler, Handler, HandlerRegistry, HandlerResult, TypedHandler};
use crate::protocol::{FrameBuffer, Packet, DEFAULT_MAX_PACKET_SIZE};
use crate::writer::{spawn_writer_task, WriterHandle, DEFAULT_CHANNEL_CAPACITY};

/// Default size of the transport read buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Tuning knobs for a context.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Size of the buffer handed to each transport read.
    pub read_buffer_size: usize,
    /// Maximum size of one encoded packet before the stream is considered
    /// malformed.
    pub max_packet_size: usize,
    /// Capacity of the outbound writer channel.
    pub channel_capacity: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

struct Inner {
    calls: CallTable,
    handlers: HandlerRegistry,
    writer: WriterHandle,
    hooks: Hooks,
    /// Taken exactly once by `listen`.
    reader: Mutex<Option<BoxedReader>>,
    closed: AtomicBool,
    config: ContextConfig,
}

/// One end of an RPC connection.
///
/// Cheaply cloneable; clones share the call table, handler registry, and
/// writer. Handlers receive a clone, so they can call back into the peer
/// while they run.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// Create a builder for configuring handlers and hooks up front.
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    /// Bind a context to a stream with default configuration.
    pub fn attach<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::builder().build(reader, writer)
    }

    /// Register (or overwrite) a handler for `name`.
    ///
    /// May be called at any point in the connection's life; requests
    /// decoded after registration see the new handler.
    pub fn on<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Vec<Value>, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.inner.handlers.register(name, FnHandler::new(handler));
    }

    /// Register a serde-typed handler for `name`.
    pub fn on_typed<F, T, R, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(T, Context) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = std::result::Result<R, Fault>> + Send + 'static,
    {
        self.inner
            .handlers
            .register(name, TypedHandler::new(handler));
    }

    /// Register a prebuilt [`Handler`] for `name`.
    pub fn register_handler(&self, name: &str, handler: impl Handler) {
        self.inner.handlers.register(name, handler);
    }

    /// Fire-and-forget: invoke `name` on the peer without expecting a
    /// reply.
    ///
    /// No pending call is created and no reply is ever processed for this
    /// packet; a failing remote handler is only observable on the remote
    /// side.
    pub async fn send(&self, name: &str, args: Vec<Value>) -> Result<()> {
        let packet = Packet::request(None, name, args);
        self.write_packet(&packet).await
    }

    /// Call `name` on the peer and await its reply.
    ///
    /// Waits indefinitely: settlement comes from the matching reply or
    /// from the connection closing. May reject with a remote fault
    /// (`UNKNOWN_HANDLER`, a handler-raised code, `SERVER_ERROR`) or with
    /// [`Error::ConnectionClosed`].
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        self.do_call(name, args, None).await
    }

    /// As [`Context::call`], but reject with [`Error::CallTimeout`] if no
    /// reply arrives within `timeout`.
    ///
    /// The timeout cancels only the local wait; the remote handler keeps
    /// running and its late reply is discarded as a no-op.
    pub async fn call_with_timeout(
        &self,
        timeout: Duration,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.do_call(name, args, Some(timeout)).await
    }

    async fn do_call(
        &self,
        name: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let time_start = Instant::now();

        // Register before sending: a reply can then never be decoded
        // before its own pending entry exists.
        let (id, rx) = self.inner.calls.register();
        let packet = Packet::request(Some(id), name, args);

        if let Err(err) = self.write_packet(&packet).await {
            self.inner.calls.discard(id);
            return Err(err);
        }

        let outcome = match self.inner.calls.wait(id, rx, timeout).await {
            // Normalize the low-level wait timeout with procedure context.
            Err(Error::WaitTimeout { .. }) => {
                let Packet::Request { name, args, .. } = &packet else {
                    unreachable!("do_call builds a request")
                };
                Err(Error::CallTimeout {
                    name: name.clone(),
                    args: args.clone(),
                })
            }
            outcome => outcome,
        };

        self.emit_call_event(&packet, &outcome, time_start);
        outcome
    }

    /// Run the read/dispatch loop until the stream ends.
    ///
    /// Emits `opened` on entry. On EOF or a fatal read/stream error, every
    /// pending call is force-settled with `CONNECTION_CLOSED` and `closed`
    /// fires exactly once; the loop's verdict is then returned.
    pub async fn listen(&self) -> Result<()> {
        let reader = {
            let mut slot = self.inner.reader.lock().expect("reader lock poisoned");
            slot.take()
        };
        let Some(mut reader) = reader else {
            return Err(Error::AlreadyListening);
        };

        self.inner.hooks.emit_opened(self);

        let verdict = self.read_loop(&mut reader).await;

        self.inner.calls.settle_all_closed();
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.hooks.emit_closed(self);
        }

        verdict
    }

    async fn read_loop(&self, reader: &mut BoxedReader) -> Result<()> {
        let mut frames = FrameBuffer::with_max_packet_size(self.inner.config.max_packet_size);
        let mut buf = vec![0u8; self.inner.config.read_buffer_size];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(err) => {
                    tracing::error!("read failed: {err}");
                    return Err(err.into());
                }
            };

            let packets = frames.push(&buf[..n]).map_err(|err| {
                tracing::error!("malformed stream: {err}");
                err
            })?;

            // Arrival order within one read is dispatch order.
            for packet in packets {
                self.dispatch(packet);
            }
        }
    }

    /// Route one decoded packet.
    ///
    /// Replies settle inline; requests run as their own tasks so handler
    /// invocations are never serialized behind each other.
    fn dispatch(&self, packet: Packet) {
        match packet {
            Packet::Reply { id, result, error } => {
                let outcome = match error {
                    Some(fault) => Err(Error::Remote(fault)),
                    None => Ok(result),
                };
                if !self.inner.calls.settle(id, outcome) {
                    tracing::debug!(id, "dropping reply with no pending call");
                }
            }
            Packet::Request { id, name, args } => {
                let ctx = self.clone();
                tokio::spawn(async move {
                    ctx.process_request(id, name, args).await;
                });
            }
        }
    }

    async fn process_request(&self, id: Option<u64>, name: String, args: Vec<Value>) {
        let time_start = Instant::now();
        let event_packet = self
            .inner
            .hooks
            .wants_packets()
            .then(|| Packet::request(id, name.clone(), args.clone()));

        let outcome = self.invoke(&name, args).await;

        // A reply is owed iff the request carried a callback id.
        if let Some(cb) = id {
            let (result, error) = match &outcome {
                Ok(value) => (value.clone(), None),
                Err(fault) => (Value::Nil, Some(fault.clone())),
            };
            let reply = Packet::reply(cb, result, error);
            if let Err(err) = self.write_packet(&reply).await {
                tracing::error!("failed to send reply for '{name}': {err}");
            }
        } else if let Err(fault) = &outcome {
            // Notification failures never travel back.
            tracing::debug!("notification handler '{name}' failed: {fault}");
        }

        if let Some(packet) = event_packet {
            let (result, error) = match outcome {
                Ok(value) => (Some(value), None),
                Err(fault) => (None, Some(fault)),
            };
            self.inner.hooks.emit_packet(&PacketEvent {
                source: PacketSource::Process,
                packet,
                result,
                error,
                time_start,
                time_end: Instant::now(),
            });
        }
    }

    /// Invoke the handler for `name`, normalizing every failure mode to a
    /// fault: unknown names, structured handler faults, and panics (which
    /// are caught at the task boundary and stripped to `SERVER_ERROR`).
    async fn invoke(&self, name: &str, args: Vec<Value>) -> HandlerResult {
        let Some(handler) = self.inner.handlers.get(name) else {
            return Err(Fault::unknown_handler(name));
        };

        let fut = handler.call(args, self.clone());
        match tokio::spawn(fut).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!("handler '{name}' aborted: {err}");
                Err(Fault::server_error())
            }
        }
    }

    async fn write_packet(&self, packet: &Packet) -> Result<()> {
        let bytes = packet.encode()?;
        self.inner.writer.send(Bytes::from(bytes)).await
    }

    fn emit_call_event(&self, packet: &Packet, outcome: &Result<Value>, time_start: Instant) {
        if !self.inner.hooks.wants_packets() {
            return;
        }
        let (result, error) = match outcome {
            Ok(value) => (Some(value.clone()), None),
            Err(err) => (None, err.to_fault()),
        };
        self.inner.hooks.emit_packet(&PacketEvent {
            source: PacketSource::Call,
            packet: packet.clone(),
            result,
            error,
            time_start,
            time_end: Instant::now(),
        });
    }

    /// Number of calls currently awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.calls.len()
    }

    /// Whether the read loop has ended and pending calls were flushed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

/// Builder for configuring and creating a [`Context`].
///
/// Handlers and hooks can be registered up front with the fluent API;
/// `build` binds the context to a stream.
pub struct ContextBuilder {
    handlers: HandlerRegistry,
    hooks: Hooks,
    config: ContextConfig,
}

impl ContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            handlers: HandlerRegistry::new(),
            hooks: Hooks::default(),
            config: ContextConfig::default(),
        }
    }

    /// Register a handler taking raw values.
    pub fn handle<F, Fut>(self, name: &str, handler: F) -> Self
    where
        F: Fn(Vec<Value>, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.register(name, FnHandler::new(handler));
        self
    }

    /// Register a serde-typed handler.
    pub fn handle_typed<F, T, R, Fut>(self, name: &str, handler: F) -> Self
    where
        F: Fn(T, Context) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = std::result::Result<R, Fault>> + Send + 'static,
    {
        self.handlers.register(name, TypedHandler::new(handler));
        self
    }

    /// Observe the read loop starting.
    pub fn on_opened(mut self, hook: impl Fn(&Context) + Send + Sync + 'static) -> Self {
        self.hooks.opened = Some(Box::new(hook));
        self
    }

    /// Observe the connection closing (fires exactly once).
    pub fn on_closed(mut self, hook: impl Fn(&Context) + Send + Sync + 'static) -> Self {
        self.hooks.closed = Some(Box::new(hook));
        self
    }

    /// Observe every processed packet with timing information.
    pub fn on_packet(mut self, hook: impl Fn(&PacketEvent) + Send + Sync + 'static) -> Self {
        self.hooks.packet = Some(Box::new(hook));
        self
    }

    /// Set the transport read buffer size.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Set the maximum size of one encoded packet.
    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.config.max_packet_size = size;
        self
    }

    /// Set the outbound writer channel capacity.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// Bind the context to a duplex stream.
    ///
    /// The writer task starts immediately; the read loop starts when
    /// [`Context::listen`] is invoked.
    pub fn build<R, W>(self, reader: R, writer: W) -> Context
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (writer, _task) = spawn_writer_task(writer, self.config.channel_capacity);

        Context {
            inner: Arc::new(Inner {
                calls: CallTable::new(),
                handlers: self.handlers,
                writer,
                hooks: self.hooks,
                reader: Mutex::new(Some(Box::new(reader))),
                closed: AtomicBool::new(false),
                config: self.config,
            }),
        }
    }
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
