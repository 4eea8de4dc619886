//! Lifecycle observability hooks.
//!
//! A context reports three things: `opened` when its read loop starts,
//! `closed` exactly once when the stream has ended and all pending calls
//! were force-settled, and `packet` once per processed packet — on the
//! call path when a call settles, and on the process path when an inbound
//! request finishes. The packet event carries start/end instants and is
//! the extension point for latency measurement and tracing.
//!
//! Hooks are a fixed, typed set rather than an open-ended event registry,
//! and they are isolated: a panicking observer is caught and logged, never
//! propagated back into the dispatch path.

use std::panic::AssertUnwindSafe;
use std::time::Instant;

use rmpv::Value;

use crate::context::Context;
use crate::error::Fault;
use crate::protocol::Packet;

/// Which path produced a packet event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketSource {
    /// Send-originated: a local call settled (reply, timeout, or close).
    Call,
    /// Receive-originated: an inbound request finished processing.
    Process,
}

/// Observation of one processed packet.
#[derive(Debug, Clone)]
pub struct PacketEvent {
    /// The path that produced this event.
    pub source: PacketSource,
    /// The request packet as sent or received.
    pub packet: Packet,
    /// Result value, when the operation succeeded.
    pub result: Option<Value>,
    /// Structured failure, when it did not.
    pub error: Option<Fault>,
    /// When processing began.
    pub time_start: Instant,
    /// When processing finished.
    pub time_end: Instant,
}

type LifecycleHook = Box<dyn Fn(&Context) + Send + Sync>;
type PacketHook = Box<dyn Fn(&PacketEvent) + Send + Sync>;

/// The typed hook set carried by a context.
#[derive(Default)]
pub(crate) struct Hooks {
    pub(crate) opened: Option<LifecycleHook>,
    pub(crate) closed: Option<LifecycleHook>,
    pub(crate) packet: Option<PacketHook>,
}

impl Hooks {
    /// Whether packet events need to be constructed at all.
    pub(crate) fn wants_packets(&self) -> bool {
        self.packet.is_some()
    }

    pub(crate) fn emit_opened(&self, ctx: &Context) {
        if let Some(hook) = &self.opened {
            isolated("opened", || hook(ctx));
        }
    }

    pub(crate) fn emit_closed(&self, ctx: &Context) {
        if let Some(hook) = &self.closed {
            isolated("closed", || hook(ctx));
        }
    }

    pub(crate) fn emit_packet(&self, event: &PacketEvent) {
        if let Some(hook) = &self.packet {
            isolated("packet", || hook(event));
        }
    }
}

/// Run an observer, containing any panic it raises.
fn isolated(hook: &str, f: impl FnOnce()) {
    if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::warn!("{hook} observer panicked; ignoring");
    }
}
