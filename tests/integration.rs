//! End-to-end tests over in-memory duplex streams.
//!
//! Two harnesses are used: a pair of connected contexts for symmetric
//! scenarios, and a context wired to a raw stream end the test drives
//! byte-by-byte for wire-level scenarios (fragmentation, reply ordering,
//! late replies, reply silence).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use wirecall::{
    codes, Context, ContextBuilder, Error, Fault, FrameBuffer, Packet, PacketEvent, PacketSource,
    Value,
};

/// Connect two contexts back to back and start both read loops.
fn pair(a: ContextBuilder, b: ContextBuilder) -> (Context, Context) {
    let (stream_a, stream_b) = tokio::io::duplex(4096);
    let (read_a, write_a) = tokio::io::split(stream_a);
    let (read_b, write_b) = tokio::io::split(stream_b);

    let ctx_a = a.build(read_a, write_a);
    let ctx_b = b.build(read_b, write_b);

    for ctx in [ctx_a.clone(), ctx_b.clone()] {
        tokio::spawn(async move {
            let _ = ctx.listen().await;
        });
    }

    (ctx_a, ctx_b)
}

/// Connect a context to a raw stream end driven directly by the test.
fn raw_pair(builder: ContextBuilder) -> (Context, DuplexStream) {
    let (stream_a, stream_b) = tokio::io::duplex(4096);
    let (read_a, write_a) = tokio::io::split(stream_a);

    let ctx = builder.build(read_a, write_a);
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let _ = ctx.listen().await;
        });
    }

    (ctx, stream_b)
}

/// Read from the raw end until `want` packets have been reassembled.
async fn read_packets(
    stream: &mut DuplexStream,
    frames: &mut FrameBuffer,
    want: usize,
) -> Vec<Packet> {
    let mut packets = Vec::new();
    let mut buf = [0u8; 4096];
    while packets.len() < want {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "stream closed before {want} packets arrived");
        packets.extend(frames.push(&buf[..n]).unwrap());
    }
    packets
}

async fn write_packet(stream: &mut DuplexStream, packet: &Packet) {
    stream.write_all(&packet.encode().unwrap()).await.unwrap();
}

#[tokio::test]
async fn test_round_trip_sum() {
    let (ctx_a, _ctx_b) = pair(
        ContextBuilder::new(),
        ContextBuilder::new().handle_typed("sum", |(a, b): (i64, i64), _ctx| async move {
            Ok::<_, Fault>(a + b)
        }),
    );

    let result = ctx_a
        .call("sum", vec![Value::from(2), Value::from(3)])
        .await
        .unwrap();
    assert_eq!(result, Value::from(5));
}

#[tokio::test]
async fn test_unknown_handler_carries_name() {
    let (ctx_a, _ctx_b) = pair(ContextBuilder::new(), ContextBuilder::new());

    let err = ctx_a.call("ghost", vec![]).await.unwrap_err();
    match err {
        Error::Remote(fault) => {
            assert_eq!(fault.code, codes::UNKNOWN_HANDLER);
            assert!(fault.args.contains(&Value::from("ghost")));
        }
        other => panic!("expected remote fault, got {other:?}"),
    }
}

#[tokio::test]
async fn test_symmetric_calls_both_directions() {
    let (ctx_a, ctx_b) = pair(
        ContextBuilder::new()
            .handle_typed("upper", |(s,): (String,), _ctx| async move {
                Ok::<_, Fault>(s.to_uppercase())
            }),
        ContextBuilder::new()
            .handle_typed("lower", |(s,): (String,), _ctx| async move {
                Ok::<_, Fault>(s.to_lowercase())
            }),
    );

    // a calls b, and b calls a, over the same stream.
    let from_a = ctx_a.call("lower", vec![Value::from("LOUD")]).await.unwrap();
    let from_b = ctx_b.call("upper", vec![Value::from("quiet")]).await.unwrap();
    assert_eq!(from_a, Value::from("loud"));
    assert_eq!(from_b, Value::from("QUIET"));
}

#[tokio::test]
async fn test_handler_fault_forwarded_verbatim() {
    let (ctx_a, _ctx_b) = pair(
        ContextBuilder::new(),
        ContextBuilder::new().handle("reject", |_args, _ctx| async {
            Err(Fault::new("QUOTA_EXCEEDED", "limit reached")
                .with_args(vec![Value::from(100), Value::from("daily")]))
        }),
    );

    let err = ctx_a.call("reject", vec![]).await.unwrap_err();
    match err {
        Error::Remote(fault) => {
            assert_eq!(fault.code, "QUOTA_EXCEEDED");
            assert_eq!(fault.message, "limit reached");
            assert_eq!(fault.args, vec![Value::from(100), Value::from("daily")]);
        }
        other => panic!("expected remote fault, got {other:?}"),
    }
}

#[tokio::test]
async fn test_handler_panic_surfaces_as_server_error() {
    let (ctx_a, _ctx_b) = pair(
        ContextBuilder::new(),
        ContextBuilder::new().handle("explode", |_args, _ctx| async { panic!("internal bug") }),
    );

    let err = ctx_a.call("explode", vec![]).await.unwrap_err();
    match err {
        Error::Remote(fault) => {
            assert_eq!(fault.code, codes::SERVER_ERROR);
            // Internals are stripped before transmission.
            assert_eq!(fault.message, "Server error");
            assert!(fault.args.is_empty());
        }
        other => panic!("expected remote fault, got {other:?}"),
    }
}

#[tokio::test]
async fn test_out_of_order_replies_resolve_by_id() {
    let (ctx, mut peer) = raw_pair(ContextBuilder::new());

    let first = {
        let ctx = ctx.clone();
        tokio::spawn(async move { ctx.call("job", vec![Value::from(1)]).await })
    };
    let second = {
        let ctx = ctx.clone();
        tokio::spawn(async move { ctx.call("job", vec![Value::from(2)]).await })
    };

    let mut frames = FrameBuffer::new();
    let requests = read_packets(&mut peer, &mut frames, 2).await;

    // Reply in reverse arrival order; result = arg * 10.
    for request in requests.iter().rev() {
        let Packet::Request { id, args, .. } = request else {
            panic!("expected request, got {request:?}");
        };
        let n = args[0].as_i64().unwrap();
        write_packet(&mut peer, &Packet::reply(id.unwrap(), Value::from(n * 10), None)).await;
    }

    assert_eq!(first.await.unwrap().unwrap(), Value::from(10));
    assert_eq!(second.await.unwrap().unwrap(), Value::from(20));
}

#[tokio::test]
async fn test_fire_and_forget_never_replies() {
    let done = Arc::new(tokio::sync::Notify::new());
    let signal = done.clone();

    let (_ctx, mut peer) = raw_pair(ContextBuilder::new().handle("boom", move |_args, _ctx| {
        let signal = signal.clone();
        async move {
            signal.notify_one();
            Err(Fault::new("BOOM", "handler failed"))
        }
    }));

    // A notification whose handler fails...
    write_packet(&mut peer, &Packet::request(None, "boom", vec![])).await;
    done.notified().await;

    // ...produces no traffic back: the next packet on the wire is the
    // reply to a normal call sent afterwards, not anything for "boom".
    write_packet(&mut peer, &Packet::request(Some(77), "boom", vec![])).await;
    let mut frames = FrameBuffer::new();
    let packets = read_packets(&mut peer, &mut frames, 1).await;
    match &packets[0] {
        Packet::Reply { id, error, .. } => {
            assert_eq!(*id, 77);
            assert_eq!(error.as_ref().unwrap().code, "BOOM");
        }
        other => panic!("expected reply to call 77, got {other:?}"),
    }
}

#[tokio::test]
async fn test_fragmented_request_and_reply() {
    let (_ctx, mut peer) = raw_pair(ContextBuilder::new().handle_typed(
        "echo",
        |(s,): (String,), _ctx| async move { Ok::<_, Fault>(s) },
    ));

    // Deliver one request in three fragments.
    let bytes = Packet::request(Some(5), "echo", vec![Value::from("fragmented")])
        .encode()
        .unwrap();
    for chunk in bytes.chunks(4) {
        peer.write_all(chunk).await.unwrap();
        peer.flush().await.unwrap();
        tokio::task::yield_now().await;
    }

    let mut frames = FrameBuffer::new();
    let packets = read_packets(&mut peer, &mut frames, 1).await;
    assert_eq!(
        packets[0],
        Packet::reply(5, Value::from("fragmented"), None)
    );
}

#[tokio::test]
async fn test_close_flush_rejects_pending_calls() {
    let closed = Arc::new(AtomicUsize::new(0));
    let counter = closed.clone();
    let (ctx, mut peer) = raw_pair(ContextBuilder::new().on_closed(move |_ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let pending = {
        let ctx = ctx.clone();
        tokio::spawn(async move { ctx.call("never", vec![]).await })
    };

    // Swallow the request, reply with nothing, close the stream.
    let mut frames = FrameBuffer::new();
    read_packets(&mut peer, &mut frames, 1).await;
    drop(peer);

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));

    // Wait for the read loop to finish its close path.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert!(ctx.is_closed());
    assert_eq!(ctx.pending_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_call_timeout_boundary_and_late_reply() {
    let (ctx, mut peer) = raw_pair(ContextBuilder::new());

    let started = tokio::time::Instant::now();
    let err = ctx
        .call_with_timeout(Duration::from_millis(50), "slow", vec![Value::from("x")])
        .await
        .unwrap_err();

    match &err {
        Error::CallTimeout { name, args } => {
            assert_eq!(name, "slow");
            assert_eq!(args[0], Value::from("x"));
        }
        other => panic!("expected call timeout, got {other:?}"),
    }
    assert_eq!(started.elapsed(), Duration::from_millis(50));

    // The table entry is gone, not leaked.
    assert_eq!(ctx.pending_calls(), 0);

    // The remote side was not cancelled; read its request and send the
    // reply late. It must be a no-op.
    let mut frames = FrameBuffer::new();
    let requests = read_packets(&mut peer, &mut frames, 1).await;
    let Packet::Request { id, .. } = &requests[0] else {
        panic!("expected request");
    };
    write_packet(&mut peer, &Packet::reply(id.unwrap(), Value::from("late"), None)).await;

    // The connection still works for a fresh call afterwards.
    let fresh = {
        let ctx = ctx.clone();
        tokio::spawn(async move { ctx.call("again", vec![]).await })
    };
    let requests = read_packets(&mut peer, &mut frames, 1).await;
    let Packet::Request { id, .. } = &requests[0] else {
        panic!("expected request");
    };
    write_packet(&mut peer, &Packet::reply(id.unwrap(), Value::from("ok"), None)).await;
    assert_eq!(fresh.await.unwrap().unwrap(), Value::from("ok"));
}

#[tokio::test]
async fn test_untimed_call_waits_through_slow_replies() {
    let (ctx_a, _ctx_b) = pair(
        ContextBuilder::new(),
        ContextBuilder::new().handle("slow", |_args, _ctx| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Value::from("worth the wait"))
        }),
    );

    let result = ctx_a.call("slow", vec![]).await.unwrap();
    assert_eq!(result, Value::from("worth the wait"));
}

#[tokio::test]
async fn test_notification_invokes_handler() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let (ctx_a, _ctx_b) = pair(
        ContextBuilder::new(),
        ContextBuilder::new().handle("log", move |args, _ctx| {
            let tx = tx.clone();
            async move {
                tx.send(args).unwrap();
                Ok(Value::Nil)
            }
        }),
    );

    ctx_a.send("log", vec![Value::from("line 1")]).await.unwrap();
    ctx_a.send("log", vec![Value::from("line 2")]).await.unwrap();

    assert_eq!(rx.recv().await.unwrap(), vec![Value::from("line 1")]);
    assert_eq!(rx.recv().await.unwrap(), vec![Value::from("line 2")]);
    assert_eq!(ctx_a.pending_calls(), 0);
}

#[tokio::test]
async fn test_dynamic_registration_on_live_connection() {
    let (ctx_a, ctx_b) = pair(ContextBuilder::new(), ContextBuilder::new());

    let err = ctx_a.call("late", vec![]).await.unwrap_err();
    assert!(matches!(err, Error::Remote(fault) if fault.code == codes::UNKNOWN_HANDLER));

    ctx_b.on("late", |_args, _ctx| async { Ok(Value::from("now registered")) });

    let result = ctx_a.call("late", vec![]).await.unwrap();
    assert_eq!(result, Value::from("now registered"));
}

#[tokio::test]
async fn test_handler_can_call_back_into_peer() {
    let (ctx_a, _ctx_b) = pair(
        ContextBuilder::new().handle_typed("sum", |(a, b): (i64, i64), _ctx| async move {
            Ok::<_, Fault>(a + b)
        }),
        // "relay" runs on b and calls "sum" back on a while a's call to
        // "relay" is still in flight.
        ContextBuilder::new().handle("relay", |args, ctx| async move {
            ctx.call("sum", args).await.map_err(|_| Fault::server_error())
        }),
    );

    let result = ctx_a
        .call("relay", vec![Value::from(4), Value::from(6)])
        .await
        .unwrap();
    assert_eq!(result, Value::from(10));
}

#[tokio::test]
async fn test_many_concurrent_calls_correlate() {
    let (ctx_a, _ctx_b) = pair(
        ContextBuilder::new(),
        ContextBuilder::new().handle_typed("echo", |(n,): (i64,), _ctx| async move {
            // Vary completion order.
            tokio::time::sleep(Duration::from_millis((n % 5) as u64)).await;
            Ok::<_, Fault>(n)
        }),
    );

    let mut calls = Vec::new();
    for n in 0..32i64 {
        let ctx = ctx_a.clone();
        calls.push(tokio::spawn(async move {
            ctx.call("echo", vec![Value::from(n)]).await
        }));
    }

    for (n, call) in calls.into_iter().enumerate() {
        assert_eq!(call.await.unwrap().unwrap(), Value::from(n as i64));
    }
    assert_eq!(ctx_a.pending_calls(), 0);
}

#[tokio::test]
async fn test_packet_events_on_both_paths() {
    let events_a: Arc<Mutex<Vec<PacketEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let events_b: Arc<Mutex<Vec<PacketEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let opened = Arc::new(AtomicUsize::new(0));

    let sink_a = events_a.clone();
    let sink_b = events_b.clone();
    let opened_counter = opened.clone();

    let (ctx_a, _ctx_b) = pair(
        ContextBuilder::new()
            .on_opened(move |_ctx| {
                opened_counter.fetch_add(1, Ordering::SeqCst);
            })
            .on_packet(move |event| sink_a.lock().unwrap().push(event.clone())),
        ContextBuilder::new()
            .handle_typed("sum", |(a, b): (i64, i64), _ctx| async move {
                Ok::<_, Fault>(a + b)
            })
            .on_packet(move |event| sink_b.lock().unwrap().push(event.clone())),
    );

    let result = ctx_a
        .call("sum", vec![Value::from(2), Value::from(3)])
        .await
        .unwrap();
    assert_eq!(result, Value::from(5));

    // The process-side event is emitted from the handler task; give it a
    // moment to land.
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(opened.load(Ordering::SeqCst), 1);

    let events_a = events_a.lock().unwrap();
    let call_event = events_a
        .iter()
        .find(|e| e.source == PacketSource::Call)
        .expect("call event on the calling side");
    assert!(matches!(&call_event.packet, Packet::Request { name, .. } if name == "sum"));
    assert_eq!(call_event.result, Some(Value::from(5)));
    assert!(call_event.error.is_none());
    assert!(call_event.time_end >= call_event.time_start);

    let events_b = events_b.lock().unwrap();
    let process_event = events_b
        .iter()
        .find(|e| e.source == PacketSource::Process)
        .expect("process event on the handling side");
    assert!(matches!(&process_event.packet, Packet::Request { name, .. } if name == "sum"));
    assert_eq!(process_event.result, Some(Value::from(5)));
    assert!(process_event.time_end >= process_event.time_start);
}

#[tokio::test]
async fn test_failed_call_event_carries_fault() {
    let events: Arc<Mutex<Vec<PacketEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();

    let (ctx_a, _ctx_b) = pair(
        ContextBuilder::new().on_packet(move |event| sink.lock().unwrap().push(event.clone())),
        ContextBuilder::new(),
    );

    let _ = ctx_a.call("ghost", vec![]).await.unwrap_err();

    let events = events.lock().unwrap();
    let call_event = events
        .iter()
        .find(|e| e.source == PacketSource::Call)
        .expect("call event");
    assert!(call_event.result.is_none());
    assert_eq!(
        call_event.error.as_ref().unwrap().code,
        codes::UNKNOWN_HANDLER
    );
}

#[tokio::test]
async fn test_panicking_observer_does_not_break_dispatch() {
    let (ctx_a, _ctx_b) = pair(
        ContextBuilder::new().on_packet(|_event| panic!("bad observer")),
        ContextBuilder::new().handle("ping", |_args, _ctx| async { Ok(Value::from("pong")) }),
    );

    // The observer panics on every settled call; the call still works.
    let result = ctx_a.call("ping", vec![]).await.unwrap();
    assert_eq!(result, Value::from("pong"));
    let result = ctx_a.call("ping", vec![]).await.unwrap();
    assert_eq!(result, Value::from("pong"));
}
