//! End-to-end instrumentation behavior against a mock transport.
//!
//! The mock transport stores completion callbacks and streams so tests can
//! fire completions on simulated later turns, under unrelated ambient
//! contexts, in whatever order a real event loop might produce.

use calltrace::trace::{InMemorySpanExporter, SpanData, Tracer};
use calltrace::{Context, Span};
use calltrace_grpc::transport::{
    CallKind, CallStream, Channel, ClientStreamingCall, EventKind, Handler, HandlerFunc, Metadata,
    Payload, Responder, ServerStreamingCall, ServiceRegistration, Status, StreamEvent, UnaryCall,
    UnaryCallback,
};
use calltrace_grpc::{patch, unpatch, wrap_registration, Config, TracedChannel, TransportHooks};
use serde_json::json;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Default)]
struct MockChannel {
    unary_log: RefCell<Vec<(String, Payload, Option<Metadata>)>>,
    callbacks: RefCell<Vec<UnaryCallback>>,
    streams: RefCell<Vec<Rc<CallStream>>>,
}

impl MockChannel {
    /// Fires the oldest stored completion callback, as a later event-loop
    /// turn would.
    fn complete_next(&self, outcome: Result<Payload, Status>) {
        self.complete_at(0, outcome);
    }

    /// Fires the stored callback at `index`, out of arrival order.
    fn complete_at(&self, index: usize, outcome: Result<Payload, Status>) {
        let callback = self.callbacks.borrow_mut().remove(index);
        callback(outcome);
    }

    fn last_stream(&self) -> Rc<CallStream> {
        self.streams.borrow().last().unwrap().clone()
    }
}

impl Channel for MockChannel {
    fn unary(
        &self,
        method: &str,
        request: Payload,
        metadata: Option<Metadata>,
        callback: UnaryCallback,
    ) {
        self.unary_log
            .borrow_mut()
            .push((method.to_string(), request, metadata));
        self.callbacks.borrow_mut().push(callback);
    }

    fn server_streaming(
        &self,
        _method: &str,
        _request: Payload,
        _metadata: Option<Metadata>,
    ) -> Rc<CallStream> {
        let stream = CallStream::new();
        self.streams.borrow_mut().push(stream.clone());
        stream
    }

    fn client_streaming(
        &self,
        _method: &str,
        _metadata: Option<Metadata>,
        callback: UnaryCallback,
    ) -> Rc<CallStream> {
        self.callbacks.borrow_mut().push(callback);
        let stream = CallStream::new();
        self.streams.borrow_mut().push(stream.clone());
        stream
    }

    fn bidi_streaming(&self, _method: &str, _metadata: Option<Metadata>) -> Rc<CallStream> {
        let stream = CallStream::new();
        self.streams.borrow_mut().push(stream.clone());
        stream
    }
}

fn harness() -> (InMemorySpanExporter, Tracer) {
    let exporter = InMemorySpanExporter::new();
    let tracer = Tracer::new(exporter.clone());
    (exporter, tracer)
}

fn span_named<'a>(spans: &'a [SpanData], name: &str) -> &'a SpanData {
    spans
        .iter()
        .find(|span| span.name == name)
        .unwrap_or_else(|| panic!("no span named {name:?}"))
}

fn echo_registration(kind: CallKind, func: HandlerFunc) -> ServiceRegistration {
    ServiceRegistration {
        name: "Echo".to_string(),
        kind,
        handler: Handler { func },
        serialize: Rc::new(|payload| serde_json::to_vec(payload).unwrap()),
        deserialize: Rc::new(|bytes| {
            serde_json::from_slice(bytes).map_err(|err| Status::new(13, err.to_string()))
        }),
    }
}

#[test]
fn passthrough_without_ambient_context() {
    let (exporter, tracer) = harness();
    let mock = Rc::new(MockChannel::default());
    let traced = TracedChannel::new(
        mock.clone(),
        tracer,
        Config::default().with_enhanced_reporting(true),
    );

    let mut md = Metadata::new();
    md.insert("x-request-id", "42");

    let got = Rc::new(RefCell::new(None));
    let sink = got.clone();
    traced.unary(
        "/svc/Echo",
        json!({"msg": "hi"}),
        Some(md.clone()),
        Box::new(move |outcome| {
            *sink.borrow_mut() = Some(outcome);
        }),
    );

    // Arguments reached the underlying channel byte-for-byte.
    {
        let log = mock.unary_log.borrow();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, "/svc/Echo");
        assert_eq!(log[0].1, json!({"msg": "hi"}));
        assert_eq!(log[0].2, Some(md));
    }

    mock.complete_next(Ok(json!({"msg": "hi"})));
    assert_eq!(*got.borrow(), Some(Ok(json!({"msg": "hi"}))));

    // Errors are forwarded unchanged too.
    traced.unary(
        "/svc/Echo",
        json!({}),
        None,
        Box::new(|outcome| {
            assert_eq!(outcome, Err(Status::new(14, "unavailable")));
        }),
    );
    mock.complete_next(Err(Status::new(14, "unavailable")));

    // Streaming shapes hand back the transport's own stream objects.
    let stream = traced.server_streaming("/svc/Watch", json!({}), None);
    assert!(Rc::ptr_eq(&stream, &mock.last_stream()));
    stream.emit(StreamEvent::Status(Status::ok()));

    let upload_done = Rc::new(RefCell::new(false));
    let upload_sink = upload_done.clone();
    let stream = traced.client_streaming(
        "/svc/Upload",
        None,
        Box::new(move |outcome| {
            assert_eq!(outcome, Ok(json!({"received": 0})));
            *upload_sink.borrow_mut() = true;
        }),
    );
    assert!(Rc::ptr_eq(&stream, &mock.last_stream()));
    mock.complete_next(Ok(json!({"received": 0})));
    assert!(*upload_done.borrow());

    let stream = traced.bidi_streaming("/svc/Chat", None);
    assert!(Rc::ptr_eq(&stream, &mock.last_stream()));
    stream.emit(StreamEvent::Error(Status::new(1, "cancelled")));
    stream.emit(StreamEvent::Status(Status::new(1, "cancelled")));

    assert!(exporter.get_finished_spans().is_empty());
}

#[test]
fn passthrough_when_ambient_root_is_null_span() {
    let (exporter, tracer) = harness();
    let mock = Rc::new(MockChannel::default());
    let traced = TracedChannel::new(mock.clone(), tracer, Config::default());

    let _guard = Context::current().with_span(Span::noop()).attach();
    traced.unary("/svc/Echo", json!({}), None, Box::new(|_| {}));
    mock.complete_next(Ok(json!({})));

    assert!(exporter.get_finished_spans().is_empty());
}

#[test]
fn unary_child_span_closes_before_user_callback() {
    let (exporter, tracer) = harness();
    let mock = Rc::new(MockChannel::default());
    let traced = TracedChannel::new(mock.clone(), tracer.clone(), Config::default());

    let root = tracer.start("rpc:Parent");
    let root_id = root.span_id();

    {
        let _guard = Context::current().with_span(root.clone()).attach();
        let inner_exporter = exporter.clone();
        traced.unary(
            "/svc/Echo",
            json!({"msg": "hi"}),
            None,
            Box::new(move |outcome| {
                assert!(outcome.is_ok());
                // The call's span is already closed and exported when the
                // user callback observes completion.
                let spans = inner_exporter.get_finished_spans();
                let child = span_named(&spans, "rpc:/svc/Echo");
                assert!(child.end_time.is_some());
            }),
        );
    }

    // Completion fires on a later turn, under an unrelated ambient context.
    let _foreign = Context::new().attach();
    mock.complete_next(Ok(json!({"msg": "hi"})));

    let spans = exporter.get_finished_spans();
    let child = span_named(&spans, "rpc:/svc/Echo");
    assert_eq!(child.parent_span_id, Some(root_id));
}

#[test]
fn streaming_terminal_events_close_exactly_once_in_either_order() {
    let (exporter, tracer) = harness();
    let mock = Rc::new(MockChannel::default());
    let traced = TracedChannel::new(
        mock.clone(),
        tracer.clone(),
        Config::default().with_enhanced_reporting(true),
    );

    for error_first in [true, false] {
        exporter.reset();
        let root = tracer.start("rpc:Parent");
        let _guard = Context::current().with_span(root).attach();

        let stream = traced.server_streaming("/svc/Watch", json!({}), None);
        if error_first {
            stream.emit(StreamEvent::Error(Status::new(14, "unavailable")));
            stream.emit(StreamEvent::Status(Status::new(14, "unavailable")));
        } else {
            stream.emit(StreamEvent::Status(Status::ok()));
            stream.emit(StreamEvent::Error(Status::new(1, "cancelled")));
        }

        let spans = exporter.get_finished_spans();
        let watches: Vec<_> = spans.iter().filter(|s| s.name == "rpc:/svc/Watch").collect();
        assert_eq!(watches.len(), 1, "second terminal event must not re-close");
        if error_first {
            assert_eq!(
                watches[0].labels.get("error").map(String::as_str),
                Some("14: unavailable")
            );
            assert!(!watches[0].labels.contains_key("status"));
        } else {
            assert_eq!(watches[0].labels.get("status").map(String::as_str), Some("0"));
            assert!(!watches[0].labels.contains_key("error"));
        }
    }
}

#[test]
fn no_payload_labels_without_enhanced_reporting() {
    let (exporter, tracer) = harness();
    let mock = Rc::new(MockChannel::default());
    let traced = TracedChannel::new(mock.clone(), tracer.clone(), Config::default());

    let root = tracer.start("rpc:Parent");
    {
        let _guard = Context::current().with_span(root).attach();
        let mut md = Metadata::new();
        md.insert("authorization", "secret");
        traced.unary(
            "/svc/Echo",
            json!({"msg": "private"}),
            Some(md),
            Box::new(|_| {}),
        );
    }
    mock.complete_next(Ok(json!({"msg": "private"})));

    let spans = exporter.get_finished_spans();
    let child = span_named(&spans, "rpc:/svc/Echo");
    assert!(child.labels.is_empty(), "labels: {:?}", child.labels);
}

#[test]
fn client_streaming_span_closes_at_callback_not_stream_end() {
    let (exporter, tracer) = harness();
    let mock = Rc::new(MockChannel::default());
    let traced = TracedChannel::new(mock.clone(), tracer.clone(), Config::default());

    let root = tracer.start("rpc:Parent");
    let stream = {
        let _guard = Context::current().with_span(root).attach();
        traced.client_streaming("/svc/Upload", None, Box::new(|_| {}))
    };

    // Listeners attached to the request stream observe the call's context.
    let saw_context = Rc::new(RefCell::new(false));
    let seen = saw_context.clone();
    stream.on(EventKind::Data, move |_| {
        *seen.borrow_mut() = Context::current().span().is_some();
    });

    // The single response arrives while the request stream is still open.
    mock.complete_next(Ok(json!({"received": 2})));
    let spans = exporter.get_finished_spans();
    assert_eq!(span_named(&spans, "rpc:/svc/Upload").name, "rpc:/svc/Upload");

    // The request stream keeps emitting afterwards; nothing re-opens or
    // re-closes the span.
    stream.emit(StreamEvent::Data(json!({"chunk": 3})));
    stream.emit(StreamEvent::Finish);
    assert!(*saw_context.borrow());
    assert_eq!(
        exporter
            .get_finished_spans()
            .iter()
            .filter(|s| s.name == "rpc:/svc/Upload")
            .count(),
        1
    );
}

#[test]
fn unary_server_end_to_end_echo() {
    let (exporter, tracer) = harness();
    let config = Config::default().with_enhanced_reporting(true);

    let registration = echo_registration(
        CallKind::Unary,
        HandlerFunc::Unary(Box::new(|call: UnaryCall, respond: Responder| {
            assert!(
                Context::current().span().is_some(),
                "handler must run inside the call's context"
            );
            (call.send_metadata)({
                let mut md = Metadata::new();
                md.insert("server", "mock");
                md
            });
            respond(Ok(call.request.clone()), None);
        })),
    );
    let registration = wrap_registration(registration, tracer, config);

    let completed = Rc::new(RefCell::new(false));
    let HandlerFunc::Unary(func) = &registration.handler.func else {
        panic!("unary registration changed shape");
    };

    let final_exporter = exporter.clone();
    let final_completed = completed.clone();
    func(
        UnaryCall {
            request: json!({"msg": "hi"}),
            metadata: Metadata::new(),
            send_metadata: Rc::new(|_| {}),
        },
        Box::new(move |outcome, _trailer| {
            assert_eq!(outcome, Ok(json!({"msg": "hi"})));
            // Closed before the real callback regains control.
            let spans = final_exporter.get_finished_spans();
            assert!(span_named(&spans, "rpc:Echo").end_time.is_some());
            *final_completed.borrow_mut() = true;
        }),
    );

    assert!(*completed.borrow());
    let spans = exporter.get_finished_spans();
    assert_eq!(spans.len(), 1);
    let span = span_named(&spans, "rpc:Echo");
    assert_eq!(span.parent_span_id, None);
    assert_eq!(
        span.labels.get("argument").map(String::as_str),
        Some(r#"{"msg":"hi"}"#)
    );
    assert_eq!(
        span.labels.get("result").map(String::as_str),
        Some(r#"{"msg":"hi"}"#)
    );
    assert_eq!(
        span.labels.get("response_metadata").map(String::as_str),
        Some(r#"{"server":"mock"}"#)
    );
}

#[test]
fn server_streaming_closes_on_failing_finish_status() {
    let (exporter, tracer) = harness();
    let config = Config::default().with_enhanced_reporting(true);

    let registration = echo_registration(
        CallKind::ServerStreaming,
        HandlerFunc::ServerStreaming(Box::new(|call: ServerStreamingCall| {
            assert!(Context::current().span().is_some());
            call.stream.emit(StreamEvent::Data(json!({"n": 1})));
        })),
    );
    let registration = wrap_registration(registration, tracer, config);

    let HandlerFunc::ServerStreaming(func) = &registration.handler.func else {
        panic!("server-streaming registration changed shape");
    };

    let stream = CallStream::new();
    func(ServerStreamingCall {
        request: json!({}),
        metadata: Metadata::new(),
        stream: stream.clone(),
    });

    // The transport finishes with a failing status and no error event. The
    // span still closes, keeping the failure code as a label.
    stream.set_status(Status::new(13, "internal"));
    stream.emit(StreamEvent::Finish);
    stream.emit(StreamEvent::Finish);

    let spans = exporter.get_finished_spans();
    assert_eq!(spans.len(), 1);
    let span = span_named(&spans, "rpc:Echo");
    assert!(span.end_time.is_some());
    assert_eq!(span.labels.get("status").map(String::as_str), Some("13"));
}

#[test]
fn client_streaming_server_span_tracks_responder_not_request_stream() {
    let (exporter, tracer) = harness();

    let responders: Rc<RefCell<Vec<Responder>>> = Rc::new(RefCell::new(Vec::new()));
    let handler_responders = responders.clone();
    let registration = echo_registration(
        CallKind::ClientStreaming,
        HandlerFunc::ClientStreaming(Box::new(move |call: ClientStreamingCall, respond| {
            // Count messages in the call's context; respond later.
            let count = Rc::new(RefCell::new(0));
            let counter = count.clone();
            call.stream.on(EventKind::Data, move |_| {
                assert!(Context::current().span().is_some());
                *counter.borrow_mut() += 1;
            });
            handler_responders.borrow_mut().push(respond);
        })),
    );
    let registration = wrap_registration(registration, tracer, Config::default());

    let HandlerFunc::ClientStreaming(func) = &registration.handler.func else {
        panic!("client-streaming registration changed shape");
    };

    let stream = CallStream::new();
    func(
        ClientStreamingCall {
            metadata: Metadata::new(),
            stream: stream.clone(),
        },
        Box::new(|_, _| {}),
    );

    stream.emit(StreamEvent::Data(json!({"chunk": 1})));
    assert!(exporter.get_finished_spans().is_empty());

    // The response fires on a later turn; the request stream stays open.
    let respond = responders.borrow_mut().pop().unwrap();
    respond(Ok(json!({"received": 1})), None);
    assert_eq!(exporter.get_finished_spans().len(), 1);

    // The client keeps sending; the span stays closed exactly once.
    stream.emit(StreamEvent::Data(json!({"chunk": 2})));
    stream.emit(StreamEvent::Finish);
    assert_eq!(exporter.get_finished_spans().len(), 1);
}

#[test]
fn concurrent_calls_keep_their_own_parents() {
    let (exporter, tracer) = harness();
    let config = Config::default().with_enhanced_reporting(true);
    let mock = Rc::new(MockChannel::default());
    let traced = Rc::new(TracedChannel::new(mock.clone(), tracer.clone(), config));

    // Each inbound call issues a nested outbound call carrying its own id.
    let responders: Rc<RefCell<Vec<Responder>>> = Rc::new(RefCell::new(Vec::new()));
    let handler_responders = responders.clone();
    let handler_channel = traced.clone();
    let registration = echo_registration(
        CallKind::Unary,
        HandlerFunc::Unary(Box::new(move |call: UnaryCall, respond| {
            handler_channel.unary(
                "/svc/Nested",
                call.request.clone(),
                None,
                Box::new(|_| {}),
            );
            handler_responders.borrow_mut().push(respond);
        })),
    );
    let registration = wrap_registration(registration, tracer, config);
    let HandlerFunc::Unary(func) = &registration.handler.func else {
        panic!("unary registration changed shape");
    };

    let invoke = |id: &str| {
        func(
            UnaryCall {
                request: json!({ "id": id }),
                metadata: Metadata::new(),
                send_metadata: Rc::new(|_| {}),
            },
            Box::new(|_, _| {}),
        );
    };

    // Interleave: A starts, B starts, then B's continuations fire first.
    invoke("A");
    invoke("B");
    mock.complete_at(1, Ok(json!(null)));
    mock.complete_at(0, Ok(json!(null)));
    for respond in responders.borrow_mut().drain(..).rev() {
        respond(Ok(json!(null)), None);
    }

    let spans = exporter.get_finished_spans();
    assert_eq!(spans.len(), 4);
    for id in ["A", "B"] {
        let arg = format!(r#"{{"id":"{id}"}}"#);
        let root = spans
            .iter()
            .find(|s| s.name == "rpc:Echo" && s.labels.get("argument") == Some(&arg))
            .unwrap();
        let nested = spans
            .iter()
            .find(|s| s.name == "rpc:/svc/Nested" && s.labels.get("argument") == Some(&arg))
            .unwrap();
        assert_eq!(
            nested.parent_span_id,
            Some(root.span_id),
            "nested call of {id} must parent to {id}'s root"
        );
    }
}

#[test]
fn mismatched_call_shape_is_left_unwrapped() {
    let (exporter, tracer) = harness();

    // Declared server-streaming, but the handler services unary calls.
    let registration = echo_registration(
        CallKind::ServerStreaming,
        HandlerFunc::Unary(Box::new(|call: UnaryCall, respond: Responder| {
            respond(Ok(call.request.clone()), None);
        })),
    );
    let registration = wrap_registration(registration, tracer, Config::default());

    let HandlerFunc::Unary(func) = &registration.handler.func else {
        panic!("mismatched registration must keep its handler");
    };
    func(
        UnaryCall {
            request: json!({}),
            metadata: Metadata::new(),
            send_metadata: Rc::new(|_| {}),
        },
        Box::new(|outcome, _| assert!(outcome.is_ok())),
    );

    assert!(exporter.get_finished_spans().is_empty());
}

#[test]
fn disabled_config_leaves_registrations_unwrapped() {
    let (exporter, tracer) = harness();

    let registration = echo_registration(
        CallKind::Unary,
        HandlerFunc::Unary(Box::new(|call: UnaryCall, respond: Responder| {
            respond(Ok(call.request.clone()), None);
        })),
    );
    let registration =
        wrap_registration(registration, tracer, Config::default().with_enabled(false));

    let HandlerFunc::Unary(func) = &registration.handler.func else {
        panic!("disabled registration must keep its handler");
    };
    func(
        UnaryCall {
            request: json!({}),
            metadata: Metadata::new(),
            send_metadata: Rc::new(|_| {}),
        },
        Box::new(|_, _| {}),
    );

    assert!(exporter.get_finished_spans().is_empty());
}

#[test]
fn patch_gates_on_version_and_unpatch_leaves_live_instances() {
    let (exporter, tracer) = harness();

    for unsupported in ["1.12.4", "2.0.0", "not-a-version"] {
        let mut hooks = TransportHooks::new(unsupported);
        patch(&mut hooks, tracer.clone(), Config::default());
        assert!(!hooks.is_patched(), "{unsupported} must not be patched");
    }

    let mut hooks = TransportHooks::new("1.24.2");
    assert_eq!(hooks.version(), "1.24.2");
    patch(&mut hooks, tracer.clone(), Config::default());
    assert!(hooks.is_patched());

    let mock = Rc::new(MockChannel::default());
    let live = hooks.wrap_channel(Box::new(mock.clone()));

    let root = tracer.start("rpc:Parent");
    {
        let _guard = Context::current().with_span(root).attach();
        live.unary("/svc/Echo", json!({}), None, Box::new(|_| {}));
    }
    mock.complete_next(Ok(json!({})));
    assert_eq!(exporter.get_finished_spans().len(), 1);

    unpatch(&mut hooks);
    assert!(!hooks.is_patched());

    // Channels wrapped after unpatch pass through untouched...
    exporter.reset();
    let fresh = hooks.wrap_channel(Box::new(mock.clone()));
    let root = tracer.start("rpc:Parent2");
    {
        let _guard = Context::current().with_span(root).attach();
        fresh.unary("/svc/Echo", json!({}), None, Box::new(|_| {}));
    }
    mock.complete_next(Ok(json!({})));
    assert!(exporter.get_finished_spans().is_empty());

    // ...but the channel wrapped while patched keeps tracing.
    let root = tracer.start("rpc:Parent3");
    {
        let _guard = Context::current().with_span(root).attach();
        live.unary("/svc/Echo", json!({}), None, Box::new(|_| {}));
    }
    mock.complete_next(Ok(json!({})));
    assert_eq!(exporter.get_finished_spans().len(), 1);
}
