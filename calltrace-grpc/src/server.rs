//! Server-side call interception.
//!
//! [`wrap_registration`] decorates an inbound handler registration so each
//! invocation opens a fresh execution context with a root span scoped to
//! that one call, runs the user handler inside it, and closes the span at
//! the completion signal of the registration's call shape:
//!
//! * **unary** and **client-streaming** — the single response callback; the
//!   span measures time until the response, not until the client finishes
//!   sending requests.
//! * **server-streaming** and **bidirectional** — the outgoing stream's
//!   first terminal event (`Finish` or `Error`).
//!
//! Registrations whose declared call shape does not match their handler are
//! left unwrapped with a warning, as is everything when instrumentation is
//! disabled; the transport's behavior is never altered by wrapping.

use crate::call_span::CallSpan;
use crate::record;
use crate::transport::{
    BidiCall, CallStream, ClientStreamingCall, EventKind, Handler, HandlerFunc, Metadata, Payload,
    Responder, ServerStreamingCall, ServiceRegistration, Status, StreamEvent, UnaryCall,
};
use crate::Config;
use calltrace::trace::Tracer;
use calltrace::Context;
use std::rc::Rc;
use tracing::{info, warn};

/// Wraps one handler registration according to its call shape.
///
/// Fail-open: when instrumentation is disabled, or the declared call shape
/// does not match the handler's entry point, the registration is returned
/// untouched.
pub fn wrap_registration(
    registration: ServiceRegistration,
    tracer: Tracer,
    config: Config,
) -> ServiceRegistration {
    if !config.enabled {
        info!(
            method = %registration.name,
            "instrumentation disabled, handler left unwrapped"
        );
        return registration;
    }
    if registration.handler.func.kind() != registration.kind {
        warn!(
            method = %registration.name,
            declared = ?registration.kind,
            handler = ?registration.handler.func.kind(),
            "unrecognized call shape, handler left unwrapped"
        );
        return registration;
    }

    let name = registration.name.clone();
    let func = match registration.handler.func {
        HandlerFunc::Unary(inner) => HandlerFunc::Unary(wrap_unary(name, inner, tracer, config)),
        HandlerFunc::ServerStreaming(inner) => {
            HandlerFunc::ServerStreaming(wrap_server_streaming(name, inner, tracer, config))
        }
        HandlerFunc::ClientStreaming(inner) => {
            HandlerFunc::ClientStreaming(wrap_client_streaming(name, inner, tracer, config))
        }
        HandlerFunc::Bidi(inner) => HandlerFunc::Bidi(wrap_bidi(name, inner, tracer, config)),
    };

    ServiceRegistration {
        handler: Handler { func },
        ..registration
    }
}

/// Opens the root span and fresh context for one inbound call.
fn open_call(name: &str, tracer: &Tracer) -> (Rc<CallSpan>, Context) {
    let root = tracer.start(format!("rpc:{name}"));
    let span = CallSpan::new(root.clone());
    let cx = Context::new().with_span(root);
    (span, cx)
}

/// Wraps a responder so it records labels, closes the span, and only then
/// delegates, running under the call's context.
fn wrap_responder(span: Rc<CallSpan>, config: Config, cx: &Context, responder: Responder) -> Responder {
    let cx = cx.clone();
    Box::new(
        move |outcome: Result<Payload, Status>, trailer: Option<Metadata>| {
            let _guard = cx.attach();
            match &outcome {
                Ok(payload) => record::result(&span, &config, payload),
                Err(status) => record::error(&span, &config, status),
            }
            if let Some(md) = &trailer {
                record::trailer(&span, &config, md);
            }
            span.close();
            responder(outcome, trailer)
        },
    )
}

/// Closes the span at the outgoing stream's first terminal event.
///
/// A `Finish` with a failing terminal status and no error event still closes
/// the span — the non-zero code is recorded as the status label instead of
/// leaving the span open forever.
fn close_on_finish_or_error(stream: &Rc<CallStream>, span: Rc<CallSpan>, config: Config) {
    let finish_span = span.clone();
    let weak = Rc::downgrade(stream);
    stream.on(EventKind::Finish, move |_| {
        if let Some(stream) = weak.upgrade() {
            let status = stream.status();
            if !status.is_ok() {
                record::status(&finish_span, &config, &status);
            }
        }
        finish_span.close();
    });

    stream.on(EventKind::Error, move |event| {
        if let StreamEvent::Error(status) = event {
            record::error(&span, &config, status);
        }
        span.close();
    });
}

fn wrap_unary(
    name: String,
    inner: Box<dyn Fn(UnaryCall, Responder)>,
    tracer: Tracer,
    config: Config,
) -> Box<dyn Fn(UnaryCall, Responder)> {
    Box::new(move |mut call, responder| {
        let (span, cx) = open_call(&name, &tracer);
        record::metadata(&span, &config, &call.metadata);
        record::request(&span, &config, &call.request);

        if config.enhanced_reporting {
            let sender = call.send_metadata.clone();
            let sender_span = span.clone();
            call.send_metadata = Rc::new(move |md: Metadata| {
                record::response_metadata(&sender_span, &config, &md);
                sender(md);
            });
        }

        let responder = wrap_responder(span, config, &cx, responder);
        cx.scope(|| inner(call, responder))
    })
}

fn wrap_server_streaming(
    name: String,
    inner: Box<dyn Fn(ServerStreamingCall)>,
    tracer: Tracer,
    config: Config,
) -> Box<dyn Fn(ServerStreamingCall)> {
    Box::new(move |call| {
        let (span, cx) = open_call(&name, &tracer);
        record::metadata(&span, &config, &call.metadata);
        record::request(&span, &config, &call.request);

        call.stream.bind(cx.clone());
        close_on_finish_or_error(&call.stream, span, config);

        cx.scope(|| inner(call))
    })
}

fn wrap_client_streaming(
    name: String,
    inner: Box<dyn Fn(ClientStreamingCall, Responder)>,
    tracer: Tracer,
    config: Config,
) -> Box<dyn Fn(ClientStreamingCall, Responder)> {
    Box::new(move |call, responder| {
        let (span, cx) = open_call(&name, &tracer);
        record::metadata(&span, &config, &call.metadata);

        // Per-message handlers on the request stream observe the call's
        // context, but the span's lifetime is tied to the response
        // callback, not to the request stream running dry.
        call.stream.bind(cx.clone());

        let responder = wrap_responder(span, config, &cx, responder);
        cx.scope(|| inner(call, responder))
    })
}

fn wrap_bidi(
    name: String,
    inner: Box<dyn Fn(BidiCall)>,
    tracer: Tracer,
    config: Config,
) -> Box<dyn Fn(BidiCall)> {
    Box::new(move |call| {
        let (span, cx) = open_call(&name, &tracer);
        record::metadata(&span, &config, &call.metadata);

        call.stream.bind(cx.clone());
        close_on_finish_or_error(&call.stream, span, config);

        cx.scope(|| inner(call))
    })
}
