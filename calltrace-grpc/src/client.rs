//! Client-side call interception.
//!
//! [`TracedChannel`] decorates an outbound [`Channel`] so that every call
//! issued while a traced operation is ambient produces one child span,
//! closed at the call's completion signal: the single callback for
//! unary-response shapes, or the first terminal stream event for
//! streaming-response shapes.
//!
//! When no ambient context exists, or the ambient root span is the null
//! span, calls are delegated unmodified; the instrumentation never
//! introduces tracing where none was authorized and never changes what the
//! application observes.

use crate::call_span::CallSpan;
use crate::record;
use crate::transport::{
    CallStream, Channel, EventKind, Metadata, Payload, Status, StreamEvent, UnaryCallback,
};
use crate::Config;
use calltrace::trace::{SpanId, Tracer};
use calltrace::Context;
use std::rc::Rc;
use tracing::debug;

/// A [`Channel`] decorator producing one child span per outbound call.
#[derive(Debug)]
pub struct TracedChannel<C> {
    inner: C,
    tracer: Tracer,
    config: Config,
}

impl<C: Channel> TracedChannel<C> {
    /// Wraps `inner`, creating spans with `tracer` under `config`.
    pub fn new(inner: C, tracer: Tracer, config: Config) -> Self {
        TracedChannel {
            inner,
            tracer,
            config,
        }
    }

    /// Opens the child span for one outbound call, or `None` when the call
    /// must pass through uninstrumented.
    fn start_call_span(&self, method: &str) -> Option<Rc<CallSpan>> {
        let cx = Context::current();
        let parent = match cx.span() {
            Some(parent) => parent,
            None => {
                debug!(method, "no ambient trace context, call left untraced");
                return None;
            }
        };
        if parent.span_id() == SpanId::INVALID {
            debug!(method, "ambient root span is suppressed, call left untraced");
            return None;
        }
        let span = self.tracer.start_with_context(format!("rpc:{method}"), &cx);
        Some(CallSpan::new(span))
    }

    /// Wraps a completion callback so it records labels, closes the span,
    /// and only then delegates — bound to the ambient context at wrap time.
    fn wrap_callback(&self, span: Rc<CallSpan>, callback: UnaryCallback) -> UnaryCallback {
        let config = self.config;
        Box::new(
            Context::current().bind(move |outcome: Result<Payload, Status>| {
                match &outcome {
                    Ok(payload) => record::result(&span, &config, payload),
                    Err(status) => record::error(&span, &config, status),
                }
                span.close();
                callback(outcome)
            }),
        )
    }

    /// Attaches the terminal listeners that close a streaming call's span.
    ///
    /// Whichever of `Error` and `Status` fires first closes the span; the
    /// loser finds the call already closed.
    fn close_on_terminal_event(&self, stream: &CallStream, span: Rc<CallSpan>) {
        let config = self.config;

        let error_span = span.clone();
        stream.on(EventKind::Error, move |event| {
            if let StreamEvent::Error(status) = event {
                record::error(&error_span, &config, status);
            }
            error_span.close();
        });

        stream.on(EventKind::Status, move |event| {
            if let StreamEvent::Status(status) = event {
                record::status(&span, &config, status);
            }
            span.close();
        });
    }
}

impl<C: Channel> Channel for TracedChannel<C> {
    fn unary(
        &self,
        method: &str,
        request: Payload,
        metadata: Option<Metadata>,
        callback: UnaryCallback,
    ) {
        let span = match self.start_call_span(method) {
            Some(span) => span,
            None => return self.inner.unary(method, request, metadata, callback),
        };
        if let Some(md) = &metadata {
            record::metadata(&span, &self.config, md);
        }
        record::request(&span, &self.config, &request);

        let callback = self.wrap_callback(span, callback);
        self.inner.unary(method, request, metadata, callback)
    }

    fn server_streaming(
        &self,
        method: &str,
        request: Payload,
        metadata: Option<Metadata>,
    ) -> Rc<CallStream> {
        let span = match self.start_call_span(method) {
            Some(span) => span,
            None => return self.inner.server_streaming(method, request, metadata),
        };
        if let Some(md) = &metadata {
            record::metadata(&span, &self.config, md);
        }
        record::request(&span, &self.config, &request);

        let stream = self.inner.server_streaming(method, request, metadata);
        stream.bind(Context::current());
        self.close_on_terminal_event(&stream, span);
        stream
    }

    fn client_streaming(
        &self,
        method: &str,
        metadata: Option<Metadata>,
        callback: UnaryCallback,
    ) -> Rc<CallStream> {
        let span = match self.start_call_span(method) {
            Some(span) => span,
            None => return self.inner.client_streaming(method, metadata, callback),
        };
        if let Some(md) = &metadata {
            record::metadata(&span, &self.config, md);
        }
        // No request label: the request side is a stream.

        // The span measures time to the response callback, not to the end
        // of the request stream; the stream is bound only so that handlers
        // attached to it observe this call's context.
        let callback = self.wrap_callback(span, callback);
        let stream = self.inner.client_streaming(method, metadata, callback);
        stream.bind(Context::current());
        stream
    }

    fn bidi_streaming(&self, method: &str, metadata: Option<Metadata>) -> Rc<CallStream> {
        let span = match self.start_call_span(method) {
            Some(span) => span,
            None => return self.inner.bidi_streaming(method, metadata),
        };
        if let Some(md) = &metadata {
            record::metadata(&span, &self.config, md);
        }

        let stream = self.inner.bidi_streaming(method, metadata);
        stream.bind(Context::current());
        self.close_on_terminal_event(&stream, span);
        stream
    }
}
