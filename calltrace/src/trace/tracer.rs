use crate::trace::{Span, SpanExporter};
use crate::Context;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Creates spans and hands them to a [`SpanExporter`] on close.
///
/// The tracer is stateless per call: it keeps no registry of open spans, so
/// exactly-once closure under racing completion signals is enforced by the
/// caller (a per-call closed flag), not by a global table.
///
/// Cloning is cheap; clones share the exporter.
#[derive(Clone)]
pub struct Tracer {
    exporter: Arc<dyn SpanExporter>,
}

impl Tracer {
    /// Creates a tracer exporting to `exporter`.
    pub fn new(exporter: impl SpanExporter + 'static) -> Self {
        Tracer {
            exporter: Arc::new(exporter),
        }
    }

    /// Starts a new root span with the given name.
    pub fn start(&self, name: impl Into<String>) -> Span {
        Span::start(name.into(), None, self.exporter.clone())
    }

    /// Starts a new span as a child of the root span carried by `cx`.
    ///
    /// Fails silently, returning the null span, when tracing is suppressed
    /// for this context or when the context's root span is itself the null
    /// span. A context without a root span yields a fresh root span.
    pub fn start_with_context(&self, name: impl Into<String>, cx: &Context) -> Span {
        if cx.is_suppressed() {
            debug!("tracing suppressed for this context, returning the null span");
            return Span::noop();
        }
        let parent = match cx.span() {
            // Child of the null span stays suppressed.
            Some(parent) if parent.span_id() == super::SpanId::INVALID => return Span::noop(),
            Some(parent) => Some(parent.span_id()),
            None => None,
        };
        Span::start(name.into(), parent, self.exporter.clone())
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("exporter", &self.exporter)
            .finish()
    }
}
