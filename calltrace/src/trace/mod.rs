//! Span creation, labeling, and exactly-once closure.
//!
//! A [`Span`] is a timed record of one unit of traced work: a name, a set of
//! string labels, a start timestamp, and (once closed) an end timestamp,
//! optionally parented to the span of an enclosing operation. Spans are
//! created by a [`Tracer`] and handed to a [`SpanExporter`] when closed.
//!
//! Closure is terminal: the first call to [`Span::close`] stamps the end
//! time and exports the span, and every later operation on the same span is
//! ignored. The tracer itself keeps no registry of open spans; callers that
//! may receive racing completion signals keep their own per-call closed
//! flag.
//!
//! The *null span* ([`Span::noop`]) represents a trace that was explicitly
//! suppressed. It is a valid span value for which every operation is a
//! no-op, which lets instrumentation distinguish "tracing disabled for this
//! call" from "no tracing context available at all".

mod export;
mod span;
mod tracer;

#[cfg(any(test, feature = "testing"))]
mod in_memory_exporter;

pub use export::{ExportResult, SpanExporter, TraceError};
pub use span::{Span, SpanData, SpanId};
pub use tracer::Tracer;

#[cfg(any(test, feature = "testing"))]
#[cfg_attr(docsrs, doc(cfg(feature = "testing")))]
pub use in_memory_exporter::InMemorySpanExporter;
