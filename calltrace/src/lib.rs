//! Execution-scoped context propagation and span lifecycle management for
//! tracing remote procedure calls.
//!
//! `calltrace` provides the two building blocks an RPC instrumentation layer
//! needs in order to produce correct distributed-tracing spans without help
//! from application code:
//!
//! * [`Context`] — an execution-scoped, immutable value carrying the current
//!   root [`Span`] (and arbitrary typed entries) across asynchronous
//!   continuations. A context is captured where a callback is *registered*
//!   and restored when the callback later *fires*, so a completion that runs
//!   on a later turn of the event loop still observes the call that created
//!   it rather than whatever happens to be ambient at fire time.
//! * [`trace`] — span creation, labeling, and exactly-once closure. Closing a
//!   span stamps its end time and hands it to a [`SpanExporter`]; a sentinel
//!   null span ([`Span::noop`]) represents an explicitly-suppressed trace and
//!   accepts every operation as a no-op.
//!
//! # Examples
//!
//! ```
//! use calltrace::{trace::Tracer, Context};
//! # #[derive(Debug)]
//! # struct Discard;
//! # impl calltrace::trace::SpanExporter for Discard {
//! #     fn export(&self, _: calltrace::trace::SpanData) -> calltrace::trace::ExportResult {
//! #         Ok(())
//! #     }
//! # }
//!
//! let tracer = Tracer::new(Discard);
//! let root = tracer.start("rpc:/pkg.Service/Method");
//!
//! // Make `root` the current root span for everything reached from here,
//! // including callbacks bound while the guard is live.
//! let _guard = Context::current().with_span(root).attach();
//!
//! let child = tracer.start_with_context("rpc:/pkg.Service/Nested", &Context::current());
//! child.add_label("argument", "{}");
//! child.close();
//! ```
//!
//! [`SpanExporter`]: trace::SpanExporter
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]
#![cfg_attr(test, deny(warnings))]

mod context;
pub mod trace;

pub use context::{Context, ContextGuard, FutureExt, WithContext};
pub use trace::Span;
