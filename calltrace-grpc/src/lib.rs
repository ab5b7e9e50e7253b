//! Automatic span instrumentation for gRPC transports.
//!
//! This crate wraps a gRPC transport's outbound channel and inbound handler
//! registration so that every call produces one correctly parented span,
//! closed exactly once, without the application adding any tracing code. It
//! covers the four call shapes — unary, server-streaming, client-streaming,
//! and bidirectional-streaming — each of which signals completion
//! differently (a single callback versus terminal stream events), and it
//! propagates the ambient tracing context into completion callbacks and
//! stream listeners that fire on later turns of the event loop.
//!
//! The instrumentation is strictly fail-open: when no tracing context is
//! available, when the transport version is unsupported, or when a handler's
//! call shape cannot be recognized, calls pass through byte-for-byte
//! unchanged. RPC errors are never altered; at most they are recorded as a
//! span label before being forwarded.
//!
//! # Wiring
//!
//! The transport exposes its interceptor seam as [`TransportHooks`]:
//! [`patch`] installs the channel and registration interceptors when the
//! transport version is supported, and [`unpatch`] removes them. Channels
//! and handlers wrapped while patched keep tracing until they are discarded;
//! `unpatch` only reverses the top-level hook. This is a documented
//! limitation, matching how live instances cannot be safely rewritten.
//!
//! ```
//! use calltrace::trace::Tracer;
//! use calltrace_grpc::{patch, Config, TransportHooks};
//! # #[derive(Debug)]
//! # struct Discard;
//! # impl calltrace::trace::SpanExporter for Discard {
//! #     fn export(&self, _: calltrace::trace::SpanData) -> calltrace::trace::ExportResult {
//! #         Ok(())
//! #     }
//! # }
//!
//! let tracer = Tracer::new(Discard);
//! let mut hooks = TransportHooks::new("1.24.2");
//! patch(&mut hooks, tracer, Config::default().with_enhanced_reporting(true));
//! assert!(hooks.is_patched());
//! ```
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(test, deny(warnings))]

mod call_span;
pub mod client;
mod patch;
mod record;
pub mod server;
pub mod transport;

pub use client::TracedChannel;
pub use patch::{patch, unpatch, TransportHooks, Version, VersionError};
pub use server::wrap_registration;

/// Instrumentation configuration, read once at patch/registration time.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Master switch; when `false`, registrations are left unwrapped.
    pub enabled: bool,
    /// Gates capture of request/response payloads and protocol metadata
    /// into span labels. Off by default: payload capture is privacy- and
    /// performance-sensitive.
    pub enhanced_reporting: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            enabled: true,
            enhanced_reporting: false,
        }
    }
}

impl Config {
    /// Returns a copy of this config with the master switch set.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Returns a copy of this config with enhanced reporting set.
    pub fn with_enhanced_reporting(mut self, enhanced_reporting: bool) -> Self {
        self.enhanced_reporting = enhanced_reporting;
        self
    }
}
