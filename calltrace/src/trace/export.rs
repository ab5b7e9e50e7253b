use crate::trace::SpanData;
use std::fmt;

/// Result of handing a finished span to an exporter.
pub type ExportResult = Result<(), TraceError>;

/// Errors raised while exporting spans.
///
/// Export failures are decoupled from the traced application: the span
/// lifecycle logs them and moves on, and an RPC is never failed because its
/// span could not be exported.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum TraceError {
    /// The export pipeline rejected or dropped the span.
    #[error("span export failed: {0}")]
    ExportFailed(String),

    /// Other types of failures not covered by the variants above.
    #[error("{0}")]
    Other(String),
}

/// Receives each span at the moment it is closed.
///
/// The exporter is the hand-off point to whatever backend persists or
/// transmits spans; this crate only delivers finished [`SpanData`] to it,
/// synchronously, exactly once per span.
pub trait SpanExporter: fmt::Debug {
    /// Exports one finished span.
    fn export(&self, span: SpanData) -> ExportResult;
}
