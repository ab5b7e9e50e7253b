use crate::trace::{ExportResult, SpanData, SpanExporter, TraceError};
use std::sync::{Arc, Mutex};

/// A span exporter that stores finished spans in memory.
///
/// Intended for tests and debugging: clones share the same buffer, so a test
/// can keep one handle while the tracer under test owns another.
///
/// # Examples
///
/// ```
/// use calltrace::trace::{InMemorySpanExporter, Tracer};
///
/// let exporter = InMemorySpanExporter::new();
/// let tracer = Tracer::new(exporter.clone());
///
/// tracer.start("work").close();
///
/// let spans = exporter.get_finished_spans();
/// assert_eq!(spans.len(), 1);
/// assert_eq!(spans[0].name, "work");
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemorySpanExporter {
    spans: Arc<Mutex<Vec<SpanData>>>,
}

impl InMemorySpanExporter {
    /// Creates a new exporter with an empty buffer.
    pub fn new() -> Self {
        InMemorySpanExporter::default()
    }

    /// Returns a copy of the finished spans exported so far.
    pub fn get_finished_spans(&self) -> Vec<SpanData> {
        self.spans
            .lock()
            .map(|spans| spans.clone())
            .unwrap_or_default()
    }

    /// Clears the stored spans.
    pub fn reset(&self) {
        if let Ok(mut spans) = self.spans.lock() {
            spans.clear();
        }
    }
}

impl SpanExporter for InMemorySpanExporter {
    fn export(&self, span: SpanData) -> ExportResult {
        self.spans
            .lock()
            .map(|mut spans| spans.push(span))
            .map_err(|err| TraceError::ExportFailed(err.to_string()))
    }
}
