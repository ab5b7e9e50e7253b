use crate::trace::SpanExporter;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::warn;

/// Identifier of a single span, unique within the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(u64);

impl SpanId {
    /// The invalid span id, carried by the null span.
    pub const INVALID: SpanId = SpanId(0);

    /// Generates a new random, valid span id.
    pub(crate) fn generate() -> Self {
        loop {
            let id = rand::random::<u64>();
            if id != 0 {
                return SpanId(id);
            }
        }
    }

    /// The raw id value; `0` is invalid.
    pub fn into_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Immutable data describing one finished (or still-open) span.
#[derive(Clone, Debug, PartialEq)]
pub struct SpanData {
    /// Span id.
    pub span_id: SpanId,
    /// Id of the parent span, absent for a root span.
    pub parent_span_id: Option<SpanId>,
    /// Span name, e.g. `"rpc:/pkg.Service/Method"`.
    pub name: String,
    /// Label keys and values. Keys are unique; the last write wins.
    pub labels: HashMap<String, String>,
    /// Wall-clock creation time.
    pub start_time: SystemTime,
    /// Wall-clock close time, absent until the span is closed.
    pub end_time: Option<SystemTime>,
}

/// A timed record of one unit of traced work.
///
/// `Span` is a cheaply clonable handle; clones refer to the same underlying
/// record, so a completion callback and an error listener can both hold the
/// span of the call they belong to. A span is mutated only between its
/// creation and its close: labels added afterwards are dropped.
///
/// The null span ([`Span::noop`]) accepts every operation as a no-op and
/// reports [`is_recording`] as `false`.
///
/// [`is_recording`]: Span::is_recording
#[derive(Clone, Debug)]
pub struct Span {
    inner: Option<Arc<ActiveSpan>>,
}

#[derive(Debug)]
struct ActiveSpan {
    span_id: SpanId,
    data: Mutex<Option<SpanData>>,
    exporter: Arc<dyn SpanExporter>,
}

impl Span {
    pub(crate) fn start(
        name: String,
        parent_span_id: Option<SpanId>,
        exporter: Arc<dyn SpanExporter>,
    ) -> Self {
        let span_id = SpanId::generate();
        Span {
            inner: Some(Arc::new(ActiveSpan {
                span_id,
                data: Mutex::new(Some(SpanData {
                    span_id,
                    parent_span_id,
                    name,
                    labels: HashMap::new(),
                    start_time: SystemTime::now(),
                    end_time: None,
                })),
                exporter,
            })),
        }
    }

    /// Returns the null span, representing an explicitly-suppressed trace.
    pub fn noop() -> Self {
        Span { inner: None }
    }

    /// The span's id, [`SpanId::INVALID`] for the null span.
    pub fn span_id(&self) -> SpanId {
        self.inner
            .as_ref()
            .map(|inner| inner.span_id)
            .unwrap_or(SpanId::INVALID)
    }

    /// Whether this span is still recording information.
    ///
    /// `false` for the null span and for spans that have been closed.
    pub fn is_recording(&self) -> bool {
        self.with_data(|_| ()).is_some()
    }

    /// Records a label on this span, overwriting any previous value for the
    /// same key.
    ///
    /// Ignored on the null span and after the span has been closed.
    pub fn add_label(&self, key: impl Into<String>, value: impl Into<String>) {
        let (key, value) = (key.into(), value.into());
        self.with_data(|data| {
            data.labels.insert(key, value);
        });
    }

    /// Closes this span, stamping its end time and handing it to the
    /// exporter.
    ///
    /// The first close wins; later calls (and a close of the null span) are
    /// no-ops. Export failures are logged and never surfaced to the traced
    /// application.
    pub fn close(&self) {
        let inner = match &self.inner {
            Some(inner) => inner,
            None => return,
        };
        // Take data out of the mutex, marking the span as closed.
        let mut data = match inner.data.lock().ok().and_then(|mut guard| guard.take()) {
            Some(data) => data,
            None => return,
        };
        data.end_time = Some(SystemTime::now());
        if let Err(err) = inner.exporter.export(data) {
            warn!(error = %err, "span export failed");
        }
    }

    fn with_data<T>(&self, f: impl FnOnce(&mut SpanData) -> T) -> Option<T> {
        self.inner.as_ref().and_then(|inner| {
            inner
                .data
                .lock()
                .ok()
                .and_then(|mut guard| guard.as_mut().map(f))
        })
    }
}
