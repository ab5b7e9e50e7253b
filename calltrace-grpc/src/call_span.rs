use calltrace::Span;
use std::cell::Cell;
use std::rc::Rc;

/// Per-call span handle enforcing the single transition into `Closed`.
///
/// A call's span can be ended by racing terminal signals (a `Finish` and an
/// `Error` event, in either order). Each interceptor therefore owns one
/// `CallSpan` and shares it between its completion hooks; the first hook to
/// fire closes the span and flips the flag, and every later hook finds the
/// call already closed and does nothing. Labels are likewise refused once
/// the call is closed, keeping span mutation confined to the open window.
#[derive(Debug)]
pub(crate) struct CallSpan {
    span: Span,
    closed: Cell<bool>,
}

impl CallSpan {
    pub(crate) fn new(span: Span) -> Rc<Self> {
        Rc::new(CallSpan {
            span,
            closed: Cell::new(false),
        })
    }

    pub(crate) fn add_label(&self, key: impl Into<String>, value: impl Into<String>) {
        if !self.closed.get() {
            self.span.add_label(key, value);
        }
    }

    /// Closes the call's span; only the first call has any effect.
    pub(crate) fn close(&self) {
        if !self.closed.replace(true) {
            self.span.close();
        }
    }
}
