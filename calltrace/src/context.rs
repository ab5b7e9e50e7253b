use crate::trace::Span;
use futures_core::stream::Stream;
use pin_project_lite::pin_project;
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasherDefault, Hasher};
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

thread_local! {
    static CURRENT_CONTEXT: RefCell<Context> = RefCell::new(Context::default());
}

/// An execution-scoped collection of values carrying the current root span.
///
/// A `Context` is the propagation mechanism that ties asynchronous
/// continuations back to the logical operation that registered them. It is
/// immutable: every write operation (`with_span`, `with_value`,
/// `with_suppression`) produces a *new* context, so concurrent logical
/// operations can never contaminate one another through a shared cell.
///
/// The current context for a thread is managed with [`attach`], which
/// replaces it and returns a [`ContextGuard`] restoring the previous context
/// on drop. Callbacks that will fire on a later turn of the event loop are
/// wrapped with [`bind`], which captures the context at registration time and
/// re-attaches it around the invocation.
///
/// [`attach`]: Context::attach()
/// [`bind`]: Context::bind()
///
/// # Examples
///
/// ```
/// use calltrace::Context;
///
/// #[derive(Debug, PartialEq)]
/// struct CallId(u64);
///
/// let _guard = Context::new().with_value(CallId(7)).attach();
///
/// // Anything reached from here observes the attached context.
/// assert_eq!(Context::current().get::<CallId>(), Some(&CallId(7)));
/// ```
#[derive(Clone, Default)]
pub struct Context {
    span: Option<Span>,
    suppressed: bool,
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>, BuildHasherDefault<IdHasher>>,
}

impl Context {
    /// Creates an empty `Context`.
    pub fn new() -> Self {
        Context::default()
    }

    /// Returns an immutable snapshot of the current thread's context.
    pub fn current() -> Self {
        Context::map_current(|cx| cx.clone())
    }

    /// Applies a function to the current context, returning its value.
    ///
    /// Avoids the clone of [`Context::current`] when only a read is needed.
    pub fn map_current<T>(f: impl FnOnce(&Context) -> T) -> T {
        CURRENT_CONTEXT.with(|cx| f(&cx.borrow()))
    }

    /// Returns the current root span, if one has been set.
    ///
    /// A return of `None` means no tracing context is available at all. A
    /// returned span may still be the null span, meaning tracing was
    /// explicitly suppressed for this operation; the two cases are
    /// distinguished with [`Span::is_recording`].
    pub fn span(&self) -> Option<&Span> {
        self.span.as_ref()
    }

    /// Returns a copy of this context with `span` as the current root span.
    pub fn with_span(&self, span: Span) -> Self {
        Context {
            span: Some(span),
            ..self.clone()
        }
    }

    /// Returns a copy of this context under which new spans are suppressed.
    ///
    /// Tracers hand out the null span for suppressed contexts, so nested
    /// instrumentation stays inert without extra checks at every site.
    pub fn with_suppression(&self) -> Self {
        Context {
            suppressed: true,
            ..self.clone()
        }
    }

    /// Whether span creation is suppressed under this context.
    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    /// Returns a reference to the entry of the corresponding value type.
    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|rc| rc.downcast_ref())
    }

    /// Returns a copy of the context with the new value included.
    ///
    /// Values are keyed by type; storing a second value of the same type
    /// replaces the first in the returned context.
    pub fn with_value<T: 'static + Send + Sync>(&self, value: T) -> Self {
        let mut new_context = self.clone();
        new_context
            .entries
            .insert(TypeId::of::<T>(), Arc::new(value));

        new_context
    }

    /// Replaces the current context on this thread with this context.
    ///
    /// Dropping the returned [`ContextGuard`] restores the previous context.
    /// Guards nest: attaching inside an attached scope stacks, and each drop
    /// peels back exactly one level.
    ///
    /// # Examples
    ///
    /// ```
    /// use calltrace::Context;
    ///
    /// #[derive(Debug, PartialEq)]
    /// struct CallId(u64);
    ///
    /// let cx = Context::new().with_value(CallId(1));
    ///
    /// let guard = cx.attach();
    /// assert_eq!(Context::current().get::<CallId>(), Some(&CallId(1)));
    ///
    /// drop(guard);
    /// assert_eq!(Context::current().get::<CallId>(), None);
    /// ```
    pub fn attach(self) -> ContextGuard {
        let previous_cx = CURRENT_CONTEXT
            .try_with(|current| current.replace(self))
            .ok();

        ContextGuard {
            previous_cx,
            _marker: PhantomData,
        }
    }

    /// Runs `f` with this context attached, restoring the previous context
    /// afterwards.
    ///
    /// This is the entry point used when starting a fresh logical operation:
    /// everything transitively reached from `f`, including callbacks bound
    /// during its execution, observes this context as current.
    pub fn scope<T>(self, f: impl FnOnce() -> T) -> T {
        let _guard = self.attach();
        f()
    }

    /// Binds a callback to this context.
    ///
    /// The returned closure, whenever it is later invoked, runs with this
    /// context attached rather than whatever context is ambient at
    /// invocation time. This is what keeps a completion callback for one
    /// call from observing another call's context merely because the other
    /// call is current when the completion fires.
    ///
    /// # Examples
    ///
    /// ```
    /// use calltrace::Context;
    ///
    /// #[derive(Debug, PartialEq)]
    /// struct CallId(u64);
    ///
    /// let bound = Context::new()
    ///     .with_value(CallId(1))
    ///     .bind(|_: ()| Context::current().get::<CallId>().is_some());
    ///
    /// // Invoked under an unrelated ambient context, the callback still
    /// // observes the context captured at bind time.
    /// let _guard = Context::new().with_value(CallId(2)).attach();
    /// assert!(bound(()));
    /// ```
    pub fn bind<A, R, F>(&self, f: F) -> impl FnOnce(A) -> R + use<A, R, F>
    where
        F: FnOnce(A) -> R,
    {
        let cx = self.clone();
        move |arg| {
            let _guard = cx.attach();
            f(arg)
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("span", &self.span)
            .field("suppressed", &self.suppressed)
            .field("entries", &self.entries.len())
            .finish()
    }
}

pin_project! {
    /// A future or stream that runs with an associated context.
    #[derive(Clone, Debug)]
    pub struct WithContext<T> {
        #[pin]
        inner: T,
        cx: Context,
    }
}

impl<T: Sized> FutureExt for T {}

impl<T: std::future::Future> std::future::Future for WithContext<T> {
    type Output = T::Output;

    fn poll(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _guard = this.cx.clone().attach();

        this.inner.poll(task_cx)
    }
}

impl<T: Stream> Stream for WithContext<T> {
    type Item = T::Item;

    fn poll_next(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let _guard = this.cx.clone().attach();
        T::poll_next(this.inner, task_cx)
    }
}

/// Extension trait allowing futures and streams to carry a context.
pub trait FutureExt: Sized {
    /// Attaches the provided [`Context`] to this type, returning a
    /// [`WithContext`] wrapper.
    ///
    /// The attached context is current for the duration of every poll of the
    /// wrapped future or stream.
    fn with_context(self, cx: Context) -> WithContext<Self> {
        WithContext { inner: self, cx }
    }

    /// Attaches the current [`Context`] to this type, returning a
    /// [`WithContext`] wrapper.
    fn with_current_context(self) -> WithContext<Self> {
        let cx = Context::current();
        self.with_context(cx)
    }
}

/// A guard that resets the current context to the prior context when dropped.
#[allow(missing_debug_implementations)]
pub struct ContextGuard {
    previous_cx: Option<Context>,
    // ensure this type is !Send as it relies on thread locals
    _marker: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(previous_cx) = self.previous_cx.take() {
            let _ = CURRENT_CONTEXT.try_with(|current| current.replace(previous_cx));
        }
    }
}

/// With TypeIds as keys, there's no need to hash them. They are already hashes
/// themselves, coming from the compiler. The IdHasher holds the u64 of
/// the TypeId, and then returns it, instead of doing any bit fiddling.
#[derive(Clone, Default, Debug)]
struct IdHasher(u64);

impl Hasher for IdHasher {
    fn write(&mut self, _: &[u8]) {
        unreachable!("TypeId calls write_u64");
    }

    #[inline]
    fn write_u64(&mut self, id: u64) {
        self.0 = id;
    }

    #[inline]
    fn finish(&self) -> u64 {
        self.0
    }
}
