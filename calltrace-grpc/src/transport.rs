//! Typed interfaces to the instrumented gRPC transport.
//!
//! These are the collaborator-facing seams: the transport library owns the
//! protocol, serialization, and dispatch; the instrumentation only decorates
//! the surfaces defined here. Message payloads travel as JSON values and
//! completion arrives either through a single callback ([`UnaryCallback`],
//! [`Responder`]) or through terminal events on a [`CallStream`].

use calltrace::Context;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// A request or response message body.
pub type Payload = serde_json::Value;

/// Terminal status of a call. `code == 0` means success.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    /// Status code; `0` is OK.
    pub code: i32,
    /// Human-readable detail message.
    pub message: String,
}

impl Status {
    /// The successful status.
    pub fn ok() -> Self {
        Status {
            code: 0,
            message: String::new(),
        }
    }

    /// Creates a status with the given code and message.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Status {
            code,
            message: message.into(),
        }
    }

    /// Whether this status indicates success.
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Protocol metadata attached to a call (headers or trailers).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: HashMap<String, String>,
}

impl Metadata {
    /// Creates an empty metadata map.
    pub fn new() -> Self {
        Metadata::default()
    }

    /// Sets a key, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Returns the value for a key, if set.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Extracts the metadata as a plain map.
    pub fn as_map(&self) -> &HashMap<String, String> {
        &self.entries
    }
}

/// The unary/streaming classification of an RPC method.
///
/// The call shape determines how many request and response values flow and,
/// with that, which completion signal ends the call's span: a single
/// callback invocation, or a stream's terminal events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
    /// One request, one response.
    Unary,
    /// One request, a stream of responses.
    ServerStreaming,
    /// A stream of requests, one response.
    ClientStreaming,
    /// Streams in both directions.
    BidiStreaming,
}

impl CallKind {
    /// Derives the call shape from the transport's streaming flags.
    pub fn from_streaming_flags(request_streaming: bool, response_streaming: bool) -> Self {
        match (request_streaming, response_streaming) {
            (false, false) => CallKind::Unary,
            (false, true) => CallKind::ServerStreaming,
            (true, false) => CallKind::ClientStreaming,
            (true, true) => CallKind::BidiStreaming,
        }
    }

    /// Whether the request side is a stream.
    pub fn request_streaming(self) -> bool {
        matches!(self, CallKind::ClientStreaming | CallKind::BidiStreaming)
    }

    /// Whether the response side is a stream.
    pub fn response_streaming(self) -> bool {
        matches!(self, CallKind::ServerStreaming | CallKind::BidiStreaming)
    }
}

/// The classes of events a [`CallStream`] emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A message flowed on the stream.
    Data,
    /// The local side finished writing; the stream's terminal status is set.
    Finish,
    /// The call failed or was cancelled.
    Error,
    /// The remote terminal status arrived.
    Status,
}

/// An event dispatched to [`CallStream`] listeners.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    /// A message flowed on the stream.
    Data(Payload),
    /// The local side finished writing.
    Finish,
    /// The call failed or was cancelled.
    Error(Status),
    /// The remote terminal status arrived.
    Status(Status),
}

impl StreamEvent {
    /// The event's class, used for listener registration.
    pub fn kind(&self) -> EventKind {
        match self {
            StreamEvent::Data(_) => EventKind::Data,
            StreamEvent::Finish => EventKind::Finish,
            StreamEvent::Error(_) => EventKind::Error,
            StreamEvent::Status(_) => EventKind::Status,
        }
    }
}

type Listener = Rc<dyn Fn(&StreamEvent)>;

/// The event-emitting half of a streaming call.
///
/// Each streaming call direction is represented by one `CallStream`; the
/// transport emits [`StreamEvent`]s on it as the call progresses and
/// listeners subscribe per [`EventKind`]. Binding a stream to a [`Context`]
/// makes *all* of its listeners — those already registered and those added
/// later — run with that context attached, which is how per-message handlers
/// and terminal listeners observe the call that owns the stream instead of
/// whatever operation happens to be current when an event fires.
#[derive(Default)]
pub struct CallStream {
    listeners: RefCell<Vec<(EventKind, Listener)>>,
    bound: RefCell<Option<Context>>,
    status: RefCell<Status>,
}

impl CallStream {
    /// Creates a new, unbound stream with an OK status.
    pub fn new() -> Rc<Self> {
        Rc::new(CallStream {
            listeners: RefCell::new(Vec::new()),
            bound: RefCell::new(None),
            status: RefCell::new(Status::ok()),
        })
    }

    /// Registers a listener for one event class.
    pub fn on(&self, kind: EventKind, listener: impl Fn(&StreamEvent) + 'static) {
        self.listeners.borrow_mut().push((kind, Rc::new(listener)));
    }

    /// Binds this stream to a context for listener dispatch.
    ///
    /// After binding, every listener invocation runs with `cx` attached.
    pub fn bind(&self, cx: Context) {
        *self.bound.borrow_mut() = Some(cx);
    }

    /// Sets the stream's terminal status field.
    pub fn set_status(&self, status: Status) {
        *self.status.borrow_mut() = status;
    }

    /// The stream's terminal status field; OK until set otherwise.
    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    /// Emits an event to every listener registered for its class.
    ///
    /// Listeners run in registration order, under the bound context if one
    /// has been set. Listeners may register further listeners; those only
    /// see later events.
    pub fn emit(&self, event: StreamEvent) {
        let kind = event.kind();
        let matching: Vec<Listener> = self
            .listeners
            .borrow()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, listener)| listener.clone())
            .collect();

        let bound = self.bound.borrow().clone();
        let _guard = bound.map(Context::attach);
        for listener in matching {
            listener(&event);
        }
    }
}

impl fmt::Debug for CallStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallStream")
            .field("listeners", &self.listeners.borrow().len())
            .field("bound", &self.bound.borrow().is_some())
            .field("status", &self.status.borrow())
            .finish()
    }
}

/// The single completion callback of a unary-response call.
pub type UnaryCallback = Box<dyn FnOnce(Result<Payload, Status>)>;

/// An outbound gRPC channel, one method per call shape.
///
/// The transport's generated client implements this; the instrumentation
/// decorates it with [`TracedChannel`](crate::TracedChannel).
pub trait Channel {
    /// Issues a unary call; `callback` fires exactly once with the result.
    fn unary(
        &self,
        method: &str,
        request: Payload,
        metadata: Option<Metadata>,
        callback: UnaryCallback,
    );

    /// Issues a server-streaming call, returning the response stream.
    ///
    /// The stream terminates with a `Status` or `Error` event.
    fn server_streaming(
        &self,
        method: &str,
        request: Payload,
        metadata: Option<Metadata>,
    ) -> Rc<CallStream>;

    /// Issues a client-streaming call, returning the request stream.
    ///
    /// `callback` fires exactly once with the single response, possibly
    /// while the request stream is still being written.
    fn client_streaming(
        &self,
        method: &str,
        metadata: Option<Metadata>,
        callback: UnaryCallback,
    ) -> Rc<CallStream>;

    /// Issues a bidirectional-streaming call, returning the duplex stream.
    fn bidi_streaming(&self, method: &str, metadata: Option<Metadata>) -> Rc<CallStream>;
}

impl<C: Channel + ?Sized> Channel for Box<C> {
    fn unary(
        &self,
        method: &str,
        request: Payload,
        metadata: Option<Metadata>,
        callback: UnaryCallback,
    ) {
        (**self).unary(method, request, metadata, callback)
    }

    fn server_streaming(
        &self,
        method: &str,
        request: Payload,
        metadata: Option<Metadata>,
    ) -> Rc<CallStream> {
        (**self).server_streaming(method, request, metadata)
    }

    fn client_streaming(
        &self,
        method: &str,
        metadata: Option<Metadata>,
        callback: UnaryCallback,
    ) -> Rc<CallStream> {
        (**self).client_streaming(method, metadata, callback)
    }

    fn bidi_streaming(&self, method: &str, metadata: Option<Metadata>) -> Rc<CallStream> {
        (**self).bidi_streaming(method, metadata)
    }
}

impl<C: Channel + ?Sized> Channel for Rc<C> {
    fn unary(
        &self,
        method: &str,
        request: Payload,
        metadata: Option<Metadata>,
        callback: UnaryCallback,
    ) {
        (**self).unary(method, request, metadata, callback)
    }

    fn server_streaming(
        &self,
        method: &str,
        request: Payload,
        metadata: Option<Metadata>,
    ) -> Rc<CallStream> {
        (**self).server_streaming(method, request, metadata)
    }

    fn client_streaming(
        &self,
        method: &str,
        metadata: Option<Metadata>,
        callback: UnaryCallback,
    ) -> Rc<CallStream> {
        (**self).client_streaming(method, metadata, callback)
    }

    fn bidi_streaming(&self, method: &str, metadata: Option<Metadata>) -> Rc<CallStream> {
        (**self).bidi_streaming(method, metadata)
    }
}

/// Sends the response result (and optional trailer) of a unary-response
/// handler. Invoked exactly once per call.
pub type Responder = Box<dyn FnOnce(Result<Payload, Status>, Option<Metadata>)>;

/// Sends response headers ahead of the response body.
pub type MetadataSender = Rc<dyn Fn(Metadata)>;

/// An inbound unary call as seen by a handler.
pub struct UnaryCall {
    /// The request payload.
    pub request: Payload,
    /// Request headers.
    pub metadata: Metadata,
    /// Sends response headers; the instrumentation may wrap this hook.
    pub send_metadata: MetadataSender,
}

/// An inbound server-streaming call: one request, responses on `stream`.
pub struct ServerStreamingCall {
    /// The request payload.
    pub request: Payload,
    /// Request headers.
    pub metadata: Metadata,
    /// Outgoing response stream; emits `Finish`/`Error` terminally.
    pub stream: Rc<CallStream>,
}

/// An inbound client-streaming call: requests on `stream`, one response.
pub struct ClientStreamingCall {
    /// Request headers.
    pub metadata: Metadata,
    /// Incoming request stream; emits `Data` per message.
    pub stream: Rc<CallStream>,
}

/// An inbound bidirectional-streaming call.
pub struct BidiCall {
    /// Request headers.
    pub metadata: Metadata,
    /// Duplex stream; emits `Finish`/`Error` when the server side is done.
    pub stream: Rc<CallStream>,
}

/// A registered handler's entry point, one variant per call shape.
pub enum HandlerFunc {
    /// One request, one response.
    Unary(Box<dyn Fn(UnaryCall, Responder)>),
    /// One request, streamed responses.
    ServerStreaming(Box<dyn Fn(ServerStreamingCall)>),
    /// Streamed requests, one response.
    ClientStreaming(Box<dyn Fn(ClientStreamingCall, Responder)>),
    /// Streams in both directions.
    Bidi(Box<dyn Fn(BidiCall)>),
}

impl HandlerFunc {
    /// The call shape this entry point actually services.
    pub fn kind(&self) -> CallKind {
        match self {
            HandlerFunc::Unary(_) => CallKind::Unary,
            HandlerFunc::ServerStreaming(_) => CallKind::ServerStreaming,
            HandlerFunc::ClientStreaming(_) => CallKind::ClientStreaming,
            HandlerFunc::Bidi(_) => CallKind::BidiStreaming,
        }
    }
}

impl fmt::Debug for HandlerFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandlerFunc::{:?}", self.kind())
    }
}

/// A handler object as registered with the transport.
#[derive(Debug)]
pub struct Handler {
    /// The handler's entry point.
    pub func: HandlerFunc,
}

/// Serializes a payload to the wire format.
pub type SerializeFn = Rc<dyn Fn(&Payload) -> Vec<u8>>;

/// Deserializes a payload from the wire format.
pub type DeserializeFn = Rc<dyn Fn(&[u8]) -> Result<Payload, Status>>;

/// One `register(name, handler, serialize, deserialize, call shape)` entry.
///
/// The instrumentation wraps `handler` according to `kind` and passes the
/// codec functions through untouched.
pub struct ServiceRegistration {
    /// The method name, e.g. `"Echo"` or `"/pkg.Service/Echo"`.
    pub name: String,
    /// The declared call shape.
    pub kind: CallKind,
    /// The handler object.
    pub handler: Handler,
    /// Response serializer, passed through untouched.
    pub serialize: SerializeFn,
    /// Request deserializer, passed through untouched.
    pub deserialize: DeserializeFn,
}

impl fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("handler", &self.handler)
            .finish()
    }
}

impl fmt::Debug for UnaryCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnaryCall")
            .field("request", &self.request)
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl fmt::Debug for ServerStreamingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerStreamingCall")
            .field("request", &self.request)
            .field("metadata", &self.metadata)
            .field("stream", &self.stream)
            .finish()
    }
}

impl fmt::Debug for ClientStreamingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientStreamingCall")
            .field("metadata", &self.metadata)
            .field("stream", &self.stream)
            .finish()
    }
}

impl fmt::Debug for BidiCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BidiCall")
            .field("metadata", &self.metadata)
            .field("stream", &self.stream)
            .finish()
    }
}
