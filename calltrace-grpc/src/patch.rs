//! Applying and removing the instrumentation on a transport.
//!
//! The transport exposes two first-class interceptor slots on its
//! [`TransportHooks`] handle: one consulted whenever a client channel is
//! constructed, one consulted whenever a handler is registered. [`patch`]
//! fills both slots when the transport version is supported; [`unpatch`]
//! clears them. Clearing only reverses the top-level hook — channels and
//! handlers wrapped while patched keep tracing until they are discarded.

use crate::client::TracedChannel;
use crate::server::wrap_registration;
use crate::transport::{Channel, ServiceRegistration};
use crate::Config;
use calltrace::trace::Tracer;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;
use tracing::{debug, info};

/// Transport versions the instrumentation is known to work with.
const MIN_SUPPORTED: Version = Version {
    major: 1,
    minor: 13,
    patch: 0,
};

type ChannelInterceptor = Rc<dyn Fn(Box<dyn Channel>) -> Box<dyn Channel>>;
type RegistrationInterceptor = Rc<dyn Fn(ServiceRegistration) -> ServiceRegistration>;

/// The interceptor seam a transport module exposes to instrumentation.
///
/// The transport owns a `TransportHooks` value and consults it at its two
/// integration points: [`wrap_channel`] when constructing a client channel,
/// and [`wrap_registration`] when a service handler is registered. With no
/// interceptors installed, both are the identity.
///
/// [`wrap_channel`]: TransportHooks::wrap_channel
/// [`wrap_registration`]: TransportHooks::wrap_registration
pub struct TransportHooks {
    version: String,
    channel_interceptor: Option<ChannelInterceptor>,
    registration_interceptor: Option<RegistrationInterceptor>,
}

impl TransportHooks {
    /// Creates unpatched hooks for a transport reporting `version`.
    pub fn new(version: impl Into<String>) -> Self {
        TransportHooks {
            version: version.into(),
            channel_interceptor: None,
            registration_interceptor: None,
        }
    }

    /// The transport's version string.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Whether instrumentation is currently installed.
    pub fn is_patched(&self) -> bool {
        self.channel_interceptor.is_some() || self.registration_interceptor.is_some()
    }

    /// Passes a freshly constructed channel through the installed
    /// interceptor, or returns it untouched when unpatched.
    pub fn wrap_channel(&self, channel: Box<dyn Channel>) -> Box<dyn Channel> {
        match &self.channel_interceptor {
            Some(interceptor) => interceptor(channel),
            None => channel,
        }
    }

    /// Passes a handler registration through the installed interceptor, or
    /// returns it untouched when unpatched.
    pub fn wrap_registration(&self, registration: ServiceRegistration) -> ServiceRegistration {
        match &self.registration_interceptor {
            Some(interceptor) => interceptor(registration),
            None => registration,
        }
    }
}

impl fmt::Debug for TransportHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHooks")
            .field("version", &self.version)
            .field("patched", &self.is_patched())
            .finish()
    }
}

/// Installs the client and server interceptors on a transport.
///
/// No-op when the transport's version is outside the supported range or
/// cannot be parsed; an informational message is logged and the transport
/// keeps running uninstrumented.
pub fn patch(hooks: &mut TransportHooks, tracer: Tracer, config: Config) {
    match hooks.version.parse::<Version>() {
        Ok(version) if supported(version) => {
            debug!(version = %hooks.version, "instrumenting grpc transport");
        }
        _ => {
            info!(
                version = %hooks.version,
                "unsupported grpc transport version, skipping instrumentation"
            );
            return;
        }
    }

    let channel_tracer = tracer.clone();
    hooks.channel_interceptor = Some(Rc::new(move |inner: Box<dyn Channel>| {
        Box::new(TracedChannel::new(inner, channel_tracer.clone(), config))
    }));
    hooks.registration_interceptor = Some(Rc::new(move |registration| {
        wrap_registration(registration, tracer.clone(), config)
    }));
}

/// Removes the interceptors installed by [`patch`].
///
/// Only the top-level hooks are reversed; channels and handlers wrapped
/// while patched keep tracing until they are discarded.
pub fn unpatch(hooks: &mut TransportHooks) {
    hooks.channel_interceptor = None;
    hooks.registration_interceptor = None;
}

fn supported(version: Version) -> bool {
    version >= MIN_SUPPORTED && version.major < 2
}

/// A `major.minor.patch` transport version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    /// Major component.
    pub major: u64,
    /// Minor component.
    pub minor: u64,
    /// Patch component, `0` when omitted.
    pub patch: u64,
}

/// Errors raised while parsing a transport version string.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum VersionError {
    /// The string is not a dotted numeric version.
    #[error("invalid transport version {0:?}")]
    Invalid(String),
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VersionError::Invalid(s.to_string());
        let mut parts = s.split('.');
        let major = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let minor = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let patch = match parts.next() {
            Some(p) => p.parse().map_err(|_| invalid())?,
            None => 0,
        };
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Version {
            major,
            minor,
            patch,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
