//! The capability interface a native DNS-SD backend implements.
//!
//! This crate never speaks the mDNS wire protocol itself. One concrete
//! backend (Avahi, mDNSResponder, the Windows DNS API, or the in-process
//! [`MockBackend`](crate::mock::MockBackend)) is linked per build and
//! supplies the network side; everything it produces is normalized into
//! [`BackendEvent`] values that the context's monitor thread pumps out of
//! [`Backend::poll`].

use crate::Result;
use std::{fmt, ops::BitOr, time::Duration};

/// Backend-assigned identity of one browse/query/resolve object or one
/// service group. Valid from creation until [`Backend::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// Flags delivered with every callback, as a bitmask.
///
/// A backend sets only [`ADD`](EventFlags::ADD),
/// [`MORE_COMING`](EventFlags::MORE_COMING), [`ERROR`](EventFlags::ERROR)
/// and [`COLLISION`](EventFlags::COLLISION); the context layer adds
/// [`HOST_CHANGE`](EventFlags::HOST_CHANGE) and
/// [`NETWORK_CHANGE`](EventFlags::NETWORK_CHANGE) during sweeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventFlags(u16);

impl EventFlags {
    /// Something appeared (absent means a removal).
    pub const ADD: EventFlags = EventFlags(0x01);
    /// More events of the same batch follow immediately.
    pub const MORE_COMING: EventFlags = EventFlags(0x02);
    /// The backend reported a failure for this event.
    pub const ERROR: EventFlags = EventFlags(0x04);
    /// A name conflict was detected for a registration.
    pub const COLLISION: EventFlags = EventFlags(0x08);
    /// The local hostname changed.
    pub const HOST_CHANGE: EventFlags = EventFlags(0x10);
    /// The network configuration changed.
    pub const NETWORK_CHANGE: EventFlags = EventFlags(0x20);

    /// An empty flag set.
    pub const fn none() -> Self {
        EventFlags(0)
    }

    /// Returns true if every bit of `other` is set in `self`.
    pub const fn contains(self, other: EventFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if no bit is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EventFlags {
    type Output = EventFlags;

    fn bitor(self, rhs: EventFlags) -> EventFlags {
        EventFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for EventFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(EventFlags, &str); 6] = [
            (EventFlags::ADD, "ADD"),
            (EventFlags::MORE_COMING, "MORE_COMING"),
            (EventFlags::ERROR, "ERROR"),
            (EventFlags::COLLISION, "COLLISION"),
            (EventFlags::HOST_CHANGE, "HOST_CHANGE"),
            (EventFlags::NETWORK_CHANGE, "NETWORK_CHANGE"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        if first {
            write!(f, "NONE")?;
        }
        Ok(())
    }
}

/// One normalized event produced by a backend.
#[derive(Debug, Clone)]
pub struct BackendEvent {
    /// The request or service group this event belongs to. Control events
    /// (hostname/domain/reconnect) carry [`RequestId::NONE`].
    pub id: RequestId,

    /// ADD / MORE_COMING / ERROR / COLLISION bits for this event.
    pub flags: EventFlags,

    pub kind: EventKind,
}

impl RequestId {
    /// Placeholder id for control events not tied to any request.
    pub const NONE: RequestId = RequestId(0);
}

/// The payload of a [`BackendEvent`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum EventKind {
    /// A browse result: one service instance appeared or disappeared.
    Browse {
        if_index: u32,
        name: String,
        regtype: String,
        domain: String,
    },

    /// A record query result with raw RDATA bytes.
    Query {
        fullname: String,
        rrtype: u16,
        rdata: Vec<u8>,
    },

    /// A resolve result with connection details. `txt` is the raw TXT
    /// record content; the context layer decodes it before delivery.
    Resolve {
        fullname: String,
        host: String,
        port: u16,
        txt: Vec<u8>,
    },

    /// Status for a registered service group (collision, backend error).
    Service { name: String },

    /// The local hostname is now this value.
    HostnameChange(String),

    /// The network configuration (interfaces, addresses) changed.
    NetworkChange,

    /// A browse domain was announced on the network.
    DomainAdd(String),

    /// A browse domain disappeared from the network.
    DomainRemove(String),

    /// The backend connection was re-established by the backend itself.
    Reconnected,
}

/// One native service-discovery backend.
///
/// A backend supplies one shared connection per context. Creation and
/// cancellation calls manipulate backend-local objects and must not block
/// on network I/O; [`poll`](Backend::poll) is the only blocking call and
/// must return within its timeout. [`cancel`](Backend::cancel) is
/// synchronous: when it returns, no further event for that id will be
/// produced.
pub trait Backend: Send + Sync {
    /// Opens the shared connection for a context.
    fn connect(&self) -> Result<()>;

    /// Closes the shared connection. Called exactly once, after the
    /// monitor thread has been joined.
    fn disconnect(&self);

    /// Snapshot of the current local hostname, e.g. `myhost.local.`
    fn hostname(&self) -> Result<String>;

    /// Snapshot of the human-readable computer name.
    fn computer_name(&self) -> Result<String> {
        let hostname = self.hostname()?;
        Ok(hostname
            .split('.')
            .next()
            .unwrap_or(hostname.as_str())
            .to_string())
    }

    /// True if the backend natively browses every domain when given an
    /// empty domain. When false, the context fans out one browse per
    /// currently-known domain.
    fn supports_any_domain(&self) -> bool;

    /// True if the backend's event pump must not run concurrently with
    /// creation/teardown calls. The context then holds one exclusive
    /// backend mutex around `poll` and every create/cancel call.
    fn needs_exclusive_access(&self) -> bool {
        false
    }

    /// Starts a browse for `regtype` in `domain` (never empty unless
    /// [`supports_any_domain`](Backend::supports_any_domain) is true).
    fn browse(&self, if_index: u32, regtype: &str, domain: &str) -> Result<RequestId>;

    /// Starts a raw record query for one full name.
    fn query(&self, if_index: u32, fullname: &str, rrtype: u16) -> Result<RequestId>;

    /// Starts resolving connection details of one service instance.
    fn resolve(&self, if_index: u32, name: &str, regtype: &str, domain: &str)
        -> Result<RequestId>;

    /// Cancels a browse/query/resolve or tears down a service group.
    fn cancel(&self, id: RequestId);

    /// Creates an empty service group for one instance name.
    fn service_group(&self, name: &str) -> Result<RequestId>;

    /// Adds one network binding to a service group. Bindings are
    /// independent: a rejected call must not retract earlier ones.
    #[allow(clippy::too_many_arguments)]
    fn service_add(
        &self,
        group: RequestId,
        if_index: u32,
        regtype: &str,
        domain: &str,
        host: &str,
        port: u16,
        txt: &[u8],
        loc: Option<&[u8; 16]>,
    ) -> Result<()>;

    /// Atomically commits everything accumulated in a service group.
    fn service_publish(&self, group: RequestId) -> Result<()>;

    /// Blocks for at most `timeout` driving backend I/O, then returns the
    /// events produced meanwhile (possibly none).
    fn poll(&self, timeout: Duration) -> Result<Vec<BackendEvent>>;
}
