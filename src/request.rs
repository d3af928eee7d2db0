//! Request and registration objects owned by a [`DnssdContext`].
//!
//! Each object holds a weak back-reference to the owning context, the
//! caller's callback, and one or more backend handles. It lives in exactly
//! one registry array from creation until `delete()` or context teardown.
//!
//! [`DnssdContext`]: crate::DnssdContext

use crate::{
    backend::{EventFlags, RequestId},
    context::Shared,
    wire::TxtProperties,
    Result,
};
use std::sync::{Mutex, Weak};

/// Callback type for context-level errors.
pub type ErrorCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Callback type for browse events.
pub type BrowseCallback = Box<dyn Fn(&BrowseEvent) + Send + Sync>;

/// Callback type for record query events.
pub type QueryCallback = Box<dyn Fn(&QueryEvent) + Send + Sync>;

/// Callback type for resolve events.
pub type ResolveCallback = Box<dyn Fn(&ResolveEvent) + Send + Sync>;

/// Callback type for service registration events.
pub type ServiceCallback = Box<dyn Fn(&ServiceEvent) + Send + Sync>;

/// A service instance appeared or disappeared for a browse.
#[derive(Debug, Clone)]
pub struct BrowseEvent {
    pub flags: EventFlags,
    pub if_index: u32,
    pub name: String,
    pub regtype: String,
    pub domain: String,
}

/// A raw record arrived for a query.
#[derive(Debug, Clone)]
pub struct QueryEvent {
    pub flags: EventFlags,
    pub fullname: String,
    pub rrtype: u16,
    pub rdata: Vec<u8>,
}

/// Connection details arrived for a resolve.
#[derive(Debug, Clone)]
pub struct ResolveEvent {
    pub flags: EventFlags,
    pub fullname: String,
    pub host: String,
    pub port: u16,
    pub txt: TxtProperties,
}

/// Status change for a service registration: collision, backend error,
/// or a HOST_CHANGE/NETWORK_CHANGE sweep.
#[derive(Debug, Clone)]
pub struct ServiceEvent {
    pub flags: EventFlags,
    pub name: String,
}

/// One backend sub-browse of a browse request, tagged with the domain it
/// covers so wildcard fan-out can follow the known-domains list.
pub(crate) struct BrowseHandle {
    pub(crate) domain: String,
    pub(crate) id: RequestId,
}

/// A long-lived subscription for service instances of some type(s).
///
/// Created by [`DnssdContext::browse_new`](crate::DnssdContext::browse_new).
pub struct BrowseRequest {
    pub(crate) ctx: Weak<Shared>,
    pub(crate) if_index: u32,
    pub(crate) regtypes: Vec<String>,
    /// `None` means all known domains (fan-out on most backends).
    pub(crate) domain: Option<String>,
    pub(crate) callback: BrowseCallback,
    pub(crate) handles: Mutex<Vec<BrowseHandle>>,
}

impl BrowseRequest {
    /// Stops the browse. Backend teardown completes before this returns.
    pub fn delete(&self) -> Result<()> {
        let shared = self.ctx.upgrade().ok_or(crate::Error::ContextGone)?;
        shared.delete_browse(self);
        Ok(())
    }

    pub(crate) fn owns(&self, id: RequestId) -> bool {
        self.handles.lock().unwrap().iter().any(|h| h.id == id)
    }

    pub(crate) fn take_handles(&self) -> Vec<BrowseHandle> {
        std::mem::take(&mut *self.handles.lock().unwrap())
    }
}

/// A subscription for raw records of one full name.
///
/// Created by [`DnssdContext::query_new`](crate::DnssdContext::query_new).
pub struct QueryRequest {
    pub(crate) ctx: Weak<Shared>,
    pub(crate) fullname: String,
    pub(crate) rrtype: u16,
    pub(crate) callback: QueryCallback,
    pub(crate) id: RequestId,
}

impl QueryRequest {
    /// Returns the full name this query watches.
    pub fn fullname(&self) -> &str {
        &self.fullname
    }

    /// Returns the record type this query watches.
    pub fn rrtype(&self) -> u16 {
        self.rrtype
    }

    /// Stops the query. Backend teardown completes before this returns.
    pub fn delete(&self) -> Result<()> {
        let shared = self.ctx.upgrade().ok_or(crate::Error::ContextGone)?;
        shared.delete_query(self);
        Ok(())
    }
}

/// A lookup of connection details for one service instance.
///
/// Created by [`DnssdContext::resolve_new`](crate::DnssdContext::resolve_new).
pub struct ResolveRequest {
    pub(crate) ctx: Weak<Shared>,
    pub(crate) callback: ResolveCallback,
    pub(crate) id: RequestId,
}

impl ResolveRequest {
    /// Stops the resolve. Backend teardown completes before this returns.
    pub fn delete(&self) -> Result<()> {
        let shared = self.ctx.upgrade().ok_or(crate::Error::ContextGone)?;
        shared.delete_resolve(self);
        Ok(())
    }
}

pub(crate) struct ServiceState {
    /// Encoded LOC RDATA, bound into every subsequent `add`.
    pub(crate) loc: Option<[u8; 16]>,
    /// Number of bindings the backend accepted so far.
    pub(crate) bindings: usize,
}

/// A local advertisement of one or more network bindings under one
/// instance name.
///
/// Lifecycle: [`DnssdContext::service_new`] -> optional
/// [`set_location`](ServiceRegistration::set_location) -> one or more
/// [`add`](ServiceRegistration::add) calls -> [`publish`](ServiceRegistration::publish)
/// -> [`delete`](ServiceRegistration::delete).
///
/// [`DnssdContext::service_new`]: crate::DnssdContext::service_new
pub struct ServiceRegistration {
    pub(crate) ctx: Weak<Shared>,
    pub(crate) name: String,
    pub(crate) if_index: u32,
    pub(crate) callback: ServiceCallback,
    pub(crate) group: RequestId,
    pub(crate) state: Mutex<ServiceState>,
}

impl ServiceRegistration {
    /// Returns the instance name of this registration.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the interface index this registration advertises on.
    pub fn if_index(&self) -> u32 {
        self.if_index
    }

    /// Attaches a geographic location, given as a `geo:` URI, to be bound
    /// with every binding added afterwards.
    ///
    /// Some backends bind the LOC record at add-time, so this must be
    /// called before the first [`add`](ServiceRegistration::add).
    pub fn set_location(&self, geo_uri: &str) -> Result<()> {
        let rdata = crate::wire::encode_loc(geo_uri)?;
        let mut state = self.state.lock().unwrap();
        if state.bindings > 0 {
            return Err(e_fmt!(
                "set_location for '{}' must precede the first add",
                self.name
            ));
        }
        state.loc = Some(rdata);
        Ok(())
    }

    /// Adds one network binding.
    ///
    /// Bindings are independent and fail-forward: a rejected call leaves
    /// every earlier accepted binding in place, and the registration stays
    /// usable.
    pub fn add<P: crate::wire::IntoTxtProperties>(
        &self,
        regtype: &str,
        domain: &str,
        host: &str,
        port: u16,
        properties: P,
    ) -> Result<()> {
        let shared = self.ctx.upgrade().ok_or(crate::Error::ContextGone)?;
        let txt = crate::wire::encode_txt(properties.into_txt_properties().iter())?;
        shared.service_add(self, regtype, domain, host, port, &txt)
    }

    /// Commits everything accumulated so far, announcing the service.
    ///
    /// Can be called again after further [`add`](ServiceRegistration::add)
    /// calls to re-announce.
    pub fn publish(&self) -> Result<()> {
        let shared = self.ctx.upgrade().ok_or(crate::Error::ContextGone)?;
        shared.service_publish(self)
    }

    /// Withdraws the advertisement and tears down every binding.
    pub fn delete(&self) -> Result<()> {
        let shared = self.ctx.upgrade().ok_or(crate::Error::ContextGone)?;
        shared.delete_service(self);
        Ok(())
    }
}
