//! A small and safe DNS-SD abstraction layer over native backends.
//!
//! This library presents one API for four service-discovery operations
//! (registering advertised services, browsing for service instances,
//! resolving instance connection details, and watching low-level DNS
//! records) on top of whichever native backend (Avahi, mDNSResponder,
//! the Windows DNS API) a build links in. The backend is supplied as a
//! [`Backend`] trait object; this crate never speaks the mDNS wire
//! protocol itself.
//!
//! Each [`DnssdContext`] starts one monitor thread that repeatedly pumps
//! the backend for events and republishes them to the owning request's
//! callback:
//!
//!```text
//!  Caller threads            DnssdContext           monitor thread
//!    |  browse_new() ----------> registry  <---------- |
//!    |  service_new()/publish()     |                  | poll(backend)
//!    |  query_new()/resolve_new()   |                  | dispatch events
//!    |       ...                    |   callbacks <--- |
//!    |  delete() -----------------> teardown, join --> | exits
//!```
//!
//! Callbacks are delivered synchronously under the context's write lock,
//! so a deleted request can never observe another event. The lock is not
//! reentrant: do not call back into the same context at all from inside a
//! callback, even read accessors like
//! [`config_changes`](DnssdContext::config_changes) or
//! [`host_name`](DnssdContext::host_name).
//!
//! # Example
//!
//! ```rust
//! use dnssd_bridge::{mock::MockBackend, DnssdContext, EventFlags};
//! use std::sync::Arc;
//!
//! let backend = Arc::new(MockBackend::new());
//! let ctx = DnssdContext::new(backend, None).expect("Failed to create context");
//!
//! // Advertise a local print queue.
//! let svc = ctx
//!     .service_new("My Printer", 0, Box::new(|event| {
//!         if event.flags.contains(EventFlags::COLLISION) {
//!             println!("name collision for {}", event.name);
//!         }
//!     }))
//!     .expect("Failed to create registration");
//! svc.add("_ipp._tcp", "", "myhost.local.", 631, &[("rp", "ipp/print")][..])
//!     .expect("Failed to add binding");
//! svc.publish().expect("Failed to publish");
//!
//! // Watch for printers appearing anywhere.
//! let browse = ctx
//!     .browse_new(0, "_ipp._tcp", None, Box::new(|event| {
//!         if event.flags.contains(EventFlags::ADD) {
//!             println!("found {} in {}", event.name, event.domain);
//!         }
//!     }))
//!     .expect("Failed to browse");
//!
//! browse.delete().unwrap();
//! ctx.delete();
//! ```

#![forbid(unsafe_code)]

/// A simple macro to report all kinds of errors.
macro_rules! e_fmt {
  ($($arg:tt)+) => {
      crate::Error::Msg(format!($($arg)+))
  };
}

mod context;
mod error;
mod monitor;
mod registry;
mod request;

pub mod backend;
pub mod mock;
pub mod wire;

pub use crate::backend::{Backend, BackendEvent, EventFlags, EventKind, RequestId};
pub use crate::context::{DnssdContext, COMPUTER_NAME_BUF_MIN, HOST_NAME_BUF_MIN};
pub use crate::error::{Error, Result};
pub use crate::request::{
    BrowseCallback, BrowseEvent, BrowseRequest, ErrorCallback, QueryCallback, QueryEvent,
    QueryRequest, ResolveCallback, ResolveEvent, ResolveRequest, ServiceCallback, ServiceEvent,
    ServiceRegistration,
};
pub use crate::wire::{TxtProperties, TxtProperty};
