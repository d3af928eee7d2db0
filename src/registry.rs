//! Per-context registries of active requests.
//!
//! Four growable arrays guarded by the context's single read/write lock
//! (they live inside the state struct behind that lock). Removal is by
//! identity, so two requests with identical parameters stay distinct.

use crate::{
    backend::{EventFlags, RequestId},
    request::{BrowseRequest, QueryRequest, ResolveRequest, ServiceEvent, ServiceRegistration},
};
use std::sync::Arc;

#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) browses: Vec<Arc<BrowseRequest>>,
    pub(crate) queries: Vec<Arc<QueryRequest>>,
    pub(crate) resolves: Vec<Arc<ResolveRequest>>,
    pub(crate) services: Vec<Arc<ServiceRegistration>>,
}

/// Removes by pointer identity. Returns true if the item was present.
fn remove_by_identity<T>(items: &mut Vec<Arc<T>>, target: &T) -> bool {
    let before = items.len();
    items.retain(|item| !std::ptr::eq(Arc::as_ptr(item), target));
    items.len() != before
}

impl Registry {
    pub(crate) fn remove_browse(&mut self, target: &BrowseRequest) -> bool {
        remove_by_identity(&mut self.browses, target)
    }

    pub(crate) fn remove_query(&mut self, target: &QueryRequest) -> bool {
        remove_by_identity(&mut self.queries, target)
    }

    pub(crate) fn remove_resolve(&mut self, target: &ResolveRequest) -> bool {
        remove_by_identity(&mut self.resolves, target)
    }

    pub(crate) fn remove_service(&mut self, target: &ServiceRegistration) -> bool {
        remove_by_identity(&mut self.services, target)
    }

    pub(crate) fn find_browse(&self, id: RequestId) -> Option<&Arc<BrowseRequest>> {
        self.browses.iter().find(|b| b.owns(id))
    }

    pub(crate) fn find_query(&self, id: RequestId) -> Option<&Arc<QueryRequest>> {
        self.queries.iter().find(|q| q.id == id)
    }

    pub(crate) fn find_resolve(&self, id: RequestId) -> Option<&Arc<ResolveRequest>> {
        self.resolves.iter().find(|r| r.id == id)
    }

    pub(crate) fn find_service(&self, group: RequestId) -> Option<&Arc<ServiceRegistration>> {
        self.services.iter().find(|s| s.group == group)
    }

    /// Notifies every registered service synchronously.
    ///
    /// Runs under the context write lock, making the sweep mutually
    /// exclusive with any concurrent add/remove. The lock is not
    /// reentrant, so a sweep-delivered callback must not call back into
    /// the same context, not even its read accessors.
    pub(crate) fn sweep_services(&self, flags: EventFlags) {
        for service in &self.services {
            (service.callback)(&ServiceEvent {
                flags,
                name: service.name.clone(),
            });
        }
    }

    /// Empties every array, handing the items back for teardown outside
    /// the lock.
    pub(crate) fn drain_all(
        &mut self,
    ) -> (
        Vec<Arc<BrowseRequest>>,
        Vec<Arc<QueryRequest>>,
        Vec<Arc<ResolveRequest>>,
        Vec<Arc<ServiceRegistration>>,
    ) {
        (
            std::mem::take(&mut self.browses),
            std::mem::take(&mut self.queries),
            std::mem::take(&mut self.resolves),
            std::mem::take(&mut self.services),
        )
    }
}
