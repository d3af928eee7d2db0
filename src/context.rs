//! The top-level DNS-SD context.
//!
//! A [`DnssdContext`] owns the shared backend connection, the four request
//! registries, the cached host/computer names, the known-domains list and
//! the monitor thread. All shared per-context state lives behind one
//! read/write lock: read-only queries take the read lock, every
//! add/remove/sweep takes the write lock, and event callbacks are always
//! delivered under the write lock (one consistent rule for every backend).
//!
//! Lock order, where both are held: state lock, then per-request handle
//! lock, then backend mutex. The monitor's event pump takes only the
//! backend mutex.

use crate::{
    backend::{Backend, BackendEvent, EventFlags, EventKind, RequestId},
    monitor::{monitor_loop, MonitorCommand},
    registry::Registry,
    request::{
        BrowseCallback, BrowseEvent, BrowseHandle, BrowseRequest, ErrorCallback, QueryCallback,
        QueryEvent, QueryRequest, ResolveCallback, ResolveEvent, ResolveRequest, ServiceCallback,
        ServiceEvent, ServiceRegistration, ServiceState,
    },
    wire, Result,
};
use flume::{bounded, Sender};
use log::{debug, error, trace};
use std::{
    sync::{Arc, Mutex, MutexGuard, RwLock},
    thread,
};

/// Minimum caller buffer size for [`DnssdContext::copy_host_name`].
pub const HOST_NAME_BUF_MIN: usize = 70;

/// Minimum caller buffer size for [`DnssdContext::copy_computer_name`].
pub const COMPUTER_NAME_BUF_MIN: usize = 128;

/// The domain every context knows from the start.
const DEFAULT_DOMAIN: &str = "local.";

/// Everything guarded by the context's single read/write lock.
pub(crate) struct State {
    config_changes: u64,
    hostname: String,
    computer_name: String,
    /// Known browse domains, grown/shrunk by backend domain events.
    domains: Vec<String>,
    pub(crate) registry: Registry,
}

/// State shared between the public handle, the monitor thread and every
/// request's weak back-reference.
pub(crate) struct Shared {
    backend: Arc<dyn Backend>,
    state: RwLock<State>,
    /// Serializes the event pump against backend object creation/teardown
    /// for backends that cannot take both concurrently.
    backend_mutex: Mutex<()>,
    error_cb: Option<ErrorCallback>,
}

fn report(error_cb: &Option<ErrorCallback>, msg: &str) {
    match error_cb {
        Some(cb) => cb(msg),
        None => error!("{}", msg),
    }
}

impl Shared {
    pub(crate) fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Returns a guard on the backend mutex when the backend needs one.
    pub(crate) fn backend_guard(&self) -> Option<MutexGuard<'_, ()>> {
        if self.backend.needs_exclusive_access() {
            Some(self.backend_mutex.lock().unwrap())
        } else {
            None
        }
    }

    pub(crate) fn report_error(&self, msg: &str) {
        report(&self.error_cb, msg);
    }

    fn cancel(&self, id: RequestId) {
        let _guard = self.backend_guard();
        self.backend.cancel(id);
    }

    pub(crate) fn delete_browse(&self, target: &BrowseRequest) {
        let removed = self.state.write().unwrap().registry.remove_browse(target);
        if removed {
            for handle in target.take_handles() {
                self.cancel(handle.id);
            }
        }
    }

    pub(crate) fn delete_query(&self, target: &QueryRequest) {
        let removed = self.state.write().unwrap().registry.remove_query(target);
        if removed {
            self.cancel(target.id);
        }
    }

    pub(crate) fn delete_resolve(&self, target: &ResolveRequest) {
        let removed = self.state.write().unwrap().registry.remove_resolve(target);
        if removed {
            self.cancel(target.id);
        }
    }

    pub(crate) fn delete_service(&self, target: &ServiceRegistration) {
        let removed = self.state.write().unwrap().registry.remove_service(target);
        if removed {
            self.cancel(target.group);
        }
    }

    pub(crate) fn service_add(
        &self,
        reg: &ServiceRegistration,
        regtype: &str,
        domain: &str,
        host: &str,
        port: u16,
        txt: &[u8],
    ) -> Result<()> {
        let mut svc = reg.state.lock().unwrap();
        let result = {
            let _guard = self.backend_guard();
            self.backend.service_add(
                reg.group,
                reg.if_index,
                regtype,
                domain,
                host,
                port,
                txt,
                svc.loc.as_ref(),
            )
        };
        match result {
            Ok(()) => {
                svc.bindings += 1;
                Ok(())
            }
            Err(e) => {
                self.report_error(&format!(
                    "backend rejected binding '{}' for service '{}': {}",
                    regtype, reg.name, e
                ));
                Err(e)
            }
        }
    }

    pub(crate) fn service_publish(&self, reg: &ServiceRegistration) -> Result<()> {
        let result = {
            let _guard = self.backend_guard();
            self.backend.service_publish(reg.group)
        };
        if let Err(e) = &result {
            self.report_error(&format!("failed to publish service '{}': {}", reg.name, e));
        }
        result
    }

    /// Routes one backend event under the write lock.
    ///
    /// Holding the write lock for the whole delivery is what guarantees
    /// that no callback fires for a request once its delete has removed it
    /// from the registry.
    pub(crate) fn dispatch_event(&self, event: BackendEvent) {
        let mut state = self.state.write().unwrap();
        match event.kind {
            EventKind::Browse {
                if_index,
                name,
                regtype,
                domain,
            } => match state.registry.find_browse(event.id) {
                Some(browse) => (browse.callback)(&BrowseEvent {
                    flags: event.flags,
                    if_index,
                    name,
                    regtype,
                    domain,
                }),
                None => trace!("browse event for unknown id {:?}", event.id),
            },

            EventKind::Query {
                fullname,
                rrtype,
                rdata,
            } => match state.registry.find_query(event.id) {
                Some(query) => (query.callback)(&QueryEvent {
                    flags: event.flags,
                    fullname,
                    rrtype,
                    rdata,
                }),
                None => trace!("query event for unknown id {:?}", event.id),
            },

            EventKind::Resolve {
                fullname,
                host,
                port,
                txt,
            } => match state.registry.find_resolve(event.id) {
                Some(resolve) => (resolve.callback)(&ResolveEvent {
                    flags: event.flags,
                    fullname,
                    host,
                    port,
                    txt: wire::decode_txt(&txt),
                }),
                None => trace!("resolve event for unknown id {:?}", event.id),
            },

            EventKind::Service { name } => match state.registry.find_service(event.id) {
                Some(service) => (service.callback)(&ServiceEvent {
                    flags: event.flags,
                    name,
                }),
                None => trace!("service event for unknown group {:?}", event.id),
            },

            EventKind::HostnameChange(hostname) => {
                if state.hostname != hostname {
                    debug!("hostname changed: '{}' -> '{}'", state.hostname, hostname);
                    state.hostname = hostname;
                    state.config_changes += 1;
                    state.registry.sweep_services(EventFlags::HOST_CHANGE);
                }
            }

            EventKind::NetworkChange => {
                debug!("network configuration changed");
                state.config_changes += 1;
                state.registry.sweep_services(EventFlags::NETWORK_CHANGE);
            }

            EventKind::DomainAdd(domain) => self.domain_added(&mut state, domain),

            EventKind::DomainRemove(domain) => self.domain_removed(&mut state, &domain),

            EventKind::Reconnected => {
                debug!("backend connection re-established");
                state.config_changes += 1;
                state.registry.sweep_services(EventFlags::HOST_CHANGE);
            }
        }
    }

    fn domain_added(&self, state: &mut State, domain: String) {
        if state.domains.iter().any(|d| *d == domain) {
            return;
        }
        debug!("browse domain added: '{}'", domain);
        state.domains.push(domain.clone());

        if self.backend.supports_any_domain() {
            return;
        }

        // Extend every wildcard browse into the new domain.
        for browse in &state.registry.browses {
            if browse.domain.is_some() {
                continue;
            }
            let mut handles = browse.handles.lock().unwrap();
            for regtype in &browse.regtypes {
                let created = {
                    let _guard = self.backend_guard();
                    self.backend.browse(browse.if_index, regtype, &domain)
                };
                match created {
                    Ok(id) => handles.push(BrowseHandle {
                        domain: domain.clone(),
                        id,
                    }),
                    Err(e) => self.report_error(&format!(
                        "failed to extend browse '{}' into domain '{}': {}",
                        regtype, domain, e
                    )),
                }
            }
        }
    }

    fn domain_removed(&self, state: &mut State, domain: &str) {
        let before = state.domains.len();
        state.domains.retain(|d| d != domain);
        if state.domains.len() == before {
            return;
        }
        debug!("browse domain removed: '{}'", domain);

        for browse in &state.registry.browses {
            if browse.domain.is_some() {
                continue;
            }
            let mut handles = browse.handles.lock().unwrap();
            let mut i = 0;
            while i < handles.len() {
                if handles[i].domain == domain {
                    let handle = handles.remove(i);
                    let _guard = self.backend_guard();
                    self.backend.cancel(handle.id);
                } else {
                    i += 1;
                }
            }
        }
    }
}

/// The public handle for one DNS-SD context.
///
/// Create it with [`DnssdContext::new`], use it from any number of
/// threads, and tear it down with [`DnssdContext::delete`] (or by
/// dropping it). Deletion stops the monitor thread and removes every
/// remaining request before any resource is freed, so no callback fires
/// once deletion has begun.
pub struct DnssdContext {
    shared: Arc<Shared>,
    cmd_tx: Sender<MonitorCommand>,
    monitor: Mutex<Option<thread::JoinHandle<()>>>,
}

impl DnssdContext {
    /// Opens the backend connection, snapshots the host and computer
    /// names, and spawns the monitor thread.
    ///
    /// Any partial failure releases everything taken so far and reports
    /// through `error_cb` (or the log when absent) before returning.
    pub fn new(backend: Arc<dyn Backend>, error_cb: Option<ErrorCallback>) -> Result<Self> {
        if let Err(e) = backend.connect() {
            let msg = format!("failed to open backend connection: {}", e);
            report(&error_cb, &msg);
            return Err(e);
        }

        let names = backend
            .hostname()
            .and_then(|hostname| Ok((hostname, backend.computer_name()?)));
        let (hostname, computer_name) = match names {
            Ok(names) => names,
            Err(e) => {
                report(&error_cb, &format!("failed to read host names: {}", e));
                backend.disconnect();
                return Err(e);
            }
        };

        let shared = Arc::new(Shared {
            backend,
            state: RwLock::new(State {
                config_changes: 0,
                hostname,
                computer_name,
                domains: vec![DEFAULT_DOMAIN.to_string()],
                registry: Registry::default(),
            }),
            backend_mutex: Mutex::new(()),
            error_cb,
        });

        let (cmd_tx, cmd_rx) = bounded(10);
        let monitor_shared = shared.clone();
        let monitor = thread::Builder::new()
            .name("dnssd_monitor".to_string())
            .spawn(move || monitor_loop(monitor_shared, cmd_rx));
        let monitor = match monitor {
            Ok(handle) => handle,
            Err(e) => {
                shared.report_error(&format!("failed to spawn monitor thread: {}", e));
                shared.backend.disconnect();
                return Err(e_fmt!("thread builder failed to spawn: {}", e));
            }
        };

        Ok(Self {
            shared,
            cmd_tx,
            monitor: Mutex::new(Some(monitor)),
        })
    }

    /// Deletes the context: cancels and joins the monitor thread, deletes
    /// every remaining request and registration (whether or not the caller
    /// cleaned them up), and closes the backend connection.
    ///
    /// Dropping the context performs the same teardown.
    pub fn delete(self) {
        self.teardown();
    }

    fn teardown(&self) {
        let handle = match self.monitor.lock().unwrap().take() {
            Some(handle) => handle,
            None => return,
        };

        // Stop the monitor first: after the join, no callback can fire
        // concurrently with the teardown below.
        let (ack_tx, ack_rx) = bounded(1);
        if self.cmd_tx.send(MonitorCommand::Exit(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
        if handle.join().is_err() {
            debug!("monitor thread panicked before join");
        }

        let (browses, queries, resolves, services) = self
            .shared
            .state
            .write()
            .unwrap()
            .registry
            .drain_all();
        for browse in browses {
            for handle in browse.take_handles() {
                self.shared.cancel(handle.id);
            }
        }
        for query in queries {
            self.shared.cancel(query.id);
        }
        for resolve in resolves {
            self.shared.cancel(resolve.id);
        }
        for service in services {
            self.shared.cancel(service.group);
        }

        self.shared.backend.disconnect();
    }

    /// Read-locked snapshot of the configuration-change counter. The
    /// counter increments on hostname changes and backend reconnections.
    pub fn config_changes(&self) -> u64 {
        self.shared.state.read().unwrap().config_changes
    }

    /// Read-locked snapshot of the cached local hostname.
    pub fn host_name(&self) -> String {
        self.shared.state.read().unwrap().hostname.clone()
    }

    /// Read-locked snapshot of the cached computer name.
    pub fn computer_name(&self) -> String {
        self.shared.state.read().unwrap().computer_name.clone()
    }

    /// Copies the cached hostname into `buf` and returns the number of
    /// bytes written. `buf` must hold at least [`HOST_NAME_BUF_MIN`] bytes;
    /// anything smaller is a usage failure.
    pub fn copy_host_name(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < HOST_NAME_BUF_MIN {
            return Err(crate::Error::BufferTooSmall(HOST_NAME_BUF_MIN));
        }
        let state = self.shared.state.read().unwrap();
        copy_name(&state.hostname, buf)
    }

    /// Copies the cached computer name into `buf` and returns the number
    /// of bytes written. `buf` must hold at least
    /// [`COMPUTER_NAME_BUF_MIN`] bytes.
    pub fn copy_computer_name(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < COMPUTER_NAME_BUF_MIN {
            return Err(crate::Error::BufferTooSmall(COMPUTER_NAME_BUF_MIN));
        }
        let state = self.shared.state.read().unwrap();
        copy_name(&state.computer_name, buf)
    }

    /// Starts browsing for service instances.
    ///
    /// `types` is one registration type, optionally followed by
    /// comma-separated sub-types: `"_ipp._tcp,_print"` browses both
    /// `_ipp._tcp` and `_print._sub._ipp._tcp`.
    ///
    /// `domain` of `None` browses all known domains. On backends without
    /// native wildcard support this fans out one sub-browse per currently
    /// known domain, and the fan-out follows the domain list as it changes.
    ///
    /// `if_index` 0 means any interface.
    pub fn browse_new(
        &self,
        if_index: u32,
        types: &str,
        domain: Option<&str>,
        callback: BrowseCallback,
    ) -> Result<Arc<BrowseRequest>> {
        let mut parts = types.split(',').map(str::trim);
        let base = match parts.next().filter(|s| !s.is_empty()) {
            Some(base) => base.to_string(),
            None => return Err(e_fmt!("browse types cannot be empty")),
        };
        let mut regtypes = vec![base.clone()];
        for sub in parts.filter(|s| !s.is_empty()) {
            regtypes.push(format!("{}._sub.{}", sub, base));
        }

        let request = Arc::new(BrowseRequest {
            ctx: Arc::downgrade(&self.shared),
            if_index,
            regtypes,
            domain: domain.map(str::to_string),
            callback,
            handles: Mutex::new(Vec::new()),
        });

        let mut state = self.shared.state.write().unwrap();
        let domains = match (&request.domain, self.shared.backend.supports_any_domain()) {
            (Some(d), _) => vec![d.clone()],
            (None, true) => vec![String::new()],
            (None, false) => state.domains.clone(),
        };

        let mut created = Vec::new();
        for browse_domain in &domains {
            for regtype in &request.regtypes {
                let result = {
                    let _guard = self.shared.backend_guard();
                    self.shared.backend.browse(if_index, regtype, browse_domain)
                };
                match result {
                    Ok(id) => created.push(BrowseHandle {
                        domain: browse_domain.clone(),
                        id,
                    }),
                    Err(e) => {
                        // No partial object: undo what this call created.
                        for handle in created {
                            self.shared.cancel(handle.id);
                        }
                        self.shared.report_error(&format!(
                            "backend refused browse for '{}' in '{}': {}",
                            regtype, browse_domain, e
                        ));
                        return Err(e);
                    }
                }
            }
        }

        *request.handles.lock().unwrap() = created;
        state.registry.browses.push(request.clone());
        Ok(request)
    }

    /// Starts a raw record query for one full name. Record payloads are
    /// delivered to `callback` undecoded.
    pub fn query_new(
        &self,
        if_index: u32,
        fullname: &str,
        rrtype: u16,
        callback: QueryCallback,
    ) -> Result<Arc<QueryRequest>> {
        let mut state = self.shared.state.write().unwrap();
        let result = {
            let _guard = self.shared.backend_guard();
            self.shared.backend.query(if_index, fullname, rrtype)
        };
        let id = result.map_err(|e| {
            self.shared
                .report_error(&format!("backend refused query for '{}': {}", fullname, e));
            e
        })?;

        let request = Arc::new(QueryRequest {
            ctx: Arc::downgrade(&self.shared),
            fullname: fullname.to_string(),
            rrtype,
            callback,
            id,
        });
        state.registry.queries.push(request.clone());
        Ok(request)
    }

    /// Starts resolving connection details for one service instance. The
    /// TXT record is decoded before delivery.
    pub fn resolve_new(
        &self,
        if_index: u32,
        name: &str,
        regtype: &str,
        domain: &str,
        callback: ResolveCallback,
    ) -> Result<Arc<ResolveRequest>> {
        let mut state = self.shared.state.write().unwrap();
        let result = {
            let _guard = self.shared.backend_guard();
            self.shared.backend.resolve(if_index, name, regtype, domain)
        };
        let id = result.map_err(|e| {
            self.shared
                .report_error(&format!("backend refused resolve for '{}': {}", name, e));
            e
        })?;

        let request = Arc::new(ResolveRequest {
            ctx: Arc::downgrade(&self.shared),
            callback,
            id,
        });
        state.registry.resolves.push(request.clone());
        Ok(request)
    }

    /// Creates a service registration with no network bindings yet.
    pub fn service_new(
        &self,
        name: &str,
        if_index: u32,
        callback: ServiceCallback,
    ) -> Result<Arc<ServiceRegistration>> {
        let mut state = self.shared.state.write().unwrap();
        let result = {
            let _guard = self.shared.backend_guard();
            self.shared.backend.service_group(name)
        };
        let group = result.map_err(|e| {
            self.shared.report_error(&format!(
                "backend refused service group for '{}': {}",
                name, e
            ));
            e
        })?;

        let registration = Arc::new(ServiceRegistration {
            ctx: Arc::downgrade(&self.shared),
            name: name.to_string(),
            if_index,
            callback,
            group,
            state: Mutex::new(ServiceState {
                loc: None,
                bindings: 0,
            }),
        });
        state.registry.services.push(registration.clone());
        Ok(registration)
    }
}

impl Drop for DnssdContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn copy_name(name: &str, buf: &mut [u8]) -> Result<usize> {
    let bytes = name.as_bytes();
    if bytes.len() > buf.len() {
        return Err(crate::Error::BufferTooSmall(bytes.len()));
    }
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(bytes.len())
}
