//! An in-process backend for tests and downstream development.
//!
//! [`MockBackend`] keeps browses and service groups in memory and feeds
//! the context's monitor thread through a flume queue drained by
//! [`poll`](crate::backend::Backend::poll). Publishing a service emits ADD
//! browse events to every matching browse; a browse created after the fact
//! sees already-published services. Tests can push synthetic control
//! events, delay `cancel` to observe teardown synchronicity, and make the
//! next connect or service-add call fail.

use crate::backend::{Backend, BackendEvent, EventFlags, EventKind, RequestId};
use crate::{Error, Result};
use flume::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    thread,
    time::Duration,
};

struct MockBrowse {
    regtype: String,
    domain: String,
}

struct MockBinding {
    if_index: u32,
    regtype: String,
    domain: String,
    host: String,
    port: u16,
    txt: Vec<u8>,
}

struct MockService {
    name: String,
    bindings: Vec<MockBinding>,
    published: bool,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    hostname: String,
    browses: HashMap<RequestId, MockBrowse>,
    services: HashMap<RequestId, MockService>,
    /// Queries and resolves only need to exist for cancel bookkeeping.
    plain_requests: Vec<RequestId>,
}

/// A fake native backend.
pub struct MockBackend {
    state: Mutex<MockState>,
    event_tx: Sender<BackendEvent>,
    event_rx: Receiver<BackendEvent>,
    cancel_delay: Mutex<Duration>,
    connected: AtomicBool,
    fail_connect: AtomicBool,
    fail_next_service_add: AtomicBool,
    any_domain: bool,
}

impl MockBackend {
    /// Creates a mock without native wildcard-domain support, so wildcard
    /// browses exercise the per-domain fan-out.
    pub fn new() -> Self {
        Self::with_any_domain(false)
    }

    /// Creates a mock that claims native wildcard-domain browsing.
    pub fn with_any_domain(any_domain: bool) -> Self {
        let (event_tx, event_rx) = unbounded();
        Self {
            state: Mutex::new(MockState {
                hostname: "mock-host.local.".to_string(),
                ..MockState::default()
            }),
            event_tx,
            event_rx,
            cancel_delay: Mutex::new(Duration::ZERO),
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            fail_next_service_add: AtomicBool::new(false),
            any_domain,
        }
    }

    /// Makes every [`cancel`](Backend::cancel) sleep this long first.
    pub fn set_cancel_delay(&self, delay: Duration) {
        *self.cancel_delay.lock().unwrap() = delay;
    }

    /// Makes the next [`connect`](Backend::connect) call fail.
    pub fn fail_next_connect(&self) {
        self.fail_connect.store(true, Ordering::SeqCst);
    }

    /// Makes the next [`service_add`](Backend::service_add) call fail.
    pub fn fail_next_service_add(&self) {
        self.fail_next_service_add.store(true, Ordering::SeqCst);
    }

    /// Queues a synthetic event for the next poll.
    pub fn push_event(&self, event: BackendEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Changes the mock hostname and queues the corresponding event.
    pub fn set_hostname(&self, hostname: &str) {
        self.state.lock().unwrap().hostname = hostname.to_string();
        self.push_event(BackendEvent {
            id: RequestId::NONE,
            flags: EventFlags::none(),
            kind: EventKind::HostnameChange(hostname.to_string()),
        });
    }

    /// Queues a network-configuration-change event.
    pub fn announce_network_change(&self) {
        self.push_event(BackendEvent {
            id: RequestId::NONE,
            flags: EventFlags::none(),
            kind: EventKind::NetworkChange,
        });
    }

    /// Announces or withdraws a browse domain.
    pub fn announce_domain(&self, domain: &str, add: bool) {
        let kind = if add {
            EventKind::DomainAdd(domain.to_string())
        } else {
            EventKind::DomainRemove(domain.to_string())
        };
        self.push_event(BackendEvent {
            id: RequestId::NONE,
            flags: EventFlags::none(),
            kind,
        });
    }

    /// Number of live backend objects (browses, queries, resolves and
    /// service groups not yet cancelled).
    pub fn live_objects(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.browses.len() + state.services.len() + state.plain_requests.len()
    }

    fn next_id(state: &mut MockState) -> RequestId {
        state.next_id += 1;
        RequestId(state.next_id)
    }

    /// Emits ADD events for `service` to every matching browse, flagging
    /// all but the last one MORE_COMING.
    fn emit_matches(&self, state: &MockState, service: &MockService) {
        let mut pending = Vec::new();
        for binding in &service.bindings {
            for (browse_id, browse) in &state.browses {
                if browse.regtype != binding.regtype {
                    continue;
                }
                if !browse.domain.is_empty() && browse.domain != binding.domain {
                    continue;
                }
                pending.push(BackendEvent {
                    id: *browse_id,
                    flags: EventFlags::ADD,
                    kind: EventKind::Browse {
                        if_index: binding.if_index,
                        name: service.name.clone(),
                        regtype: binding.regtype.clone(),
                        domain: binding.domain.clone(),
                    },
                });
            }
        }
        let last = pending.len().saturating_sub(1);
        for (i, mut event) in pending.into_iter().enumerate() {
            if i < last {
                event.flags = event.flags | EventFlags::MORE_COMING;
            }
            let _ = self.event_tx.send(event);
        }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MockBackend {
    fn connect(&self) -> Result<()> {
        if self.fail_connect.swap(false, Ordering::SeqCst) {
            return Err(Error::Msg("mock connect failure".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn hostname(&self) -> Result<String> {
        Ok(self.state.lock().unwrap().hostname.clone())
    }

    fn supports_any_domain(&self) -> bool {
        self.any_domain
    }

    fn browse(&self, _if_index: u32, regtype: &str, domain: &str) -> Result<RequestId> {
        let mut state = self.state.lock().unwrap();
        let id = Self::next_id(&mut state);
        state.browses.insert(
            id,
            MockBrowse {
                regtype: regtype.to_string(),
                domain: domain.to_string(),
            },
        );

        // A late browse still sees everything already published.
        let browse = &state.browses[&id];
        let mut pending = Vec::new();
        for service in state.services.values().filter(|s| s.published) {
            for binding in &service.bindings {
                if browse.regtype != binding.regtype {
                    continue;
                }
                if !browse.domain.is_empty() && browse.domain != binding.domain {
                    continue;
                }
                pending.push(BackendEvent {
                    id,
                    flags: EventFlags::ADD,
                    kind: EventKind::Browse {
                        if_index: binding.if_index,
                        name: service.name.clone(),
                        regtype: binding.regtype.clone(),
                        domain: binding.domain.clone(),
                    },
                });
            }
        }
        for event in pending {
            let _ = self.event_tx.send(event);
        }

        Ok(id)
    }

    /// Answers immediately from published services: a TXT query (rrtype 16)
    /// whose full name starts with a published instance name gets that
    /// binding's TXT content as raw RDATA.
    fn query(&self, _if_index: u32, fullname: &str, rrtype: u16) -> Result<RequestId> {
        let mut state = self.state.lock().unwrap();
        let id = Self::next_id(&mut state);
        state.plain_requests.push(id);

        if rrtype == 16 {
            for service in state.services.values().filter(|s| s.published) {
                if !fullname.starts_with(&format!("{}.", service.name)) {
                    continue;
                }
                for binding in &service.bindings {
                    let _ = self.event_tx.send(BackendEvent {
                        id,
                        flags: EventFlags::ADD,
                        kind: EventKind::Query {
                            fullname: fullname.to_string(),
                            rrtype,
                            rdata: binding.txt.clone(),
                        },
                    });
                }
            }
        }
        Ok(id)
    }

    /// Answers immediately from published services matching name and type.
    fn resolve(
        &self,
        _if_index: u32,
        name: &str,
        regtype: &str,
        domain: &str,
    ) -> Result<RequestId> {
        let mut state = self.state.lock().unwrap();
        let id = Self::next_id(&mut state);
        state.plain_requests.push(id);

        for service in state.services.values().filter(|s| s.published) {
            if service.name != name {
                continue;
            }
            let matching = service
                .bindings
                .iter()
                .filter(|b| b.regtype == regtype && (domain.is_empty() || b.domain == domain));
            for binding in matching {
                let _ = self.event_tx.send(BackendEvent {
                    id,
                    flags: EventFlags::ADD,
                    kind: EventKind::Resolve {
                        fullname: format!("{}.{}.{}", name, regtype, binding.domain),
                        host: binding.host.clone(),
                        port: binding.port,
                        txt: binding.txt.clone(),
                    },
                });
            }
        }
        Ok(id)
    }

    fn cancel(&self, id: RequestId) {
        let delay = *self.cancel_delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let mut state = self.state.lock().unwrap();
        state.browses.remove(&id);
        state.services.remove(&id);
        state.plain_requests.retain(|r| *r != id);
    }

    fn service_group(&self, name: &str) -> Result<RequestId> {
        let mut state = self.state.lock().unwrap();
        let id = Self::next_id(&mut state);
        state.services.insert(
            id,
            MockService {
                name: name.to_string(),
                bindings: Vec::new(),
                published: false,
            },
        );
        Ok(id)
    }

    fn service_add(
        &self,
        group: RequestId,
        if_index: u32,
        regtype: &str,
        domain: &str,
        host: &str,
        port: u16,
        txt: &[u8],
        _loc: Option<&[u8; 16]>,
    ) -> Result<()> {
        if self.fail_next_service_add.swap(false, Ordering::SeqCst) {
            return Err(Error::Msg("mock service_add failure".to_string()));
        }
        let mut state = self.state.lock().unwrap();
        let service = state
            .services
            .get_mut(&group)
            .ok_or_else(|| Error::Msg(format!("no such service group {:?}", group)))?;
        service.bindings.push(MockBinding {
            if_index,
            regtype: regtype.to_string(),
            domain: if domain.is_empty() {
                "local.".to_string()
            } else {
                domain.to_string()
            },
            host: host.to_string(),
            port,
            txt: txt.to_vec(),
        });
        Ok(())
    }

    fn service_publish(&self, group: RequestId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let service = state
            .services
            .get_mut(&group)
            .ok_or_else(|| Error::Msg(format!("no such service group {:?}", group)))?;
        service.published = true;

        // Re-borrow immutably for matching.
        let state = &*state;
        let service = &state.services[&group];
        self.emit_matches(state, service);
        Ok(())
    }

    fn poll(&self, timeout: Duration) -> Result<Vec<BackendEvent>> {
        let mut events = Vec::new();
        match self.event_rx.recv_timeout(timeout) {
            Ok(event) => {
                events.push(event);
                while let Ok(event) = self.event_rx.try_recv() {
                    events.push(event);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(Error::Msg("mock event queue closed".to_string()))
            }
        }
        Ok(events)
    }
}
