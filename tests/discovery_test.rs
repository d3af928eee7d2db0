use dnssd_bridge::{
    mock::MockBackend, wire, BackendEvent, BrowseEvent, DnssdContext, EventFlags, EventKind,
    RequestId, COMPUTER_NAME_BUF_MIN, HOST_NAME_BUF_MIN,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::thread::sleep;
use std::time::{Duration, Instant};
use test_log::test;

/// Polls `predicate` until it returns true or the timeout passes.
fn wait_for(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        sleep(Duration::from_millis(50));
    }
    predicate()
}

fn new_context(backend: &Arc<MockBackend>) -> DnssdContext {
    DnssdContext::new(backend.clone(), None).expect("Failed to create context")
}

#[test]
fn test_publish_then_browse() {
    let backend = Arc::new(MockBackend::new());
    let ctx = new_context(&backend);

    let svc = ctx
        .service_new("Test Printer", 42, Box::new(|_| {}))
        .expect("Failed to create registration");
    svc.add(
        "_ipp._tcp",
        "",
        "mock-host.local.",
        631,
        &[("rp", "ipp/print")][..],
    )
    .expect("Failed to add binding");
    svc.publish().expect("Failed to publish");

    let seen: Arc<Mutex<Vec<BrowseEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = seen.clone();
    let _browse = ctx
        .browse_new(
            0,
            "_ipp._tcp",
            None,
            Box::new(move |event| seen_cb.lock().unwrap().push(event.clone())),
        )
        .expect("Failed to browse");

    assert!(
        wait_for(Duration::from_secs(2), || !seen.lock().unwrap().is_empty()),
        "Browse should observe the published service"
    );

    // Give the monitor time to deliver any unexpected extras.
    sleep(Duration::from_millis(600));

    let events = seen.lock().unwrap();
    assert_eq!(events.len(), 1, "Expected exactly one ADD event");
    let event = &events[0];
    assert!(event.flags.contains(EventFlags::ADD));
    assert_eq!(event.if_index, 42);
    assert_eq!(event.name, "Test Printer");
    assert_eq!(event.regtype, "_ipp._tcp");
    assert_eq!(event.domain, "local.");

    let full = wire::assemble_full_name(&event.name, &event.regtype, &event.domain).unwrap();
    assert_eq!(full, "Test Printer._ipp._tcp.local.");
}

#[test]
fn test_service_add_is_fail_forward() {
    let backend = Arc::new(MockBackend::new());
    let ctx = new_context(&backend);

    let svc = ctx
        .service_new("Flaky Printer", 0, Box::new(|_| {}))
        .expect("Failed to create registration");

    svc.add("_ipp._tcp", "", "mock-host.local.", 631, None)
        .expect("First binding should be accepted");

    backend.fail_next_service_add();
    let rejected = svc.add("_http._tcp", "", "mock-host.local.", 80, None);
    assert!(rejected.is_err(), "Second binding should be rejected");

    // Publish still advertises the first binding.
    svc.publish().expect("Publish should still succeed");

    let ipp_adds = Arc::new(AtomicUsize::new(0));
    let http_adds = Arc::new(AtomicUsize::new(0));

    let counter = ipp_adds.clone();
    let _b1 = ctx
        .browse_new(
            0,
            "_ipp._tcp",
            None,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
    let counter = http_adds.clone();
    let _b2 = ctx
        .browse_new(
            0,
            "_http._tcp",
            None,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

    assert!(
        wait_for(Duration::from_secs(2), || ipp_adds.load(Ordering::SeqCst) == 1),
        "The accepted binding should be advertised"
    );
    sleep(Duration::from_millis(400));
    assert_eq!(
        http_adds.load(Ordering::SeqCst),
        0,
        "The rejected binding should not be advertised"
    );
}

#[test]
fn test_hostname_change_updates_context() {
    let backend = Arc::new(MockBackend::new());
    let ctx = new_context(&backend);
    assert_eq!(ctx.host_name(), "mock-host.local.");
    assert_eq!(ctx.config_changes(), 0);

    let host_changes = Arc::new(AtomicUsize::new(0));
    let counter = host_changes.clone();
    let _svc = ctx
        .service_new(
            "Watched Printer",
            0,
            Box::new(move |event| {
                if event.flags.contains(EventFlags::HOST_CHANGE) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
        )
        .unwrap();

    backend.set_hostname("renamed.local.");

    assert!(
        wait_for(Duration::from_secs(2), || ctx.config_changes() == 1),
        "Hostname change should bump the config-change counter"
    );
    assert_eq!(ctx.host_name(), "renamed.local.");
    assert_eq!(host_changes.load(Ordering::SeqCst), 1);

    // The same hostname again is not a change.
    backend.set_hostname("renamed.local.");
    sleep(Duration::from_millis(400));
    assert_eq!(ctx.config_changes(), 1);
    assert_eq!(host_changes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_network_change_sweeps_services() {
    let backend = Arc::new(MockBackend::new());
    let ctx = new_context(&backend);

    let network_changes = Arc::new(AtomicUsize::new(0));
    let counter = network_changes.clone();
    let _svc = ctx
        .service_new(
            "Watched Printer",
            0,
            Box::new(move |event| {
                if event.flags.contains(EventFlags::NETWORK_CHANGE) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
        )
        .unwrap();

    backend.announce_network_change();

    assert!(
        wait_for(Duration::from_secs(2), || ctx.config_changes() == 1),
        "Network change should bump the config-change counter"
    );
    assert_eq!(network_changes.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.host_name(), "mock-host.local.", "Hostname is unaffected");
}

#[test]
fn test_wildcard_browse_follows_domain_list() {
    let backend = Arc::new(MockBackend::new());
    let ctx = new_context(&backend);

    let seen: Arc<Mutex<Vec<BrowseEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = seen.clone();
    let _browse = ctx
        .browse_new(
            0,
            "_ipp._tcp",
            None,
            Box::new(move |event| seen_cb.lock().unwrap().push(event.clone())),
        )
        .unwrap();

    // One sub-browse for the seeded "local." domain.
    assert_eq!(backend.live_objects(), 1);

    backend.announce_domain("example.com.", true);
    assert!(
        wait_for(Duration::from_secs(2), || backend.live_objects() == 2),
        "A new domain should grow the fan-out"
    );

    // A service published into the new domain is observed.
    let svc = ctx.service_new("Remote Printer", 7, Box::new(|_| {})).unwrap();
    svc.add("_ipp._tcp", "example.com.", "remote.example.com.", 631, None)
        .unwrap();
    svc.publish().unwrap();

    assert!(wait_for(Duration::from_secs(2), || {
        seen.lock()
            .unwrap()
            .iter()
            .any(|e| e.domain == "example.com." && e.name == "Remote Printer")
    }));

    backend.announce_domain("example.com.", false);
    assert!(
        wait_for(Duration::from_secs(2), || backend.live_objects() == 2),
        "Removing the domain should shrink the fan-out (browse + service group remain)"
    );
}

#[test]
fn test_resolve_decodes_txt() {
    let backend = Arc::new(MockBackend::new());
    let ctx = new_context(&backend);

    let svc = ctx.service_new("Test Printer", 0, Box::new(|_| {})).unwrap();
    svc.add(
        "_ipp._tcp",
        "",
        "mock-host.local.",
        631,
        &[("rp", "ipp/print"), ("note", "2nd floor")][..],
    )
    .unwrap();
    svc.publish().unwrap();

    let resolved = Arc::new(Mutex::new(Vec::new()));
    let resolved_cb = resolved.clone();
    let _resolve = ctx
        .resolve_new(
            0,
            "Test Printer",
            "_ipp._tcp",
            "local.",
            Box::new(move |event| resolved_cb.lock().unwrap().push(event.clone())),
        )
        .expect("Failed to resolve");

    assert!(wait_for(Duration::from_secs(2), || {
        !resolved.lock().unwrap().is_empty()
    }));

    let events = resolved.lock().unwrap();
    let event = &events[0];
    assert_eq!(event.fullname, "Test Printer._ipp._tcp.local.");
    assert_eq!(event.host, "mock-host.local.");
    assert_eq!(event.port, 631);
    assert_eq!(event.txt.get_property_val("rp"), Some("ipp/print"));
    assert_eq!(event.txt.get_property_val("note"), Some("2nd floor"));
}

#[test]
fn test_query_delivers_raw_records() {
    let backend = Arc::new(MockBackend::new());
    let ctx = new_context(&backend);

    let svc = ctx.service_new("Test Printer", 0, Box::new(|_| {})).unwrap();
    svc.add("_ipp._tcp", "", "mock-host.local.", 631, &[("rp", "ipp/print")][..])
        .unwrap();
    svc.publish().unwrap();

    let records = Arc::new(Mutex::new(Vec::new()));
    let records_cb = records.clone();
    let query = ctx
        .query_new(
            0,
            "Test Printer._ipp._tcp.local.",
            16, // TXT
            Box::new(move |event| records_cb.lock().unwrap().push(event.clone())),
        )
        .expect("Failed to query");
    assert_eq!(query.fullname(), "Test Printer._ipp._tcp.local.");
    assert_eq!(query.rrtype(), 16);

    assert!(wait_for(Duration::from_secs(2), || {
        !records.lock().unwrap().is_empty()
    }));

    let events = records.lock().unwrap();
    let event = &events[0];
    assert!(event.flags.contains(EventFlags::ADD));
    let decoded = wire::decode_txt(&event.rdata);
    assert_eq!(decoded.get_property_val("rp"), Some("ipp/print"));
}

#[test]
fn test_error_routing() {
    let backend = Arc::new(MockBackend::new());

    let reported: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let reported_cb = reported.clone();
    let ctx = DnssdContext::new(
        backend.clone(),
        Some(Box::new(move |msg| {
            reported_cb.lock().unwrap().push(msg.to_string())
        })),
    )
    .expect("Failed to create context");

    let seen: Arc<Mutex<Vec<BrowseEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = seen.clone();
    let _browse = ctx
        .browse_new(
            0,
            "_ipp._tcp",
            None,
            Box::new(move |event| seen_cb.lock().unwrap().push(event.clone())),
        )
        .unwrap();

    // A per-call rejection goes to the context error callback.
    let svc = ctx.service_new("Flaky Printer", 0, Box::new(|_| {})).unwrap();
    backend.fail_next_service_add();
    assert!(svc.add("_ipp._tcp", "", "mock-host.local.", 631, None).is_err());
    {
        let reported = reported.lock().unwrap();
        assert_eq!(reported.len(), 1, "Rejected binding should be reported");
        assert!(reported[0].contains("Flaky Printer"));
    }

    // An asynchronous post-acceptance failure reaches the owning request's
    // callback with ERROR set. The browse was the first backend object
    // created on a fresh mock, so its id is 1.
    backend.push_event(BackendEvent {
        id: RequestId(1),
        flags: EventFlags::ERROR,
        kind: EventKind::Browse {
            if_index: 0,
            name: "Test Printer".to_string(),
            regtype: "_ipp._tcp".to_string(),
            domain: "local.".to_string(),
        },
    });
    assert!(
        wait_for(Duration::from_secs(2), || !seen.lock().unwrap().is_empty()),
        "ERROR event should reach the browse callback"
    );
    assert!(seen.lock().unwrap()[0].flags.contains(EventFlags::ERROR));

    // The failure does not unregister the request: later events still arrive.
    backend.push_event(BackendEvent {
        id: RequestId(1),
        flags: EventFlags::ADD,
        kind: EventKind::Browse {
            if_index: 0,
            name: "Test Printer".to_string(),
            regtype: "_ipp._tcp".to_string(),
            domain: "local.".to_string(),
        },
    });
    assert!(
        wait_for(Duration::from_secs(2), || seen.lock().unwrap().len() == 2),
        "The browse should keep receiving events after an ERROR"
    );
    assert!(seen.lock().unwrap()[1].flags.contains(EventFlags::ADD));

    // Per-call rejections never went to the request callbacks.
    assert_eq!(reported.lock().unwrap().len(), 1);
}

#[test]
fn test_copy_name_buffers() {
    let backend = Arc::new(MockBackend::new());
    let ctx = new_context(&backend);

    let mut small = [0u8; 16];
    assert!(ctx.copy_host_name(&mut small).is_err(), "Undersized buffer is a usage failure");
    assert!(ctx.copy_computer_name(&mut small).is_err());

    let mut host_buf = [0u8; HOST_NAME_BUF_MIN];
    let n = ctx.copy_host_name(&mut host_buf).unwrap();
    assert_eq!(&host_buf[..n], b"mock-host.local.");

    let mut computer_buf = [0u8; COMPUTER_NAME_BUF_MIN];
    let n = ctx.copy_computer_name(&mut computer_buf).unwrap();
    assert_eq!(&computer_buf[..n], b"mock-host");
}

#[test]
fn test_set_location_must_precede_add() {
    let backend = Arc::new(MockBackend::new());
    let ctx = new_context(&backend);

    let svc = ctx.service_new("Located Printer", 0, Box::new(|_| {})).unwrap();
    svc.set_location("geo:37.386,-122.083,30;u=10")
        .expect("Location before add should be accepted");
    svc.add("_ipp._tcp", "", "mock-host.local.", 631, None).unwrap();

    assert!(
        svc.set_location("geo:0,0").is_err(),
        "Location after add must be rejected"
    );
}

#[test]
fn test_subtype_browse_fans_out() {
    let backend = Arc::new(MockBackend::new());
    let ctx = new_context(&backend);

    let _browse = ctx
        .browse_new(0, "_ipp._tcp,_print,_universal", None, Box::new(|_| {}))
        .unwrap();

    // Base type plus two sub-type browses, all in "local.".
    assert_eq!(backend.live_objects(), 3);
}
