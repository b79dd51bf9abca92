//! End-to-end resolver behavior against a scripted loopback nameserver.

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, PTR};
use hickory_proto::rr::{Name, RData, Record};
use netsonde::dns::{
    DnsError, DnsErrorKind, DnsResponse, QueryKind, Records, ResolveSettings, Resolver,
};
use netsonde::error::ErrorKind;
use netsonde::test_utils::init_test_logging;
use netsonde::{assert_with_log, test_complete, test_phase};
use netsonde::Scheduler;
use std::cell::RefCell;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::rc::Rc;
use std::str::FromStr;
use std::thread::JoinHandle;
use std::time::Duration;

fn init_test(name: &str) {
    init_test_logging();
    test_phase!(name);
}

/// Scripted nameserver: answers up to `max_packets` datagrams through
/// `script`, then reports how many it saw. `None` from the script means
/// "stay silent for this one".
fn spawn_nameserver<F>(max_packets: usize, script: F) -> (SocketAddr, JoinHandle<usize>)
where
    F: Fn(&[u8]) -> Option<Vec<u8>> + Send + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").expect("bind nameserver");
    socket
        .set_read_timeout(Some(Duration::from_secs(3)))
        .expect("read timeout");
    let addr = socket.local_addr().expect("nameserver addr");
    let handle = std::thread::spawn(move || {
        let mut seen = 0;
        let mut buf = [0u8; 1500];
        while seen < max_packets {
            let Ok((n, from)) = socket.recv_from(&mut buf) else {
                break; // Idle past the window; the test is done with us.
            };
            seen += 1;
            if let Some(reply) = script(&buf[..n]) {
                socket.send_to(&reply, from).expect("send reply");
            }
        }
        seen
    });
    (addr, handle)
}

fn settings_for(addr: SocketAddr) -> ResolveSettings {
    ResolveSettings {
        nameserver: Some(addr.to_string()),
        attempts: 2,
        timeout: Duration::from_millis(300),
        randomize_case: false,
    }
}

/// Echoes the request as a response, applying `fill` to add answers or
/// flip codes.
fn answer_with(request: &[u8], fill: impl FnOnce(&mut Message)) -> Option<Vec<u8>> {
    let mut message = Message::from_vec(request).expect("parse request");
    message.set_message_type(MessageType::Response);
    fill(&mut message);
    Some(message.to_vec().expect("encode response"))
}

#[test]
fn a_lookup_returns_addresses_with_rtt() {
    init_test("a_lookup_returns_addresses_with_rtt");
    let (addr, server) = spawn_nameserver(1, |request| {
        answer_with(request, |message| {
            let name = message.queries()[0].name().clone();
            message.add_answer(Record::from_rdata(
                name.clone(),
                120,
                RData::A(A("192.0.2.7".parse().unwrap())),
            ));
            message.add_answer(Record::from_rdata(
                name,
                120,
                RData::A(A("192.0.2.8".parse().unwrap())),
            ));
        })
    });

    let sched = Scheduler::new().expect("create scheduler");
    let outcome: Rc<RefCell<Option<Result<DnsResponse, DnsError>>>> =
        Rc::new(RefCell::new(None));
    let resolver = Resolver::new(&sched, settings_for(addr));
    {
        let outcome = Rc::clone(&outcome);
        resolver
            .resolve(QueryKind::A, "probe.example", move |result| {
                *outcome.borrow_mut() = Some(result);
            })
            .expect("issue");
    }
    sched.run().expect("run");
    assert_eq!(server.join().expect("nameserver"), 1);

    let outcome = outcome.borrow();
    let response = outcome
        .as_ref()
        .expect("completed")
        .as_ref()
        .expect("success");
    let expected = Records::Addrs(vec![
        "192.0.2.7".parse::<IpAddr>().unwrap(),
        "192.0.2.8".parse::<IpAddr>().unwrap(),
    ]);
    assert_with_log!(
        response.records == expected,
        "addresses in answer order",
        expected,
        response.records
    );
    assert_with_log!(response.ttl == 120, "ttl", 120u32, response.ttl);
    let rtt_measured = response.rtt > Duration::ZERO;
    assert_with_log!(rtt_measured, "rtt measured", true, rtt_measured);
    test_complete!("a_lookup_returns_addresses_with_rtt");
}

#[test]
fn nxdomain_maps_to_name_unknown_with_rtt() {
    init_test("nxdomain_maps_to_name_unknown_with_rtt");
    let (addr, server) = spawn_nameserver(1, |request| {
        answer_with(request, |message| {
            message.set_response_code(ResponseCode::NXDomain);
        })
    });

    let sched = Scheduler::new().expect("create scheduler");
    let outcome: Rc<RefCell<Option<Result<DnsResponse, DnsError>>>> =
        Rc::new(RefCell::new(None));
    let resolver = Resolver::new(&sched, settings_for(addr));
    {
        let outcome = Rc::clone(&outcome);
        resolver
            .resolve(QueryKind::A, "missing.example", move |result| {
                *outcome.borrow_mut() = Some(result);
            })
            .expect("issue");
    }
    sched.run().expect("run");
    assert_eq!(server.join().expect("nameserver"), 1);

    let outcome = outcome.borrow();
    let err = outcome
        .as_ref()
        .expect("completed")
        .as_ref()
        .expect_err("failure");
    assert_with_log!(
        err.kind == DnsErrorKind::NameOrServiceUnknown,
        "kind",
        DnsErrorKind::NameOrServiceUnknown,
        err.kind
    );
    assert_with_log!(err.code == 3, "raw code retained", 3, err.code);
    // The server answered, so the failure carries a round-trip time.
    let rtt_measured = err.rtt > Duration::ZERO;
    assert_with_log!(rtt_measured, "failure rtt measured", true, rtt_measured);
    test_complete!("nxdomain_maps_to_name_unknown_with_rtt");
}

#[test]
fn timeout_retransmits_then_reports_zero_rtt() {
    init_test("timeout_retransmits_then_reports_zero_rtt");
    // Stay silent; count how many transmissions arrive.
    let (addr, server) = spawn_nameserver(2, |_| None);

    let sched = Scheduler::new().expect("create scheduler");
    let outcome: Rc<RefCell<Option<Result<DnsResponse, DnsError>>>> =
        Rc::new(RefCell::new(None));
    let resolver = Resolver::new(&sched, settings_for(addr));
    {
        let outcome = Rc::clone(&outcome);
        resolver
            .resolve(QueryKind::A, "silent.example", move |result| {
                *outcome.borrow_mut() = Some(result);
            })
            .expect("issue");
    }
    sched.run().expect("run");

    let transmissions = server.join().expect("nameserver");
    assert_with_log!(transmissions == 2, "attempt count", 2usize, transmissions);

    let outcome = outcome.borrow();
    let err = outcome
        .as_ref()
        .expect("completed")
        .as_ref()
        .expect_err("failure");
    assert_with_log!(
        err.kind == DnsErrorKind::Timeout,
        "kind",
        DnsErrorKind::Timeout,
        err.kind
    );
    assert_with_log!(err.rtt == Duration::ZERO, "no rtt", Duration::ZERO, err.rtt);
    test_complete!("timeout_retransmits_then_reports_zero_rtt");
}

#[test]
fn cancel_before_answer_suppresses_completion() {
    init_test("cancel_before_answer_suppresses_completion");
    // Answer immediately; the cancellation must still win.
    let (addr, server) = spawn_nameserver(1, |request| {
        answer_with(request, |message| {
            let name = message.queries()[0].name().clone();
            message.add_answer(Record::from_rdata(
                name,
                60,
                RData::A(A("192.0.2.1".parse().unwrap())),
            ));
        })
    });

    let sched = Scheduler::new().expect("create scheduler");
    let invoked = Rc::new(RefCell::new(false));
    let resolver = Resolver::new(&sched, settings_for(addr));
    {
        let invoked = Rc::clone(&invoked);
        let query = resolver
            .resolve(QueryKind::A, "probe.example", move |_| {
                *invoked.borrow_mut() = true;
            })
            .expect("issue");
        // Cancel within the same tick, before any engine notification.
        query.cancel();
        assert!(query.is_cancelled());
    }
    sched.run().expect("run");
    server.join().expect("nameserver");

    let ran = *invoked.borrow();
    assert_with_log!(!ran, "completion suppressed", false, ran);
    test_complete!("cancel_before_answer_suppresses_completion");
}

#[test]
fn dropping_resolver_fails_pending_queries_with_shutdown() {
    init_test("dropping_resolver_fails_pending_queries_with_shutdown");
    // Never answers; three queries stay pending.
    let (addr, server) = spawn_nameserver(3, |_| None);

    let sched = Scheduler::new().expect("create scheduler");
    let failures = Rc::new(RefCell::new(Vec::new()));
    {
        let resolver = Resolver::new(&sched, settings_for(addr));
        for name in ["one.example", "two.example", "three.example"] {
            let failures = Rc::clone(&failures);
            resolver
                .resolve(QueryKind::A, name, move |result| {
                    failures
                        .borrow_mut()
                        .push(result.expect_err("shutdown error"));
                })
                .expect("issue");
        }
        // Dropping the resolver delivers Shutdown synchronously, before
        // the loop ever runs.
        drop(resolver);
    }
    let k = failures.borrow().len();
    assert_with_log!(k == 3, "exactly K completions at drop", 3usize, k);
    for err in failures.borrow().iter() {
        assert_with_log!(
            err.kind == DnsErrorKind::Shutdown,
            "shutdown kind",
            DnsErrorKind::Shutdown,
            err.kind
        );
        assert_with_log!(err.rtt == Duration::ZERO, "no rtt", Duration::ZERO, err.rtt);
    }
    sched.run().expect("run");
    server.join().expect("nameserver");
    test_complete!("dropping_resolver_fails_pending_queries_with_shutdown");
}

#[test]
fn reverse_lookup_returns_typed_names() {
    init_test("reverse_lookup_returns_typed_names");
    let (addr, server) = spawn_nameserver(1, |request| {
        let parsed = Message::from_vec(request).expect("parse request");
        let qname = parsed.queries()[0].name().to_ascii();
        assert!(qname.eq_ignore_ascii_case("7.2.0.192.in-addr.arpa."));
        answer_with(request, |message| {
            let name = message.queries()[0].name().clone();
            message.add_answer(Record::from_rdata(
                name,
                600,
                RData::PTR(PTR(Name::from_str("host.probe.example.").unwrap())),
            ));
        })
    });

    let sched = Scheduler::new().expect("create scheduler");
    let outcome: Rc<RefCell<Option<Result<DnsResponse, DnsError>>>> =
        Rc::new(RefCell::new(None));
    let resolver = Resolver::new(&sched, settings_for(addr));
    {
        let outcome = Rc::clone(&outcome);
        resolver
            .resolve(QueryKind::ReverseA, "192.0.2.7", move |result| {
                *outcome.borrow_mut() = Some(result);
            })
            .expect("issue");
    }
    sched.run().expect("run");
    server.join().expect("nameserver");

    let outcome = outcome.borrow();
    let response = outcome
        .as_ref()
        .expect("completed")
        .as_ref()
        .expect("success");
    let expected = Records::Names(vec!["host.probe.example.".to_string()]);
    assert_with_log!(
        response.records == expected,
        "typed reverse records",
        expected,
        response.records
    );
    test_complete!("reverse_lookup_returns_typed_names");
}

#[test]
fn reverse_aaaa_rejects_non_ipv6_literal_synchronously() {
    init_test("reverse_aaaa_rejects_non_ipv6_literal_synchronously");
    let sched = Scheduler::new().expect("create scheduler");
    // Deliberately no nameserver: the failure must precede any engine
    // interaction.
    let resolver = Resolver::new(&sched, ResolveSettings::default());
    let err = resolver
        .resolve(QueryKind::ReverseAaaa, "not-an-ipv6-literal", |_| {
            unreachable!("completion must never run");
        })
        .expect_err("synchronous failure");
    assert_with_log!(
        err.kind() == ErrorKind::InvalidInput,
        "invalid input",
        ErrorKind::InvalidInput,
        err.kind()
    );
    test_complete!("reverse_aaaa_rejects_non_ipv6_literal_synchronously");
}

#[test]
fn randomized_case_echo_is_accepted() {
    init_test("randomized_case_echo_is_accepted");
    let (addr, server) = spawn_nameserver(1, |request| {
        // A well-behaved server echoes the question spelling exactly.
        answer_with(request, |message| {
            let name = message.queries()[0].name().clone();
            message.add_answer(Record::from_rdata(
                name,
                30,
                RData::AAAA(AAAA("2001:db8::7".parse().unwrap())),
            ));
        })
    });

    let sched = Scheduler::new().expect("create scheduler");
    let outcome: Rc<RefCell<Option<Result<DnsResponse, DnsError>>>> =
        Rc::new(RefCell::new(None));
    let resolver = Resolver::new(
        &sched,
        ResolveSettings {
            randomize_case: true,
            ..settings_for(addr)
        },
    );
    {
        let outcome = Rc::clone(&outcome);
        resolver
            .resolve(QueryKind::Aaaa, "mixed.case.example", move |result| {
                *outcome.borrow_mut() = Some(result);
            })
            .expect("issue");
    }
    sched.run().expect("run");
    server.join().expect("nameserver");

    let outcome = outcome.borrow();
    let response = outcome
        .as_ref()
        .expect("completed")
        .as_ref()
        .expect("verified echo accepted");
    let expected = Records::Addrs(vec!["2001:db8::7".parse::<IpAddr>().unwrap()]);
    assert_with_log!(
        response.records == expected,
        "aaaa records",
        expected,
        response.records
    );
    test_complete!("randomized_case_echo_is_accepted");
}
