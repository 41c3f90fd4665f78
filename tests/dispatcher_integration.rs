//! End-to-end tests for the outbound dispatcher over loopback sockets

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::{SocketAddr, UdpSocket};
use std::rc::Rc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use hermes::dns::key::Family;
use hermes::dns::outbound::{Completion, OutboundConfig, OutboundDispatcher, QueryOutcome};
use hermes::dns::socket_pool::{PoolError, SocketPool};

/// Owned copy of a completion outcome, so assertions can run after the
/// shared receive buffer has been reused.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Answer { from: SocketAddr, datagram: Vec<u8> },
    Timeout,
    Closed,
}

fn recorder(log: &Rc<RefCell<Vec<Outcome>>>) -> Completion {
    let log = Rc::clone(log);
    Box::new(move |outcome| {
        let owned = match outcome {
            QueryOutcome::Answer { from, datagram } => Outcome::Answer {
                from,
                datagram: datagram.to_vec(),
            },
            QueryOutcome::Timeout => Outcome::Timeout,
            QueryOutcome::Closed => Outcome::Closed,
        };
        log.borrow_mut().push(owned);
    })
}

/// RNG that replays a fixed script of words, for forcing id collisions.
struct ScriptedRng {
    values: VecDeque<u64>,
}

impl ScriptedRng {
    fn new(values: &[u64]) -> ScriptedRng {
        ScriptedRng {
            values: values.iter().copied().collect(),
        }
    }
}

impl RngCore for ScriptedRng {
    fn next_u32(&mut self) -> u32 {
        self.next_u64() as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.values.pop_front().unwrap_or(0x1234_5678)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for byte in dest.iter_mut() {
            *byte = self.next_u64() as u8;
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

fn loopback_config(ports: usize) -> OutboundConfig {
    OutboundConfig {
        buffer_size: 4096,
        ports_per_family: ports,
        interfaces: vec!["127.0.0.1".to_string()],
        ip4_enabled: true,
        ip6_enabled: false,
        base_port: None,
    }
}

fn query_packet() -> Vec<u8> {
    // A minimal header-only message; only bytes 0-1 matter to the
    // dispatcher.
    let mut packet = vec![0u8; 12];
    packet[5] = 1; // QDCOUNT, for the look of it
    packet
}

fn upstream_server() -> UdpSocket {
    let server = UdpSocket::bind("127.0.0.1:0").expect("bind upstream stub");
    server
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    server
}

/// Poll every pool socket for queued datagrams until `done` holds or the
/// retry budget runs out.
fn pump(dispatcher: &mut OutboundDispatcher, done: &dyn Fn(&OutboundDispatcher) -> bool) -> bool {
    for _ in 0..200 {
        let slots: Vec<_> = dispatcher.sockets().map(|(slot, _)| slot).collect();
        for slot in slots {
            dispatcher.handle_readable(slot);
        }
        if done(dispatcher) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn test_happy_path_reply_completes_once() {
    let mut dispatcher = OutboundDispatcher::new(&loopback_config(4)).unwrap();
    let server = upstream_server();
    let dest = server.local_addr().unwrap();
    let log = Rc::new(RefCell::new(Vec::new()));
    let mut rng = StdRng::from_entropy();
    let now = Instant::now();

    let mut packet = query_packet();
    let handle = dispatcher.submit(
        &mut packet,
        dest,
        Duration::from_secs(3),
        now,
        &mut rng,
        recorder(&log),
    );
    assert!(handle.is_some());

    // The stub upstream sees the patched query and echoes the id back.
    let mut buf = [0u8; 512];
    let (len, client) = server.recv_from(&mut buf).expect("query arrives");
    assert_eq!(&buf[..len], &packet[..]);

    let reply = [buf[0], buf[1], 0x81, 0x80, 0, 1, 0, 0, 0, 0, 0, 0];
    server.send_to(&reply, client).unwrap();

    assert!(pump(&mut dispatcher, &|_| !log.borrow().is_empty()));
    assert_eq!(
        *log.borrow(),
        vec![Outcome::Answer {
            from: dest,
            datagram: reply.to_vec(),
        }]
    );
    assert_eq!(dispatcher.pending_count(), 0);
    assert_eq!(dispatcher.pool().len(Family::V4), 4);
    assert_eq!(dispatcher.stats().answered, 1);

    // A duplicate of the same reply is unsolicited now.
    server.send_to(&reply, client).unwrap();
    assert!(pump(&mut dispatcher, &|d| d.stats().unsolicited_drops == 1));
    assert_eq!(log.borrow().len(), 1);
}

#[test]
fn test_reply_on_wrong_pool_socket_is_dropped() {
    let mut dispatcher = OutboundDispatcher::new(&loopback_config(4)).unwrap();
    let server = upstream_server();
    let dest = server.local_addr().unwrap();
    let log = Rc::new(RefCell::new(Vec::new()));
    let mut rng = StdRng::from_entropy();
    let now = Instant::now();

    let mut packet = query_packet();
    dispatcher
        .submit(
            &mut packet,
            dest,
            Duration::from_secs(3),
            now,
            &mut rng,
            recorder(&log),
        )
        .expect("submitted");

    let mut buf = [0u8; 512];
    let (_, client) = server.recv_from(&mut buf).expect("query arrives");

    // Deliver a correctly-keyed reply to a pool socket the query did not
    // leave through: id and 4-tuple match, source port does not.
    let other = dispatcher
        .sockets()
        .map(|(_, socket)| socket.local_addr().unwrap())
        .find(|addr| *addr != client)
        .expect("pool has more than one socket");
    let reply = [buf[0], buf[1], 0x81, 0x80];
    server.send_to(&reply, other).unwrap();

    assert!(pump(&mut dispatcher, &|d| d.stats().wrong_socket_drops == 1));
    assert!(log.borrow().is_empty());
    assert_eq!(dispatcher.pending_count(), 1);

    // The query then runs out its clock normally.
    dispatcher.handle_timeout(now + Duration::from_secs(4));
    assert_eq!(*log.borrow(), vec![Outcome::Timeout]);
    assert_eq!(dispatcher.pending_count(), 0);
}

#[test]
fn test_unsolicited_datagram_is_ignored() {
    let mut dispatcher = OutboundDispatcher::new(&loopback_config(2)).unwrap();
    let stranger = upstream_server();

    let target = dispatcher
        .sockets()
        .map(|(_, socket)| socket.local_addr().unwrap())
        .next()
        .unwrap();
    stranger
        .send_to(&[0xAB, 0xCD, 0x81, 0x80], target)
        .unwrap();

    assert!(pump(&mut dispatcher, &|d| d.stats().unsolicited_drops == 1));
    assert_eq!(dispatcher.pending_count(), 0);
    assert_eq!(dispatcher.stats().answered, 0);
}

#[test]
fn test_colliding_id_is_regenerated() {
    let mut dispatcher = OutboundDispatcher::new(&loopback_config(2)).unwrap();
    let server = upstream_server();
    let dest = server.local_addr().unwrap();
    let log = Rc::new(RefCell::new(Vec::new()));
    let now = Instant::now();

    // Script: first query draws id 0xAAAA then an egress socket; the second
    // draws 0xAAAA again (collision), regenerates 0xBBBB, then its egress.
    let mut rng = ScriptedRng::new(&[0x00AA_AA00, 0, 0x00AA_AA00, 0x00BB_BB00, 1]);

    let mut first = query_packet();
    dispatcher
        .submit(
            &mut first,
            dest,
            Duration::from_secs(3),
            now,
            &mut rng,
            recorder(&log),
        )
        .expect("first submitted");
    let mut second = query_packet();
    dispatcher
        .submit(
            &mut second,
            dest,
            Duration::from_secs(3),
            now,
            &mut rng,
            recorder(&log),
        )
        .expect("second submitted");

    assert_eq!(u16::from_be_bytes([first[0], first[1]]), 0xAAAA);
    assert_eq!(u16::from_be_bytes([second[0], second[1]]), 0xBBBB);
    assert_eq!(dispatcher.pending_count(), 2);
    assert!(log.borrow().is_empty());
}

#[test]
fn test_late_reply_after_timeout_is_unsolicited() {
    let mut dispatcher = OutboundDispatcher::new(&loopback_config(2)).unwrap();
    let server = upstream_server();
    let dest = server.local_addr().unwrap();
    let log = Rc::new(RefCell::new(Vec::new()));
    let mut rng = StdRng::from_entropy();
    let now = Instant::now();

    let mut packet = query_packet();
    dispatcher
        .submit(
            &mut packet,
            dest,
            Duration::from_secs(1),
            now,
            &mut rng,
            recorder(&log),
        )
        .expect("submitted");

    let mut buf = [0u8; 512];
    let (_, client) = server.recv_from(&mut buf).expect("query arrives");

    // Clock runs past the deadline before the server gets around to it.
    dispatcher.handle_timeout(now + Duration::from_secs(2));
    assert_eq!(*log.borrow(), vec![Outcome::Timeout]);
    assert_eq!(dispatcher.pending_count(), 0);

    // The answer shows up anyway - correct id, correct socket, too late.
    let reply = [buf[0], buf[1], 0x81, 0x80];
    server.send_to(&reply, client).unwrap();
    assert!(pump(&mut dispatcher, &|d| d.stats().unsolicited_drops == 1));
    assert_eq!(*log.borrow(), vec![Outcome::Timeout]);
}

#[test]
fn test_construction_shortfall_closes_everything() {
    let base_port = 46811u16;
    let mut cfg = loopback_config(10);
    cfg.base_port = Some(base_port);

    let mut attempts = 0;
    let mut reported = None;
    let mut bind = |addr: SocketAddr| {
        attempts += 1;
        if attempts > 7 {
            Err(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "no more ports",
            ))
        } else {
            UdpSocket::bind(addr)
        }
    };

    match SocketPool::open_with(&cfg, &mut bind) {
        Err(PoolError::Shortfall {
            family,
            requested,
            bound,
        }) => {
            assert_eq!(family, Family::V4);
            assert_eq!(requested, 10);
            reported = Some(bound);
        }
        Ok(_) => panic!("expected construction to fail"),
        Err(other) => panic!("expected shortfall, got {}", other),
    }

    // If all seven early binds succeeded they belonged to the pool, and the
    // teardown must have released them.
    if reported == Some(7) {
        let reclaimed = UdpSocket::bind(("127.0.0.1", base_port));
        assert!(reclaimed.is_ok());
    }
}

#[test]
fn test_create_via_dispatcher_fails_without_family_interface() {
    // IPv6 enabled, but only an IPv4 interface to bind on: the v6 pool
    // cannot reach its requested count, so construction fails whole.
    let mut cfg = loopback_config(2);
    cfg.ip6_enabled = true;

    match OutboundDispatcher::new(&cfg) {
        Err(PoolError::Shortfall { family, bound, .. }) => {
            assert_eq!(family, Family::V6);
            assert_eq!(bound, 0);
        }
        _ => panic!("expected v6 shortfall"),
    }
}
