//! Dispatcher for outbound queries to upstream DNS servers
//!
//! A caller hands `submit` a prepared query packet, a destination, a timeout
//! and a completion. The dispatcher assigns a random transaction id (retrying
//! on collision), patches it into the packet, fires the packet through a
//! randomly chosen pool socket and arms a deadline. Asynchronously, either a
//! reply datagram arrives on a pool socket and is matched back through the
//! pending index, or the deadline expires; both paths invoke the completion
//! exactly once and then retire the pending record.
//!
//! The dispatcher performs no I/O multiplexing of its own. The embedding
//! event loop registers every socket from [`OutboundDispatcher::sockets`]
//! for readability, calls [`OutboundDispatcher::handle_readable`] when one
//! fires, and uses [`OutboundDispatcher::poll_timeout`] /
//! [`OutboundDispatcher::handle_timeout`] to schedule expiry. All calls run
//! on the loop's thread; per-worker dispatchers need no locking.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::dns::key::QueryKey;
use crate::dns::pending::{Pending, PendingIndex, PendingStore, QueryHandle};
use crate::dns::socket_pool::{PoolSlot, SocketPool};

pub use crate::dns::socket_pool::PoolError;

/// Give up on a submit after this many transaction id collisions. The index
/// has to be nearly saturated for even a second draw to collide; the bound
/// only exists to rule out livelock.
const MAX_ID_ATTEMPTS: usize = 1000;

/// The transaction id occupies bytes 0-1 of a DNS message, network order.
const ID_LEN: usize = 2;

/// How a submitted query ended.
///
/// On `Answer`, the datagram slice points into the dispatcher's shared
/// receive buffer and is only valid until the completion returns; copy it
/// out to keep it.
pub enum QueryOutcome<'a> {
    Answer { from: SocketAddr, datagram: &'a [u8] },
    Timeout,
    Closed,
}

/// Completion invoked exactly once per submitted query, on the event-loop
/// thread.
pub type Completion = Box<dyn FnOnce(QueryOutcome<'_>)>;

/// Dispatcher construction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    /// Size of the shared receive buffer. Replies longer than this are
    /// truncated by the kernel, so it should hold the largest EDNS payload
    /// the resolver advertises.
    pub buffer_size: usize,
    /// Number of egress sockets to bind per enabled address family.
    pub ports_per_family: usize,
    /// Interface addresses (IP literals) to bind on; empty means wildcard.
    pub interfaces: Vec<String>,
    pub ip4_enabled: bool,
    pub ip6_enabled: bool,
    /// First port to bind, incremented per attempt; `None` lets the OS pick
    /// an ephemeral port for every socket.
    pub base_port: Option<u16>,
}

impl Default for OutboundConfig {
    fn default() -> OutboundConfig {
        OutboundConfig {
            buffer_size: 65535,
            ports_per_family: 16,
            interfaces: Vec::new(),
            ip4_enabled: true,
            ip6_enabled: true,
            base_port: None,
        }
    }
}

/// Counters of dispatcher activity. Single-threaded by contract, so plain
/// integers are enough.
#[derive(Debug, Default, Clone)]
pub struct DispatchStats {
    pub queries_sent: u64,
    pub answered: u64,
    pub timed_out: u64,
    pub closed: u64,
    pub cancelled: u64,
    pub unsolicited_drops: u64,
    pub wrong_socket_drops: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerEntry {
    deadline: Instant,
    handle: QueryHandle,
}

/// The outbound query dispatcher. One per worker thread.
pub struct OutboundDispatcher {
    pool: SocketPool,
    index: PendingIndex,
    store: PendingStore,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    recv_buf: Vec<u8>,
    stats: DispatchStats,
    closed: bool,
}

impl OutboundDispatcher {
    /// Open the socket pool and build the dispatcher. Fails if any enabled
    /// family comes up short of its requested port count; nothing is left
    /// bound in that case.
    pub fn new(config: &OutboundConfig) -> Result<OutboundDispatcher, PoolError> {
        let pool = SocketPool::open(config)?;
        Ok(OutboundDispatcher::with_pool(pool, config.buffer_size))
    }

    /// Build a dispatcher around an already-opened pool.
    pub fn with_pool(pool: SocketPool, buffer_size: usize) -> OutboundDispatcher {
        OutboundDispatcher {
            pool,
            index: PendingIndex::new(),
            store: PendingStore::new(),
            timers: BinaryHeap::new(),
            recv_buf: vec![0; buffer_size],
            stats: DispatchStats::default(),
            closed: false,
        }
    }

    /// Submit one query.
    ///
    /// `packet` is the fully prepared DNS message; the dispatcher overwrites
    /// its first two bytes with the assigned transaction id, so the buffer
    /// is the dispatcher's to mutate until this call returns. `rng` supplies
    /// the id and egress-socket entropy and must be cryptographically seeded
    /// (e.g. `StdRng::from_entropy()`); the id is taken from the high bits
    /// of the draw, discarding the low byte.
    ///
    /// The completion is invoked exactly once: with `Answer` when a matching
    /// reply arrives, `Timeout` when the deadline passes first, or `Closed`
    /// (possibly synchronously, before this call returns) when the query
    /// could not be sent. The returned handle can be passed to [`cancel`]
    /// and is `None` when the completion already fired.
    ///
    /// [`cancel`]: OutboundDispatcher::cancel
    pub fn submit(
        &mut self,
        packet: &mut [u8],
        dest: SocketAddr,
        timeout: Duration,
        now: Instant,
        rng: &mut dyn RngCore,
        on_done: Completion,
    ) -> Option<QueryHandle> {
        if self.closed || packet.len() < ID_LEN {
            log::warn!("query to {} rejected before send", dest);
            self.stats.closed += 1;
            on_done(QueryOutcome::Closed);
            return None;
        }

        let handle = self.store.insert(Pending::new(dest, now, on_done));

        // Draw ids until one is free for this destination. The packet is
        // patched on every attempt so the bytes on the wire always match
        // the key under which the reply will be looked up.
        let mut id = 0;
        let mut registered = false;
        for _ in 0..MAX_ID_ATTEMPTS {
            id = draw_id(rng);
            packet[..ID_LEN].copy_from_slice(&id.to_be_bytes());
            if self.index.insert(QueryKey::new(id, dest), handle) {
                registered = true;
                break;
            }
        }
        if !registered {
            log::warn!(
                "no free transaction id for {} after {} attempts",
                dest,
                MAX_ID_ATTEMPTS
            );
            return self.fail_closed(handle);
        }
        if let Some(pending) = self.store.get_mut(handle) {
            pending.id = id;
        }
        let key = QueryKey::new(id, dest);

        let slot = match self.pool.select(&dest, rng) {
            Ok(slot) => slot,
            Err(e) => {
                log::warn!("no egress for query to {}: {}", dest, e);
                self.index.remove(&key);
                return self.fail_closed(handle);
            }
        };
        if let Some(pending) = self.store.get_mut(handle) {
            pending.slot = Some(slot);
        }

        let sent = match self.pool.socket(slot) {
            Some(socket) => socket.send_to(packet, dest),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "pool slot gone")),
        };
        if let Err(e) = sent {
            log::warn!("failed to send query to {}: {}", dest, e);
            self.index.remove(&key);
            return self.fail_closed(handle);
        }
        self.stats.queries_sent += 1;

        // The deadline is armed after the send so scheduling delay on the
        // send path is not charged against the server's response time.
        let deadline = now + timeout;
        if let Some(pending) = self.store.get_mut(handle) {
            pending.deadline = deadline;
        }
        self.timers.push(Reverse(TimerEntry { deadline, handle }));

        Some(handle)
    }

    /// Drain and deliver every datagram queued on one pool socket. Called by
    /// the event loop when the socket becomes readable.
    pub fn handle_readable(&mut self, slot: PoolSlot) {
        if self.closed {
            return;
        }
        loop {
            let received = {
                let socket = match self.pool.socket(slot) {
                    Some(socket) => socket,
                    None => return,
                };
                socket.recv_from(&mut self.recv_buf)
            };
            match received {
                Ok((len, src)) => self.deliver(slot, src, len),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                // ICMP port-unreachable surfaces as a recv error on some
                // platforms; skip it so datagrams behind it still drain.
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionRefused => continue,
                Err(e) => {
                    log::warn!("recv on pool socket {} failed: {}", slot.index(), e);
                    return;
                }
            }
        }
    }

    /// Match one received datagram against the pending index.
    fn deliver(&mut self, slot: PoolSlot, src: SocketAddr, len: usize) {
        if len < ID_LEN {
            log::debug!("runt datagram from {} dropped", src);
            return;
        }
        let id = u16::from_be_bytes([self.recv_buf[0], self.recv_buf[1]]);
        let key = QueryKey::new(id, src);

        let handle = match self.index.lookup(&key) {
            Some(handle) => handle,
            None => {
                log::info!("unsolicited reply from {} (id {:#06x}) dropped", src, id);
                self.stats.unsolicited_drops += 1;
                return;
            }
        };

        // A reply must come back on the socket the query left through.
        let chosen = self.store.get(handle).and_then(|pending| pending.slot);
        if chosen != Some(slot) {
            log::debug!("reply from {} (id {:#06x}) arrived on wrong port", src, id);
            self.stats.wrong_socket_drops += 1;
            return;
        }

        self.index.remove(&key);
        let mut pending = match self.store.remove(handle) {
            Some(pending) => pending,
            None => return,
        };
        // Removing the record retires its timer entry; handle_timeout skips
        // handles that no longer resolve.
        if let Some(on_done) = pending.on_done.take() {
            self.stats.answered += 1;
            on_done(QueryOutcome::Answer {
                from: src,
                datagram: &self.recv_buf[..len],
            });
        }
    }

    /// Earliest pending deadline, if any. The event loop sleeps until this
    /// instant and then calls [`handle_timeout`].
    ///
    /// [`handle_timeout`]: OutboundDispatcher::handle_timeout
    pub fn poll_timeout(&mut self) -> Option<Instant> {
        while let Some(Reverse(entry)) = self.timers.peek().copied() {
            match self.store.get(entry.handle) {
                Some(pending) if pending.deadline == entry.deadline => {
                    return Some(entry.deadline);
                }
                // Completed, cancelled, or re-keyed since this entry was
                // pushed; discard and keep looking.
                _ => {
                    self.timers.pop();
                }
            }
        }
        None
    }

    /// Expire every query whose deadline has passed. Each expired query's
    /// completion is invoked with `Timeout`, after the record has left the
    /// index so that a late reply is dropped as unsolicited.
    pub fn handle_timeout(&mut self, now: Instant) {
        while let Some(Reverse(entry)) = self.timers.peek().copied() {
            if entry.deadline > now {
                break;
            }
            self.timers.pop();

            let live = match self.store.get(entry.handle) {
                Some(pending) => pending.deadline == entry.deadline,
                None => false,
            };
            if !live {
                continue;
            }

            let mut pending = match self.store.remove(entry.handle) {
                Some(pending) => pending,
                None => continue,
            };
            self.index.remove(&pending.key());
            if let Some(on_done) = pending.on_done.take() {
                log::debug!("query {:#06x} to {} timed out", pending.id, pending.addr);
                self.stats.timed_out += 1;
                on_done(QueryOutcome::Timeout);
            }
        }
    }

    /// Abandon one in-flight query without invoking its completion. Stale
    /// handles are a no-op.
    pub fn cancel(&mut self, handle: QueryHandle) {
        if let Some(pending) = self.store.remove(handle) {
            self.index.remove(&pending.key());
            self.stats.cancelled += 1;
        }
    }

    /// Tear the dispatcher down: abandon every in-flight query (their
    /// completions are not invoked), drop the timers, close every pool
    /// socket and release the receive buffer. Idempotent; `Drop` performs
    /// the same teardown.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if !self.store.is_empty() {
            log::info!("abandoning {} in-flight queries on shutdown", self.store.len());
        }
        self.index.clear();
        self.store.clear();
        self.timers.clear();
        self.pool.close();
        self.recv_buf = Vec::new();
    }

    /// Remove the pending record and complete with `Closed`. The completion
    /// runs before the record's storage is released.
    fn fail_closed(&mut self, handle: QueryHandle) -> Option<QueryHandle> {
        if let Some(mut pending) = self.store.remove(handle) {
            if let Some(on_done) = pending.on_done.take() {
                self.stats.closed += 1;
                on_done(QueryOutcome::Closed);
            }
        }
        None
    }

    /// Every pool socket with its readiness token, for event-loop
    /// registration.
    pub fn sockets(&self) -> impl Iterator<Item = (PoolSlot, &std::net::UdpSocket)> {
        self.pool.sockets()
    }

    pub fn pool(&self) -> &SocketPool {
        &self.pool
    }

    pub fn pending_count(&self) -> usize {
        self.store.len()
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }
}

impl Drop for OutboundDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Draw a 16-bit transaction id. The low byte of the word is discarded
/// before masking: the high bits of the generator output carry the better
/// entropy and the wire only has room for 16 of them.
fn draw_id(rng: &mut dyn RngCore) -> u16 {
    ((rng.next_u32() >> 8) & 0xffff) as u16
}
