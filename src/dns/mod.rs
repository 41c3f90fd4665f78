//! Outbound DNS query dispatch
//!
//! This module implements the machinery for sending DNS queries to upstream
//! servers over UDP and routing the replies back to their originators:
//!
//! * `key` - composite lookup key over (transaction id, server address)
//! * `pending` - in-flight query records and the ordered index over them
//! * `socket_pool` - bound UDP egress sockets with random per-query selection
//! * `outbound` - the dispatcher tying the above together
//!
//! Spoofing resistance comes from making the (id, address, port, egress
//! port) tuple unpredictable per query: the transaction id is drawn from a
//! caller-supplied RNG and the egress socket is picked uniformly at random
//! from the pool, so an off-path attacker has to guess both.

/// Composite lookup key and address family ordering
pub mod key;

/// The dispatcher: submit queries, deliver replies, expire timeouts
pub mod outbound;

/// In-flight query records, their arena, and the keyed index
pub mod pending;

/// Bound UDP egress sockets with uniform random selection
pub mod socket_pool;
