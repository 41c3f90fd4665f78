//! Hermes outbound query dispatcher
//!
//! The outbound half of a recursive DNS resolver: queries are fired at
//! authoritative name servers over a pool of pre-bound UDP sockets, and the
//! asynchronous replies are matched back to the pending request that caused
//! them - or dropped as unsolicited.
//!
//! # Architecture
//!
//! Everything lives under the `dns` module:
//! * `dns::outbound` - the dispatcher itself (submit / reply / timeout)
//! * `dns::socket_pool` - per-family arrays of bound egress sockets
//! * `dns::pending` - the registry of in-flight queries
//! * `dns::key` - the composite lookup key and its total order
//!
//! The dispatcher is single-threaded and reactor-agnostic: the embedding
//! event loop registers the pool sockets for readability, forwards readable
//! and timer events, and everything else happens inline. Multi-core
//! deployments run one dispatcher per worker thread.

/// Outbound DNS dispatch: pending registry, socket pool, reply demultiplexing
pub mod dns;
