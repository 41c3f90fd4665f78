//! Lookup key for in-flight queries
//!
//! A reply datagram is matched to its query by (transaction id, source
//! address). The index that holds pending queries is ordered, so the key
//! carries a total order: id first, then address length, family, port in
//! wire byte order, and finally the raw address octets. The port comparison
//! is over stored bytes for ordering only - the index never interprets it.

use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Address family of a pool or key. IPv4 orders before IPv6, matching the
/// shorter-address-first rule of the key comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(ip: &IpAddr) -> Family {
        match ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    /// Octet length of an address of this family.
    pub fn addr_len(&self) -> usize {
        match self {
            Family::V4 => 4,
            Family::V6 => 16,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => write!(f, "IPv4"),
            Family::V6 => write!(f, "IPv6"),
        }
    }
}

/// Key identifying one in-flight query: the 16-bit transaction id plus the
/// server address the query was sent to. No two live queries may share the
/// full tuple.
///
/// IPv6 scope ids and flow labels are not part of the key; they are not part
/// of the wire tuple a reply (or a spoofer) carries.
#[derive(Debug, Clone, Copy)]
pub struct QueryKey {
    id: u16,
    ip: IpAddr,
    port: u16,
}

impl QueryKey {
    pub fn new(id: u16, addr: SocketAddr) -> QueryKey {
        QueryKey {
            id,
            ip: addr.ip(),
            port: addr.port(),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn family(&self) -> Family {
        Family::of(&self.ip)
    }
}

impl Ord for QueryKey {
    fn cmp(&self, other: &QueryKey) -> Ordering {
        self.id
            .cmp(&other.id)
            .then_with(|| self.family().addr_len().cmp(&other.family().addr_len()))
            .then_with(|| self.family().cmp(&other.family()))
            .then_with(|| self.port.to_be_bytes().cmp(&other.port.to_be_bytes()))
            .then_with(|| match (&self.ip, &other.ip) {
                (IpAddr::V4(a), IpAddr::V4(b)) => a.octets().cmp(&b.octets()),
                (IpAddr::V6(a), IpAddr::V6(b)) => a.octets().cmp(&b.octets()),
                // Mixed families were already separated by the length and
                // family comparisons above.
                _ => Ordering::Equal,
            })
    }
}

impl PartialOrd for QueryKey {
    fn partial_cmp(&self, other: &QueryKey) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Eq must agree with Ord for the index to stay coherent, so equality is
// defined through the comparison rather than derived field-by-field.
impl PartialEq for QueryKey {
    fn eq(&self, other: &QueryKey) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueryKey {}
