//! Bound UDP egress sockets
//!
//! The pool opens a configured number of UDP sockets per address family,
//! optionally on specific interface addresses, and hands out a uniformly
//! random socket for every outgoing query. Per-query source-port randomness
//! is the spoofing defense: the pool size sets how much entropy sits on top
//! of the 16-bit transaction id.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use derive_more::{Display, Error, From};
use rand::RngCore;
use socket2::{Domain, Protocol, Socket, Type};

use crate::dns::key::Family;
use crate::dns::outbound::OutboundConfig;

#[derive(Debug, Display, From, Error)]
pub enum PoolError {
    #[display(fmt = "interface {} is not an IP literal", name)]
    Interface {
        #[error(not(source))]
        name: String,
    },
    #[display(fmt = "bound {} of {} requested {} ports", bound, requested, family)]
    Shortfall {
        family: Family,
        requested: usize,
        bound: usize,
    },
    #[display(fmt = "no bound {} socket to send from", family)]
    NoEgress {
        #[error(not(source))]
        family: Family,
    },
}

type Result<T> = std::result::Result<T, PoolError>;

/// Stable handle to one socket in the pool. Doubles as the readiness token
/// the embedding event loop registers the socket under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolSlot(pub(crate) usize);

impl PoolSlot {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Function used to bind one UDP socket. The default binder goes through
/// `socket2`; tests substitute failing binders to exercise the shortfall
/// path.
pub type Binder<'a> = &'a mut dyn FnMut(SocketAddr) -> io::Result<UdpSocket>;

/// Per-family arrays of bound, nonblocking UDP sockets.
///
/// Socket indices are stable for the pool's lifetime, so a `PoolSlot` taken
/// at selection time still names the same socket when the reply arrives.
pub struct SocketPool {
    sockets: Vec<UdpSocket>,
    v4: Vec<usize>,
    v6: Vec<usize>,
}

impl SocketPool {
    /// Open the pool described by `config`. Individual bind failures are
    /// logged and skipped, but a final count short of the request tears the
    /// partial pool down and fails construction.
    pub fn open(config: &OutboundConfig) -> Result<SocketPool> {
        SocketPool::open_with(config, &mut bind_udp)
    }

    /// `open`, with the socket binding step supplied by the caller.
    pub fn open_with(config: &OutboundConfig, bind: Binder<'_>) -> Result<SocketPool> {
        let mut pool = SocketPool {
            sockets: Vec::new(),
            v4: Vec::new(),
            v6: Vec::new(),
        };

        if config.ip4_enabled {
            let targets = interface_addrs(&config.interfaces, Family::V4)?;
            pool.populate(Family::V4, &targets, config, bind)?;
        }
        if config.ip6_enabled {
            let targets = interface_addrs(&config.interfaces, Family::V6)?;
            pool.populate(Family::V6, &targets, config, bind)?;
        }

        Ok(pool)
    }

    fn populate(
        &mut self,
        family: Family,
        targets: &[IpAddr],
        config: &OutboundConfig,
        bind: Binder<'_>,
    ) -> Result<()> {
        let want = config.ports_per_family;
        let mut base_cursor = config.base_port;
        let mut bound = 0;

        if !targets.is_empty() {
            for attempt in 0..want {
                let ip = targets[attempt % targets.len()];
                let port = base_cursor.unwrap_or(0);

                match bind(SocketAddr::new(ip, port)) {
                    Ok(socket) => {
                        let index = self.sockets.len();
                        self.sockets.push(socket);
                        self.family_list_mut(family).push(index);
                        bound += 1;
                    }
                    Err(e) => {
                        log::warn!("failed to bind {} port on {}: {}", family, ip, e);
                    }
                }

                // The cursor moves whether or not the bind succeeded.
                if let Some(port) = base_cursor {
                    match port.checked_add(1) {
                        Some(next) => base_cursor = Some(next),
                        None => {
                            log::warn!("base port range exhausted at {}", port);
                            break;
                        }
                    }
                }
            }
        }

        if bound != want {
            self.close();
            return Err(PoolError::Shortfall {
                family,
                requested: want,
                bound,
            });
        }
        Ok(())
    }

    fn family_list_mut(&mut self, family: Family) -> &mut Vec<usize> {
        match family {
            Family::V4 => &mut self.v4,
            Family::V6 => &mut self.v6,
        }
    }

    fn family_list(&self, family: Family) -> &[usize] {
        match family {
            Family::V4 => &self.v4,
            Family::V6 => &self.v6,
        }
    }

    /// Pick a uniformly random egress socket of the destination's family.
    pub fn select(&self, dest: &SocketAddr, rng: &mut dyn RngCore) -> Result<PoolSlot> {
        let family = Family::of(&dest.ip());
        let list = self.family_list(family);
        if list.is_empty() {
            return Err(PoolError::NoEgress { family });
        }
        // Clamp so no rounding of the draw can escape the list.
        let index = (rng.next_u32() as usize % list.len()).min(list.len() - 1);
        Ok(PoolSlot(list[index]))
    }

    pub fn socket(&self, slot: PoolSlot) -> Option<&UdpSocket> {
        self.sockets.get(slot.0)
    }

    pub fn len(&self, family: Family) -> usize {
        self.family_list(family).len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Every socket with its slot, for event-loop registration.
    pub fn sockets(&self) -> impl Iterator<Item = (PoolSlot, &UdpSocket)> {
        self.sockets
            .iter()
            .enumerate()
            .map(|(index, socket)| (PoolSlot(index), socket))
    }

    /// Close every socket. The pool is unusable afterwards.
    pub fn close(&mut self) {
        self.sockets.clear();
        self.v4.clear();
        self.v6.clear();
    }
}

/// Resolve the configured interface literals for one family. An empty
/// interface list means the family's wildcard address.
fn interface_addrs(interfaces: &[String], family: Family) -> Result<Vec<IpAddr>> {
    if interfaces.is_empty() {
        let wildcard = match family {
            Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        return Ok(vec![wildcard]);
    }

    let mut addrs = Vec::new();
    for name in interfaces {
        let ip: IpAddr = match name.parse() {
            Ok(ip) => ip,
            Err(_) => {
                return Err(PoolError::Interface { name: name.clone() });
            }
        };
        if Family::of(&ip) == family {
            addrs.push(ip);
        }
    }
    Ok(addrs)
}

/// Bind one nonblocking UDP socket on `addr`, with the domain fixed to the
/// address's family. IPv6 sockets are V6ONLY so the two pools stay disjoint.
fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}
