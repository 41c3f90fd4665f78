//! In-flight query records
//!
//! Every submitted query becomes a `Pending`: its transaction id, the server
//! it was sent to, the egress socket it left through, its deadline, and the
//! completion to invoke when a reply or timeout arrives. All records live in
//! a generational arena (`PendingStore`); the keyed index and the timer heap
//! refer to them through `QueryHandle`s rather than references, and the
//! generation bump on removal turns any handle that outlives its record into
//! a no-op instead of a use-after-free.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;

use crate::dns::key::QueryKey;
use crate::dns::outbound::Completion;
use crate::dns::socket_pool::PoolSlot;

/// Stable handle to a `Pending` in the store. Stale handles (the record was
/// removed, or the slot was reused) simply fail to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryHandle {
    index: u32,
    generation: u32,
}

/// One in-flight query awaiting its reply or timeout.
pub struct Pending {
    pub(crate) id: u16,
    pub(crate) addr: SocketAddr,
    pub(crate) slot: Option<PoolSlot>,
    pub(crate) deadline: Instant,
    pub(crate) on_done: Option<Completion>,
}

impl Pending {
    pub fn new(addr: SocketAddr, now: Instant, on_done: Completion) -> Pending {
        Pending {
            id: 0,
            addr,
            slot: None,
            deadline: now,
            on_done: Some(on_done),
        }
    }

    pub fn key(&self) -> QueryKey {
        QueryKey::new(self.id, self.addr)
    }
}

struct Slot {
    generation: u32,
    value: Option<Pending>,
}

/// Arena owning every live `Pending`.
pub struct PendingStore {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl PendingStore {
    pub fn new() -> PendingStore {
        PendingStore {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn insert(&mut self, pending: Pending) -> QueryHandle {
        self.live += 1;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.value = Some(pending);
                QueryHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    value: Some(pending),
                });
                QueryHandle {
                    index,
                    generation: 0,
                }
            }
        }
    }

    pub fn get(&self, handle: QueryHandle) -> Option<&Pending> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: QueryHandle) -> Option<&mut Pending> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    /// Remove a record, retiring the handle. Later lookups with the same
    /// handle return `None` even after the slot is reused.
    pub fn remove(&mut self, handle: QueryHandle) -> Option<Pending> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation || slot.value.is_none() {
            return None;
        }
        let pending = slot.value.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.live -= 1;
        pending
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Drop every record without invoking completions. Used by shutdown.
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.value.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.live = 0;
    }
}

impl Default for PendingStore {
    fn default() -> PendingStore {
        PendingStore::new()
    }
}

/// Ordered index of live queries, keyed by the full (id, address) tuple.
pub struct PendingIndex {
    map: BTreeMap<QueryKey, QueryHandle>,
}

impl PendingIndex {
    pub fn new() -> PendingIndex {
        PendingIndex {
            map: BTreeMap::new(),
        }
    }

    /// Insert a key, refusing collisions. The caller reacts to `false` by
    /// drawing a fresh transaction id and retrying.
    pub fn insert(&mut self, key: QueryKey, handle: QueryHandle) -> bool {
        use std::collections::btree_map::Entry;

        match self.map.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(handle);
                true
            }
        }
    }

    pub fn lookup(&self, key: &QueryKey) -> Option<QueryHandle> {
        self.map.get(key).copied()
    }

    pub fn remove(&mut self, key: &QueryKey) -> Option<QueryHandle> {
        self.map.remove(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

impl Default for PendingIndex {
    fn default() -> PendingIndex {
        PendingIndex::new()
    }
}
