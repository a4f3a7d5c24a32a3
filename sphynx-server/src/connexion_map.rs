//! Server-side connection map: a fixed-size open-addressed hash table keyed by peer
//! address, plus a parallel flood table used to throttle repeated handshake attempts
//! from the same source before a `Connexion` exists for it. Sized and thresholded the
//! same as the table this is grounded on; randomized per-process salts make the hash
//! unpredictable to an off-path attacker trying to engineer collisions. The primary
//! table salt and the flood table's salt are independent, mirroring the `_port_salt`/
//! `_flood_salt` split in the table this is grounded on: the flood table keys on the
//! remote IP only, never the port, so a flood attempt that varies its source port
//! still lands in one bucket per IP.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;
use rand::RngCore;

use sphynx_proto::constants::{CONNECTION_FLOOD_THRESHOLD, HASH_TABLE_SIZE, MAX_POPULATION};
use sphynx_proto::Connexion;

fn addr_bytes(addr: &SocketAddr) -> Vec<u8> {
    match addr {
        SocketAddr::V4(a) => {
            let mut v = a.ip().octets().to_vec();
            v.extend_from_slice(&a.port().to_be_bytes());
            v
        }
        SocketAddr::V6(a) => {
            let mut v = a.ip().octets().to_vec();
            v.extend_from_slice(&a.port().to_be_bytes());
            v
        }
    }
}

fn ip_only_bytes(addr: &SocketAddr) -> Vec<u8> {
    match addr {
        SocketAddr::V4(a) => a.ip().octets().to_vec(),
        SocketAddr::V6(a) => a.ip().octets().to_vec(),
    }
}

/// Distance (in probe steps) an entry is from its ideal bucket, wrapping at the table size.
fn probe_distance(ideal: usize, idx: usize) -> usize {
    (idx + HASH_TABLE_SIZE - ideal) % HASH_TABLE_SIZE
}

/// Whether `k` lies cyclically in `(i, j]`, the condition Knuth's Algorithm R6.4 uses to
/// decide whether the entry at `j` can be shifted back into the hole at `i` without
/// breaking its own probe chain.
fn cyclic_in_open_closed_range(i: usize, k: usize, j: usize) -> bool {
    if i <= j {
        i < k && k <= j
    } else {
        k <= j || k > i
    }
}

struct Slot {
    addr: SocketAddr,
    conn: Connexion,
    /// Number of linear-probe steps it took to land here from its ideal bucket.
    collision: u8,
}

struct Table {
    slots: Vec<Option<Slot>>,
    flood: Vec<u8>,
    count: usize,
}

impl Table {
    /// Linear-probes from `ideal` looking for `addr`, stopping at the first empty
    /// slot (an empty slot means `addr` was never inserted, since insert always
    /// claims the first empty slot it finds along the same probe sequence).
    fn probe_find(&self, ideal: usize, addr: &SocketAddr) -> Option<usize> {
        for step in 0..HASH_TABLE_SIZE {
            let idx = (ideal + step) % HASH_TABLE_SIZE;
            match &self.slots[idx] {
                Some(s) if s.addr == *addr => return Some(idx),
                None => return None,
                Some(_) => continue,
            }
        }
        None
    }

    /// Linear-probes from `ideal` looking for the first empty slot to claim.
    fn probe_insert(&self, ideal: usize) -> Option<(usize, u8)> {
        for step in 0..HASH_TABLE_SIZE {
            let idx = (ideal + step) % HASH_TABLE_SIZE;
            if self.slots[idx].is_none() {
                return Some((idx, step.min(u8::MAX as usize) as u8));
            }
        }
        None
    }

    /// Removes `addr` and closes the gap with backward-shift deletion instead of
    /// leaving a plain `None` behind. A bare clear would truncate the probe chain for
    /// every entry inserted past this bucket under a collision, making them
    /// unreachable by `probe_find`. `hash_fn` recomputes a slot's ideal bucket so the
    /// chain can be walked and repacked without the table needing to know about salts.
    fn remove(&mut self, ideal: usize, addr: &SocketAddr, hash_fn: impl Fn(&SocketAddr) -> usize) -> Option<Connexion> {
        let found_idx = self.probe_find(ideal, addr)?;
        self.count -= 1;
        let removed = self.slots[found_idx].take().map(|s| s.conn);
        self.close_gap(found_idx, hash_fn);
        removed
    }

    /// Knuth's Algorithm R6.4: walk forward from the freshly emptied `hole`, and for
    /// each occupied slot found before the next empty one, shift it back into the hole
    /// if doing so wouldn't put it before its own ideal bucket. Stops at the first
    /// empty slot, which is the natural end of the probe chain.
    fn close_gap(&mut self, mut hole: usize, hash_fn: impl Fn(&SocketAddr) -> usize) {
        let mut j = hole;
        loop {
            j = (j + 1) % HASH_TABLE_SIZE;
            let Some(slot_addr) = self.slots[j].as_ref().map(|s| s.addr) else { break };
            let ideal = hash_fn(&slot_addr);
            if cyclic_in_open_closed_range(hole, ideal, j) {
                continue;
            }
            let mut moved = self.slots[j].take();
            if let Some(m) = moved.as_mut() {
                m.collision = probe_distance(ideal, hole).min(u8::MAX as usize) as u8;
            }
            self.slots[hole] = moved;
            hole = j;
        }
    }
}

pub struct ConnexionMap {
    salt: u64,
    ip_salt: u64,
    table: RwLock<Table>,
    is_shutdown: AtomicU32,
}

pub enum LookupResult<'a> {
    Found(parking_lot::MappedRwLockReadGuard<'a, Connexion>),
    NotFound,
    Flooded,
}

impl ConnexionMap {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(HASH_TABLE_SIZE);
        slots.resize_with(HASH_TABLE_SIZE, || None);
        Self {
            salt: rand::thread_rng().next_u64(),
            ip_salt: rand::thread_rng().next_u64(),
            table: RwLock::new(Table { slots, flood: vec![0u8; HASH_TABLE_SIZE], count: 0 }),
            is_shutdown: AtomicU32::new(0),
        }
    }

    fn hash(&self, addr: &SocketAddr) -> usize {
        let bytes = addr_bytes(addr);
        let h = sphynx_crypto::hash::hash(&[&self.salt.to_le_bytes(), bytes.as_slice()]);
        let mut idx = [0u8; 8];
        idx.copy_from_slice(&h[..8]);
        (u64::from_le_bytes(idx) as usize) & (HASH_TABLE_SIZE - 1)
    }

    /// Hash of the remote IP alone, salted independently of `hash`, so the flood
    /// counter tracks a source address regardless of which port it attacks from.
    fn flood_hash(&self, addr: &SocketAddr) -> usize {
        let bytes = ip_only_bytes(addr);
        let h = sphynx_crypto::hash::hash(&[&self.ip_salt.to_le_bytes(), bytes.as_slice()]);
        let mut idx = [0u8; 8];
        idx.copy_from_slice(&h[..8]);
        (u64::from_le_bytes(idx) as usize) & (HASH_TABLE_SIZE - 1)
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::Acquire) != 0
    }

    pub fn count(&self) -> usize {
        self.table.read().count
    }

    /// Looks up an established connection by peer address. When none exists, bumps
    /// the flood counter for that slot and reports whether the threshold has now
    /// been crossed, so the caller (handshake processing) can start dropping that
    /// source's HELLOs instead of minting a fresh cookie for every one.
    pub fn lookup_check_flood(&self, addr: &SocketAddr) -> LookupResult<'_> {
        let ideal = self.hash(addr);
        {
            let guard = self.table.read();
            if let Some(found_idx) = guard.probe_find(ideal, addr) {
                return parking_lot::RwLockReadGuard::try_map(guard, |t| match &t.slots[found_idx] {
                    Some(s) if s.addr == *addr => Some(&s.conn),
                    _ => None,
                })
                .map(LookupResult::Found)
                .unwrap_or(LookupResult::NotFound);
            }
        }
        let flood_idx = self.flood_hash(addr);
        let mut guard = self.table.write();
        let count = guard.flood[flood_idx].saturating_add(1);
        guard.flood[flood_idx] = count;
        if count >= CONNECTION_FLOOD_THRESHOLD {
            LookupResult::Flooded
        } else {
            LookupResult::NotFound
        }
    }

    pub fn lookup(&self, addr: &SocketAddr) -> Option<parking_lot::MappedRwLockReadGuard<'_, Connexion>> {
        let ideal = self.hash(addr);
        let guard = self.table.read();
        let found_idx = guard.probe_find(ideal, addr)?;
        parking_lot::RwLockReadGuard::try_map(guard, |t| match &t.slots[found_idx] {
            Some(s) if s.addr == *addr => Some(&s.conn),
            _ => None,
        })
        .ok()
    }

    pub fn lookup_mut(&self, addr: &SocketAddr) -> Option<parking_lot::MappedRwLockWriteGuard<'_, Connexion>> {
        let ideal = self.hash(addr);
        let guard = self.table.write();
        let found_idx = guard.probe_find(ideal, addr)?;
        parking_lot::RwLockWriteGuard::try_map(guard, |t| match &mut t.slots[found_idx] {
            Some(s) if s.addr == *addr => Some(&mut s.conn),
            _ => None,
        })
        .ok()
    }

    /// Fails closed with `false` once the table is at `MAX_POPULATION`, which is
    /// deliberately half of `HASH_TABLE_SIZE` so linear probing never has to walk far
    /// through a mostly-full table under load.
    pub fn insert(&self, addr: SocketAddr, conn: Connexion) -> bool {
        let ideal = self.hash(&addr);
        let flood_idx = self.flood_hash(&addr);
        let mut guard = self.table.write();
        if guard.count >= MAX_POPULATION {
            return false;
        }
        let Some((idx, collision)) = guard.probe_insert(ideal) else {
            return false;
        };
        guard.slots[idx] = Some(Slot { addr, conn, collision });
        guard.flood[flood_idx] = 0;
        guard.count += 1;
        true
    }

    pub fn remove(&self, addr: &SocketAddr) -> Option<Connexion> {
        let ideal = self.hash(addr);
        let mut guard = self.table.write();
        guard.remove(ideal, addr, |a| self.hash(a))
    }

    pub fn shutdown_all(&self) -> Vec<(SocketAddr, Connexion)> {
        self.is_shutdown.store(1, Ordering::Release);
        let mut guard = self.table.write();
        guard.count = 0;
        guard.slots.drain(..).flatten().map(|s| (s.addr, s.conn)).collect()
    }

    /// Drains one flood-counter tick off every occupied bucket; call roughly once a
    /// second from the server's background loop.
    pub fn decay_flood_counters(&self) {
        let mut guard = self.table.write();
        for v in guard.flood.iter_mut() {
            if *v > 0 {
                *v -= 1;
            }
        }
    }

    /// Deepest linear-probe chain currently in the table; useful as a load-shedding
    /// signal well before `MAX_POPULATION` is actually reached.
    pub fn max_collision_depth(&self) -> u8 {
        self.table.read().slots.iter().flatten().map(|s| s.collision).max().unwrap_or(0)
    }

    pub fn for_each_mut(&self, mut f: impl FnMut(&SocketAddr, &mut Connexion)) {
        let mut guard = self.table.write();
        for slot in guard.slots.iter_mut().flatten() {
            f(&slot.addr, &mut slot.conn);
        }
    }
}

impl Default for ConnexionMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sphynx_crypto::secret::Secret;
    use sphynx_crypto::stream::SessionCipher;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    fn dummy_connexion(peer: SocketAddr) -> Connexion {
        let key = Secret::new([7u8; 32]);
        Connexion::new(peer, SessionCipher::new(&key), SessionCipher::new(&key), 0)
    }

    #[test]
    fn insert_then_lookup_finds_it() {
        let map = ConnexionMap::new();
        let a = addr(9000);
        assert!(map.insert(a, dummy_connexion(a)));
        assert!(map.lookup(&a).is_some());
        assert_eq!(map.count(), 1);
    }

    #[test]
    fn lookup_of_unknown_address_increments_flood_counter() {
        let map = ConnexionMap::new();
        let a = addr(9001);
        for _ in 0..(CONNECTION_FLOOD_THRESHOLD - 1) {
            assert!(matches!(map.lookup_check_flood(&a), LookupResult::NotFound));
        }
        assert!(matches!(map.lookup_check_flood(&a), LookupResult::Flooded));
    }

    #[test]
    fn flood_counter_is_keyed_by_ip_not_port() {
        let map = ConnexionMap::new();
        let base_port = 9100u16;
        for step in 0..(CONNECTION_FLOOD_THRESHOLD as u16 - 1) {
            let a = addr(base_port + step);
            assert!(matches!(map.lookup_check_flood(&a), LookupResult::NotFound));
        }
        let last = addr(base_port + CONNECTION_FLOOD_THRESHOLD as u16 - 1);
        assert!(matches!(map.lookup_check_flood(&last), LookupResult::Flooded));
    }

    #[test]
    fn remove_clears_the_slot() {
        let map = ConnexionMap::new();
        let a = addr(9002);
        map.insert(a, dummy_connexion(a));
        assert!(map.remove(&a).is_some());
        assert!(map.lookup(&a).is_none());
        assert_eq!(map.count(), 0);
    }

    #[test]
    fn remove_preserves_probe_chain_for_later_entries() {
        let mut slots = Vec::with_capacity(HASH_TABLE_SIZE);
        slots.resize_with(HASH_TABLE_SIZE, || None);
        let mut table = Table { slots, flood: vec![0u8; HASH_TABLE_SIZE], count: 0 };

        let ideal = 200usize;
        let a0 = addr(9200);
        let a1 = addr(9201);
        let a2 = addr(9202);

        let hash_fn = |a: &SocketAddr| -> usize {
            match a.port() {
                9200 | 9201 | 9202 => ideal,
                _ => unreachable!(),
            }
        };

        table.slots[ideal] = Some(Slot { addr: a0, conn: dummy_connexion(a0), collision: 0 });
        table.slots[ideal + 1] = Some(Slot { addr: a1, conn: dummy_connexion(a1), collision: 1 });
        table.slots[ideal + 2] = Some(Slot { addr: a2, conn: dummy_connexion(a2), collision: 2 });
        table.count = 3;

        assert!(table.remove(ideal, &a1, hash_fn).is_some());
        assert!(
            table.probe_find(ideal, &a2).is_some(),
            "a2 must stay reachable once a1's slot is reclaimed"
        );
    }

    #[test]
    fn shutdown_all_drains_every_connexion() {
        let map = ConnexionMap::new();
        for port in 9003..9006 {
            let a = addr(port);
            map.insert(a, dummy_connexion(a));
        }
        let drained = map.shutdown_all();
        assert_eq!(drained.len(), 3);
        assert!(map.is_shutdown());
        assert_eq!(map.count(), 0);
    }
}
