//! Fragment reassembly and the receive-side reorder buffer, both scoped to a single
//! stream. Plain `BTreeMap`s stand in for a custom ring-buffer/gather-array: a worker
//! owns exactly one `Stream` for the life of its `Connexion`, so
//! there is no contention to optimize away, just bounded memory for buffered-but-not-yet-
//! deliverable data.

use std::collections::BTreeMap;

use crate::constants::HUGE_THRESHOLD;

/// A message's fragments as they arrive, keyed by the first fragment's message id.
/// Ordinary (non-huge) messages are buffered whole here until `Last` arrives; huge
/// messages are never buffered — each fragment is hashed straight through to the caller
/// as `DeliveredMessage { huge_fragment_offset: Some(_), .. }` instead.
pub struct FragmentAssembler {
    total_size: Option<u32>,
    is_huge: bool,
    chunks: BTreeMap<u32, Vec<u8>>,
    received_bytes: usize,
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self { total_size: None, is_huge: false, chunks: BTreeMap::new(), received_bytes: 0 }
    }

    /// Feed the `First` fragment. `announced_total` is the `fragment_field` of a First
    /// fragment, which the wire format overloads as "total reassembled size".
    pub fn start(&mut self, announced_total: u32, payload: &[u8]) {
        self.total_size = Some(announced_total);
        self.is_huge = announced_total as usize > HUGE_THRESHOLD;
        self.received_bytes = payload.len();
        if !self.is_huge {
            self.chunks.insert(0, payload.to_vec());
        }
    }

    pub fn is_huge(&self) -> bool {
        self.is_huge
    }

    /// Feed a `Mid`/`Last` fragment at `offset`. Returns the fully reassembled message
    /// once every byte up to `total_size` has arrived (never fires for a huge message,
    /// whose chunks are delivered individually by the caller instead of through here).
    pub fn feed(&mut self, offset: u32, payload: &[u8], is_last: bool) -> Option<Vec<u8>> {
        self.received_bytes += payload.len();
        if self.is_huge {
            return None;
        }
        self.chunks.insert(offset, payload.to_vec());
        let total = self.total_size?;
        if is_last && self.received_bytes as u32 >= total {
            let mut out = Vec::with_capacity(total as usize);
            for (_, chunk) in self.chunks.iter() {
                out.extend_from_slice(chunk);
            }
            out.truncate(total as usize);
            return Some(out);
        }
        None
    }
}

impl Default for FragmentAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive-side state for one reliable ordered stream: tracks the next id the
/// application expects and buffers anything that arrived ahead of it.
pub struct ReorderBuffer {
    next_expected_id: u32,
    buffered: BTreeMap<u32, Vec<u8>>,
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self { next_expected_id: 0, buffered: BTreeMap::new() }
    }

    pub fn next_expected_id(&self) -> u32 {
        self.next_expected_id
    }

    /// Record that `id` is fully reassembled and ready. Returns `Deliver` if it (and any
    /// already-buffered successors) can go straight to the application now, `Buffered` if
    /// it arrived ahead of `next_expected_id`, or `Duplicate` if it was already delivered.
    pub fn accept(&mut self, id: u32, payload: Vec<u8>) -> Accept {
        use std::cmp::Ordering;
        match id.cmp(&self.next_expected_id) {
            Ordering::Less => Accept::Duplicate,
            Ordering::Equal => {
                let mut ready = vec![payload];
                self.next_expected_id = self.next_expected_id.wrapping_add(1);
                while let Some(next) = self.buffered.remove(&self.next_expected_id) {
                    ready.push(next);
                    self.next_expected_id = self.next_expected_id.wrapping_add(1);
                }
                Accept::Deliver(ready)
            }
            Ordering::Greater => {
                self.buffered.insert(id, payload);
                Accept::Buffered
            }
        }
    }

    /// Ids received out of order, relative to `next_expected_id`, for the ACK trailer's
    /// bitmap — bit `n` set means `next_expected_id + n` has arrived.
    pub fn out_of_order_bitmap(&self, bits: u32) -> u64 {
        let mut bitmap = 0u64;
        for (&id, _) in self.buffered.iter() {
            let delta = id.wrapping_sub(self.next_expected_id);
            if delta >= 1 && delta <= bits as u32 {
                bitmap |= 1u64 << (delta - 1);
            }
        }
        bitmap
    }
}

impl Default for ReorderBuffer {
    fn default() -> Self {
        Self::new()
    }
}

pub enum Accept {
    Deliver(Vec<Vec<u8>>),
    Buffered,
    Duplicate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_delivers_immediately() {
        let mut buf = ReorderBuffer::new();
        match buf.accept(0, b"a".to_vec()) {
            Accept::Deliver(v) => assert_eq!(v, vec![b"a".to_vec()]),
            _ => panic!("expected deliver"),
        }
    }

    #[test]
    fn out_of_order_then_gap_fill_drains_in_order() {
        let mut buf = ReorderBuffer::new();
        assert!(matches!(buf.accept(1, b"b".to_vec()), Accept::Buffered));
        assert!(matches!(buf.accept(2, b"c".to_vec()), Accept::Buffered));
        match buf.accept(0, b"a".to_vec()) {
            Accept::Deliver(v) => assert_eq!(v, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]),
            _ => panic!("expected deliver"),
        }
        assert_eq!(buf.next_expected_id(), 3);
    }

    #[test]
    fn duplicate_below_expected_is_rejected() {
        let mut buf = ReorderBuffer::new();
        buf.accept(0, b"a".to_vec());
        assert!(matches!(buf.accept(0, b"a".to_vec()), Accept::Duplicate));
    }

    #[test]
    fn fragment_reassembly_round_trip() {
        let mut asm = FragmentAssembler::new();
        let whole = vec![7u8; 3000];
        asm.start(3000, &whole[..1000]);
        assert!(asm.feed(1000, &whole[1000..2000], false).is_none());
        let result = asm.feed(2000, &whole[2000..3000], true).unwrap();
        assert_eq!(result, whole);
    }

    #[test]
    fn huge_fragment_never_buffers_chunks() {
        let mut asm = FragmentAssembler::new();
        asm.start((HUGE_THRESHOLD as u32) + 1, &[0u8; 10]);
        assert!(asm.is_huge());
        assert!(asm.feed(10, &[0u8; 10], false).is_none());
    }
}
