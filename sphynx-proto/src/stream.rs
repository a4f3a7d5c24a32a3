//! Per-stream send/receive state: send queue with id assignment and fragmentation,
//! reorder buffer, fragment reassembly, and the unacked set. One `Stream` exists per
//! direction-independent channel index in `0..N_STREAMS`; `UNRELIABLE_STREAM` uses the
//! same type but never touches `unacked`/`reorder`.

use std::collections::{BTreeMap, VecDeque};

use crate::ack::UnackedSet;
use crate::constants::{DEFAULT_MTU, ID_WIRE_MASK};
use crate::reorder::{Accept, FragmentAssembler, ReorderBuffer};
use crate::wire::{FragmentKind, MessageKind, UnfragmentedKind};

/// One outgoing message queued for a reliable stream, possibly needing fragmentation.
pub struct QueuedMessage {
    pub id: u32,
    pub payload: Vec<u8>,
}

/// One wire-ready piece to place into the next outgoing datagram: either a whole
/// unfragmented message or one fragment of a larger one.
pub struct OutgoingPiece {
    pub id: Option<u32>,
    pub kind: MessageKind,
    pub fragment_field: Option<u32>,
    pub payload: Vec<u8>,
}

pub struct Stream {
    is_reliable: bool,
    next_send_id: u32,
    send_queue: VecDeque<QueuedMessage>,
    pub unacked: UnackedSet,
    reorder: ReorderBuffer,
    in_progress_fragments: BTreeMap<u32, FragmentAssembler>,
}

impl Stream {
    pub fn new(is_reliable: bool) -> Self {
        Self {
            is_reliable,
            next_send_id: 0,
            send_queue: VecDeque::new(),
            unacked: UnackedSet::new(),
            reorder: ReorderBuffer::new(),
            in_progress_fragments: BTreeMap::new(),
        }
    }

    pub fn is_reliable(&self) -> bool {
        self.is_reliable
    }

    pub fn next_expected_id(&self) -> u32 {
        self.reorder.next_expected_id()
    }

    pub fn out_of_order_bitmap(&self, bits: u32) -> u64 {
        self.reorder.out_of_order_bitmap(bits)
    }

    /// Queue an application write. Reliable streams assign the next id; the unreliable
    /// stream has none and is never retransmitted.
    pub fn write(&mut self, payload: Vec<u8>) -> Option<u32> {
        if self.is_reliable {
            let id = self.next_send_id;
            self.next_send_id = self.next_send_id.wrapping_add(1) & ID_WIRE_MASK;
            self.send_queue.push_back(QueuedMessage { id, payload });
            Some(id)
        } else {
            self.send_queue.push_back(QueuedMessage { id: 0, payload });
            None
        }
    }

    pub fn has_pending_send(&self) -> bool {
        !self.send_queue.is_empty()
    }

    /// Pop the front queued message and split it into wire-ready pieces that each fit
    /// `mtu_budget` bytes of payload, marking the first fragment "huge" when the whole
    /// message exceeds `HUGE_THRESHOLD` (checked by the caller via `fragment_field`).
    pub fn pop_fragmented(&mut self, mtu_budget: usize, huge_threshold: usize, now_ms: i64) -> Option<Vec<OutgoingPiece>> {
        let msg = self.send_queue.pop_front()?;
        if self.is_reliable {
            self.unacked.record_sent(msg.id, msg.payload.clone(), now_ms);
        }
        let id = if self.is_reliable { Some(msg.id) } else { None };
        Some(split_into_pieces(id, self.is_reliable, msg.payload, mtu_budget, huge_threshold))
    }

    /// Re-split a previously sent reliable payload for retransmission. A payload
    /// recorded in the unacked set is always whole; it must be re-fragmented the same
    /// way the original send would have been, never resent as one oversized piece.
    pub fn split_for_retransmit(id: u32, payload: Vec<u8>, mtu_budget: usize, huge_threshold: usize) -> Vec<OutgoingPiece> {
        split_into_pieces(Some(id), true, payload, mtu_budget, huge_threshold)
    }

    /// Feed one received unfragmented message. Returns the payloads (in delivery order)
    /// ready for the application, accounting for reorder-buffer drains on reliable
    /// streams; unreliable data is always returned immediately as a single-element vec.
    pub fn receive_unfragmented(&mut self, id: Option<u32>, payload: Vec<u8>) -> Vec<Vec<u8>> {
        match id {
            Some(id) if self.is_reliable => match self.reorder.accept(id, payload) {
                Accept::Deliver(msgs) => msgs,
                Accept::Buffered | Accept::Duplicate => Vec::new(),
            },
            _ => vec![payload],
        }
    }

    /// Feed one received fragment. `message_id` keys the in-progress reassembly; for a
    /// huge message, `(offset, payload, is_last)` is the caller's cue to deliver this
    /// fragment directly rather than waiting for reassembly.
    pub fn receive_fragment(
        &mut self,
        message_id: u32,
        kind: FragmentKind,
        fragment_field: u32,
        payload: &[u8],
    ) -> FragmentOutcome {
        let assembler = self.in_progress_fragments.entry(message_id).or_insert_with(FragmentAssembler::new);
        match kind {
            FragmentKind::First { huge } => {
                assembler.start(fragment_field, payload);
                if huge {
                    FragmentOutcome::HugeChunk { offset: 0, payload: payload.to_vec(), is_last: false }
                } else {
                    FragmentOutcome::Pending
                }
            }
            FragmentKind::Mid | FragmentKind::Last => {
                let is_last = matches!(kind, FragmentKind::Last);
                if assembler.is_huge() {
                    assembler.feed(fragment_field, payload, is_last);
                    if is_last {
                        self.in_progress_fragments.remove(&message_id);
                    }
                    FragmentOutcome::HugeChunk { offset: fragment_field, payload: payload.to_vec(), is_last }
                } else if let Some(whole) = assembler.feed(fragment_field, payload, is_last) {
                    self.in_progress_fragments.remove(&message_id);
                    let delivered = if self.is_reliable {
                        match self.reorder.accept(message_id, whole) {
                            Accept::Deliver(msgs) => msgs,
                            Accept::Buffered | Accept::Duplicate => Vec::new(),
                        }
                    } else {
                        vec![whole]
                    };
                    FragmentOutcome::Complete(delivered)
                } else {
                    FragmentOutcome::Pending
                }
            }
        }
    }
}

/// Split `payload` into wire-ready pieces no larger than `mtu_budget`, used both for a
/// fresh send (`pop_fragmented`) and for retransmitting an already-sent reliable
/// message (`split_for_retransmit`) so a retransmit never exceeds the MTU regardless of
/// how large the original write was.
fn split_into_pieces(id: Option<u32>, is_reliable: bool, payload: Vec<u8>, mtu_budget: usize, huge_threshold: usize) -> Vec<OutgoingPiece> {
    let budget = mtu_budget.max(64);
    if payload.len() <= budget {
        return vec![OutgoingPiece {
            id,
            kind: if is_reliable {
                MessageKind::Unfragmented(UnfragmentedKind::Data)
            } else {
                MessageKind::Unfragmented(UnfragmentedKind::Unreliable)
            },
            fragment_field: None,
            payload,
        }];
    }

    let total_len = payload.len();
    let huge = total_len > huge_threshold;
    let mut pieces = Vec::new();
    let mut offset = 0usize;
    let mut first = true;
    while offset < total_len {
        let end = (offset + budget).min(total_len);
        let is_last = end == total_len;
        let chunk = payload[offset..end].to_vec();
        let kind = if first {
            MessageKind::Fragment(FragmentKind::First { huge })
        } else if is_last {
            MessageKind::Fragment(FragmentKind::Last)
        } else {
            MessageKind::Fragment(FragmentKind::Mid)
        };
        let fragment_field = if first { total_len as u32 } else { offset as u32 };
        pieces.push(OutgoingPiece { id, kind, fragment_field: Some(fragment_field), payload: chunk });
        offset = end;
        first = false;
    }
    pieces
}

pub enum FragmentOutcome {
    Pending,
    Complete(Vec<Vec<u8>>),
    HugeChunk { offset: u32, payload: Vec<u8>, is_last: bool },
}

pub const DEFAULT_FRAGMENT_PAYLOAD_BUDGET: usize = DEFAULT_MTU - 1 - 3 - 4 - 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_write_is_not_fragmented() {
        let mut s = Stream::new(true);
        s.write(b"hi".to_vec());
        let pieces = s.pop_fragmented(1000, 65536, 0).unwrap();
        assert_eq!(pieces.len(), 1);
        assert!(matches!(pieces[0].kind, MessageKind::Unfragmented(UnfragmentedKind::Data)));
    }

    #[test]
    fn large_write_splits_into_first_mid_last() {
        let mut s = Stream::new(true);
        s.write(vec![1u8; 250]);
        let pieces = s.pop_fragmented(100, 65536, 0).unwrap();
        assert!(pieces.len() >= 3);
        assert!(matches!(pieces[0].kind, MessageKind::Fragment(FragmentKind::First { huge: false })));
        assert!(matches!(pieces.last().unwrap().kind, MessageKind::Fragment(FragmentKind::Last)));
    }

    #[test]
    fn unreliable_write_has_no_id() {
        let mut s = Stream::new(false);
        s.write(b"boop".to_vec());
        let pieces = s.pop_fragmented(1000, 65536, 0).unwrap();
        assert_eq!(pieces[0].id, None);
    }

    #[test]
    fn retransmit_of_oversized_payload_is_refragmented() {
        let payload = vec![9u8; 250];
        let pieces = Stream::split_for_retransmit(4, payload.clone(), 100, 65536);
        assert!(pieces.len() >= 3);
        assert!(pieces.iter().all(|p| p.payload.len() <= 100));
        assert!(pieces.iter().all(|p| p.id == Some(4)));
        assert!(matches!(pieces[0].kind, MessageKind::Fragment(FragmentKind::First { huge: false })));
        assert!(matches!(pieces.last().unwrap().kind, MessageKind::Fragment(FragmentKind::Last)));
    }
}
