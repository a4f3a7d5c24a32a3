//! Send-side acknowledgment bookkeeping for one reliable stream: the unacked set, RTO
//! estimation, and which ids are due for a tick-driven retransmit.

use std::collections::BTreeMap;

use crate::constants::{RTO_CEILING_MS, RTO_FLOOR_MS};

pub struct UnackedMessage {
    pub payload: Vec<u8>,
    pub first_send_ms: i64,
    pub last_send_ms: i64,
    pub retry_count: u32,
}

/// Tracks messages sent-but-not-yet-acknowledged on one stream, plus the smoothed RTT
/// estimate used to size the retransmit timeout.
pub struct UnackedSet {
    entries: BTreeMap<u32, UnackedMessage>,
    smoothed_rtt_ms: i64,
}

impl UnackedSet {
    pub fn new() -> Self {
        Self { entries: BTreeMap::new(), smoothed_rtt_ms: RTO_FLOOR_MS as i64 }
    }

    pub fn record_sent(&mut self, id: u32, payload: Vec<u8>, now_ms: i64) {
        self.entries.insert(id, UnackedMessage { payload, first_send_ms: now_ms, last_send_ms: now_ms, retry_count: 0 });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Retire every id up to and including `base_id` (contiguous-delivered ack, `None`
    /// if the peer hasn't contiguously delivered anything on this stream yet) plus any
    /// explicitly called out in `acked_extra` (bits set in the peer's out-of-order
    /// bitmap), feeding each retirement's round-trip time into the smoothed estimate.
    pub fn apply_ack(&mut self, base_id: Option<u32>, acked_extra: &[u32], now_ms: i64) -> AckOutcome {
        let mut acked_count = 0u32;
        let retiring: Vec<u32> = self
            .entries
            .keys()
            .copied()
            .filter(|&id| base_id.map(|b| id <= b).unwrap_or(false) || acked_extra.contains(&id))
            .collect();
        for id in retiring {
            if let Some(msg) = self.entries.remove(&id) {
                let sample = (now_ms - msg.first_send_ms).max(0);
                self.smoothed_rtt_ms = (7 * self.smoothed_rtt_ms + sample) / 8;
                acked_count += 1;
            }
        }
        AckOutcome { acked_count, smoothed_rtt_ms: self.smoothed_rtt_ms }
    }

    pub fn rto_ms(&self) -> i64 {
        (2 * self.smoothed_rtt_ms).clamp(RTO_FLOOR_MS as i64, RTO_CEILING_MS as i64)
    }

    /// Ids whose last send is older than the current RTO and so are due for retransmit,
    /// along with their bumped retry counts. Callers that exceed `max_retries` on any
    /// entry should disconnect; this function only reports the candidates.
    pub fn due_for_retransmit(&mut self, now_ms: i64) -> Vec<(u32, Vec<u8>, u32)> {
        let rto = self.rto_ms();
        let mut due = Vec::new();
        for (&id, msg) in self.entries.iter_mut() {
            if now_ms - msg.last_send_ms >= rto {
                msg.last_send_ms = now_ms;
                msg.retry_count += 1;
                due.push((id, msg.payload.clone(), msg.retry_count));
            }
        }
        due
    }

    pub fn max_retry_count(&self) -> u32 {
        self.entries.values().map(|m| m.retry_count).max().unwrap_or(0)
    }

    /// Unconditionally retransmit specific ids now, ahead of their RTO, because the
    /// peer's ack trailer already proved them missing. Bumps `retry_count` and resets
    /// `last_send_ms` the same as an RTO-driven retransmit would, so the RTO timer for
    /// the same id doesn't immediately fire again right behind this one.
    pub fn force_retransmit(&mut self, ids: &[u32], now_ms: i64) -> Vec<(u32, Vec<u8>, u32)> {
        let mut out = Vec::new();
        for &id in ids {
            if let Some(msg) = self.entries.get_mut(&id) {
                msg.last_send_ms = now_ms;
                msg.retry_count += 1;
                out.push((id, msg.payload.clone(), msg.retry_count));
            }
        }
        out
    }
}

/// Ids strictly between `base` and the highest id in `acked_extra` that aren't
/// themselves in `acked_extra`: positions the peer's out-of-order bitmap proves are
/// missing, since something sent after them already arrived. Used to fast-retransmit
/// a gap instead of waiting for its RTO.
pub fn implied_gap_ids(base: u32, acked_extra: &[u32]) -> Vec<u32> {
    let Some(&max_extra) = acked_extra.iter().max() else {
        return Vec::new();
    };
    let mut gaps = Vec::new();
    let mut id = base.wrapping_add(1);
    while id != max_extra {
        if !acked_extra.contains(&id) {
            gaps.push(id);
        }
        id = id.wrapping_add(1);
    }
    gaps
}

impl Default for UnackedSet {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AckOutcome {
    pub acked_count: u32,
    pub smoothed_rtt_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_retires_contiguous_range() {
        let mut set = UnackedSet::new();
        set.record_sent(0, b"a".to_vec(), 0);
        set.record_sent(1, b"b".to_vec(), 0);
        set.record_sent(2, b"c".to_vec(), 0);
        let outcome = set.apply_ack(Some(1), &[], 100);
        assert_eq!(outcome.acked_count, 2);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn nack_bit_retransmits_immediately_via_due_check() {
        let mut set = UnackedSet::new();
        set.record_sent(5, b"x".to_vec(), 0);
        // not yet due
        assert!(set.due_for_retransmit(10).is_empty());
        // past RTO floor
        assert!(!set.due_for_retransmit(1000).is_empty());
    }

    #[test]
    fn rto_is_bounded() {
        let set = UnackedSet::new();
        assert!(set.rto_ms() >= RTO_FLOOR_MS as i64);
        assert!(set.rto_ms() <= RTO_CEILING_MS as i64);
    }

    #[test]
    fn force_retransmit_bumps_retry_and_ignores_unknown_ids() {
        let mut set = UnackedSet::new();
        set.record_sent(3, b"x".to_vec(), 0);
        let out = set.force_retransmit(&[3, 99], 50);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, 3);
        assert_eq!(out[0].2, 1);
        let out2 = set.force_retransmit(&[3], 100);
        assert_eq!(out2[0].2, 2);
    }

    #[test]
    fn implied_gap_ids_finds_the_hole_between_base_and_highest_extra() {
        let gaps = implied_gap_ids(10, &[12, 13]);
        assert_eq!(gaps, vec![11]);
    }

    #[test]
    fn implied_gap_ids_empty_with_no_out_of_order_acks() {
        assert!(implied_gap_ids(10, &[]).is_empty());
    }
}
