//! Epoch-based leaky-bucket send budget with RTT/loss-driven bandwidth adaptation.

use crate::constants::{
    DEFAULT_BANDWIDTH_HIGH_BPS, DEFAULT_BANDWIDTH_LOW_BPS, DEFAULT_TICK_INTERVAL_MS,
    FC_ADDITIVE_INCREASE_BPS, FC_LOSS_RATE_DECREASE_THRESHOLD, FC_RTT_DECREASE_THRESHOLD_MS,
};

const SAMPLE_WINDOW: usize = 8;

#[derive(Clone, Copy)]
struct Sample {
    rtt_ms: i64,
    nacks: u32,
    acked: u32,
}

/// Fixed-capacity ring of recent ACK samples; oldest is overwritten once full.
struct SampleRing {
    buf: [Sample; SAMPLE_WINDOW],
    len: usize,
    next: usize,
}

impl SampleRing {
    fn new() -> Self {
        Self { buf: [Sample { rtt_ms: 0, nacks: 0, acked: 0 }; SAMPLE_WINDOW], len: 0, next: 0 }
    }

    fn push(&mut self, sample: Sample) {
        self.buf[self.next] = sample;
        self.next = (self.next + 1) % SAMPLE_WINDOW;
        if self.len < SAMPLE_WINDOW {
            self.len += 1;
        }
    }

    fn median_rtt_ms(&self) -> Option<i64> {
        if self.len == 0 {
            return None;
        }
        let mut rtts: Vec<i64> = self.buf[..self.len].iter().map(|s| s.rtt_ms).collect();
        rtts.sort_unstable();
        Some(rtts[rtts.len() / 2])
    }

    fn loss_rate(&self) -> f64 {
        if self.len == 0 {
            return 0.0;
        }
        let (nacks, acked): (u32, u32) = self.buf[..self.len]
            .iter()
            .fold((0, 0), |(n, a), s| (n + s.nacks, a + s.acked));
        let total = nacks + acked;
        if total == 0 {
            0.0
        } else {
            nacks as f64 / total as f64
        }
    }
}

/// Per-Connexion send budget. One mutex protects `available_bytes`/`last_update_time`
/// in the caller (see `connexion.rs`); the sample ring here is only ever touched from
/// that same owning worker, so it needs no locking of its own.
pub struct FlowControl {
    bandwidth_low_limit_bps: u64,
    bandwidth_high_limit_bps: u64,
    current_bps: u64,
    available_bytes: i64,
    last_update_ms: i64,
    samples: SampleRing,
}

impl FlowControl {
    pub fn new(now_ms: i64) -> Self {
        Self::with_limits(DEFAULT_BANDWIDTH_LOW_BPS, DEFAULT_BANDWIDTH_HIGH_BPS, now_ms)
    }

    pub fn with_limits(low_bps: u64, high_bps: u64, now_ms: i64) -> Self {
        Self {
            bandwidth_low_limit_bps: low_bps,
            bandwidth_high_limit_bps: high_bps,
            current_bps: low_bps,
            available_bytes: 0,
            last_update_ms: now_ms,
            samples: SampleRing::new(),
        }
    }

    fn bytes_per_tick_max(&self) -> i64 {
        (self.current_bps as i64 * DEFAULT_TICK_INTERVAL_MS as i64) / 1000
    }

    /// Refill the bucket for elapsed time and return how many bytes may be sent now.
    pub fn remaining_bytes(&mut self, now_ms: i64) -> i64 {
        let elapsed_ms = (now_ms - self.last_update_ms).max(0);
        self.last_update_ms = now_ms;
        let refill = (elapsed_ms * self.current_bps as i64) / 1000;
        let cap = self.bytes_per_tick_max();
        self.available_bytes = (self.available_bytes + refill).min(cap);
        self.available_bytes
    }

    pub fn on_packet_send(&mut self, bytes: usize) {
        let floor = -self.bytes_per_tick_max();
        self.available_bytes = (self.available_bytes - bytes as i64).max(floor);
    }

    pub fn on_ack(&mut self, rtt_ms: i64, nack_count: u32, acked_count: u32) {
        self.samples.push(Sample { rtt_ms, nacks: nack_count, acked: acked_count });
    }

    /// Additive-increase/multiplicative-decrease adjustment, run once per transport tick.
    pub fn on_tick(&mut self) {
        let loss_rate = self.samples.loss_rate();
        let rtt_high = self.samples.median_rtt_ms().map(|r| r >= FC_RTT_DECREASE_THRESHOLD_MS).unwrap_or(false);
        if rtt_high || loss_rate > FC_LOSS_RATE_DECREASE_THRESHOLD {
            self.current_bps = (self.current_bps / 2).max(self.bandwidth_low_limit_bps);
        } else {
            let step = FC_ADDITIVE_INCREASE_BPS.max(self.current_bps / 32);
            self.current_bps = (self.current_bps + step).min(self.bandwidth_high_limit_bps);
        }
    }

    pub fn current_bps(&self) -> u64 {
        self.current_bps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_low_limit_and_refills_over_time() {
        let mut fc = FlowControl::new(0);
        assert_eq!(fc.current_bps(), DEFAULT_BANDWIDTH_LOW_BPS);
        let remaining = fc.remaining_bytes(1000);
        assert_eq!(remaining, (DEFAULT_BANDWIDTH_LOW_BPS as i64 * DEFAULT_TICK_INTERVAL_MS as i64) / 1000);
    }

    #[test]
    fn send_consumes_budget_and_can_go_negative_bounded() {
        let mut fc = FlowControl::new(0);
        fc.remaining_bytes(0);
        fc.on_packet_send(1_000_000);
        let floor = -fc.bytes_per_tick_max();
        assert_eq!(fc.available_bytes, floor);
    }

    #[test]
    fn high_loss_halves_rate() {
        let mut fc = FlowControl::with_limits(10_000, 1_000_000, 0);
        fc.current_bps = 80_000;
        for _ in 0..SAMPLE_WINDOW {
            fc.on_ack(50, 5, 5);
        }
        fc.on_tick();
        assert_eq!(fc.current_bps(), 40_000);
    }

    #[test]
    fn clean_acks_increase_rate_additively() {
        let mut fc = FlowControl::with_limits(10_000, 1_000_000, 0);
        for _ in 0..SAMPLE_WINDOW {
            fc.on_ack(20, 0, 10);
        }
        fc.on_tick();
        assert!(fc.current_bps() > DEFAULT_BANDWIDTH_LOW_BPS);
    }
}
