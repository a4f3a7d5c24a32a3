//! Worker assignment: each live `Connexion` is owned (for ticking purposes) by exactly
//! one worker index, chosen by least-population when the connexion is created. A
//! dedicated tokio task per worker ticks only its own partition of the connection map,
//! so one worker's slow peer can't starve another's tick cadence. This stands in for
//! the dedicated OS-thread-per-worker pool with its own inbound queue and wakeup flag;
//! tokio's scheduler already does the fair multiplexing that pool hand-rolled.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Tracks how many connexions each worker currently owns, so new connexions can be
/// handed to whichever is least loaded. Counts are advisory: a worker's true load can
/// drift slightly from this if connexions die without going through `release`, since
/// the count is only used to pick a starting point, never to enforce a hard cap.
pub struct WorkerAssigner {
    counts: Vec<AtomicUsize>,
}

impl WorkerAssigner {
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        Self { counts: (0..worker_count).map(|_| AtomicUsize::new(0)).collect() }
    }

    pub fn worker_count(&self) -> usize {
        self.counts.len()
    }

    /// Assigns and returns the least-loaded worker index, incrementing its count.
    pub fn assign(&self) -> usize {
        let (idx, _) = self
            .counts
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.load(Ordering::Relaxed))
            .expect("worker_count is at least 1");
        self.counts[idx].fetch_add(1, Ordering::Relaxed);
        idx
    }

    pub fn release(&self, worker_id: usize) {
        if let Some(c) = self.counts.get(worker_id) {
            c.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_least_loaded_worker_first() {
        let assigner = WorkerAssigner::new(2);
        let a = assigner.assign();
        let b = assigner.assign();
        assert_ne!(a, b);
        assigner.release(a);
        let c = assigner.assign();
        assert_eq!(a, c);
    }
}
