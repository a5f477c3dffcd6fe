// Per-run sequence number assignment.
//
// Sequence numbers are monotonic and gapless per run. Counters are handed
// out synchronously so the emitter can assign a number and push the frame
// to the connection channel in one critical section, which is what keeps
// the delivered stream in order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::info_span;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct RunSequencer {
    counters: RwLock<HashMap<Uuid, Arc<AtomicI64>>>,
}

impl RunSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next sequence number for a run, starting at 1.
    pub fn next_seq(&self, run_id: Uuid) -> i64 {
        let _span = info_span!("gateway.sequencer.next_seq", run_id = %run_id).entered();
        let counter = self.counter_for_run(run_id);
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Raise a run's counter to at least `max_seq` (recovery after restart).
    /// Never regresses an already-higher counter.
    pub fn seed(&self, run_id: Uuid, max_seq: i64) {
        let _span =
            info_span!("gateway.sequencer.seed", run_id = %run_id, max_seq).entered();
        let counter = self.counter_for_run(run_id);
        let mut current = counter.load(Ordering::SeqCst);

        while max_seq > current {
            match counter.compare_exchange(current, max_seq, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return,
                Err(next_current) => current = next_current,
            }
        }
    }

    /// Drops a completed run's counter. No further numbers are ever needed:
    /// events for a terminal run are rejected before sequencing.
    pub fn release(&self, run_id: Uuid) {
        self.counters
            .write()
            .expect("sequencer lock poisoned")
            .remove(&run_id);
    }

    fn counter_for_run(&self, run_id: Uuid) -> Arc<AtomicI64> {
        if let Some(existing) =
            self.counters.read().expect("sequencer lock poisoned").get(&run_id).cloned()
        {
            return existing;
        }

        let mut counters = self.counters.write().expect("sequencer lock poisoned");
        counters.entry(run_id).or_insert_with(|| Arc::new(AtomicI64::new(0))).clone()
    }
}
