//! Client-side call statistics reported to the balancer.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;

/// Per-call statistics aggregated for the balancer.
///
/// One instance is shared by the active balancer call (which drains it into
/// load reports), the current picker, and every subchannel wrapper produced
/// from the associated serverlist; it lives as long as its longest holder.
///
/// The counters are updated from application threads on every pick, so they
/// are atomics; the drop-token map sits behind a mutex of its own.  Nothing
/// here touches the policy's serialized state.
#[derive(Debug, Default)]
pub struct GrpclbClientStats {
    num_calls_started: AtomicI64,
    num_calls_finished: AtomicI64,
    num_calls_finished_with_client_failed_to_send: AtomicI64,
    num_calls_finished_known_received: AtomicI64,
    drop_token_counts: Mutex<BTreeMap<Bytes, i64>>,
}

/// A drained snapshot of the counters.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ClientStatsSnapshot {
    pub num_calls_started: i64,
    pub num_calls_finished: i64,
    pub num_calls_finished_with_client_failed_to_send: i64,
    pub num_calls_finished_known_received: i64,
    pub drop_token_counts: Vec<(Bytes, i64)>,
}

impl ClientStatsSnapshot {
    pub fn is_zero(&self) -> bool {
        self.num_calls_started == 0
            && self.num_calls_finished == 0
            && self.num_calls_finished_with_client_failed_to_send == 0
            && self.num_calls_finished_known_received == 0
            && self.drop_token_counts.is_empty()
    }
}

impl GrpclbClientStats {
    pub fn call_started(&self) {
        self.num_calls_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn call_finished(&self, failed_to_send: bool, known_received: bool) {
        self.num_calls_finished.fetch_add(1, Ordering::Relaxed);
        if failed_to_send {
            self.num_calls_finished_with_client_failed_to_send
                .fetch_add(1, Ordering::Relaxed);
        }
        if known_received {
            self.num_calls_finished_known_received
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn call_dropped(&self, token: &Bytes) {
        let mut counts = self.drop_token_counts.lock().unwrap();
        *counts.entry(token.clone()).or_insert(0) += 1;
    }

    /// Returns the current counter values and resets them all to zero.
    pub fn get_and_reset(&self) -> ClientStatsSnapshot {
        let drop_token_counts = std::mem::take(&mut *self.drop_token_counts.lock().unwrap());
        ClientStatsSnapshot {
            num_calls_started: self.num_calls_started.swap(0, Ordering::Relaxed),
            num_calls_finished: self.num_calls_finished.swap(0, Ordering::Relaxed),
            num_calls_finished_with_client_failed_to_send: self
                .num_calls_finished_with_client_failed_to_send
                .swap(0, Ordering::Relaxed),
            num_calls_finished_known_received: self
                .num_calls_finished_known_received
                .swap(0, Ordering::Relaxed),
            drop_token_counts: drop_token_counts.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_reset() {
        let stats = GrpclbClientStats::default();
        stats.call_started();
        stats.call_started();
        stats.call_started();
        stats.call_finished(false, true);
        stats.call_finished(true, false);

        let snapshot = stats.get_and_reset();
        assert_eq!(snapshot.num_calls_started, 3);
        assert_eq!(snapshot.num_calls_finished, 2);
        assert_eq!(snapshot.num_calls_finished_with_client_failed_to_send, 1);
        assert_eq!(snapshot.num_calls_finished_known_received, 1);
        assert!(snapshot.drop_token_counts.is_empty());
        assert!(!snapshot.is_zero());

        // A second snapshot sees only what happened after the first.
        let snapshot = stats.get_and_reset();
        assert!(snapshot.is_zero());
    }

    #[test]
    fn drops_are_counted_per_token() {
        let stats = GrpclbClientStats::default();
        let token_a = Bytes::from_static(b"a");
        let token_b = Bytes::from_static(b"b");
        stats.call_dropped(&token_a);
        stats.call_dropped(&token_b);
        stats.call_dropped(&token_a);

        let snapshot = stats.get_and_reset();
        assert_eq!(
            snapshot.drop_token_counts,
            vec![(token_a, 2), (token_b, 1)]
        );
        assert!(stats.get_and_reset().drop_token_counts.is_empty());
    }
}
