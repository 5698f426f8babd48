use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::Mutex;
use lazy_static::lazy_static;

pub const ROUNDS: &str = "consensus_rounds";
pub const TIMEOUTS: &str = "consensus_timeouts";
pub const COMMITS: &str = "consensus_commits";
pub const EQUIVOCATIONS: &str = "consensus_equivocations";
pub const SIGN_FAILURES: &str = "consensus_sign_failures";
pub const DROPPED_MESSAGES: &str = "consensus_dropped_messages";
pub const HEIGHT: &str = "consensus_height";
pub const ROUND: &str = "consensus_round";

/// In-process metrics registry (counters and gauges)
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    counters: Arc<Mutex<HashMap<String, u64>>>,
    gauges: Arc<Mutex<HashMap<String, f64>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_counter(&self, name: &str) {
        self.add_counter(name, 1);
    }

    pub fn add_counter(&self, name: &str, n: u64) {
        let mut counters = self.counters.lock();
        *counters.entry(name.to_string()).or_insert(0) += n;
    }

    pub fn set_gauge(&self, name: &str, val: f64) {
        self.gauges.lock().insert(name.to_string(), val);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> (HashMap<String, u64>, HashMap<String, f64>) {
        (self.counters.lock().clone(), self.gauges.lock().clone())
    }
}

lazy_static! {
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_gauges() {
        let m = MetricsRegistry::new();
        m.inc_counter(COMMITS);
        m.add_counter(COMMITS, 2);
        m.set_gauge(HEIGHT, 11.0);
        assert_eq!(m.counter(COMMITS), 3);
        assert_eq!(m.snapshot().1.get(HEIGHT), Some(&11.0));
    }
}
