//! Append-only experiment metric buffers
//!
//! Writers push raw samples into one of several shards (round-robin), so
//! concurrent recorders rarely touch the same lock. Aggregation drains the
//! shards into per-(variant, metric) moments on demand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::stats::Moments;

const DEFAULT_SHARDS: usize = 16;

#[derive(Debug, Clone)]
struct Sample {
    variant: String,
    metric: String,
    value: f64,
}

type Key = (String, String);

/// Sharded sample buffer with lazily aggregated totals
#[derive(Debug)]
pub struct MetricBuffer {
    shards: Vec<Mutex<Vec<Sample>>>,
    next: AtomicUsize,
    totals: Mutex<HashMap<Key, Moments>>,
}

impl Default for MetricBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

impl MetricBuffer {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(Vec::new())).collect(),
            next: AtomicUsize::new(0),
            totals: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, variant: &str, metric: &str, value: f64) {
        let shard = self.next.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        self.shards[shard].lock().push(Sample {
            variant: variant.to_string(),
            metric: metric.to_string(),
            value,
        });
    }

    /// Fold pending samples into the totals and return a copy of them
    pub fn aggregate(&self) -> HashMap<Key, Moments> {
        let mut totals = self.totals.lock();
        for shard in &self.shards {
            let pending = std::mem::take(&mut *shard.lock());
            for sample in pending {
                totals
                    .entry((sample.variant, sample.metric))
                    .or_default()
                    .push(sample.value);
            }
        }
        totals.clone()
    }

    pub fn moments(&self, variant: &str, metric: &str) -> Moments {
        self.aggregate()
            .get(&(variant.to_string(), metric.to_string()))
            .copied()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_aggregate_is_incremental() {
        let buffer = MetricBuffer::new(4);
        for v in [1.0, 2.0, 3.0] {
            buffer.record("control", "reward", v);
        }
        assert_eq!(buffer.moments("control", "reward").count, 3);
        buffer.record("control", "reward", 4.0);
        let m = buffer.moments("control", "reward");
        assert_eq!(m.count, 4);
        assert!((m.mean - 2.5).abs() < 1e-12);
        assert_eq!(buffer.moments("variant", "reward").count, 0);
    }

    #[test]
    fn test_concurrent_recording() {
        let buffer = Arc::new(MetricBuffer::default());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        buffer.record(if t % 2 == 0 { "a" } else { "b" }, "reward", i as f64);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(buffer.moments("a", "reward").count, 4000);
        assert_eq!(buffer.moments("b", "reward").count, 4000);
    }
}
