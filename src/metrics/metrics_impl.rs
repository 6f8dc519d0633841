use crate::metrics::traits::ResourceCacheMetricsRecorder;

/// Plain counters; synchronized by the cache monitor that owns them.
#[derive(Debug, Default, Clone)]
pub struct ResourceCacheMetrics {
    pub find_calls: u64,
    pub find_hits: u64,
    pub find_misses: u64,
    pub find_stale: u64,
    pub add_calls: u64,
    pub add_replaced: u64,
    pub add_rejected: u64,
    pub evicted_entries: u64,
    pub shared_id_purges: u64,
    pub shared_id_purged_entries: u64,
    pub messages_drained: u64,
    pub block_allocs: u64,
    pub block_alloc_failures: u64,
}

impl ResourceCacheMetricsRecorder for ResourceCacheMetrics {
    fn record_find_call(&mut self) {
        self.find_calls += 1;
    }

    fn record_find_hit(&mut self) {
        self.find_hits += 1;
    }

    fn record_find_miss(&mut self) {
        self.find_misses += 1;
    }

    fn record_find_stale(&mut self) {
        self.find_stale += 1;
    }

    fn record_add_call(&mut self) {
        self.add_calls += 1;
    }

    fn record_add_replaced(&mut self) {
        self.add_replaced += 1;
    }

    fn record_add_rejected(&mut self) {
        self.add_rejected += 1;
    }

    fn record_evicted_entry(&mut self) {
        self.evicted_entries += 1;
    }

    fn record_shared_id_purge(&mut self, removed: usize) {
        self.shared_id_purges += 1;
        self.shared_id_purged_entries += removed as u64;
    }

    fn record_messages_drained(&mut self, count: usize) {
        self.messages_drained += count as u64;
    }

    fn record_block_alloc(&mut self) {
        self.block_allocs += 1;
    }

    fn record_block_alloc_failure(&mut self) {
        self.block_alloc_failures += 1;
    }
}
