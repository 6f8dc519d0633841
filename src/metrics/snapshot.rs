#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResourceCacheMetricsSnapshot {
    pub find_calls: u64,
    pub find_hits: u64,
    pub find_misses: u64,
    pub find_stale: u64,

    pub add_calls: u64,
    pub add_replaced: u64, // purgeable duplicate removed in favour of the new record
    pub add_rejected: u64, // new record dropped, un-purgeable duplicate kept

    pub evicted_entries: u64,
    pub shared_id_purges: u64,
    pub shared_id_purged_entries: u64,
    pub messages_drained: u64,

    pub block_allocs: u64,
    pub block_alloc_failures: u64,

    // gauges captured at snapshot time
    pub entry_count: usize,
    pub total_bytes: usize,
    pub total_byte_limit: usize,
}
