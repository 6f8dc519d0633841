/// Counters written by the resource cache.
pub trait ResourceCacheMetricsRecorder {
    fn record_find_call(&mut self);
    fn record_find_hit(&mut self);
    fn record_find_miss(&mut self);
    fn record_find_stale(&mut self);
    fn record_add_call(&mut self);
    fn record_add_replaced(&mut self);
    fn record_add_rejected(&mut self);
    fn record_evicted_entry(&mut self);
    fn record_shared_id_purge(&mut self, removed: usize);
    fn record_messages_drained(&mut self, count: usize);
    fn record_block_alloc(&mut self);
    fn record_block_alloc_failure(&mut self);
}

/// Read side: produce a point-in-time copy of the counters.
pub trait MetricsSnapshotProvider<S> {
    fn snapshot(&self) -> S;
}
