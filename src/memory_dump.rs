//! Memory accounting sink.
//!
//! [`ResourceCache::dump_memory_statistics`] reports every record to a
//! [`MemoryDump`], naming each one `rescache/<category>_<slot>`. Heap-backed
//! records report a `size` value and a `malloc` backing; discardable ones
//! report `discardable_size` and point at their block.
//!
//! [`ResourceCache::dump_memory_statistics`]: crate::cache::ResourceCache::dump_memory_statistics

use crate::block::BlockHandle;

/// How much detail a dump wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LevelOfDetail {
    Light,
    Background,
    #[default]
    Detailed,
}

/// Receiver of memory statistics, implemented by tracing/profiling tools.
pub trait MemoryDump {
    fn dump_numeric_value(&mut self, dump_name: &str, value_name: &str, units: &str, value: u64);

    fn set_memory_backing(&mut self, dump_name: &str, backing_type: &str);

    fn set_discardable_memory_backing(&mut self, dump_name: &str, block: BlockHandle);

    fn level_of_detail(&self) -> LevelOfDetail {
        LevelOfDetail::Detailed
    }
}

/// One numeric value captured by [`CollectingDump`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpValue {
    pub dump_name: String,
    pub value_name: String,
    pub units: String,
    pub value: u64,
}

/// A [`MemoryDump`] that keeps everything it is told, for tools and tests.
#[derive(Debug, Default, Clone)]
pub struct CollectingDump {
    pub values: Vec<DumpValue>,
    pub heap_backed: Vec<String>,
    pub discardable_backed: Vec<(String, BlockHandle)>,
    pub detail: LevelOfDetail,
}

impl CollectingDump {
    pub fn new(detail: LevelOfDetail) -> Self {
        Self {
            detail,
            ..Self::default()
        }
    }

    /// Sum of every value reported under `value_name`.
    pub fn total(&self, value_name: &str) -> u64 {
        self.values
            .iter()
            .filter(|v| v.value_name == value_name)
            .map(|v| v.value)
            .sum()
    }
}

impl MemoryDump for CollectingDump {
    fn dump_numeric_value(&mut self, dump_name: &str, value_name: &str, units: &str, value: u64) {
        self.values.push(DumpValue {
            dump_name: dump_name.to_owned(),
            value_name: value_name.to_owned(),
            units: units.to_owned(),
            value,
        });
    }

    fn set_memory_backing(&mut self, dump_name: &str, _backing_type: &str) {
        self.heap_backed.push(dump_name.to_owned());
    }

    fn set_discardable_memory_backing(&mut self, dump_name: &str, block: BlockHandle) {
        self.discardable_backed.push((dump_name.to_owned(), block));
    }

    fn level_of_detail(&self) -> LevelOfDetail {
        self.detail
    }
}
