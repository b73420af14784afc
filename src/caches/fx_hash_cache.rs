use super::*;
use get_size::GetSize;
use rustc_hash::FxHashMap;
use std::mem::size_of;

/// Keeps everything on the heap.
pub struct FxHashCache<V> {
    entries: FxHashMap<i64, V>,
}

impl<V> Default for FxHashCache<V> {
    fn default() -> Self {
        FxHashCache {
            entries: FxHashMap::default(),
        }
    }
}

impl<V> FxHashCache<V> {
    pub fn with_capacity(capacity: usize) -> Self {
        FxHashCache {
            entries: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
        }
    }
}

impl<V> Cache<V> for FxHashCache<V>
where
    V: Clone + GetSize,
{
    fn put(&mut self, id: i64, value: V) -> Result<()> {
        self.entries.insert(id, value);
        Ok(())
    }

    fn get(&self, id: i64) -> Option<V> {
        self.entries.get(&id).cloned()
    }

    fn put_all(&mut self, entries: Vec<(i64, V)>) -> Result<()> {
        self.entries.extend(entries);
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn heap_size(&self) -> usize {
        let table = self.entries.capacity() * size_of::<(i64, V)>();
        let values: usize = self.entries.values().map(GetSize::get_heap_size).sum();
        table + values
    }
}
