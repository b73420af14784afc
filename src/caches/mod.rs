use std::ops::{Deref, DerefMut};

use crate::{
    config::CacheKind,
    osm_data::{Coordinate, DataBlock, Node, Way},
    Result,
};

pub mod fx_hash_cache;
pub mod temp_disk_cache;

pub use fx_hash_cache::FxHashCache;
pub use temp_disk_cache::TempDiskCache;

/// An id-indexed map where the last write for a key wins.
pub trait Cache<V> {
    fn put(&mut self, id: i64, value: V) -> Result<()>;

    fn get(&self, id: i64) -> Option<V>;

    fn put_all(&mut self, entries: Vec<(i64, V)>) -> Result<()> {
        for (id, value) in entries {
            self.put(id, value)?;
        }
        Ok(())
    }

    /// Look up all `ids`, in order.
    fn get_all(&self, ids: &[i64]) -> Vec<Option<V>> {
        ids.iter().map(|id| self.get(*id)).collect()
    }

    /// Number of distinct keys.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate number of bytes held on the heap.
    fn heap_size(&self) -> usize;
}

/// Lookups needed to rebuild geometry from ids.
///
/// Nodes and ways have independent id spaces, so they are kept apart:
/// node ids map to their coordinate and way ids to their node list.
pub struct ReferenceCache {
    coordinates: Box<dyn Cache<Coordinate> + Send>,
    references: Box<dyn Cache<Vec<i64>> + Send>,
    kind: Option<CacheKind>,
}

impl ReferenceCache {
    pub fn new(
        coordinates: Box<dyn Cache<Coordinate> + Send>,
        references: Box<dyn Cache<Vec<i64>> + Send>,
    ) -> Self {
        ReferenceCache {
            coordinates,
            references,
            kind: None,
        }
    }

    pub fn in_memory() -> Self {
        ReferenceCache {
            kind: Some(CacheKind::InMemory),
            ..Self::new(
                Box::new(FxHashCache::default()),
                Box::new(FxHashCache::default()),
            )
        }
    }

    pub fn temp_disk() -> Result<Self> {
        Ok(ReferenceCache {
            kind: Some(CacheKind::TempDisk),
            ..Self::new(
                Box::new(TempDiskCache::new()?),
                Box::new(TempDiskCache::new()?),
            )
        })
    }

    /// The built-in backing in use, `None` for caches assembled with [ReferenceCache::new].
    pub fn kind(&self) -> Option<CacheKind> {
        self.kind
    }

    pub fn for_kind(kind: CacheKind) -> Result<Self> {
        match kind {
            CacheKind::InMemory => Ok(Self::in_memory()),
            CacheKind::TempDisk => Self::temp_disk(),
        }
    }

    pub fn put_coordinate(&mut self, id: i64, coordinate: Coordinate) -> Result<()> {
        self.coordinates.put(id, coordinate)
    }

    pub fn put_coordinates(&mut self, entries: Vec<(i64, Coordinate)>) -> Result<()> {
        self.coordinates.put_all(entries)
    }

    pub fn coordinate(&self, id: i64) -> Option<Coordinate> {
        self.coordinates.get(id)
    }

    pub fn coordinates(&self, ids: &[i64]) -> Vec<Option<Coordinate>> {
        self.coordinates.get_all(ids)
    }

    pub fn put_references(&mut self, id: i64, refs: Vec<i64>) -> Result<()> {
        self.references.put(id, refs)
    }

    pub fn put_all_references(&mut self, entries: Vec<(i64, Vec<i64>)>) -> Result<()> {
        self.references.put_all(entries)
    }

    pub fn references(&self, id: i64) -> Option<Vec<i64>> {
        self.references.get(id)
    }

    /// Remember a node's coordinate. Nodes without one are skipped.
    pub fn add_node(&mut self, node: &Node) -> Result<()> {
        if let Some(coordinate) = node.coordinate {
            self.put_coordinate(node.id, coordinate)?;
        }
        Ok(())
    }

    pub fn add_way(&mut self, way: &Way) -> Result<()> {
        self.put_references(way.id, way.refs.clone())
    }

    /// Write every node coordinate and way node list of `block`.
    pub fn populate(&mut self, block: &DataBlock) -> Result<()> {
        let coordinates = block
            .all_nodes()
            .filter_map(|node| node.coordinate.map(|c| (node.id, c)))
            .collect();
        self.put_coordinates(coordinates)?;
        let references = block
            .ways
            .iter()
            .map(|way| (way.id, way.refs.clone()))
            .collect();
        self.put_all_references(references)
    }

    pub fn num_coordinates(&self) -> usize {
        self.coordinates.len()
    }

    pub fn num_references(&self) -> usize {
        self.references.len()
    }

    pub fn heap_size(&self) -> usize {
        self.coordinates.heap_size() + self.references.heap_size()
    }
}

/// The cache a run works against: lent by the caller or opened from the configured kind.
pub(crate) enum CacheSlot<'a> {
    Lent(&'a mut ReferenceCache),
    Owned(ReferenceCache),
}

impl<'a> CacheSlot<'a> {
    pub(crate) fn open(lent: Option<&'a mut ReferenceCache>, kind: CacheKind) -> Result<Self> {
        match lent {
            Some(cache) => Ok(CacheSlot::Lent(cache)),
            None => {
                log::debug!("Opening a {kind:?} reference cache");
                Ok(CacheSlot::Owned(ReferenceCache::for_kind(kind)?))
            }
        }
    }
}

impl Deref for CacheSlot<'_> {
    type Target = ReferenceCache;

    fn deref(&self) -> &ReferenceCache {
        match self {
            CacheSlot::Lent(cache) => &**cache,
            CacheSlot::Owned(cache) => cache,
        }
    }
}

impl DerefMut for CacheSlot<'_> {
    fn deref_mut(&mut self) -> &mut ReferenceCache {
        match self {
            CacheSlot::Lent(cache) => &mut **cache,
            CacheSlot::Owned(cache) => cache,
        }
    }
}
