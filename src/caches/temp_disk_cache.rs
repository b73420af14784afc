use super::*;
use crate::IoSnafu;
use bytes::{Buf, BufMut};
use memmap::*;
use rustc_hash::FxHashMap;
use snafu::prelude::*;
use std::{fs::File, mem::size_of};
use tempfile::tempfile;

type Offset = usize;
const INITIAL_FILE_SIZE: usize = 64 * 1000 * 1000; // 64MB, doubled whenever it runs full
const PRECISION_FACTOR: f64 = 1e7;

/// Values that can be written to and read back from raw bytes.
pub trait DiskRecord: Sized {
    fn encoded_len(&self) -> usize;
    fn write_to(&self, buf: impl BufMut);
    fn read_from(buf: impl Buf) -> Self;
}

/// Stored with the same 7 decimal places OSM itself uses.
impl DiskRecord for Coordinate {
    fn encoded_len(&self) -> usize {
        8
    }

    fn write_to(&self, mut buf: impl BufMut) {
        buf.put_i32((self.lon * PRECISION_FACTOR).round() as i32);
        buf.put_i32((self.lat * PRECISION_FACTOR).round() as i32);
    }

    fn read_from(mut buf: impl Buf) -> Self {
        let lon = buf.get_i32() as f64 / PRECISION_FACTOR;
        let lat = buf.get_i32() as f64 / PRECISION_FACTOR;
        Coordinate { lon, lat }
    }
}

impl DiskRecord for Vec<i64> {
    fn encoded_len(&self) -> usize {
        8 + self.len() * 8
    }

    fn write_to(&self, mut buf: impl BufMut) {
        buf.put_u64(self.len() as u64);
        for id in self {
            buf.put_i64(*id);
        }
    }

    fn read_from(mut buf: impl Buf) -> Self {
        let len = buf.get_u64() as usize;
        (0..len).map(|_| buf.get_i64()).collect()
    }
}

/// Spills values into a memory-mapped temporary file and only keeps an id→offset index in memory.
///
/// The file is append-only: overwriting a key writes a new record and repoints the index.
pub struct TempDiskCache<V> {
    index: FxHashMap<i64, Offset>,
    file: File,
    data: MmapMut,
    capacity: usize,
    end: Offset,
    _values: std::marker::PhantomData<V>,
}

impl<V> TempDiskCache<V>
where
    V: DiskRecord,
{
    pub fn new() -> Result<Self> {
        Self::with_capacity(INITIAL_FILE_SIZE)
    }

    /// Start out with a file of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let capacity = capacity.max(1);
        let file = tempfile().context(IoSnafu {
            context: "creating temporary cache file",
        })?;
        let data = Self::map(&file, capacity)?;
        Ok(TempDiskCache {
            index: FxHashMap::default(),
            file,
            data,
            capacity,
            end: 0,
            _values: std::marker::PhantomData,
        })
    }

    fn map(file: &File, capacity: usize) -> Result<MmapMut> {
        file.set_len(capacity as u64).context(IoSnafu {
            context: "sizing temporary cache file",
        })?;
        unsafe { MmapOptions::new().map_mut(file) }.context(IoSnafu {
            context: "memory mapping temporary cache file",
        })
    }

    fn ensure_room(&mut self, needed: usize) -> Result<()> {
        if self.end + needed <= self.capacity {
            return Ok(());
        }
        let mut new_capacity = self.capacity * 2;
        while self.end + needed > new_capacity {
            new_capacity *= 2;
        }
        log::debug!(
            "Growing temporary cache file from {}MB to {}MB",
            self.capacity / 1000000,
            new_capacity / 1000000
        );
        self.data.flush().context(IoSnafu {
            context: "flushing temporary cache file",
        })?;
        self.data = Self::map(&self.file, new_capacity)?;
        self.capacity = new_capacity;
        Ok(())
    }

    /// Bytes written to the backing file so far.
    pub fn bytes_written(&self) -> usize {
        self.end
    }
}

impl<V> Cache<V> for TempDiskCache<V>
where
    V: DiskRecord,
{
    fn put(&mut self, id: i64, value: V) -> Result<()> {
        let len = value.encoded_len();
        self.ensure_room(len)?;
        let offset = self.end;
        value.write_to(&mut self.data[offset..offset + len]);
        self.end += len;
        self.index.insert(id, offset);
        Ok(())
    }

    fn get(&self, id: i64) -> Option<V> {
        let offset = *self.index.get(&id)?;
        Some(V::read_from(&self.data[offset..]))
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn heap_size(&self) -> usize {
        self.index.capacity() * size_of::<(i64, Offset)>()
    }
}
