use rustc_hash::FxHashMap;
use snafu::{prelude::*, IntoError};
use std::{
    fs::{self, File},
    io::{self, BufReader, Cursor, Read},
    path::{Path, PathBuf},
};

use crate::{IoSnafu, Result};

/// Where snapshot, diff and state files are fetched from.
pub trait BlobSource {
    /// Size of the blob at `uri` in bytes.
    fn size(&self, uri: &str) -> Result<u64>;

    fn open(&self, uri: &str) -> Result<Box<dyn Read + Send>>;
}

/// Reads plain paths and `file://` URIs from the local file system.
///
/// Relative paths are resolved against the root, if there is one.
#[derive(Clone, Debug, Default)]
pub struct FileBlobSource {
    root: Option<PathBuf>,
}

impl FileBlobSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn under<P>(root: P) -> Self
    where
        P: AsRef<Path>,
    {
        FileBlobSource {
            root: Some(root.as_ref().to_owned()),
        }
    }

    fn path(&self, uri: &str) -> PathBuf {
        let path = Path::new(uri.strip_prefix("file://").unwrap_or(uri));
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_owned(),
        }
    }
}

impl BlobSource for FileBlobSource {
    fn size(&self, uri: &str) -> Result<u64> {
        let path = self.path(uri);
        let metadata = fs::metadata(&path).context(IoSnafu {
            context: format!("reading metadata of {}", path.display()),
        })?;
        Ok(metadata.len())
    }

    fn open(&self, uri: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.path(uri);
        let file = File::open(&path).context(IoSnafu {
            context: format!("opening {}", path.display()),
        })?;
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Blobs held in memory, keyed by their exact URI.
#[derive(Clone, Debug, Default)]
pub struct MemoryBlobSource {
    blobs: FxHashMap<String, Vec<u8>>,
}

impl MemoryBlobSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, uri: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.blobs.insert(uri.into(), bytes.into());
    }

    fn get(&self, uri: &str) -> Result<&Vec<u8>> {
        self.blobs.get(uri).ok_or_else(|| {
            IoSnafu {
                context: format!("looking up {uri}"),
            }
            .into_error(io::Error::new(io::ErrorKind::NotFound, "no such blob"))
        })
    }
}

impl BlobSource for MemoryBlobSource {
    fn size(&self, uri: &str) -> Result<u64> {
        Ok(self.get(uri)?.len() as u64)
    }

    fn open(&self, uri: &str) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.get(uri)?.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn read_all(source: &dyn BlobSource, uri: &str) -> String {
        let mut content = String::new();
        source
            .open(uri)
            .expect("open")
            .read_to_string(&mut content)
            .expect("read");
        content
    }

    #[test]
    fn files_resolve_against_their_root() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut file = File::create(dir.path().join("state.txt")).expect("create");
        file.write_all(b"sequenceNumber=5\n").expect("write");
        drop(file);

        let source = FileBlobSource::under(dir.path());
        assert_eq!(source.size("state.txt").expect("size"), 17);
        assert_eq!(read_all(&source, "state.txt"), "sequenceNumber=5\n");

        let absolute = format!("file://{}", dir.path().join("state.txt").display());
        assert_eq!(read_all(&FileBlobSource::new(), &absolute), "sequenceNumber=5\n");
    }

    #[test]
    fn missing_blobs_are_io_errors() {
        let dir = tempfile::tempdir().expect("temp dir");
        let source = FileBlobSource::under(dir.path());
        let error = source.open("nope.osc.gz").err().expect("missing");
        assert!(error.is_transient());
        assert!(MemoryBlobSource::new().size("nope").is_err());
    }

    #[test]
    fn memory_blobs() {
        let mut source = MemoryBlobSource::new();
        source.insert("mem://a", "hello");
        assert_eq!(source.size("mem://a").expect("size"), 5);
        assert_eq!(read_all(&source, "mem://a"), "hello");
    }
}
