use snafu::{prelude::*, Backtrace};

pub mod blob;
pub mod caches;
pub mod config;
pub mod decoding;
pub mod geometry;
pub mod import;
pub mod osm_data;
pub mod store;
pub mod update;
pub mod utils;

pub use caches::ReferenceCache;
pub use config::{CacheKind, ImportConfig, Srid, UpdateConfig};
pub use import::{run_import, ImportReport, ImportState, Importer};
pub use store::Store;
pub use update::{resolve_uri, run_update_once, UpdateReport, UpdateState, Updater};

/// The external collaborators an import or update run works against.
///
/// Without a lent `cache`, the run opens one of the configured [CacheKind]
/// and keeps it for its own lifetime.
pub struct Collaborators<'a, S> {
    pub blobs: &'a dyn blob::BlobSource,
    pub store: &'a mut S,
    pub cache: Option<&'a mut ReferenceCache>,
    pub reprojector: &'a dyn geometry::projection::Reprojector,
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("I/O error while {context}: {source}"))]
    Io {
        context: String,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Malformed input: {description}"))]
    Decode {
        description: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Error reading osmChange XML: {source}"))]
    Xml {
        source: quick_xml::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("No projection available from {from} to {to}"))]
    UnsupportedProjection {
        from: config::Srid,
        to: config::Srid,
        backtrace: Backtrace,
    },
    #[snafu(display("Store operation failed: {description}"))]
    Store {
        description: String,
        backtrace: Backtrace,
    },
    #[snafu(display("The store holds no header, import a snapshot first"))]
    MissingHeader { backtrace: Backtrace },
    #[snafu(display("Invalid configuration: {description}"))]
    InvalidConfig {
        description: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Worker runtime unavailable: {description}"))]
    Runtime {
        description: String,
        backtrace: Backtrace,
    },
    #[snafu(display("A worker did not complete: {source}"))]
    WorkerFailed {
        source: tokio::task::JoinError,
        backtrace: Backtrace,
    },
}

impl Error {
    /// Only I/O failures are worth retrying, everything else will fail the same way again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io { .. })
    }

    pub fn store(description: impl Into<String>) -> Self {
        StoreSnafu {
            description: description.into(),
        }
        .build()
    }

    pub(crate) fn decode(description: impl Into<String>) -> Self {
        DecodeSnafu {
            description: description.into(),
        }
        .build()
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(source: tokio::task::JoinError) -> Self {
        Error::WorkerFailed {
            source,
            backtrace: Backtrace::capture(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use snafu::IntoError;
    use crate::{decoding::SnapshotFormat, osm_data::*};
    use chrono::{TimeZone, Utc};
    use std::{
        io::Read,
        sync::{Arc, Mutex},
    };

    pub(crate) fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    pub(crate) fn node(id: i64, lon: f64, lat: f64) -> Node {
        Node::new(id, Some(Coordinate::new(lon, lat)))
    }

    pub(crate) fn way(id: i64, refs: &[i64]) -> Way {
        Way::new(id, refs.to_vec())
    }

    pub(crate) fn member(member_type: EntityKind, reference: i64, role: &str) -> Member {
        Member {
            member_type,
            reference,
            role: role.to_string(),
        }
    }

    pub(crate) fn header(sequence_number: i64) -> Header {
        Header {
            replication_url: "http://example.org/rep".to_string(),
            sequence_number,
            timestamp: Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap(),
            source: "test".to_string(),
            writer: "osmingest-tests".to_string(),
        }
    }

    pub(crate) enum TestUnit {
        Decoded(Block),
        Broken,
    }

    /// A snapshot format that hands out prepared blocks instead of reading its input.
    pub(crate) struct Prepared(Mutex<Vec<TestUnit>>);

    impl Prepared {
        pub(crate) fn new(units: Vec<TestUnit>) -> Arc<Self> {
            Arc::new(Prepared(Mutex::new(units)))
        }

        pub(crate) fn blocks(blocks: Vec<Block>) -> Arc<Self> {
            Self::new(blocks.into_iter().map(TestUnit::Decoded).collect())
        }
    }

    impl SnapshotFormat for Prepared {
        type Unit = TestUnit;

        fn units(
            &self,
            _reader: Box<dyn Read + Send>,
        ) -> Result<Box<dyn Iterator<Item = Result<TestUnit>>>> {
            let units = std::mem::take(&mut *self.0.lock().expect("units"));
            Ok(Box::new(units.into_iter().map(Ok)))
        }

        fn decode(&self, unit: TestUnit) -> Result<Block> {
            match unit {
                TestUnit::Decoded(block) => Ok(block),
                TestUnit::Broken => Err(Error::decode("corrupt blob")),
            }
        }
    }

    #[test]
    fn only_io_errors_are_transient() {
        let io = IoSnafu {
            context: "reading",
        }
        .into_error(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        assert!(io.is_transient());
        assert!(!Error::store("constraint violated").is_transient());
        assert!(!Error::decode("garbage").is_transient());
    }
}
