use std::io::Read;

use crate::{
    osm_data::{Block, Change, ReplicationState},
    Result,
};

pub mod osc_xml;
pub mod osm_pbf;
pub mod state;

pub use osc_xml::OsmChangeXml;
pub use osm_pbf::OsmPbf;

/// A snapshot encoding made of independently decodable units.
///
/// Units are read sequentially by [units](SnapshotFormat::units), the expensive
/// [decode](SnapshotFormat::decode) step runs on the worker pool.
pub trait SnapshotFormat: Send + Sync + 'static {
    type Unit: Send + 'static;

    fn units(
        &self,
        reader: Box<dyn Read + Send>,
    ) -> Result<Box<dyn Iterator<Item = Result<Self::Unit>>>>;

    fn decode(&self, unit: Self::Unit) -> Result<Block>;
}

/// Decodes replication diffs and their companion state files.
pub trait ChangeDecoder {
    /// Changes in file order. The iterator ends after the first error.
    fn decode_changes(
        &self,
        reader: Box<dyn Read + Send>,
    ) -> Result<Box<dyn Iterator<Item = Result<Change>>>>;

    fn decode_state(&self, reader: Box<dyn Read + Send>) -> Result<ReplicationState>;
}
