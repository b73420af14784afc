use chrono::DateTime;
use osmpbf::{Blob, BlobDecode, BlobReader, Element, PrimitiveBlock, RelMemberType};
use std::io::Read;

use super::SnapshotFormat;
use crate::{
    osm_data::{Block, Coordinate, DataBlock, EntityKind, Header, Info, Member, Node, Relation, Tags, Way},
    Error, Result,
};

const WRITER: &str = concat!("osmingest ", env!("CARGO_PKG_VERSION"));

/// The `.osm.pbf` format, one unit per file blob.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsmPbf;

impl SnapshotFormat for OsmPbf {
    type Unit = Blob;

    fn units(
        &self,
        reader: Box<dyn Read + Send>,
    ) -> Result<Box<dyn Iterator<Item = Result<Blob>>>> {
        let blobs = BlobReader::new(reader)
            .map(|blob| blob.map_err(|e| Error::decode(format!("reading PBF blob: {e}"))));
        Ok(Box::new(blobs))
    }

    fn decode(&self, unit: Blob) -> Result<Block> {
        let decoded = unit
            .decode()
            .map_err(|e| Error::decode(format!("decoding PBF blob: {e}")))?;
        match decoded {
            // PBF headers decoded this way carry no replication data,
            // callers complete it from their configuration.
            BlobDecode::OsmHeader(_) => Ok(Block::Header(Header {
                replication_url: String::new(),
                sequence_number: 0,
                timestamp: Default::default(),
                source: String::new(),
                writer: WRITER.to_string(),
            })),
            BlobDecode::OsmData(block) => Ok(Block::Data(data_block(&block))),
            BlobDecode::Unknown(kind) => {
                log::warn!("Skipping PBF blob of unknown type '{kind}'");
                Ok(Block::Data(DataBlock::default()))
            }
        }
    }
}

fn data_block(block: &PrimitiveBlock) -> DataBlock {
    let mut data = DataBlock::default();
    for element in block.elements() {
        match element {
            // Dense metadata is not carried over.
            Element::DenseNode(node) => data.dense_nodes.push(Node {
                id: node.id(),
                info: Info::default(),
                tags: collect_tags(node.tags()),
                coordinate: Some(Coordinate::new(node.lon(), node.lat())),
                geometry: None,
            }),
            Element::Node(node) => data.nodes.push(Node {
                id: node.id(),
                info: convert_info(node.info()),
                tags: collect_tags(node.tags()),
                coordinate: Some(Coordinate::new(node.lon(), node.lat())),
                geometry: None,
            }),
            Element::Way(way) => data.ways.push(Way {
                id: way.id(),
                info: convert_info(way.info()),
                tags: collect_tags(way.tags()),
                refs: way.refs().collect(),
                geometry: None,
            }),
            Element::Relation(relation) => data.relations.push(Relation {
                id: relation.id(),
                info: convert_info(relation.info()),
                tags: collect_tags(relation.tags()),
                members: relation
                    .members()
                    .map(|member| Member {
                        member_type: match member.member_type {
                            RelMemberType::Node => EntityKind::Node,
                            RelMemberType::Way => EntityKind::Way,
                            RelMemberType::Relation => EntityKind::Relation,
                        },
                        reference: member.member_id,
                        role: member.role().unwrap_or_default().to_string(),
                    })
                    .collect(),
                geometry: None,
            }),
        }
    }
    data
}

fn collect_tags<'a>(tags: impl Iterator<Item = (&'a str, &'a str)>) -> Tags {
    tags.map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn convert_info(info: osmpbf::Info<'_>) -> Info {
    Info {
        version: info.version().unwrap_or_default(),
        timestamp: info.milli_timestamp().and_then(DateTime::from_timestamp_millis),
        changeset: info.changeset().unwrap_or_default(),
        user_id: info.uid().unwrap_or_default(),
        user_name: info
            .user()
            .and_then(|user| user.ok())
            .unwrap_or_default()
            .to_string(),
    }
}
