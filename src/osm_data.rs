use approx::AbsDiffEq;
use chrono::{DateTime, Utc};
use get_size::GetSize;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

use crate::geometry::Geometry;

// <node id="106904" lat="51.5195553" lon="-0.0362329" version="5" timestamp="2020-06-15T19:23:35Z" changeset="86684855" uid="4948143" user="doublah">
//     <tag k="seamark:type" v="gate"/>
//   </node>

pub type Tags = BTreeMap<String, String>;

/// A WGS84-style (x, y) pair. Before reprojection `lon`/`lat` are degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, GetSize, Serialize, Deserialize)]
pub struct Coordinate {
    pub lon: f64,
    pub lat: f64,
}

impl Coordinate {
    pub const fn new(lon: f64, lat: f64) -> Self {
        Coordinate { lon, lat }
    }
}

impl AbsDiffEq for Coordinate {
    type Epsilon = f64;

    fn default_epsilon() -> Self::Epsilon {
        f64::EPSILON
    }

    fn abs_diff_eq(&self, other: &Self, epsilon: Self::Epsilon) -> bool {
        self.lon.abs_diff_eq(&other.lon, epsilon) && self.lat.abs_diff_eq(&other.lat, epsilon)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.lon, self.lat)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Node,
    Way,
    Relation,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Node => write!(f, "node"),
            EntityKind::Way => write!(f, "way"),
            EntityKind::Relation => write!(f, "relation"),
        }
    }
}

/// Editing metadata shared by every entity.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Info {
    pub version: i32,
    pub timestamp: Option<DateTime<Utc>>,
    pub changeset: i64,
    pub user_id: i32,
    pub user_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    pub info: Info,
    pub tags: Tags,
    /// Absent when the decoder elided it, e.g. for deleted nodes in a diff.
    pub coordinate: Option<Coordinate>,
    pub geometry: Option<Geometry>,
}

impl Node {
    pub fn new(id: i64, coordinate: Option<Coordinate>) -> Self {
        Node {
            id,
            info: Info::default(),
            tags: Tags::new(),
            coordinate,
            geometry: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Way {
    pub id: i64,
    pub info: Info,
    pub tags: Tags,
    pub refs: Vec<i64>,
    pub geometry: Option<Geometry>,
}

impl Way {
    pub fn new(id: i64, refs: Vec<i64>) -> Self {
        Way {
            id,
            info: Info::default(),
            tags: Tags::new(),
            refs,
            geometry: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        closes_ring(&self.refs)
    }
}

/// Node refs describe an area iff they come back to their start and there are at least 4.
pub fn closes_ring(refs: &[i64]) -> bool {
    refs.len() >= 4 && refs.first() == refs.last()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub member_type: EntityKind,
    pub reference: i64,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub id: i64,
    pub info: Info,
    pub tags: Tags,
    pub members: Vec<Member>,
    pub geometry: Option<Geometry>,
}

impl Relation {
    pub fn new(id: i64, members: Vec<Member>) -> Self {
        Relation {
            id,
            info: Info::default(),
            tags: Tags::new(),
            members,
            geometry: None,
        }
    }

    pub fn has_tag(&self, key: &str, value: &str) -> bool {
        self.tags.get(key).is_some_and(|v| v == value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Entity {
    Node(Node),
    Way(Way),
    Relation(Relation),
}

impl Entity {
    pub fn id(&self) -> i64 {
        match self {
            Entity::Node(node) => node.id,
            Entity::Way(way) => way.id,
            Entity::Relation(relation) => relation.id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Node(_) => EntityKind::Node,
            Entity::Way(_) => EntityKind::Way,
            Entity::Relation(_) => EntityKind::Relation,
        }
    }

    pub fn geometry(&self) -> Option<&Geometry> {
        match self {
            Entity::Node(node) => node.geometry.as_ref(),
            Entity::Way(way) => way.geometry.as_ref(),
            Entity::Relation(relation) => relation.geometry.as_ref(),
        }
    }

    /// Attach the derived geometry, replacing whatever was there.
    pub fn with_geometry(self, geometry: Option<Geometry>) -> Self {
        match self {
            Entity::Node(node) => Entity::Node(Node { geometry, ..node }),
            Entity::Way(way) => Entity::Way(Way { geometry, ..way }),
            Entity::Relation(relation) => Entity::Relation(Relation {
                geometry,
                ..relation
            }),
        }
    }
}

impl From<Node> for Entity {
    fn from(node: Node) -> Self {
        Entity::Node(node)
    }
}
impl From<Way> for Entity {
    fn from(way: Way) -> Self {
        Entity::Way(way)
    }
}
impl From<Relation> for Entity {
    fn from(relation: Relation) -> Self {
        Entity::Relation(relation)
    }
}

/// The single logical row describing how far the store has caught up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub replication_url: String,
    pub sequence_number: i64,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub writer: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationState {
    pub sequence_number: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataBlock {
    pub dense_nodes: Vec<Node>,
    pub nodes: Vec<Node>,
    pub ways: Vec<Way>,
    pub relations: Vec<Relation>,
}

impl DataBlock {
    pub fn len(&self) -> usize {
        self.dense_nodes.len() + self.nodes.len() + self.ways.len() + self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All nodes in file order, dense ones first.
    pub fn all_nodes(&self) -> impl Iterator<Item = &Node> {
        self.dense_nodes.iter().chain(self.nodes.iter())
    }
}

/// A decoded unit of a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Header(Header),
    Data(DataBlock),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Create => write!(f, "create"),
            ChangeKind::Modify => write!(f, "modify"),
            ChangeKind::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub kind: ChangeKind,
    pub entities: Vec<Entity>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::*;

    #[test]
    fn closed_ways_need_four_refs() {
        assert!(way(1, &[1, 2, 3, 1]).is_closed());
        assert!(!way(1, &[1, 2, 1]).is_closed());
        assert!(!way(1, &[1, 2, 3, 4]).is_closed());
        assert!(!way(1, &[]).is_closed());
    }

    #[test]
    fn with_geometry_keeps_identity() {
        let entity: Entity = node(7, 1.0, 2.0).into();
        let geometry = Geometry::Point(Coordinate::new(1.0, 2.0));
        let entity = entity.with_geometry(Some(geometry.clone()));
        assert_eq!(entity.id(), 7);
        assert_eq!(entity.kind(), EntityKind::Node);
        assert_eq!(entity.geometry(), Some(&geometry));
    }
}
