use crate::{
    osm_data::{Entity, EntityKind, Header, Node, Relation, Way},
    Result,
};

pub mod memory_store;

pub use memory_store::MemoryStore;

/// Entities of a single kind, persisted with one store call.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityBatch {
    Nodes(Vec<Node>),
    Ways(Vec<Way>),
    Relations(Vec<Relation>),
}

impl EntityBatch {
    /// A batch of just `entity`.
    pub fn of(entity: Entity) -> Self {
        match entity {
            Entity::Node(node) => EntityBatch::Nodes(vec![node]),
            Entity::Way(way) => EntityBatch::Ways(vec![way]),
            Entity::Relation(relation) => EntityBatch::Relations(vec![relation]),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            EntityBatch::Nodes(_) => EntityKind::Node,
            EntityBatch::Ways(_) => EntityKind::Way,
            EntityBatch::Relations(_) => EntityKind::Relation,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            EntityBatch::Nodes(nodes) => nodes.len(),
            EntityBatch::Ways(ways) => ways.len(),
            EntityBatch::Relations(relations) => relations.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `entity` if it has the batch's kind, otherwise hand it back.
    pub fn push(&mut self, entity: Entity) -> Option<Entity> {
        match (self, entity) {
            (EntityBatch::Nodes(nodes), Entity::Node(node)) => nodes.push(node),
            (EntityBatch::Ways(ways), Entity::Way(way)) => ways.push(way),
            (EntityBatch::Relations(relations), Entity::Relation(relation)) => {
                relations.push(relation)
            }
            (_, entity) => return Some(entity),
        }
        None
    }

    pub fn ids(&self) -> Vec<i64> {
        match self {
            EntityBatch::Nodes(nodes) => nodes.iter().map(|n| n.id).collect(),
            EntityBatch::Ways(ways) => ways.iter().map(|w| w.id).collect(),
            EntityBatch::Relations(relations) => relations.iter().map(|r| r.id).collect(),
        }
    }
}

/// The destination of imports and updates.
///
/// Every call must be atomic on its own, nothing is assumed across calls.
pub trait Store {
    /// Insert or replace every entity in `batch`, in order.
    fn upsert(&mut self, batch: EntityBatch) -> Result<()>;

    /// Remove `ids`. Ids that aren't stored are ignored.
    fn delete(&mut self, kind: EntityKind, ids: &[i64]) -> Result<()>;

    fn read_header(&self) -> Result<Option<Header>>;

    /// Replace the header row.
    fn write_header(&mut self, header: Header) -> Result<()>;
}
