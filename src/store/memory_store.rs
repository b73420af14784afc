use rustc_hash::FxHashMap;

use super::*;

/// Keeps every table in a hash map. Mostly useful for tests and small extracts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    nodes: FxHashMap<i64, Node>,
    ways: FxHashMap<i64, Way>,
    relations: FxHashMap<i64, Relation>,
    header: Option<Header>,
    upserts: Vec<(EntityKind, usize)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(header: Header) -> Self {
        MemoryStore {
            header: Some(header),
            ..Self::default()
        }
    }

    pub fn node(&self, id: i64) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn way(&self, id: i64) -> Option<&Way> {
        self.ways.get(&id)
    }

    pub fn relation(&self, id: i64) -> Option<&Relation> {
        self.relations.get(&id)
    }

    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    /// Number of stored entities of `kind`.
    pub fn count(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Node => self.nodes.len(),
            EntityKind::Way => self.ways.len(),
            EntityKind::Relation => self.relations.len(),
        }
    }

    /// Everything stored, ordered by kind and id.
    pub fn entities(&self) -> Vec<Entity> {
        let mut entities: Vec<Entity> = self
            .nodes
            .values()
            .cloned()
            .map(Entity::from)
            .chain(self.ways.values().cloned().map(Entity::from))
            .chain(self.relations.values().cloned().map(Entity::from))
            .collect();
        entities.sort_by_key(|e| (e.kind(), e.id()));
        entities
    }

    /// Kind and size of every upsert call, in call order.
    pub fn upserts(&self) -> &[(EntityKind, usize)] {
        &self.upserts
    }
}

impl Store for MemoryStore {
    fn upsert(&mut self, batch: EntityBatch) -> Result<()> {
        self.upserts.push((batch.kind(), batch.len()));
        match batch {
            EntityBatch::Nodes(nodes) => self.nodes.extend(nodes.into_iter().map(|n| (n.id, n))),
            EntityBatch::Ways(ways) => self.ways.extend(ways.into_iter().map(|w| (w.id, w))),
            EntityBatch::Relations(relations) => self
                .relations
                .extend(relations.into_iter().map(|r| (r.id, r))),
        }
        Ok(())
    }

    fn delete(&mut self, kind: EntityKind, ids: &[i64]) -> Result<()> {
        match kind {
            EntityKind::Node => ids.iter().for_each(|id| drop(self.nodes.remove(id))),
            EntityKind::Way => ids.iter().for_each(|id| drop(self.ways.remove(id))),
            EntityKind::Relation => ids.iter().for_each(|id| drop(self.relations.remove(id))),
        }
        Ok(())
    }

    fn read_header(&self) -> Result<Option<Header>> {
        Ok(self.header.clone())
    }

    fn write_header(&mut self, header: Header) -> Result<()> {
        self.header = Some(header);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::*;

    #[test]
    fn repeated_upserts_are_idempotent() {
        let mut store = MemoryStore::new();
        let batch = EntityBatch::Nodes(vec![node(1, 0.0, 0.0), node(2, 1.0, 1.0)]);
        store.upsert(batch.clone()).expect("upsert");
        let once = store.entities();
        store.upsert(batch).expect("upsert");
        assert_eq!(store.entities(), once);
        assert_eq!(store.count(EntityKind::Node), 2);
        assert_eq!(store.upserts(), &[(EntityKind::Node, 2), (EntityKind::Node, 2)]);
    }

    #[test]
    fn deleting_twice_is_a_no_op() {
        let mut store = MemoryStore::new();
        store
            .upsert(EntityBatch::Ways(vec![way(1, &[1, 2]), way(2, &[2, 3])]))
            .expect("upsert");
        store.delete(EntityKind::Way, &[1]).expect("delete");
        let once = store.entities();
        store.delete(EntityKind::Way, &[1]).expect("delete");
        assert_eq!(store.entities(), once);
        assert!(store.way(1).is_none());
        assert!(store.way(2).is_some());
        // Ids of other kinds are untouched.
        store.delete(EntityKind::Node, &[2]).expect("delete");
        assert!(store.way(2).is_some());
    }

    #[test]
    fn header_is_overwritten() {
        let mut store = MemoryStore::new();
        assert_eq!(store.read_header().expect("read"), None);
        store.write_header(header(1)).expect("write");
        store.write_header(header(2)).expect("write");
        assert_eq!(store.read_header().expect("read"), Some(header(2)));
    }
}
