use std::fmt;

use super::{projection::Reprojector, Geometry, Polygon};
use crate::{
    caches::ReferenceCache,
    config::Srid,
    osm_data::{closes_ring, Coordinate, Entity, EntityKind, Node, Relation, Way},
    Result,
};

/// An id that an entity refers to but that could not be found in the cache.
///
/// This is not an error: the referring entity simply ends up without geometry
/// (ways) or without that part (relations).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnresolvedReference {
    pub referrer_kind: EntityKind,
    pub referrer_id: i64,
    pub missing_kind: EntityKind,
    pub missing_id: i64,
}

impl fmt::Display for UnresolvedReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} references {} {}, which is not cached",
            self.referrer_kind, self.referrer_id, self.missing_kind, self.missing_id
        )
    }
}

/// Rebuilds geometry from cached references and reprojects it.
///
/// Assembly only ever reads the cache. Relations are resolved at most two hops deep
/// (relation → way → node); relation members are skipped.
pub struct GeometryAssembler<'c> {
    cache: &'c ReferenceCache,
    reprojector: &'c dyn Reprojector,
    source_srid: Srid,
    target_srid: Srid,
    anomalies: Vec<UnresolvedReference>,
}

impl<'c> GeometryAssembler<'c> {
    pub fn new(
        cache: &'c ReferenceCache,
        reprojector: &'c dyn Reprojector,
        source_srid: Srid,
        target_srid: Srid,
    ) -> Self {
        GeometryAssembler {
            cache,
            reprojector,
            source_srid,
            target_srid,
            anomalies: Vec::new(),
        }
    }

    /// The projected geometry of `entity`, or `None` if it can't be built.
    pub fn assemble(&mut self, entity: &Entity) -> Result<Option<Geometry>> {
        let geometry = match entity {
            Entity::Node(node) => self.node_geometry(node),
            Entity::Way(way) => self.way_geometry(way),
            Entity::Relation(relation) => self.relation_geometry(relation),
        };
        self.reproject(geometry)
    }

    /// Move assembled geometry into the target reference system.
    pub fn reproject(&self, geometry: Option<Geometry>) -> Result<Option<Geometry>> {
        geometry
            .map(|g| {
                self.reprojector
                    .transform(g, self.source_srid, self.target_srid)
            })
            .transpose()
    }

    /// Returns `entity` with its geometry replaced by the assembled one.
    pub fn attach(&mut self, entity: Entity) -> Result<Entity> {
        let geometry = self.assemble(&entity)?;
        Ok(entity.with_geometry(geometry))
    }

    /// Unprojected point of a node, looked up in the cache if the node came without coordinate.
    pub fn node_geometry(&mut self, node: &Node) -> Option<Geometry> {
        let coordinate = node.coordinate.or_else(|| self.cache.coordinate(node.id));
        if coordinate.is_none() {
            log::debug!("Node {} has no coordinate", node.id);
        }
        coordinate.map(Geometry::Point)
    }

    /// Unprojected line or ring of a way. Any missing node means no geometry at all.
    pub fn way_geometry(&mut self, way: &Way) -> Option<Geometry> {
        let points = self.resolve_nodes(EntityKind::Way, way.id, &way.refs)?;
        Some(line_or_ring(&way.refs, points))
    }

    /// Unprojected geometry of a relation built from its node and way members.
    pub fn relation_geometry(&mut self, relation: &Relation) -> Option<Geometry> {
        let mut parts: Vec<(&str, Geometry)> = Vec::with_capacity(relation.members.len());
        for member in &relation.members {
            let part = match member.member_type {
                EntityKind::Node => match self.cache.coordinate(member.reference) {
                    Some(coordinate) => Some(Geometry::Point(coordinate)),
                    None => {
                        self.report(relation.id, EntityKind::Node, member.reference);
                        None
                    }
                },
                EntityKind::Way => match self.cache.references(member.reference) {
                    Some(refs) => self
                        .resolve_nodes(EntityKind::Relation, relation.id, &refs)
                        .map(|points| line_or_ring(&refs, points)),
                    None => {
                        self.report(relation.id, EntityKind::Way, member.reference);
                        None
                    }
                },
                EntityKind::Relation => {
                    log::trace!(
                        "Not expanding relation {} inside relation {}",
                        member.reference,
                        relation.id
                    );
                    None
                }
            };
            if let Some(part) = part {
                parts.push((member.role.as_str(), part));
            }
        }

        if parts.is_empty() {
            return None;
        }
        let is_area = relation.has_tag("type", "multipolygon") || relation.has_tag("type", "boundary");
        if is_area && parts.iter().all(|(_, part)| part.is_closed_ring()) {
            Some(multi_polygon(parts))
        } else {
            Some(Geometry::Collection(
                parts.into_iter().map(|(_, part)| part).collect(),
            ))
        }
    }

    fn resolve_nodes(
        &mut self,
        referrer_kind: EntityKind,
        referrer_id: i64,
        refs: &[i64],
    ) -> Option<Vec<Coordinate>> {
        let resolved = self.cache.coordinates(refs);
        let mut complete = true;
        for (id, coordinate) in refs.iter().zip(&resolved) {
            if coordinate.is_none() {
                self.record(UnresolvedReference {
                    referrer_kind,
                    referrer_id,
                    missing_kind: EntityKind::Node,
                    missing_id: *id,
                });
                complete = false;
            }
        }
        complete.then(|| resolved.into_iter().flatten().collect())
    }

    fn report(&mut self, relation_id: i64, missing_kind: EntityKind, missing_id: i64) {
        self.record(UnresolvedReference {
            referrer_kind: EntityKind::Relation,
            referrer_id: relation_id,
            missing_kind,
            missing_id,
        });
    }

    fn record(&mut self, anomaly: UnresolvedReference) {
        log::warn!("{anomaly}");
        self.anomalies.push(anomaly);
    }

    pub fn anomalies(&self) -> &[UnresolvedReference] {
        &self.anomalies
    }

    pub fn take_anomalies(&mut self) -> Vec<UnresolvedReference> {
        std::mem::take(&mut self.anomalies)
    }

    pub fn into_anomalies(self) -> Vec<UnresolvedReference> {
        self.anomalies
    }
}

fn line_or_ring(refs: &[i64], points: Vec<Coordinate>) -> Geometry {
    if closes_ring(refs) {
        Geometry::Polygon(Polygon::from_ring(points))
    } else {
        Geometry::LineString(points)
    }
}

/// `inner` rings become holes of the latest outer ring.
fn multi_polygon(parts: Vec<(&str, Geometry)>) -> Geometry {
    let mut polygons: Vec<Polygon> = Vec::with_capacity(parts.len());
    let mut current_outer: Option<usize> = None;
    for (role, part) in parts {
        let Geometry::Polygon(ring) = part else {
            continue;
        };
        match current_outer {
            Some(outer) if role == "inner" => polygons[outer].interiors.push(ring.exterior),
            _ => {
                if role != "inner" {
                    current_outer = Some(polygons.len());
                }
                polygons.push(ring);
            }
        }
    }
    Geometry::MultiPolygon(polygons)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{geometry::projection::WebMercator, osm_data::Tags, tests::*};
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    fn grid_cache() -> ReferenceCache {
        let mut cache = ReferenceCache::in_memory();
        for id in 1..=9 {
            let (x, y) = ((id - 1) % 3, (id - 1) / 3);
            cache
                .add_node(&node(id, x as f64, y as f64))
                .expect("cached");
        }
        cache
    }

    fn unprojected(cache: &ReferenceCache) -> GeometryAssembler<'_> {
        GeometryAssembler::new(cache, &WebMercator, Srid::WGS84, Srid::WGS84)
    }

    fn tagged(mut relation: Relation, key: &str, value: &str) -> Relation {
        relation.tags = Tags::from([(key.to_string(), value.to_string())]);
        relation
    }

    proptest! {
        #[test]
        fn resolved_ways_keep_every_point(refs in prop::collection::vec(1i64..=9, 0..12)) {
            let cache = grid_cache();
            let mut assembler = unprojected(&cache);
            let way = way(1, &refs);
            let geometry = assembler.way_geometry(&way).expect("resolved");
            prop_assert_eq!(geometry.point_count(), refs.len());
            prop_assert_eq!(geometry.is_closed_ring(), way.is_closed());
            prop_assert_eq!(way.is_closed(), refs.len() >= 4 && refs.first() == refs.last());
            prop_assert!(assembler.anomalies().is_empty());
        }
    }

    #[test]
    fn rings_need_four_refs() {
        let cache = grid_cache();
        let mut assembler = unprojected(&cache);
        assert!(matches!(
            assembler.way_geometry(&way(1, &[1, 2, 5, 1])),
            Some(Geometry::Polygon(_))
        ));
        assert!(matches!(
            assembler.way_geometry(&way(2, &[1, 2, 1])),
            Some(Geometry::LineString(points)) if points.len() == 3
        ));
    }

    #[test]
    fn single_node_ways_are_degenerate_lines() {
        let cache = grid_cache();
        let mut assembler = unprojected(&cache);
        assert_eq!(
            assembler.way_geometry(&way(10, &[1])),
            Some(Geometry::LineString(vec![Coordinate::new(0.0, 0.0)]))
        );
    }

    #[test]
    fn missing_nodes_leave_ways_without_geometry() {
        init_logging();
        let cache = grid_cache();
        let mut assembler = unprojected(&cache);
        let entity = assembler
            .attach(way(7, &[1, 42, 2, 43]).into())
            .expect("no error");
        assert_eq!(entity.geometry(), None);
        let anomalies = assembler.take_anomalies();
        assert_eq!(anomalies.len(), 2);
        assert_eq!(
            anomalies[0],
            UnresolvedReference {
                referrer_kind: EntityKind::Way,
                referrer_id: 7,
                missing_kind: EntityKind::Node,
                missing_id: 42,
            }
        );
        assert_eq!(anomalies[1].missing_id, 43);
        assert!(assembler.anomalies().is_empty());
    }

    #[test]
    fn nodes_fall_back_to_the_cache() {
        let cache = grid_cache();
        let mut assembler = unprojected(&cache);
        assert_eq!(
            assembler.node_geometry(&Node::new(5, None)),
            Some(Geometry::Point(Coordinate::new(1.0, 1.0)))
        );
        assert_eq!(assembler.node_geometry(&Node::new(50, None)), None);
        assert_eq!(
            assembler.node_geometry(&node(5, 3.0, 4.0)),
            Some(Geometry::Point(Coordinate::new(3.0, 4.0)))
        );
    }

    #[test]
    fn multipolygons_get_holes() {
        let mut cache = grid_cache();
        cache.add_way(&way(100, &[1, 3, 9, 7, 1])).expect("cached");
        cache.add_way(&way(101, &[2, 6, 8, 4, 2])).expect("cached");
        let mut assembler = unprojected(&cache);
        let relation = tagged(
            Relation::new(
                1,
                vec![
                    member(EntityKind::Way, 100, "outer"),
                    member(EntityKind::Way, 101, "inner"),
                ],
            ),
            "type",
            "multipolygon",
        );
        match assembler.relation_geometry(&relation) {
            Some(Geometry::MultiPolygon(polygons)) => {
                assert_eq!(polygons.len(), 1);
                assert_eq!(polygons[0].exterior.len(), 5);
                assert_eq!(polygons[0].interiors.len(), 1);
                assert_eq!(polygons[0].interiors[0][1], Coordinate::new(2.0, 1.0));
            }
            other => panic!("Expected a multipolygon, got {other:?}"),
        }
    }

    #[test]
    fn leading_inner_rings_stand_alone() {
        let mut cache = grid_cache();
        cache.add_way(&way(100, &[1, 3, 9, 7, 1])).expect("cached");
        cache.add_way(&way(101, &[2, 6, 8, 4, 2])).expect("cached");
        let mut assembler = unprojected(&cache);
        let relation = tagged(
            Relation::new(
                1,
                vec![
                    member(EntityKind::Way, 101, "inner"),
                    member(EntityKind::Way, 100, "outer"),
                    member(EntityKind::Way, 101, "inner"),
                ],
            ),
            "type",
            "boundary",
        );
        match assembler.relation_geometry(&relation) {
            Some(Geometry::MultiPolygon(polygons)) => {
                assert_eq!(polygons.len(), 2);
                assert!(polygons[0].interiors.is_empty());
                assert_eq!(polygons[1].interiors.len(), 1);
            }
            other => panic!("Expected a multipolygon, got {other:?}"),
        }
    }

    #[test]
    fn other_relations_collect_their_parts() {
        init_logging();
        let mut cache = grid_cache();
        cache.add_way(&way(100, &[1, 2, 3])).expect("cached");
        let mut assembler = unprojected(&cache);
        let relation = tagged(
            Relation::new(
                2,
                vec![
                    member(EntityKind::Node, 5, "stop"),
                    member(EntityKind::Way, 100, ""),
                    member(EntityKind::Relation, 1, ""),
                    member(EntityKind::Way, 999, ""),
                ],
            ),
            "type",
            "route",
        );
        let geometry = assembler.relation_geometry(&relation);
        assert_eq!(
            geometry,
            Some(Geometry::Collection(vec![
                Geometry::Point(Coordinate::new(1.0, 1.0)),
                Geometry::LineString(vec![
                    Coordinate::new(0.0, 0.0),
                    Coordinate::new(1.0, 0.0),
                    Coordinate::new(2.0, 0.0),
                ]),
            ]))
        );
        // Only the missing way is reported, the nested relation is skipped silently.
        assert_eq!(
            assembler.into_anomalies(),
            vec![UnresolvedReference {
                referrer_kind: EntityKind::Relation,
                referrer_id: 2,
                missing_kind: EntityKind::Way,
                missing_id: 999,
            }]
        );
    }

    #[test]
    fn unresolvable_relations_have_no_geometry() {
        let cache = grid_cache();
        let mut assembler = unprojected(&cache);
        let relation = Relation::new(3, vec![member(EntityKind::Relation, 2, "")]);
        assert_eq!(assembler.relation_geometry(&relation), None);
        assert_eq!(assembler.relation_geometry(&Relation::new(4, Vec::new())), None);
    }

    #[test]
    fn assembled_geometry_is_projected() {
        let mut cache = ReferenceCache::in_memory();
        cache.add_node(&node(1, 0.0, 0.0)).expect("cached");
        cache.add_node(&node(2, 180.0, 0.0)).expect("cached");
        let mut assembler =
            GeometryAssembler::new(&cache, &WebMercator, Srid::WGS84, Srid::WEB_MERCATOR);
        match assembler.assemble(&way(1, &[1, 2]).into()).expect("projected") {
            Some(Geometry::LineString(points)) => {
                assert_eq!(points.len(), 2);
                assert_abs_diff_eq!(points[0], Coordinate::new(0.0, 0.0), epsilon = 1e-6);
                assert_abs_diff_eq!(points[1].lon, 20_037_508.342_789_244, epsilon = 1e-6);
            }
            other => panic!("Expected a line, got {other:?}"),
        }
    }

    #[test]
    fn unsupported_projections_fail() {
        let cache = grid_cache();
        let mut assembler = GeometryAssembler::new(&cache, &WebMercator, Srid::WGS84, Srid(2056));
        assert!(assembler.assemble(&node(1, 1.0, 1.0).into()).is_err());
    }
}
