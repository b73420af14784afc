use serde::{Deserialize, Serialize};

use crate::osm_data::Coordinate;

pub mod assembler;
pub mod projection;

pub use assembler::{GeometryAssembler, UnresolvedReference};

/// A closed outer ring and any holes cut into it.
///
/// Rings repeat their first coordinate at the end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub exterior: Vec<Coordinate>,
    pub interiors: Vec<Vec<Coordinate>>,
}

impl Polygon {
    pub fn from_ring(exterior: Vec<Coordinate>) -> Self {
        Polygon {
            exterior,
            interiors: Vec::new(),
        }
    }

    fn point_count(&self) -> usize {
        self.exterior.len() + self.interiors.iter().map(Vec::len).sum::<usize>()
    }

    fn try_map_coordinates<F, E>(self, f: &mut F) -> Result<Self, E>
    where
        F: FnMut(Coordinate) -> Result<Coordinate, E>,
    {
        let exterior = map_ring(self.exterior, f)?;
        let interiors = self
            .interiors
            .into_iter()
            .map(|ring| map_ring(ring, f))
            .collect::<Result<_, E>>()?;
        Ok(Polygon {
            exterior,
            interiors,
        })
    }
}

/// Geometry derived from an entity and its references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Geometry {
    Point(Coordinate),
    LineString(Vec<Coordinate>),
    Polygon(Polygon),
    MultiPolygon(Vec<Polygon>),
    Collection(Vec<Geometry>),
}

impl Geometry {
    /// Total number of coordinate pairs, counting ring closures.
    pub fn point_count(&self) -> usize {
        match self {
            Geometry::Point(_) => 1,
            Geometry::LineString(points) => points.len(),
            Geometry::Polygon(polygon) => polygon.point_count(),
            Geometry::MultiPolygon(polygons) => polygons.iter().map(Polygon::point_count).sum(),
            Geometry::Collection(parts) => parts.iter().map(Geometry::point_count).sum(),
        }
    }

    pub fn is_closed_ring(&self) -> bool {
        matches!(self, Geometry::Polygon(p) if p.interiors.is_empty())
    }

    /// Apply `f` to every coordinate, keeping order and nesting exactly as they are.
    pub fn try_map_coordinates<F, E>(self, mut f: F) -> Result<Self, E>
    where
        F: FnMut(Coordinate) -> Result<Coordinate, E>,
    {
        self.try_map_with(&mut f)
    }

    fn try_map_with<F, E>(self, f: &mut F) -> Result<Self, E>
    where
        F: FnMut(Coordinate) -> Result<Coordinate, E>,
    {
        let mapped = match self {
            Geometry::Point(point) => Geometry::Point(f(point)?),
            Geometry::LineString(points) => Geometry::LineString(map_ring(points, f)?),
            Geometry::Polygon(polygon) => Geometry::Polygon(polygon.try_map_coordinates(f)?),
            Geometry::MultiPolygon(polygons) => Geometry::MultiPolygon(
                polygons
                    .into_iter()
                    .map(|p| p.try_map_coordinates(f))
                    .collect::<Result<_, E>>()?,
            ),
            Geometry::Collection(parts) => Geometry::Collection(
                parts
                    .into_iter()
                    .map(|part| part.try_map_with(f))
                    .collect::<Result<_, E>>()?,
            ),
        };
        Ok(mapped)
    }
}

fn map_ring<F, E>(ring: Vec<Coordinate>, f: &mut F) -> Result<Vec<Coordinate>, E>
where
    F: FnMut(Coordinate) -> Result<Coordinate, E>,
{
    ring.into_iter().map(f).collect()
}
