use std::f64::consts::PI;

use super::Geometry;
use crate::{config::Srid, osm_data::Coordinate, Result, UnsupportedProjectionSnafu};

/// Transforms coordinates between reference systems.
///
/// Implementations only need to provide [project](Reprojector::project);
/// whole geometries are transformed point by point, so the shape is never altered.
pub trait Reprojector: Sync {
    fn project(&self, from: Srid, to: Srid, coordinate: Coordinate) -> Result<Coordinate>;

    fn transform(&self, geometry: Geometry, from: Srid, to: Srid) -> Result<Geometry> {
        if from == to {
            return Ok(geometry);
        }
        geometry.try_map_coordinates(|c| self.project(from, to, c))
    }
}

/// Spherical ("web") Mercator, the usual target for tiles.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebMercator;

impl WebMercator {
    const EARTH_RADIUS_M: f64 = 6_378_137.0;
    const MAX_LATITUDE: f64 = 85.051_128_78;

    fn forward(c: Coordinate) -> Coordinate {
        let lat = c.lat.clamp(-Self::MAX_LATITUDE, Self::MAX_LATITUDE);
        let x = Self::EARTH_RADIUS_M * c.lon.to_radians();
        let y = Self::EARTH_RADIUS_M * (PI / 4.0 + lat.to_radians() / 2.0).tan().ln();
        Coordinate::new(x, y)
    }

    fn inverse(c: Coordinate) -> Coordinate {
        let lon = (c.lon / Self::EARTH_RADIUS_M).to_degrees();
        let lat = (2.0 * (c.lat / Self::EARTH_RADIUS_M).exp().atan() - PI / 2.0).to_degrees();
        Coordinate::new(lon, lat)
    }
}

impl Reprojector for WebMercator {
    fn project(&self, from: Srid, to: Srid, coordinate: Coordinate) -> Result<Coordinate> {
        match (from, to) {
            (from, to) if from == to => Ok(coordinate),
            (Srid::WGS84, Srid::WEB_MERCATOR) => Ok(Self::forward(coordinate)),
            (Srid::WEB_MERCATOR, Srid::WGS84) => Ok(Self::inverse(coordinate)),
            (from, to) => UnsupportedProjectionSnafu { from, to }.fail(),
        }
    }
}
