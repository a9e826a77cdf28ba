use crate::common::RoutingError;
use crate::domains::route_tracking::{Coordinate, Path, PathProvider};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use geojson::{GeoJson, Geometry, Value};
use std::path::Path as FsPath;

/// Straight-line route split into evenly spaced waypoints.
/// Stands in for a mapping provider in demos and tests.
pub struct InterpolatedPathProvider {
    segments: usize,
}

impl InterpolatedPathProvider {
    /// `waypoints` includes both endpoints and must be at least 2.
    pub fn new(waypoints: usize) -> Self {
        Self {
            segments: waypoints.saturating_sub(1),
        }
    }
}

#[async_trait]
impl PathProvider for InterpolatedPathProvider {
    async fn route(&self, start: Coordinate, end: Coordinate) -> Result<Path, RoutingError> {
        if self.segments == 0 {
            return Err(RoutingError::new("interpolated provider needs at least two waypoints"));
        }
        if start == end {
            return Path::new(vec![start]).map_err(|e| RoutingError::new(e.to_string()));
        }

        let waypoints = (0..=self.segments)
            .map(|i| {
                let t = i as f64 / self.segments as f64;
                Coordinate {
                    lat: start.lat + (end.lat - start.lat) * t,
                    lng: start.lng + (end.lng - start.lng) * t,
                }
            })
            .collect();
        Path::new(waypoints).map_err(|e| RoutingError::new(e.to_string()))
    }
}

/// Serves routes exported from a mapping provider as GeoJSON LineStrings.
///
/// A request matches a route when both endpoints lie within `tolerance_m` of
/// the route's ends, in either direction.
pub struct GeoJsonRouteProvider {
    routes: Vec<Vec<Coordinate>>,
    tolerance_m: f64,
}

impl GeoJsonRouteProvider {
    pub fn from_geojson_str(source: &str, tolerance_m: f64) -> Result<Self> {
        let geojson: GeoJson = source.parse().context("Failed to parse route GeoJSON")?;
        let geometries: Vec<Geometry> = match geojson {
            GeoJson::FeatureCollection(collection) => collection
                .features
                .into_iter()
                .filter_map(|feature| feature.geometry)
                .collect(),
            GeoJson::Feature(feature) => feature.geometry.into_iter().collect(),
            GeoJson::Geometry(geometry) => vec![geometry],
        };

        let mut routes = Vec::new();
        for geometry in geometries {
            if let Value::LineString(line) = geometry.value {
                let route = line
                    .iter()
                    .map(|position| match position.as_slice() {
                        // GeoJSON positions are [longitude, latitude, ...].
                        [lng, lat, ..] => Coordinate::new(*lat, *lng).map_err(|e| anyhow!(e)),
                        _ => Err(anyhow!("GeoJSON position needs two values")),
                    })
                    .collect::<Result<Vec<_>>>()?;
                if !route.is_empty() {
                    routes.push(route);
                }
            }
        }

        if routes.is_empty() {
            return Err(anyhow!("GeoJSON contains no LineString routes"));
        }
        Ok(Self { routes, tolerance_m })
    }

    pub async fn from_file<P: AsRef<FsPath>>(path: P, tolerance_m: f64) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read route file {}", path.display()))?;
        Self::from_geojson_str(&content, tolerance_m)
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

#[async_trait]
impl PathProvider for GeoJsonRouteProvider {
    async fn route(&self, start: Coordinate, end: Coordinate) -> Result<Path, RoutingError> {
        let near = |a: &Coordinate, b: &Coordinate| a.approx_eq(b, self.tolerance_m);

        for route in &self.routes {
            let (first, last) = (&route[0], &route[route.len() - 1]);
            if near(first, &start) && near(last, &end) {
                return Path::new(route.clone()).map_err(|e| RoutingError::new(e.to_string()));
            }
            if near(last, &start) && near(first, &end) {
                let reversed = route.iter().rev().copied().collect();
                return Path::new(reversed).map_err(|e| RoutingError::new(e.to_string()));
            }
        }

        Err(RoutingError::new(format!("no stored route from {} to {}", start, end)))
    }
}
