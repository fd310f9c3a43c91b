//! Spatial extent extraction for GeoPackages and zipped shapefile bundles.
//!
//! Every dataset is reduced to the axis-aligned bounding box of its
//! geometries, reprojected into EPSG:4326 and emitted as a WKT polygon.

pub mod bundle;
pub mod crs;
pub mod geopackage;

use crate::services::validation::{BundleViolation, normalize_extension};
use bytes::Bytes;
use geo::{Rect, coord};
use std::path::Path;
use thiserror::Error;
use wkt::ToWkt;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeoError {
    #[error("Dataset declares no coordinate reference system")]
    NoCrs,

    #[error("Invalid shapefile bundle: {0}")]
    InvalidContainer(#[from] BundleViolation),

    #[error("Spatial extraction is not supported for '.{0}' files")]
    UnsupportedExtension(String),

    #[error("Unrecognised coordinate reference system: {0}")]
    UnrecognisedCrs(String),

    #[error("Dataset contains no geometries")]
    NoGeometry,

    #[error("Failed to read dataset: {0}")]
    Read(String),

    #[error("Reprojection failed: {0}")]
    Reprojection(String),
}

impl GeoError {
    /// Only a denylisted member smuggled inside a bundle fails the whole upload
    pub fn is_security_violation(&self) -> bool {
        matches!(self, GeoError::InvalidContainer(v) if v.is_security_violation())
    }
}

/// Axis-aligned bounding box; longitude/latitude once reprojected
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extent {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Extent {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn union(self, other: Extent) -> Extent {
        Extent {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.min_x.is_finite()
            && self.min_y.is_finite()
            && self.max_x.is_finite()
            && self.max_y.is_finite()
    }

    pub fn to_wkt(&self) -> String {
        Rect::new(
            coord! { x: self.min_x, y: self.min_y },
            coord! { x: self.max_x, y: self.max_y },
        )
        .to_polygon()
        .wkt_string()
    }
}

impl From<Rect<f64>> for Extent {
    fn from(rect: Rect<f64>) -> Self {
        Extent::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y)
    }
}

/// Computes the EPSG:4326 extent of an uploaded spatial dataset.
#[derive(Debug, Clone, Default)]
pub struct GeoExtractor;

impl GeoExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Dispatches on the filename: `.gpkg` is read as a GeoPackage, `.zip` as a shapefile bundle.
    pub async fn extract(&self, filename: &str, content: &Bytes) -> Result<Extent, GeoError> {
        let extension = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(normalize_extension)
            .unwrap_or_default();

        let extent = match extension.as_str() {
            "gpkg" => geopackage::extract(content).await?,
            "zip" => {
                let content = content.clone();
                tokio::task::spawn_blocking(move || bundle::extract(&content))
                    .await
                    .map_err(|e| GeoError::Read(format!("extraction task failed: {}", e)))??
            }
            _ => return Err(GeoError::UnsupportedExtension(extension)),
        };

        tracing::debug!("🗺️  Extent of {}: {:?}", filename, extent);
        Ok(extent)
    }
}
