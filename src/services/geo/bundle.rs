use super::crs::{epsg_from_wkt, reproject_to_wgs84};
use super::{Extent, GeoError};
use crate::services::validation::inspect_bundle;
use shapefile::ShapeReader;
use std::io::{Cursor, Read};
use zip::ZipArchive;

/// Main file header length; the bounding box lives inside it
const SHP_HEADER_LEN: u64 = 100;
/// `.prj` files are a single WKT string
const MAX_PRJ_LEN: u64 = 64 * 1024;

fn member_with_extension<'a>(names: &'a [String], extension: &str) -> Option<&'a str> {
    names
        .iter()
        .find(|n| {
            n.rsplit_once('.')
                .is_some_and(|(_, ext)| ext.eq_ignore_ascii_case(extension))
        })
        .map(String::as_str)
}

fn read_member(
    archive: &mut ZipArchive<Cursor<&[u8]>>,
    name: &str,
    limit: u64,
) -> Result<Vec<u8>, GeoError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| GeoError::Read(format!("{}: {}", name, e)))?;
    let mut buf = Vec::new();
    entry
        .take(limit)
        .read_to_end(&mut buf)
        .map_err(|e| GeoError::Read(format!("{}: {}", name, e)))?;
    Ok(buf)
}

/// Extent of a zipped shapefile bundle from the `.shp` header and the `.prj` CRS.
pub fn extract(content: &[u8]) -> Result<Extent, GeoError> {
    let names = inspect_bundle(content)?;
    let mut archive = ZipArchive::new(Cursor::new(content))
        .map_err(|e| GeoError::Read(e.to_string()))?;

    // Both members exist, inspect_bundle enforces the required set
    let prj_name = member_with_extension(&names, "prj")
        .ok_or_else(|| GeoError::Read("missing .prj member".to_string()))?;
    let shp_name = member_with_extension(&names, "shp")
        .ok_or_else(|| GeoError::Read("missing .shp member".to_string()))?;

    let prj = read_member(&mut archive, prj_name, MAX_PRJ_LEN)?;
    let prj = String::from_utf8_lossy(&prj);
    let prj = prj.trim();
    if prj.is_empty() {
        return Err(GeoError::NoCrs);
    }
    let code = epsg_from_wkt(prj).ok_or_else(|| GeoError::UnrecognisedCrs(prj_name.to_string()))?;

    let header = read_member(&mut archive, shp_name, SHP_HEADER_LEN)?;
    let reader = ShapeReader::new(Cursor::new(header))
        .map_err(|e| GeoError::Read(format!("{}: {}", shp_name, e)))?;
    let header = reader.header();

    // file_length is in 16-bit words; 50 words is a header with no records
    if header.file_length <= 50 {
        return Err(GeoError::NoGeometry);
    }

    let bbox = Extent::new(
        header.bbox.min.x,
        header.bbox.min.y,
        header.bbox.max.x,
        header.bbox.max.y,
    );
    if !bbox.is_finite() {
        return Err(GeoError::Read(format!("{}: invalid bounding box", shp_name)));
    }

    reproject_to_wgs84(code, bbox)
}
