use super::crs::{epsg_from_wkt, reproject_to_wgs84};
use super::{Extent, GeoError};
use futures::TryStreamExt;
use geo::BoundingRect;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection, Row, SqliteConnection};

struct FeatureLayer {
    table: String,
    column: String,
    srs_id: i64,
}

/// Envelope of one GeoPackage geometry blob, `None` for empty geometries.
///
/// Uses the header envelope when present and decodes the WKB body otherwise.
pub fn blob_envelope(blob: &[u8]) -> Result<Option<Extent>, GeoError> {
    if blob.len() < 8 || &blob[..2] != b"GP" {
        return Err(GeoError::Read("geometry is not GeoPackage binary".to_string()));
    }

    let flags = blob[3];
    let little_endian = flags & 0b1 == 1;
    let envelope_kind = (flags >> 1) & 0b111;
    let empty = flags & 0b1_0000 != 0;

    let envelope_len = match envelope_kind {
        0 => 0,
        1 => 32,
        2 | 3 => 48,
        4 => 64,
        other => {
            return Err(GeoError::Read(format!(
                "invalid envelope indicator {}",
                other
            )));
        }
    };
    let wkb_offset = 8 + envelope_len;
    if blob.len() < wkb_offset {
        return Err(GeoError::Read("truncated geometry header".to_string()));
    }
    if empty {
        return Ok(None);
    }

    if envelope_len > 0 {
        let value = |i: usize| {
            let start = 8 + i * 8;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&blob[start..start + 8]);
            if little_endian {
                f64::from_le_bytes(raw)
            } else {
                f64::from_be_bytes(raw)
            }
        };
        // Envelope order is minx, maxx, miny, maxy
        let extent = Extent::new(value(0), value(2), value(1), value(3));
        if extent.is_finite() {
            return Ok(Some(extent));
        }
    }

    let mut wkb = &blob[wkb_offset..];
    let geometry = wkb::wkb_to_geom(&mut wkb)
        .map_err(|e| GeoError::Read(format!("invalid WKB: {:?}", e)))?;
    Ok(geometry.bounding_rect().map(Extent::from))
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn read_err(e: sqlx::Error) -> GeoError {
    GeoError::Read(e.to_string())
}

async fn layers(conn: &mut SqliteConnection) -> Result<Vec<FeatureLayer>, GeoError> {
    let rows = sqlx::query(
        "SELECT g.table_name, g.column_name, g.srs_id \
         FROM gpkg_geometry_columns g \
         JOIN gpkg_contents c ON c.table_name = g.table_name \
         WHERE c.data_type = 'features'",
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(read_err)?;

    rows.iter()
        .map(|row| {
            Ok(FeatureLayer {
                table: row.try_get(0).map_err(read_err)?,
                column: row.try_get(1).map_err(read_err)?,
                srs_id: row.try_get(2).map_err(read_err)?,
            })
        })
        .collect()
}

async fn layer_epsg(conn: &mut SqliteConnection, layer: &FeatureLayer) -> Result<u16, GeoError> {
    // srs_id 0 and -1 are the reserved undefined geographic/cartesian systems
    if layer.srs_id <= 0 {
        return Err(GeoError::NoCrs);
    }

    let row = sqlx::query(
        "SELECT organization, organization_coordsys_id, definition \
         FROM gpkg_spatial_ref_sys WHERE srs_id = ?",
    )
    .bind(layer.srs_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(read_err)?
    .ok_or(GeoError::NoCrs)?;

    let organization: String = row.try_get(0).map_err(read_err)?;
    let coordsys_id: i64 = row.try_get(1).map_err(read_err)?;
    let definition: String = row.try_get(2).map_err(read_err)?;

    if organization.eq_ignore_ascii_case("EPSG") {
        if let Ok(code) = u16::try_from(coordsys_id) {
            return Ok(code);
        }
    }

    epsg_from_wkt(&definition)
        .ok_or_else(|| GeoError::UnrecognisedCrs(format!("{}:{}", organization, coordsys_id)))
}

async fn layer_bbox(
    conn: &mut SqliteConnection,
    layer: &FeatureLayer,
) -> Result<Option<Extent>, GeoError> {
    let sql = format!(
        "SELECT {} FROM {}",
        quote_ident(&layer.column),
        quote_ident(&layer.table)
    );
    let mut rows = sqlx::query_scalar::<_, Option<Vec<u8>>>(&sql).fetch(&mut *conn);

    let mut bbox: Option<Extent> = None;
    while let Some(blob) = rows.try_next().await.map_err(read_err)? {
        let Some(blob) = blob else { continue };
        if let Some(envelope) = blob_envelope(&blob)? {
            bbox = Some(bbox.map_or(envelope, |b| b.union(envelope)));
        }
    }
    Ok(bbox)
}

async fn read_extent(conn: &mut SqliteConnection) -> Result<Extent, GeoError> {
    let layers = layers(conn).await?;
    if layers.is_empty() {
        return Err(GeoError::NoGeometry);
    }

    let mut extent: Option<Extent> = None;
    for layer in &layers {
        let code = layer_epsg(conn, layer).await?;
        let Some(bbox) = layer_bbox(conn, layer).await? else {
            tracing::debug!("GeoPackage layer {} has no geometries", layer.table);
            continue;
        };
        let projected = reproject_to_wgs84(code, bbox)?;
        extent = Some(extent.map_or(projected, |e| e.union(projected)));
    }

    extent.ok_or(GeoError::NoGeometry)
}

/// Extent of every feature table in a GeoPackage, unioned in EPSG:4326.
pub async fn extract(content: &[u8]) -> Result<Extent, GeoError> {
    // SQLite needs a real file; the temp file is removed when `file` drops
    let file = tempfile::Builder::new()
        .suffix(".gpkg")
        .tempfile()
        .map_err(|e| GeoError::Read(format!("temp file: {}", e)))?;
    tokio::fs::write(file.path(), content)
        .await
        .map_err(|e| GeoError::Read(format!("temp file: {}", e)))?;

    let mut conn = SqliteConnectOptions::new()
        .filename(file.path())
        .read_only(true)
        .connect()
        .await
        .map_err(read_err)?;

    let result = read_extent(&mut conn).await;

    if let Err(e) = conn.close().await {
        tracing::warn!("Failed to close GeoPackage connection: {}", e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point_blob(x: f64, y: f64, with_envelope: bool) -> Vec<u8> {
        let mut blob = vec![b'G', b'P', 0];
        blob.push(if with_envelope { 0b0000_0011 } else { 0b0000_0001 });
        blob.extend_from_slice(&4326i32.to_le_bytes());
        if with_envelope {
            for v in [x, x, y, y] {
                blob.extend_from_slice(&v.to_le_bytes());
            }
        }
        blob.push(1);
        blob.extend_from_slice(&1u32.to_le_bytes());
        blob.extend_from_slice(&x.to_le_bytes());
        blob.extend_from_slice(&y.to_le_bytes());
        blob
    }

    #[test]
    fn test_envelope_from_header() {
        let env = blob_envelope(&point_blob(3.0, 4.0, true)).unwrap().unwrap();
        assert_eq!(env, Extent::new(3.0, 4.0, 3.0, 4.0));
    }

    #[test]
    fn test_envelope_from_wkb() {
        let env = blob_envelope(&point_blob(-1.5, 2.5, false)).unwrap().unwrap();
        assert_eq!(env, Extent::new(-1.5, 2.5, -1.5, 2.5));
    }

    #[test]
    fn test_empty_geometry_flag() {
        let mut blob = point_blob(0.0, 0.0, false);
        blob[3] |= 0b1_0000;
        assert_eq!(blob_envelope(&blob).unwrap(), None);
    }

    #[test]
    fn test_not_geopackage_binary() {
        assert!(blob_envelope(b"\x01\x01\x00\x00\x00").is_err());
    }
}
