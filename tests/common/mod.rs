#![allow(dead_code)]

use anyhow::anyhow;
use async_trait::async_trait;
use object_catalog::config::SecurityConfig;
use object_catalog::infrastructure::database::run_migrations;
use object_catalog::infrastructure::seed::{EntrySeed, seed_dictionary};
use object_catalog::services::guard::{ActionGuard, Caller};
use object_catalog::services::scanner::{ScanResult, VirusScanner};
use object_catalog::services::storage::BlobReader;
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{ConnectOptions as _, Connection};
use std::io::{Cursor, Write};
use zip::write::SimpleFileOptions;

pub const CSV_ENTRY: &str = "stations";
pub const SHAPEFILE_ENTRY: &str = "catchments";
pub const GEOPACKAGE_ENTRY: &str = "land_cover";
pub const GRID_ENTRY: &str = "elevation";

pub const WGS84_PRJ: &str = r#"GEOGCS["GCS_WGS_1984",DATUM["D_WGS_1984",SPHEROID["WGS_1984",6378137.0,298.257223563]],PRIMEM["Greenwich",0.0],UNIT["Degree",0.0174532925199433]]"#;

pub const CSV_BODY: &[u8] = b"station,lat,lon\nA1,51.5,-0.12\nB2,52.2,0.11\n";

/// In-memory catalogue with the schema created and the test dictionary seeded
pub async fn setup_db() -> DatabaseConnection {
    let mut opt = ConnectOptions::new("sqlite::memory:");
    // One connection, otherwise every pooled connection gets its own empty database
    opt.max_connections(1).sqlx_logging(false);
    let db = Database::connect(opt).await.unwrap();
    run_migrations(&db).await.unwrap();
    seed_dictionary(&db, dictionary()).await.unwrap();
    db
}

pub fn dictionary() -> Vec<EntrySeed> {
    let entry = |id: &str, ext: &str, mime: &str, gis: bool| EntrySeed {
        id: id.to_string(),
        name: id.replace('_', " "),
        model_domain: "hydrology".to_string(),
        description: None,
        filename_extension: ext.to_string(),
        mime_type: mime.to_string(),
        gis,
    };

    vec![
        entry(CSV_ENTRY, "csv", "text/csv", false),
        entry(SHAPEFILE_ENTRY, ".SHP", "application/zip", true),
        entry(
            GEOPACKAGE_ENTRY,
            "gpkg",
            "application/geopackage+sqlite3",
            true,
        ),
        entry(GRID_ENTRY, "asc", "text/plain", true),
    ]
}

pub fn test_config() -> SecurityConfig {
    SecurityConfig {
        jwt_secret: "test-jwt-secret".to_string(),
        token_secret: "test-token-secret".to_string(),
        upload_bucket: "models".to_string(),
        ..SecurityConfig::development()
    }
}

/// Caller admitted through the anti-forgery guard, the only way one is minted
pub fn caller(identity: &str) -> Caller {
    let guard = ActionGuard::new("test-token-secret", 3600);
    let token = guard.issue_csrf_token(identity).unwrap();
    guard.admit(Some(identity), Some(&token)).unwrap()
}

pub struct InfectedScanner;

#[async_trait]
impl VirusScanner for InfectedScanner {
    async fn scan(&self, _reader: BlobReader) -> anyhow::Result<ScanResult> {
        Ok(ScanResult::Infected {
            threat_name: "Eicar-Test-Signature".to_string(),
        })
    }

    async fn health_check(&self) -> bool {
        true
    }
}

pub struct UnreachableScanner;

#[async_trait]
impl VirusScanner for UnreachableScanner {
    async fn scan(&self, _reader: BlobReader) -> anyhow::Result<ScanResult> {
        Err(anyhow!("Failed to connect to ClamAV at 127.0.0.1:3310"))
    }

    async fn health_check(&self) -> bool {
        false
    }
}

/// Point shapefile covering the given box, with a single record
pub fn shp_bytes(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&9994i32.to_be_bytes());
    buf.extend_from_slice(&[0u8; 20]);
    buf.extend_from_slice(&64i32.to_be_bytes());
    buf.extend_from_slice(&1000i32.to_le_bytes());
    buf.extend_from_slice(&1i32.to_le_bytes());
    for v in [min_x, min_y, max_x, max_y, 0.0, 0.0, 0.0, 0.0] {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf.extend_from_slice(&1i32.to_be_bytes());
    buf.extend_from_slice(&10i32.to_be_bytes());
    buf.extend_from_slice(&1i32.to_le_bytes());
    buf.extend_from_slice(&min_x.to_le_bytes());
    buf.extend_from_slice(&min_y.to_le_bytes());
    buf
}

pub fn zip_of(members: Vec<(&str, Vec<u8>)>) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in members {
        writer.start_file(name, SimpleFileOptions::default()).unwrap();
        writer.write_all(&data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub fn shapefile_bundle(prj: &str) -> Vec<u8> {
    zip_of(vec![
        ("catchments.shp", shp_bytes(-3.5, 50.25, -1.0, 52.0)),
        ("catchments.shx", b"x".to_vec()),
        ("catchments.dbf", b"x".to_vec()),
        ("catchments.prj", prj.as_bytes().to_vec()),
    ])
}

/// GeoPackage point geometry with an XY envelope
fn gpkg_point(x: f64, y: f64) -> Vec<u8> {
    let mut blob = vec![b'G', b'P', 0, 0b0000_0011];
    blob.extend_from_slice(&4326i32.to_le_bytes());
    for v in [x, x, y, y] {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob.push(1);
    blob.extend_from_slice(&1u32.to_le_bytes());
    blob.extend_from_slice(&x.to_le_bytes());
    blob.extend_from_slice(&y.to_le_bytes());
    blob
}

/// Minimal GeoPackage with one feature table of points in EPSG:4326
pub async fn geopackage(points: &[(f64, f64)]) -> Vec<u8> {
    let file = tempfile::Builder::new().suffix(".gpkg").tempfile().unwrap();
    let mut conn = SqliteConnectOptions::new()
        .filename(file.path())
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Delete)
        .connect()
        .await
        .unwrap();

    for statement in [
        "PRAGMA application_id = 1196444487",
        "CREATE TABLE gpkg_spatial_ref_sys (srs_name TEXT NOT NULL, srs_id INTEGER PRIMARY KEY, \
         organization TEXT NOT NULL, organization_coordsys_id INTEGER NOT NULL, \
         definition TEXT NOT NULL, description TEXT)",
        "CREATE TABLE gpkg_contents (table_name TEXT PRIMARY KEY, data_type TEXT NOT NULL, \
         identifier TEXT, srs_id INTEGER)",
        "CREATE TABLE gpkg_geometry_columns (table_name TEXT NOT NULL, column_name TEXT NOT NULL, \
         geometry_type_name TEXT NOT NULL, srs_id INTEGER NOT NULL, z TINYINT NOT NULL, m TINYINT NOT NULL)",
        "CREATE TABLE sites (fid INTEGER PRIMARY KEY, geom BLOB)",
        "INSERT INTO gpkg_contents VALUES ('sites', 'features', 'sites', 4326)",
        "INSERT INTO gpkg_geometry_columns VALUES ('sites', 'geom', 'POINT', 4326, 0, 0)",
    ] {
        sqlx::query(statement).execute(&mut conn).await.unwrap();
    }

    sqlx::query("INSERT INTO gpkg_spatial_ref_sys VALUES ('WGS 84', 4326, 'EPSG', 4326, ?, NULL)")
        .bind(WGS84_PRJ)
        .execute(&mut conn)
        .await
        .unwrap();

    for (x, y) in points {
        sqlx::query("INSERT INTO sites (geom) VALUES (?)")
            .bind(gpkg_point(*x, *y))
            .execute(&mut conn)
            .await
            .unwrap();
    }

    conn.close().await.unwrap();
    tokio::fs::read(file.path()).await.unwrap()
}
