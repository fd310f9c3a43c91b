mod common;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use http_body_util::BodyExt;
use object_catalog::api::middleware::csrf::CSRF_HEADER;
use object_catalog::services::catalog::DELETE_SCHEDULED_TAG;
use object_catalog::services::scanner::NoOpScanner;
use object_catalog::services::storage::{BlobLocation, MemoryBlobStore};
use object_catalog::utils::auth::create_jwt;
use object_catalog::{AppState, create_app};
use std::io::{Cursor, Read};
use std::sync::Arc;
use tower::ServiceExt;

const OWNER: &str = "analyst@example.org";
const BOUNDARY: &str = "---------------------------object-catalog-boundary";

struct TestApp {
    app: Router,
    store: Arc<MemoryBlobStore>,
}

async fn test_app() -> TestApp {
    let db = common::setup_db().await;
    let store = Arc::new(MemoryBlobStore::new());
    let state = AppState::new(
        db,
        store.clone(),
        Arc::new(NoOpScanner),
        common::test_config(),
    );
    TestApp {
        app: create_app(state),
        store,
    }
}

fn session(identity: &str) -> String {
    create_jwt(identity, "test-jwt-secret").unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

async fn send_json(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let (status, body) = send(app, request).await;
    let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

async fn csrf_token(app: &Router, jwt: &str) -> String {
    let (status, json) = send_json(
        app,
        Request::builder()
            .uri("/csrf-token")
            .header(header::AUTHORIZATION, format!("Bearer {}", jwt))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    json["token"].as_str().unwrap().to_string()
}

fn multipart_body(entry_id: &str, filename: &str, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"entry_id\"\r\n\r\n{entry}\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"tags\"\r\n\r\nflood, rivers\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n",
            b = BOUNDARY,
            entry = entry_id,
            name = filename
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
    body
}

fn upload_request(jwt: &str, csrf: Option<&str>, filename: &str, content: &[u8]) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/upload")
        .header(header::AUTHORIZATION, format!("Bearer {}", jwt))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        );
    if let Some(csrf) = csrf {
        builder = builder.header(CSRF_HEADER, csrf);
    }
    builder
        .body(Body::from(multipart_body(common::CSV_ENTRY, filename, content)))
        .unwrap()
}

async fn upload(app: &Router, jwt: &str, csrf: &str, filename: &str, content: &[u8]) -> String {
    let (status, json) = send_json(app, upload_request(jwt, Some(csrf), filename, content)).await;
    assert_eq!(status, StatusCode::OK, "upload failed: {}", json);
    json["location"].as_str().unwrap().to_string()
}

fn link_request(jwt: &str, csrf: &str, locations: &[&str]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/download-links")
        .header(header::AUTHORIZATION, format!("Bearer {}", jwt))
        .header(header::CONTENT_TYPE, "application/json")
        .header(CSRF_HEADER, csrf)
        .body(Body::from(
            serde_json::json!({ "locations": locations }).to_string(),
        ))
        .unwrap()
}

fn get(uri: &str, jwt: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", jwt))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_health_is_public() {
    let t = test_app().await;
    let (status, json) = send_json(
        &t.app,
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["scanner"], "disabled");
}

#[tokio::test]
async fn test_catalogue_requires_session() {
    let t = test_app().await;

    let (status, _) = send(
        &t.app,
        Request::builder().uri("/entries").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, json) = send_json(&t.app, get("/entries", &session(OWNER))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json.as_array().unwrap().len(), common::dictionary().len());

    let (status, _) = send(&t.app, get("/entries/nope/objects", &session(OWNER))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_mutations_require_anti_forgery_token() {
    let t = test_app().await;
    let jwt = session(OWNER);

    let (status, _) = send(
        &t.app,
        upload_request(&jwt, None, "stations.csv", common::CSV_BODY),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // A token minted for someone else does not transfer
    let foreign = csrf_token(&t.app, &session("someone@example.org")).await;
    let (status, json) = send_json(
        &t.app,
        upload_request(&jwt, Some(&foreign), "stations.csv", common::CSV_BODY),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["error"], "Access denied");

    assert!(t.store.is_empty());
}

#[tokio::test]
async fn test_rejected_upload_is_bad_request() {
    let t = test_app().await;
    let jwt = session(OWNER);
    let csrf = csrf_token(&t.app, &jwt).await;

    let (status, json) = send_json(
        &t.app,
        upload_request(&jwt, Some(&csrf), "page.html", b"<html><body></body></html>"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains(".html"));
    assert!(t.store.is_empty());
}

#[tokio::test]
async fn test_truncated_form_field_is_bad_request() {
    let t = test_app().await;
    let jwt = session(OWNER);
    let csrf = csrf_token(&t.app, &jwt).await;

    // The file part is complete, the entry_id part after it never ends
    let mut body = multipart_body(common::CSV_ENTRY, "stations.csv", common::CSV_BODY);
    let closing = format!("--{}--\r\n", BOUNDARY);
    body.truncate(body.len() - closing.len());
    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Disposition: form-data; name=\"entry_id\"\r\n\r\n{}",
            BOUNDARY,
            common::CSV_ENTRY
        )
        .as_bytes(),
    );

    let mut request = upload_request(&jwt, Some(&csrf), "stations.csv", common::CSV_BODY);
    *request.body_mut() = Body::from(body);

    let (status, json) = send_json(&t.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("multipart/form-data"));
    assert!(t.store.is_empty());
}

#[tokio::test]
async fn test_upload_list_and_download_once() {
    let t = test_app().await;
    let jwt = session(OWNER);
    let csrf = csrf_token(&t.app, &jwt).await;

    let location = upload(&t.app, &jwt, &csrf, "stations.csv", common::CSV_BODY).await;

    let (status, objects) = send_json(
        &t.app,
        get(&format!("/entries/{}/objects", common::CSV_ENTRY), &jwt),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let objects = objects.as_array().unwrap();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0]["location"], location.as_str());
    assert_eq!(objects[0]["tags"], serde_json::json!(["flood", "rivers"]));

    let (status, link) = send_json(&t.app, link_request(&jwt, &csrf, &[&location])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(link["purpose"], "download_file");
    let url = link["url"].as_str().unwrap();
    assert!(url.starts_with("/download_file?"));

    let response = t.app.clone().oneshot(get(url, &jwt)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/octet-stream"
    );
    let disposition = response.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.contains("stations.csv"));
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], common::CSV_BODY);
    assert_eq!(t.store.open_readers(), 0);

    // Same link again
    let (status, _) = send(&t.app, get(url, &jwt)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_download_link_bound_to_its_object() {
    let t = test_app().await;
    let jwt = session(OWNER);
    let csrf = csrf_token(&t.app, &jwt).await;

    let first = upload(&t.app, &jwt, &csrf, "a.csv", common::CSV_BODY).await;
    let second = upload(&t.app, &jwt, &csrf, "b.csv", common::CSV_BODY).await;

    let (_, link) = send_json(&t.app, link_request(&jwt, &csrf, &[&first])).await;
    let url = link["url"].as_str().unwrap();
    let token = url.rsplit("token=").next().unwrap();

    let other = BlobLocation::parse(&second).unwrap();
    let forged = format!(
        "/download_file?{}",
        serde_urlencoded::to_string([
            ("bucket", other.bucket.as_str()),
            ("object", other.key.as_str()),
        ])
        .unwrap()
    ) + "&token="
        + token;
    let (status, _) = send(&t.app, get(&forged, &jwt)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // The mismatch did not burn the token
    let (status, _) = send(&t.app, get(url, &jwt)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_link_for_unknown_object_is_not_found() {
    let t = test_app().await;
    let jwt = session(OWNER);
    let csrf = csrf_token(&t.app, &jwt).await;

    let (status, _) = send(
        &t.app,
        link_request(&jwt, &csrf, &["models/stations/x/missing.csv"]),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&t.app, link_request(&jwt, &csrf, &["no-slash"])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&t.app, link_request(&jwt, &csrf, &[])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_zip_download_of_several_objects() {
    let t = test_app().await;
    let jwt = session(OWNER);
    let csrf = csrf_token(&t.app, &jwt).await;

    let first = upload(&t.app, &jwt, &csrf, "north.csv", common::CSV_BODY).await;
    let second = upload(&t.app, &jwt, &csrf, "south.csv", b"a,b\n1,2\n3,4\n").await;

    let (status, link) = send_json(&t.app, link_request(&jwt, &csrf, &[&first, &second])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(link["purpose"], "download_zip");
    let url = link["url"].as_str().unwrap();
    assert!(url.starts_with("/download_zip?"));

    let (status, body) = send(&t.app, get(url, &jwt)).await;
    assert_eq!(status, StatusCode::OK);

    let mut archive = zip::ZipArchive::new(Cursor::new(body)).unwrap();
    assert_eq!(archive.len(), 2);

    let expected = [
        (BlobLocation::parse(&first).unwrap(), common::CSV_BODY.to_vec()),
        (BlobLocation::parse(&second).unwrap(), b"a,b\n1,2\n3,4\n".to_vec()),
    ];
    for (index, (location, content)) in expected.iter().enumerate() {
        let mut member = archive.by_index(index).unwrap();
        assert_eq!(member.name().unwrap(), location.archive_entry_name());
        let mut data = Vec::new();
        member.read_to_end(&mut data).unwrap();
        assert_eq!(&data, content);
    }

    let (status, _) = send(&t.app, get(url, &jwt)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&t.app, get("/download_zip?token=x", &jwt)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_only_owner_schedules_deletion() {
    let t = test_app().await;
    let jwt = session(OWNER);
    let csrf = csrf_token(&t.app, &jwt).await;
    upload(&t.app, &jwt, &csrf, "stations.csv", common::CSV_BODY).await;

    let (_, objects) = send_json(
        &t.app,
        get(&format!("/entries/{}/objects", common::CSV_ENTRY), &jwt),
    )
    .await;
    let id = objects[0]["id"].as_str().unwrap().to_string();
    let location = BlobLocation::parse(objects[0]["location"].as_str().unwrap()).unwrap();

    let delete = |jwt: &str, csrf: &str| {
        Request::builder()
            .method("DELETE")
            .uri(format!("/objects/{}", id))
            .header(header::AUTHORIZATION, format!("Bearer {}", jwt))
            .header(CSRF_HEADER, csrf)
            .body(Body::empty())
            .unwrap()
    };

    let intruder = session("someone@example.org");
    let intruder_csrf = csrf_token(&t.app, &intruder).await;
    let (status, _) = send(&t.app, delete(&intruder, &intruder_csrf)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, json) = send_json(&t.app, delete(&jwt, &csrf)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "deletion_scheduled");

    // Tagged for the sweep, not removed
    assert!(t.store.contains(&location));
    assert_eq!(
        t.store.tags(&location).get(DELETE_SCHEDULED_TAG).map(String::as_str),
        Some("true")
    );

    let (_, objects) = send_json(
        &t.app,
        get(&format!("/entries/{}/objects", common::CSV_ENTRY), &jwt),
    )
    .await;
    assert!(objects.as_array().unwrap().is_empty());

    let (status, _) = send(&t.app, delete(&jwt, &csrf)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
