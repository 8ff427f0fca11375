//! HTTP surface tests, driven through the router without a socket.

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use flate2::read::GzDecoder;
use pod_harvest::http::{router, ServerState};
use pod_harvest::{
    OaiConfig, OaiEngine, RecordInput, Repository, RepositoryConfig, StreamId, UploadInput,
};
use std::io::Read;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

struct Server {
    _dir: TempDir,
    repo: Arc<Repository>,
    app: Router,
    stream: StreamId,
}

fn server() -> Server {
    let dir = TempDir::new().unwrap();
    let repo = Arc::new(
        Repository::create(RepositoryConfig {
            path: dir.path().join("repo"),
            max_records_per_page: 3,
            ..Default::default()
        })
        .unwrap(),
    );

    let stream = repo.create_stream("best-org", "").unwrap().id;
    repo.ingest(
        stream,
        UploadInput::records(["a1", "a2", "a3"].iter().map(|k| {
            RecordInput::new(
                *k,
                format!("<record><controlfield tag=\"001\">{k}</controlfield></record>"),
            )
        })),
    )
    .unwrap();
    repo.generate_full_dump(stream).unwrap();

    let state = ServerState {
        engine: Arc::new(OaiEngine::new(Arc::clone(&repo), OaiConfig::default())),
        repository: Arc::clone(&repo),
    };
    Server {
        _dir: dir,
        repo,
        app: router(state),
        stream,
    }
}

async fn get(app: &Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, body.to_vec())
}

#[tokio::test]
async fn test_identify_over_get() {
    let s = server();
    let (status, headers, body) = get(&s.app, "/oai?verb=Identify").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "text/xml; charset=utf-8");
    assert!(headers.get(header::CACHE_CONTROL).is_none());

    let body = String::from_utf8(body).unwrap();
    assert!(body.contains("<repositoryName>POD Aggregator</repositoryName>"));
}

#[tokio::test]
async fn test_list_records_disables_buffering() {
    let s = server();
    let (status, headers, body) = get(&s.app, "/oai?verb=ListRecords&metadataPrefix=marc21").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
    assert_eq!(headers["x-accel-buffering"], "no");
    let body = String::from_utf8(body).unwrap();
    assert!(body.contains("<ListRecords>"));
    assert!(body.contains(">a1</controlfield>"));
}

#[tokio::test]
async fn test_list_records_error_keeps_headers() {
    let s = server();
    let (status, headers, body) = get(&s.app, "/oai?verb=ListRecords&metadataPrefix=oai_dc").await;

    // Protocol errors are still 200 responses.
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
    assert_eq!(headers["x-accel-buffering"], "no");
    assert!(String::from_utf8(body)
        .unwrap()
        .contains("<error code=\"cannotDisseminateFormat\">"));
}

#[tokio::test]
async fn test_bad_verb_over_get() {
    let s = server();
    let (status, headers, body) = get(&s.app, "/oai?verb=Nope").await;

    assert_eq!(status, StatusCode::OK);
    assert!(headers.get(header::CACHE_CONTROL).is_none());
    assert!(String::from_utf8(body)
        .unwrap()
        .contains("<error code=\"badVerb\">"));
}

#[tokio::test]
async fn test_post_form() {
    let s = server();
    let response = s
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/oai")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("verb=ListSets"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = String::from_utf8(body.to_vec()).unwrap();
    assert!(body.contains(&format!("<setSpec>{}</setSpec>", s.stream)));
}

#[tokio::test]
async fn test_page_download() {
    let s = server();
    let dump = s.repo.current_full_dump(s.stream).unwrap();
    assert_eq!(dump.marcxml_pages.len(), 2);

    let (status, headers, body) = get(&s.app, &format!("/dumps/{}/marcxml/1", dump.id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "application/gzip");

    let mut xml = String::new();
    GzDecoder::new(body.as_slice())
        .read_to_string(&mut xml)
        .unwrap();
    assert_eq!(xml.as_bytes(), s.repo.read_page(&dump.marcxml_pages[1]).unwrap());
    assert!(xml.contains(">a3</controlfield>"));
}

#[tokio::test]
async fn test_missing_pages() {
    let s = server();
    let dump = s.repo.current_full_dump(s.stream).unwrap();

    for uri in [
        format!("/dumps/{}/marcxml/2", dump.id),
        format!("/dumps/{}/deletes/0", dump.id),
        format!("/dumps/{}/json/0", dump.id),
        "/dumps/999/oai/0".to_string(),
    ] {
        let (status, _, _) = get(&s.app, &uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
    }
}
