use chrono::{Duration as ChronoDuration, Utc};
use reqwest::Url;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::{
    matchers::{body_string_contains, header, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

use auction_sync::drive::auth::load_token_file;
use auction_sync::drive::{AuthError, DriveClient, RemoteStore, StoreError, TokenProvider};
use auction_sync::layout::write_in_place;
use auction_sync::retry::RetryPolicy;

const TIMEOUT: Duration = Duration::from_secs(5);

fn write_token(dir: &TempDir, token_uri: &str, expires_in_minutes: i64) -> PathBuf {
    let path = dir.path().join("token.json");
    let body = json!({
        "token": "tok",
        "refresh_token": "refresh-1",
        "token_uri": token_uri,
        "client_id": "client",
        "client_secret": "secret",
        "scopes": ["https://www.googleapis.com/auth/drive"],
        "expiry": (Utc::now() + ChronoDuration::minutes(expires_in_minutes)).to_rfc3339(),
    });
    std::fs::write(&path, body.to_string()).unwrap();
    path
}

fn provider(path: &Path) -> Arc<TokenProvider> {
    Arc::new(TokenProvider::new(path, TIMEOUT).with_retry(RetryPolicy::immediate(3)))
}

async fn client(server: &MockServer, dir: &TempDir) -> DriveClient {
    let token = write_token(dir, &format!("{}/token", server.uri()), 60);
    let base = Url::parse(&format!("{}/", server.uri())).unwrap();
    DriveClient::with_base_url(provider(&token), TIMEOUT, base)
}

fn file(id: &str, name: &str, mime: &str) -> serde_json::Value {
    json!({
        "id": id,
        "name": name,
        "mimeType": mime,
        "webViewLink": format!("https://drive.google.com/drive/folders/{}", id),
    })
}

#[tokio::test]
async fn find_folder_sends_scoped_query_with_bearer_token() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let drive = client(&server, &dir).await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .and(header("authorization", "Bearer tok"))
        .and(query_param(
            "q",
            "name = 'Images' and mimeType = 'application/vnd.google-apps.folder' \
             and trashed = false and 'root-1' in parents",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "files": [file("img-1", "Images", "application/vnd.google-apps.folder")]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let found = drive.find_folder(Some("root-1"), "Images").await.unwrap().unwrap();
    assert_eq!(found.id, "img-1");
    assert!(found.is_folder());
    assert_eq!(found.public_link(), "https://drive.google.com/drive/folders/img-1");
}

#[tokio::test]
async fn list_children_follows_page_tokens() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let drive = client(&server, &dir).await;

    // Mounted first so the unqualified mock below does not shadow it.
    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .and(query_param("pageToken", "p2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "files": [file("c", "IMG_3.jpg", "image/jpeg")]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "nextPageToken": "p2",
            "files": [
                file("a", "IMG_1.jpg", "image/jpeg"),
                file("b", "IMG_2.jpg", "image/jpeg"),
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let children = drive.list_children("folder-1").await.unwrap();
    let ids: Vec<&str> = children.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn update_file_uploads_media_in_place() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let drive = client(&server, &dir).await;

    Mock::given(method("PATCH"))
        .and(path("/upload/drive/v3/files/csv-1"))
        .and(query_param("uploadType", "media"))
        .and(header("content-type", "text/csv"))
        .and(body_string_contains("1,Sedan"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "csv-1" })))
        .expect(1)
        .mount(&server)
        .await;

    drive
        .update_file("csv-1", "text/csv", b"ID,DETAILS\n1,Sedan\n")
        .await
        .unwrap();
}

#[tokio::test]
async fn status_codes_map_to_store_errors() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let drive = client(&server, &dir).await;

    Mock::given(method("POST"))
        .and(path("/drive/v3/files/src-1/copy"))
        .respond_with(ResponseTemplate::new(503).set_body_string("backend error"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/drive/v3/files/locked/permissions"))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/drive/v3/files/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/files/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let copy = drive.copy_file("src-1", "dest", "image_1.jpg").await;
    assert!(matches!(copy, Err(StoreError::Transient { op: "copy_file", .. })));

    let public = drive.set_public("locked").await;
    assert!(matches!(public, Err(StoreError::Rejected { status: 403, .. })));

    drive.delete("gone").await.unwrap();

    assert!(matches!(
        drive.read_file("missing").await,
        Err(StoreError::NotFound(_))
    ));
}

fn token_endpoint(access: &str) -> Mock {
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": access,
            "expires_in": 3599,
        })))
}

#[tokio::test]
async fn rejected_access_token_is_refreshed_once_and_replayed() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let drive = client(&server, &dir).await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files/csv-1"))
        .and(header("authorization", "Bearer tok"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid credentials"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/files/csv-1"))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ID\n1\n"))
        .expect(1)
        .mount(&server)
        .await;
    token_endpoint("fresh").expect(1).mount(&server).await;

    assert_eq!(drive.read_file("csv-1").await.unwrap(), b"ID\n1\n");
}

#[tokio::test]
async fn repeated_unauthorized_is_an_authentication_error() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let drive = client(&server, &dir).await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid credentials"))
        .expect(2)
        .mount(&server)
        .await;
    token_endpoint("still-bad").expect(1).mount(&server).await;

    let err = drive.list_children("root-1").await.unwrap_err();
    assert!(matches!(err, StoreError::Auth(AuthError::Authentication(_))));
}

#[tokio::test]
async fn new_file_upload_is_retried_without_recreating() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let drive = client(&server, &dir).await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "files": [] })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/drive/v3/files"))
        .respond_with(ResponseTemplate::new(200).set_body_json(file("csv-9", "data.csv", "text/csv")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/upload/drive/v3/files/csv-9"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/upload/drive/v3/files/csv-9"))
        .and(body_string_contains("1,Sedan"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "csv-9" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/drive/v3/files/csv-9/permissions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "anyone" })))
        .expect(1)
        .mount(&server)
        .await;

    let written = write_in_place(
        &drive,
        "root-1",
        "data.csv",
        b"ID,DETAILS\n1,Sedan\n",
        &RetryPolicy::immediate(3),
    )
    .await
    .unwrap();
    assert_eq!(written.id, "csv-9");
}

#[tokio::test]
async fn missing_token_file_requires_authentication() {
    let dir = TempDir::new().unwrap();
    let tokens = provider(&dir.path().join("token.json"));
    let err = tokens.access_token().await.unwrap_err();
    assert!(matches!(err, AuthError::Authentication(_)));
}

#[tokio::test]
async fn corrupt_or_incomplete_token_file_is_a_configuration_error() {
    let dir = TempDir::new().unwrap();
    let corrupt = dir.path().join("corrupt.json");
    std::fs::write(&corrupt, "{not json").unwrap();
    assert!(matches!(
        load_token_file(&corrupt).await,
        Err(AuthError::Configuration(_))
    ));

    let partial = dir.path().join("partial.json");
    std::fs::write(&partial, json!({ "token": "tok", "client_id": "c" }).to_string()).unwrap();
    match load_token_file(&partial).await {
        Err(AuthError::Configuration(msg)) => {
            assert!(msg.contains("client_secret"));
            assert!(msg.contains("refresh_token"));
        }
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn valid_token_is_used_without_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let path = write_token(&dir, &format!("{}/token", server.uri()), 60);
    let tokens = provider(&path);
    assert_eq!(tokens.access_token().await.unwrap(), "tok");
    assert_eq!(tokens.access_token().await.unwrap(), "tok");
}

#[tokio::test]
async fn expiring_token_is_refreshed_and_persisted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh",
            "expires_in": 3599,
            "refresh_token": "refresh-2",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let path = write_token(&dir, &format!("{}/token", server.uri()), 2);
    let tokens = provider(&path);

    assert_eq!(tokens.access_token().await.unwrap(), "fresh");
    // Cached in memory afterwards.
    assert_eq!(tokens.access_token().await.unwrap(), "fresh");

    let saved = load_token_file(&path).await.unwrap();
    assert_eq!(saved.token.as_deref(), Some("fresh"));
    assert_eq!(saved.refresh_token, "refresh-2");
    assert!(saved.expiry.unwrap() > Utc::now() + ChronoDuration::minutes(50));

    let backup = load_token_file(&dir.path().join("token.json.backup"))
        .await
        .unwrap();
    assert_eq!(backup.token.as_deref(), Some("tok"));
}

#[tokio::test]
async fn revoked_refresh_token_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Token has been expired or revoked.",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let path = write_token(&dir, &format!("{}/token", server.uri()), -10);
    let err = provider(&path).access_token().await.unwrap_err();
    match err {
        AuthError::Authentication(msg) => assert!(msg.contains("revoked")),
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn transient_refresh_failures_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "third-time",
            "expires_in": 3600,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let path = write_token(&dir, &format!("{}/token", server.uri()), -1);
    assert_eq!(provider(&path).access_token().await.unwrap(), "third-time");
    assert_eq!(load_token_file(&path).await.unwrap().refresh_token, "refresh-1");
}

#[tokio::test]
async fn exhausted_refresh_retries_become_authentication_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let path = write_token(&dir, &format!("{}/token", server.uri()), -1);
    match provider(&path).access_token().await.unwrap_err() {
        AuthError::Authentication(msg) => assert!(msg.contains("after 3 attempts")),
        other => panic!("unexpected: {:?}", other),
    }
}
