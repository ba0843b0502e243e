use drivemirror_core::{DriveClient, DriveError, FilePatch};
use serde_json::json;
use tempfile::tempdir;
use wiremock::matchers::{body_bytes, body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn md5_hex(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

#[tokio::test]
async fn get_record_sends_bearer_token_and_parses_fields() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/files/f1"))
        .and(header("authorization", "Bearer test-token"))
        .and(query_param(
            "fields",
            "id,name,mimeType,md5Checksum,size,modifiedTime,parents,trashed",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "f1",
            "name": "a.txt",
            "mimeType": "text/plain",
            "md5Checksum": "h1",
            "size": "3",
            "modifiedTime": "2024-01-01T00:00:00Z",
            "parents": ["root"],
            "trashed": false
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let record = client.get_record("f1").await.unwrap().unwrap();

    assert_eq!(record.name, "a.txt");
    assert_eq!(record.size, Some(3));
    assert_eq!(record.parents, vec!["root".to_string()]);
    assert!(!record.is_folder());
}

#[tokio::test]
async fn get_record_maps_not_found_to_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/files/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    assert!(client.get_record("gone").await.unwrap().is_none());
}

#[tokio::test]
async fn get_record_surfaces_other_api_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/files/f1"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client.get_record("f1").await.unwrap_err();
    assert!(matches!(err, DriveError::Api { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn list_children_all_follows_page_tokens() {
    let server = MockServer::start().await;
    let q = "trashed = false and 'root' in parents";
    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .and(query_param("q", q))
        .and(query_param("pageSize", "1000"))
        .and(query_param("pageToken", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "files": [{"id": "b", "name": "b.txt"}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .and(query_param("q", q))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "files": [{"id": "a", "name": "a.txt"}],
            "nextPageToken": "page-2"
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let files = client.list_children_all("root").await.unwrap();
    let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "b.txt"]);
}

#[tokio::test]
async fn create_file_inserts_metadata_then_uploads_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/drive/v3/files"))
        .and(body_json(json!({"name": "new.txt", "parents": ["root"]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "n1",
            "name": "new.txt"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/upload/drive/v3/files/n1"))
        .and(query_param("uploadType", "media"))
        .and(body_bytes(b"payload".to_vec()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "n1",
            "name": "new.txt",
            "md5Checksum": md5_hex(b"payload"),
            "size": 7
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let source = dir.path().join("new.txt");
    std::fs::write(&source, b"payload").unwrap();

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let metadata = FilePatch {
        name: Some("new.txt".into()),
        parents: Some(vec!["root".into()]),
        ..FilePatch::default()
    };
    let record = client.create_file(&metadata, Some(&source)).await.unwrap();
    assert_eq!(record.md5_checksum.as_deref(), Some(md5_hex(b"payload").as_str()));
    assert_eq!(record.size, Some(7));
}

#[tokio::test]
async fn update_metadata_patches_only_populated_fields() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/drive/v3/files/f1"))
        .and(body_json(json!({"trashed": true})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "f1",
            "name": "a.txt",
            "trashed": true
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let record = client
        .update_metadata("f1", &FilePatch::trash())
        .await
        .unwrap();
    assert!(record.trashed);
}

#[tokio::test]
async fn delete_record_accepts_no_content() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/drive/v3/files/f1"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    client.delete_record("f1").await.unwrap();
}

#[tokio::test]
async fn start_page_token_unwraps_the_payload() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/changes/startPageToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "startPageToken": "token-42"
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    assert_eq!(client.start_page_token().await.unwrap(), "token-42");
}

#[tokio::test]
async fn changes_since_all_concatenates_pages_and_adopts_the_new_start_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/changes"))
        .and(query_param("pageToken", "next-page"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "changes": [{"fileId": "b", "removed": true}],
            "newStartPageToken": "token-9"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/changes"))
        .and(query_param("pageToken", "token-8"))
        .and(query_param("restrictToMyDrive", "true"))
        .and(query_param("spaces", "drive"))
        .and(query_param("pageSize", "1000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "changes": [{
                "fileId": "a",
                "removed": false,
                "file": {"id": "a", "name": "a.txt", "size": 1}
            }],
            "nextPageToken": "next-page"
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let (changes, new_start) = client.changes_since_all("token-8").await.unwrap();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0].file_id, "a");
    assert!(changes[1].removed);
    assert_eq!(new_start, Some("token-9".to_string()));
}

#[tokio::test]
async fn download_writes_the_content_and_returns_its_digest() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/files/f1"))
        .and(query_param("alt", "media"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello"))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let target = dir.path().join("nested/out.txt");
    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let digest = client
        .download_to_path("f1", &target, Some(&md5_hex(b"hello")))
        .await
        .unwrap();

    assert_eq!(std::fs::read(&target).unwrap(), b"hello");
    assert_eq!(digest, md5_hex(b"hello"));
}

#[tokio::test]
async fn download_removes_the_file_on_checksum_mismatch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/files/f1"))
        .and(query_param("alt", "media"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello"))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let target = dir.path().join("bad.txt");
    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client
        .download_to_path("f1", &target, Some("deadbeef"))
        .await
        .expect_err("expected md5 mismatch");

    assert!(matches!(err, DriveError::IntegrityMismatch { .. }));
    assert!(!target.exists());
}
