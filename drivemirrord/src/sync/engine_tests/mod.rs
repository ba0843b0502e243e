use super::*;

use std::path::Path;

use tempfile::tempdir;
use wiremock::matchers::{body_bytes, body_json, method, path as url_path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn make_engine(server: &MockServer, root: &Path) -> SyncEngine {
    make_engine_with_flags(server, root, false)
}

fn make_engine_with_flags(server: &MockServer, root: &Path, delete_permanently: bool) -> SyncEngine {
    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let metadata = MetadataStore::new(client.clone(), root.to_path_buf());
    metadata.set_root("root");
    let (status, _status_rx, _events_rx) = StatusHub::new();
    SyncEngine::new(
        client,
        metadata,
        IgnoreRegistry::new(),
        status,
        delete_permanently,
    )
}

fn md5_hex(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

fn folder_record(id: &str, name: &str, parents: &[&str]) -> FileRecord {
    FileRecord {
        id: id.into(),
        name: name.into(),
        mime_type: "application/vnd.google-apps.folder".into(),
        modified_time: Some("2024-01-01T00:00:00Z".into()),
        parents: parents.iter().map(|p| p.to_string()).collect(),
        ..FileRecord::default()
    }
}

fn file_record(id: &str, name: &str, parents: &[&str], content: &[u8]) -> FileRecord {
    FileRecord {
        id: id.into(),
        name: name.into(),
        mime_type: "text/plain".into(),
        md5_checksum: Some(md5_hex(content)),
        size: Some(content.len() as u64),
        modified_time: Some("2024-01-01T00:00:00Z".into()),
        parents: parents.iter().map(|p| p.to_string()).collect(),
        trashed: false,
    }
}

fn change_for(record: FileRecord) -> ChangeItem {
    ChangeItem {
        file_id: record.id.clone(),
        removed: false,
        time: record.modified_time.clone(),
        file: Some(record),
    }
}

fn removal_of(id: &str) -> ChangeItem {
    ChangeItem {
        file_id: id.into(),
        removed: true,
        time: None,
        file: None,
    }
}

async fn mock_download(server: &MockServer, id: &str, content: &'static [u8]) {
    Mock::given(method("GET"))
        .and(url_path(format!("/drive/v3/files/{id}")))
        .and(query_param("alt", "media"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content))
        .mount(server)
        .await;
}

/// Seeds a record as if a previous sync had materialized it: cached,
/// indexed, on disk and marked in the materialized set.
fn seed_on_disk(engine: &SyncEngine, record: FileRecord, content: Option<&[u8]>) {
    let paths = engine.metadata.materialize_cached(record.clone());
    for path in &paths {
        if record.is_folder() {
            std::fs::create_dir_all(path).unwrap();
        } else {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content.unwrap_or_default()).unwrap();
        }
        engine.metadata.mark_materialized(path);
    }
}

include!("part1.rs");
include!("part2.rs");
