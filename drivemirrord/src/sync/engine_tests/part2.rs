#[tokio::test]
async fn local_edit_uploads_the_new_content_once() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path());

    seed_on_disk(&engine, folder_record("F", "F", &["root"]), None);
    seed_on_disk(&engine, file_record("a1", "a.txt", &["F"], b"hello"), Some(b"hello"));

    let path = dir.path().join("F/a.txt");
    std::fs::write(&path, b"hello!").unwrap();

    Mock::given(method("PATCH"))
        .and(url_path("/upload/drive/v3/files/a1"))
        .and(query_param("uploadType", "media"))
        .and(body_bytes(b"hello!".to_vec()))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({
                    "id": "a1",
                    "name": "a.txt",
                    "mimeType": "text/plain",
                    "md5Checksum": md5_hex(b"hello!"),
                    "size": 6,
                    "modifiedTime": "2024-02-01T00:00:00Z",
                    "parents": ["F"],
                    "trashed": false
                })),
        )
        .expect(1)
        .mount(&server)
        .await;

    engine
        .apply_local_event(&LocalEvent::FileChanged { path: path.clone() })
        .await
        .unwrap();

    let cached = engine.metadata.cached("a1").unwrap();
    assert_eq!(cached.md5_checksum.as_deref(), Some(md5_hex(b"hello!").as_str()));
    assert_eq!(engine.metadata.id_for_path(&path), Some("a1".into()));
}

#[tokio::test]
async fn local_edit_with_matching_checksum_is_ignored() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path());

    seed_on_disk(&engine, file_record("a1", "a.txt", &["root"], b"hello"), Some(b"hello"));

    // No upload mock: a request would fail the apply.
    engine
        .apply_local_event(&LocalEvent::FileChanged {
            path: dir.path().join("a.txt"),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn local_edit_fans_out_to_sibling_materializations() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path());

    seed_on_disk(&engine, folder_record("F", "F", &["root"]), None);
    seed_on_disk(
        &engine,
        file_record("s1", "s.txt", &["F", "root"], b"abc"),
        Some(b"abc"),
    );

    let edited = dir.path().join("F/s.txt");
    std::fs::write(&edited, b"abcd").unwrap();

    Mock::given(method("PATCH"))
        .and(url_path("/upload/drive/v3/files/s1"))
        .and(query_param("uploadType", "media"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({
                    "id": "s1",
                    "name": "s.txt",
                    "mimeType": "text/plain",
                    "md5Checksum": md5_hex(b"abcd"),
                    "size": 4,
                    "modifiedTime": "2024-02-01T00:00:00Z",
                    "parents": ["F", "root"],
                    "trashed": false
                })),
        )
        .mount(&server)
        .await;

    engine
        .apply_local_event(&LocalEvent::FileChanged { path: edited })
        .await
        .unwrap();

    // The sibling copy follows without another watcher round trip.
    assert_eq!(std::fs::read(dir.path().join("s.txt")).unwrap(), b"abcd");
    assert!(engine.ignore.consume(&dir.path().join("s.txt")));
}

#[tokio::test]
async fn local_file_added_creates_a_remote_record() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path());

    let path = dir.path().join("new.txt");
    std::fs::write(&path, b"abc").unwrap();

    Mock::given(method("POST"))
        .and(url_path("/drive/v3/files"))
        .and(body_json(serde_json::json!({
            "name": "new.txt",
            "parents": ["root"]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "n1",
            "name": "new.txt",
            "mimeType": "text/plain",
            "parents": ["root"],
            "trashed": false
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(url_path("/upload/drive/v3/files/n1"))
        .and(query_param("uploadType", "media"))
        .and(body_bytes(b"abc".to_vec()))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "n1",
            "name": "new.txt",
            "mimeType": "text/plain",
            "md5Checksum": md5_hex(b"abc"),
            "size": 3,
            "modifiedTime": "2024-02-01T00:00:00Z",
            "parents": ["root"],
            "trashed": false
        })))
        .expect(1)
        .mount(&server)
        .await;

    engine
        .apply_local_event(&LocalEvent::FileAdded { path: path.clone() })
        .await
        .unwrap();

    let cached = engine.metadata.cached("n1").unwrap();
    assert_eq!(cached.md5_checksum.as_deref(), Some(md5_hex(b"abc").as_str()));
    assert_eq!(engine.metadata.id_for_path(&path), Some("n1".into()));
}

#[tokio::test]
async fn local_dir_added_creates_a_remote_folder() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path());

    let path = dir.path().join("Photos");
    std::fs::create_dir_all(&path).unwrap();

    Mock::given(method("POST"))
        .and(url_path("/drive/v3/files"))
        .and(body_json(serde_json::json!({
            "name": "Photos",
            "mimeType": "application/vnd.google-apps.folder",
            "parents": ["root"]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "p1",
            "name": "Photos",
            "mimeType": "application/vnd.google-apps.folder",
            "parents": ["root"],
            "trashed": false
        })))
        .expect(1)
        .mount(&server)
        .await;

    engine
        .apply_local_event(&LocalEvent::DirAdded { path: path.clone() })
        .await
        .unwrap();
    assert_eq!(engine.metadata.id_for_path(&path), Some("p1".into()));
}

#[tokio::test]
async fn local_removal_trashes_by_default() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path());

    seed_on_disk(&engine, file_record("a1", "a.txt", &["root"], b"abc"), Some(b"abc"));
    let path = dir.path().join("a.txt");
    std::fs::remove_file(&path).unwrap();

    Mock::given(method("PATCH"))
        .and(url_path("/drive/v3/files/a1"))
        .and(body_json(serde_json::json!({"trashed": true})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "a1",
            "name": "a.txt",
            "mimeType": "text/plain",
            "parents": ["root"],
            "trashed": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    engine
        .apply_local_event(&LocalEvent::FileRemoved { path: path.clone() })
        .await
        .unwrap();
    assert!(engine.metadata.cached("a1").is_none());
    assert_eq!(engine.metadata.id_for_path(&path), None);
}

#[tokio::test]
async fn local_removal_deletes_when_configured_permanently() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let engine = make_engine_with_flags(&server, dir.path(), true);

    seed_on_disk(&engine, file_record("a1", "a.txt", &["root"], b"abc"), Some(b"abc"));
    std::fs::remove_file(dir.path().join("a.txt")).unwrap();

    Mock::given(method("DELETE"))
        .and(url_path("/drive/v3/files/a1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    engine
        .apply_local_event(&LocalEvent::FileRemoved {
            path: dir.path().join("a.txt"),
        })
        .await
        .unwrap();
    assert!(engine.metadata.cached("a1").is_none());
}

#[tokio::test]
async fn local_removal_cleans_up_sibling_materializations() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path());

    seed_on_disk(&engine, folder_record("F", "F", &["root"]), None);
    seed_on_disk(
        &engine,
        file_record("s1", "s.txt", &["F", "root"], b"abc"),
        Some(b"abc"),
    );
    std::fs::remove_file(dir.path().join("F/s.txt")).unwrap();

    Mock::given(method("PATCH"))
        .and(url_path("/drive/v3/files/s1"))
        .and(body_json(serde_json::json!({"trashed": true})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "s1",
            "name": "s.txt",
            "mimeType": "text/plain",
            "parents": [],
            "trashed": true
        })))
        .mount(&server)
        .await;

    engine
        .apply_local_event(&LocalEvent::FileRemoved {
            path: dir.path().join("F/s.txt"),
        })
        .await
        .unwrap();
    assert!(!dir.path().join("s.txt").exists());
    assert!(engine.metadata.cached("s1").is_none());
}

#[tokio::test]
async fn local_removal_of_an_unindexed_path_is_ignored() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path());

    engine
        .apply_local_event(&LocalEvent::FileRemoved {
            path: dir.path().join("stranger.txt"),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn local_event_with_unknown_parent_is_rejected() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path());

    let path = dir.path().join("Ghost/x.txt");
    let result = engine
        .apply_local_event(&LocalEvent::FileAdded { path })
        .await;
    assert!(matches!(result, Err(EngineError::UnknownParent(_))));
}

#[tokio::test]
async fn removing_the_local_root_is_fatal() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path());

    let result = engine
        .apply_local_event(&LocalEvent::DirRemoved {
            path: dir.path().to_path_buf(),
        })
        .await;
    assert!(matches!(result, Err(EngineError::RootRemoved)));
}

#[tokio::test]
async fn local_add_of_an_indexed_path_delegates_to_update() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path());

    seed_on_disk(&engine, file_record("a1", "a.txt", &["root"], b"hello"), Some(b"hello"));

    // Content is unchanged, so the delegated update is a no-op and no
    // create request may go out.
    engine
        .apply_local_event(&LocalEvent::FileAdded {
            path: dir.path().join("a.txt"),
        })
        .await
        .unwrap();
    assert!(engine.metadata.cached("a1").is_some());
}
