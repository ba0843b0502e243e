#[tokio::test]
async fn remote_add_fans_out_to_every_materialized_path() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path());

    seed_on_disk(&engine, folder_record("F", "F", &["root"]), None);
    mock_download(&server, "s1", b"hi").await;

    let record = file_record("s1", "s.txt", &["F", "root"], b"hi");
    let changed = engine
        .apply_remote_change(&change_for(record))
        .await
        .unwrap();
    assert!(changed);

    let in_folder = dir.path().join("F/s.txt");
    let at_root = dir.path().join("s.txt");
    assert_eq!(std::fs::read(&in_folder).unwrap(), b"hi");
    assert_eq!(std::fs::read(&at_root).unwrap(), b"hi");
    assert_eq!(engine.metadata.id_for_path(&in_folder), Some("s1".into()));
    assert_eq!(engine.metadata.id_for_path(&at_root), Some("s1".into()));
    assert_eq!(engine.metadata.paths_for_id("s1").len(), 2);
}

#[tokio::test]
async fn remote_rename_moves_the_file_without_redownloading() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path());

    seed_on_disk(&engine, folder_record("F", "F", &["root"]), None);
    seed_on_disk(&engine, file_record("a1", "a.txt", &["F"], b"abc"), Some(b"abc"));

    // Same checksum, new name, newer stamp. No download mock is mounted, so
    // any transfer attempt would fail the test.
    let mut renamed = file_record("a1", "a2.txt", &["F"], b"abc");
    renamed.modified_time = Some("2024-02-01T00:00:00Z".into());
    let changed = engine
        .apply_remote_change(&change_for(renamed))
        .await
        .unwrap();
    assert!(changed);

    let old_path = dir.path().join("F/a.txt");
    let new_path = dir.path().join("F/a2.txt");
    assert!(!old_path.exists());
    assert_eq!(std::fs::read(&new_path).unwrap(), b"abc");
    assert_eq!(engine.metadata.id_for_path(&old_path), None);
    assert_eq!(engine.metadata.id_for_path(&new_path), Some("a1".into()));
}

#[tokio::test]
async fn remote_trash_removes_the_local_copy() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path());

    seed_on_disk(&engine, folder_record("F", "F", &["root"]), None);
    seed_on_disk(&engine, file_record("a1", "a.txt", &["F"], b"abc"), Some(b"abc"));

    let mut trashed = file_record("a1", "a.txt", &["F"], b"abc");
    trashed.trashed = true;
    let changed = engine
        .apply_remote_change(&change_for(trashed))
        .await
        .unwrap();
    assert!(changed);

    let path = dir.path().join("F/a.txt");
    assert!(!path.exists());
    assert_eq!(engine.metadata.id_for_path(&path), None);
    assert!(engine.metadata.cached("a1").is_none());
}

#[tokio::test]
async fn removal_marker_behaves_like_trash() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path());

    seed_on_disk(&engine, file_record("a1", "a.txt", &["root"], b"abc"), Some(b"abc"));
    let changed = engine.apply_remote_change(&removal_of("a1")).await.unwrap();
    assert!(changed);
    assert!(!dir.path().join("a.txt").exists());
    assert!(engine.metadata.cached("a1").is_none());
}

#[tokio::test]
async fn removal_of_an_unknown_record_is_a_noop() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path());
    let changed = engine
        .apply_remote_change(&removal_of("ghost"))
        .await
        .unwrap();
    assert!(!changed);
}

#[tokio::test]
async fn checksum_change_redownloads_the_content() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path());

    seed_on_disk(&engine, file_record("a1", "a.txt", &["root"], b"hello"), Some(b"hello"));
    mock_download(&server, "a1", b"hello world").await;

    let mut updated = file_record("a1", "a.txt", &["root"], b"hello world");
    updated.modified_time = Some("2024-02-01T00:00:00Z".into());
    let changed = engine
        .apply_remote_change(&change_for(updated))
        .await
        .unwrap();
    assert!(changed);
    assert_eq!(
        std::fs::read(dir.path().join("a.txt")).unwrap(),
        b"hello world"
    );
}

#[tokio::test]
async fn applying_the_same_change_twice_is_idempotent() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path());

    mock_download(&server, "c1", b"abc").await;
    let change = change_for(file_record("c1", "c.txt", &["root"], b"abc"));

    assert!(engine.apply_remote_change(&change).await.unwrap());
    assert!(!engine.apply_remote_change(&change).await.unwrap());

    let path = dir.path().join("c.txt");
    assert_eq!(std::fs::read(&path).unwrap(), b"abc");
    assert_eq!(engine.metadata.id_for_path(&path), Some("c1".into()));
    assert_eq!(engine.metadata.paths_for_id("c1").len(), 1);
}

#[tokio::test]
async fn every_write_is_declared_to_the_ignore_registry() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path());

    mock_download(&server, "c1", b"abc").await;
    let change = change_for(file_record("c1", "c.txt", &["root"], b"abc"));
    engine.apply_remote_change(&change).await.unwrap();

    // The watcher would consume this token for the echo event.
    assert!(engine.ignore.consume(&dir.path().join("c.txt")));
}

#[tokio::test]
async fn records_without_content_materialize_nothing() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path());

    let mut doc = file_record("g1", "notes", &["root"], b"");
    doc.md5_checksum = None;
    doc.size = None;
    let changed = engine.apply_remote_change(&change_for(doc)).await.unwrap();
    assert!(!changed);
    assert!(!dir.path().join("notes").exists());
    // The record itself is still cached for path resolution.
    assert!(engine.metadata.cached("g1").is_some());
}

#[tokio::test]
async fn new_folder_is_created_locally() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path());

    let changed = engine
        .apply_remote_change(&change_for(folder_record("F", "F", &["root"])))
        .await
        .unwrap();
    assert!(changed);
    assert!(dir.path().join("F").is_dir());
}

#[tokio::test]
async fn added_parent_copies_instead_of_redownloading() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path());

    seed_on_disk(&engine, folder_record("F", "F", &["root"]), None);
    seed_on_disk(&engine, file_record("s1", "s.txt", &["F"], b"abc"), Some(b"abc"));

    // Second parent appears: one more materialized path, same content. No
    // download mock, so the fill must come from the surviving copy.
    let mut shared = file_record("s1", "s.txt", &["F", "root"], b"abc");
    shared.modified_time = Some("2024-02-01T00:00:00Z".into());
    let changed = engine
        .apply_remote_change(&change_for(shared))
        .await
        .unwrap();
    assert!(changed);
    assert_eq!(std::fs::read(dir.path().join("F/s.txt")).unwrap(), b"abc");
    assert_eq!(std::fs::read(dir.path().join("s.txt")).unwrap(), b"abc");
}
