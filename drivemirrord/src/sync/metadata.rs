use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use drivemirror_core::{DriveClient, DriveError, FileRecord};
use futures_util::future::join_all;

use super::paths;

/// Everything the materializer reads and the reconciler mutates: the record
/// cache, the parent-info side cache, the reverse path index and the set of
/// paths we believe we have written. One lock guards all four so a path is
/// never indexed against a record that is mid-replacement.
#[derive(Default)]
pub struct CacheInner {
    pub records: HashMap<String, FileRecord>,
    pub parent_info: HashMap<String, FileRecord>,
    pub path_index: HashMap<PathBuf, String>,
    pub materialized: HashSet<PathBuf>,
}

#[derive(Clone)]
pub struct MetadataStore {
    client: DriveClient,
    local_root: PathBuf,
    root_id: Arc<Mutex<Option<String>>>,
    inner: Arc<Mutex<CacheInner>>,
}

impl MetadataStore {
    pub fn new(client: DriveClient, local_root: PathBuf) -> Self {
        Self {
            client,
            local_root,
            root_id: Arc::new(Mutex::new(None)),
            inner: Arc::new(Mutex::new(CacheInner::default())),
        }
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    /// Binds the remote root id and seeds the path index so children of the
    /// root can resolve their parent from the local root path.
    pub fn set_root(&self, id: &str) {
        *self.root_id.lock().expect("root mutex poisoned") = Some(id.to_string());
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        inner
            .path_index
            .insert(self.local_root.clone(), id.to_string());
    }

    pub fn root_id(&self) -> Option<String> {
        self.root_id.lock().expect("root mutex poisoned").clone()
    }

    pub fn cached(&self, id: &str) -> Option<FileRecord> {
        self.inner
            .lock()
            .expect("cache mutex poisoned")
            .records
            .get(id)
            .cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner
            .lock()
            .expect("cache mutex poisoned")
            .records
            .contains_key(id)
    }

    /// Inserts a record without touching the path index. Replacing a record
    /// invalidates the side cache for every parent of both versions, because
    /// that parent's children set may have shifted.
    pub fn insert_fetched(&self, record: FileRecord) {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        insert_record(&mut inner, record);
    }

    /// Cached record or a single remote fetch. Fetched records enter the
    /// cache.
    pub async fn get(&self, id: &str) -> Result<Option<FileRecord>, DriveError> {
        if let Some(record) = self.cached(id) {
            return Ok(Some(record));
        }
        match self.client.get_record(id).await? {
            Some(record) => {
                self.insert_fetched(record.clone());
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Resolves a batch of ids, fetching the uncached ones concurrently.
    /// A fetch failure or a not-found yields `None` for that id only.
    pub async fn get_many(&self, ids: &[String]) -> HashMap<String, Option<FileRecord>> {
        let mut out = HashMap::with_capacity(ids.len());
        let mut uncached = Vec::new();
        let mut seen = HashSet::with_capacity(ids.len());
        {
            let inner = self.inner.lock().expect("cache mutex poisoned");
            for id in ids {
                if !seen.insert(id.clone()) {
                    continue;
                }
                match inner.records.get(id) {
                    Some(record) => {
                        out.insert(id.clone(), Some(record.clone()));
                    }
                    None => uncached.push(id.clone()),
                }
            }
        }

        let fetches = uncached.iter().map(|id| self.client.get_record(id));
        let results = join_all(fetches).await;
        for (id, result) in uncached.into_iter().zip(results) {
            let record = result.ok().flatten();
            if let Some(record) = &record {
                self.insert_fetched(record.clone());
            }
            out.insert(id, record);
        }
        out
    }

    /// Stores (or replaces) a record, prefetching any missing parents so the
    /// path walk is cache-only, then recomputes its paths and updates the
    /// path index. Returns the materialized paths.
    pub async fn store(&self, record: FileRecord) -> Result<Vec<PathBuf>, DriveError> {
        self.prefetch_parents(std::slice::from_ref(&record)).await;
        Ok(self.materialize_cached(record))
    }

    /// Cache-only variant of `store`: inserts, walks, indexes.
    pub fn materialize_cached(&self, record: FileRecord) -> Vec<PathBuf> {
        let root_id = self.root_id().unwrap_or_default();
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        insert_record(&mut inner, record.clone());
        let paths = paths::record_paths(&record, &mut inner, &root_id, &self.local_root);
        paths::index_record_paths(&record, &paths, &mut inner);
        paths
    }

    /// Computes a record's paths without inserting it or touching the index.
    /// Used to capture the path set of the previous version of a record.
    pub fn peek_paths(&self, record: &FileRecord) -> Vec<PathBuf> {
        let root_id = self.root_id().unwrap_or_default();
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        paths::record_paths(record, &mut inner, &root_id, &self.local_root)
    }

    /// Fetches the transitive parent closure of `seeds` that is not yet
    /// cached. Each round resolves one level; ids that fail to resolve are
    /// not retried.
    pub async fn prefetch_parents(&self, seeds: &[FileRecord]) {
        let root_id = self.root_id().unwrap_or_default();
        let mut attempted: HashSet<String> = HashSet::new();
        let mut frontier: Vec<String> = seeds
            .iter()
            .flat_map(|record| record.parents.iter().cloned())
            .collect();
        loop {
            let missing: Vec<String> = {
                let inner = self.inner.lock().expect("cache mutex poisoned");
                frontier
                    .drain(..)
                    .filter(|id| {
                        *id != root_id
                            && !inner.records.contains_key(id)
                            && attempted.insert(id.clone())
                    })
                    .collect()
            };
            if missing.is_empty() {
                break;
            }
            let fetched = self.get_many(&missing).await;
            frontier = fetched
                .values()
                .flatten()
                .flat_map(|record| record.parents.iter().cloned())
                .collect();
        }
    }

    pub fn id_for_path(&self, path: &Path) -> Option<String> {
        self.inner
            .lock()
            .expect("cache mutex poisoned")
            .path_index
            .get(path)
            .cloned()
    }

    /// Every indexed path currently claimed by `id`.
    pub fn paths_for_id(&self, id: &str) -> Vec<PathBuf> {
        let inner = self.inner.lock().expect("cache mutex poisoned");
        let mut paths: Vec<PathBuf> = inner
            .path_index
            .iter()
            .filter(|(_, indexed)| indexed.as_str() == id)
            .map(|(path, _)| path.clone())
            .collect();
        paths.sort();
        paths
    }

    pub fn drop_index_path(&self, path: &Path) {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        inner.path_index.remove(path);
    }

    /// Removes a record and every index, side-cache and materialized-set
    /// trace of it. Returns the removed record.
    pub fn remove(&self, id: &str) -> Option<FileRecord> {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        let record = inner.records.remove(id);
        inner.parent_info.remove(id);
        if let Some(record) = &record {
            for parent in &record.parents {
                inner.parent_info.remove(parent);
            }
        }
        let stale: Vec<PathBuf> = inner
            .path_index
            .iter()
            .filter(|(_, indexed)| indexed.as_str() == id)
            .map(|(path, _)| path.clone())
            .collect();
        for path in stale {
            inner.path_index.remove(&path);
            inner.materialized.remove(&path);
        }
        record
    }

    pub fn mark_materialized(&self, path: &Path) {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        inner.materialized.insert(path.to_path_buf());
    }

    pub fn unmark_materialized(&self, path: &Path) {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        inner.materialized.remove(path);
    }

    pub fn is_materialized(&self, path: &Path) -> bool {
        self.inner
            .lock()
            .expect("cache mutex poisoned")
            .materialized
            .contains(path)
    }

    /// Clones the persistent parts of the cache for checkpointing.
    pub fn snapshot(&self) -> (HashMap<String, FileRecord>, HashSet<PathBuf>) {
        let inner = self.inner.lock().expect("cache mutex poisoned");
        (inner.records.clone(), inner.materialized.clone())
    }

    /// Restores a checkpoint snapshot and rebuilds the path index from it.
    /// The root must be bound before calling this.
    pub fn restore(&self, records: HashMap<String, FileRecord>, materialized: HashSet<PathBuf>) {
        let root_id = self.root_id().unwrap_or_default();
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        inner.records = records;
        inner.parent_info.clear();
        inner.materialized = materialized;
        let all: Vec<FileRecord> = inner.records.values().cloned().collect();
        for record in all {
            let paths = paths::record_paths(&record, &mut inner, &root_id, &self.local_root);
            paths::index_record_paths(&record, &paths, &mut inner);
        }
    }

    pub fn record_count(&self) -> usize {
        self.inner
            .lock()
            .expect("cache mutex poisoned")
            .records
            .len()
    }
}

fn insert_record(inner: &mut CacheInner, record: FileRecord) {
    if let Some(previous) = inner.records.get(&record.id) {
        for parent in &previous.parents {
            inner.parent_info.remove(parent);
        }
    }
    for parent in &record.parents {
        inner.parent_info.remove(parent);
    }
    inner.records.insert(record.id.clone(), record);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_for_tests() -> MetadataStore {
        let client = DriveClient::with_base_url("http://127.0.0.1:9", "test-token").unwrap();
        let store = MetadataStore::new(client, PathBuf::from("/sync"));
        store.set_root("root");
        store
    }

    fn file(id: &str, name: &str, parents: &[&str]) -> FileRecord {
        FileRecord {
            id: id.into(),
            name: name.into(),
            mime_type: "text/plain".into(),
            md5_checksum: Some("h".into()),
            size: Some(1),
            modified_time: Some("2024-01-01T00:00:00Z".into()),
            parents: parents.iter().map(|p| p.to_string()).collect(),
            trashed: false,
        }
    }

    #[test]
    fn set_root_indexes_the_local_root() {
        let store = store_for_tests();
        assert_eq!(
            store.id_for_path(Path::new("/sync")),
            Some("root".to_string())
        );
    }

    #[test]
    fn materialize_indexes_every_path() {
        let store = store_for_tests();
        let paths = store.materialize_cached(file("a", "a.txt", &["root"]));
        assert_eq!(paths, vec![PathBuf::from("/sync/a.txt")]);
        assert_eq!(
            store.id_for_path(Path::new("/sync/a.txt")),
            Some("a".to_string())
        );
        assert_eq!(store.paths_for_id("a"), vec![PathBuf::from("/sync/a.txt")]);
    }

    #[test]
    fn replacing_a_record_invalidates_its_parents_memo() {
        let store = store_for_tests();
        let folder = FileRecord {
            id: "d".into(),
            name: "Docs".into(),
            mime_type: "application/vnd.google-apps.folder".into(),
            parents: vec!["root".into()],
            ..FileRecord::default()
        };
        store.materialize_cached(folder);
        store.materialize_cached(file("n", "n.txt", &["d"]));
        {
            let inner = store.inner.lock().unwrap();
            assert!(inner.parent_info.contains_key("d"));
        }
        // Replacing the child must drop the memo for its parent.
        store.insert_fetched(file("n", "n2.txt", &["d"]));
        let inner = store.inner.lock().unwrap();
        assert!(!inner.parent_info.contains_key("d"));
    }

    #[test]
    fn remove_cleans_index_and_materialized_set() {
        let store = store_for_tests();
        let paths = store.materialize_cached(file("a", "a.txt", &["root"]));
        store.mark_materialized(&paths[0]);
        let removed = store.remove("a");
        assert_eq!(removed.unwrap().id, "a");
        assert_eq!(store.id_for_path(&paths[0]), None);
        assert!(!store.is_materialized(&paths[0]));
    }

    #[test]
    fn restore_rebuilds_the_index() {
        let store = store_for_tests();
        let mut records = HashMap::new();
        records.insert("a".to_string(), file("a", "a.txt", &["root"]));
        let mut materialized = HashSet::new();
        materialized.insert(PathBuf::from("/sync/a.txt"));
        store.restore(records, materialized);
        assert_eq!(
            store.id_for_path(Path::new("/sync/a.txt")),
            Some("a".to_string())
        );
        assert!(store.is_materialized(Path::new("/sync/a.txt")));
    }
}
