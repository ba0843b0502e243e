use std::path::{Path, PathBuf};

use drivemirror_core::FileRecord;

use super::decision::modified_instant;
use super::metadata::CacheInner;

/// Computes every local path the record materializes at, walking each parent
/// chain up to the configured root. Parents resolve through the parent-info
/// side cache first, then the metadata cache; the walk is cache-only, so
/// callers batch-prefetch missing parents beforehand. A parent that still
/// cannot be resolved contributes no paths.
pub fn record_paths(
    record: &FileRecord,
    inner: &mut CacheInner,
    root_id: &str,
    local_root: &Path,
) -> Vec<PathBuf> {
    let mut chain = Vec::new();
    walk(record, inner, root_id, local_root, &mut chain)
}

fn walk(
    record: &FileRecord,
    inner: &mut CacheInner,
    root_id: &str,
    local_root: &Path,
    chain: &mut Vec<String>,
) -> Vec<PathBuf> {
    if record.id == root_id {
        return vec![local_root.to_path_buf()];
    }
    let mut out = Vec::new();
    for parent_id in &record.parents {
        if parent_id == root_id {
            out.push(local_root.join(&record.name));
            continue;
        }
        // A parent cycle would recurse forever; the server contract says DAG
        // but the walk does not rely on it.
        if chain.iter().any(|id| id == parent_id) {
            continue;
        }
        let Some(parent) = resolve_parent(parent_id, inner) else {
            continue;
        };
        chain.push(parent_id.clone());
        for parent_path in walk(&parent, inner, root_id, local_root, chain) {
            out.push(parent_path.join(&record.name));
        }
        chain.pop();
    }
    out
}

fn resolve_parent(parent_id: &str, inner: &mut CacheInner) -> Option<FileRecord> {
    if let Some(memo) = inner.parent_info.get(parent_id) {
        return Some(memo.clone());
    }
    let record = inner.records.get(parent_id)?.clone();
    inner
        .parent_info
        .insert(parent_id.to_string(), record.clone());
    Some(record)
}

/// Points every materialized path at the record's id. A path already claimed
/// by a different id is a sibling name collision; the record with the newer
/// modification stamp wins.
pub fn index_record_paths(record: &FileRecord, paths: &[PathBuf], inner: &mut CacheInner) {
    for path in paths {
        match inner.path_index.get(path) {
            Some(existing) if existing != &record.id => {
                let newer = match inner.records.get(existing) {
                    Some(rival) => modified_instant(record) >= modified_instant(rival),
                    None => true,
                };
                if newer {
                    inner.path_index.insert(path.clone(), record.id.clone());
                }
            }
            _ => {
                inner.path_index.insert(path.clone(), record.id.clone());
            }
        }
    }
}
