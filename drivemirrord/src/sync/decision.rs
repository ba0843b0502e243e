use std::collections::HashSet;
use std::path::PathBuf;

use drivemirror_core::FileRecord;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Modification stamps are RFC 3339 strings on the wire; an absent or
/// unparseable stamp sorts before every parsed one.
pub fn modified_instant(record: &FileRecord) -> Option<OffsetDateTime> {
    record
        .modified_time
        .as_deref()
        .and_then(|value| OffsetDateTime::parse(value, &Rfc3339).ok())
}

/// How a change to an already-known record must be applied locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteUpdate {
    Ignore,
    /// Content changed: remove the old copies, download fresh ones.
    Redownload,
    /// The record had no local paths before but has some now.
    Add,
    /// Same content, different path set: move/copy/remove.
    Delta {
        removed: Vec<PathBuf>,
        added: Vec<PathBuf>,
    },
}

pub fn classify_update(
    old: &FileRecord,
    new: &FileRecord,
    old_paths: &[PathBuf],
    new_paths: &[PathBuf],
) -> RemoteUpdate {
    let same_name = old.name == new.name;
    let same_parents = {
        let old_set: HashSet<&String> = old.parents.iter().collect();
        let new_set: HashSet<&String> = new.parents.iter().collect();
        old_set == new_set
    };
    if same_name && same_parents && modified_instant(new) <= modified_instant(old) {
        return RemoteUpdate::Ignore;
    }
    if old_paths.is_empty() && new_paths.is_empty() {
        return RemoteUpdate::Ignore;
    }
    if old.md5_checksum != new.md5_checksum {
        return RemoteUpdate::Redownload;
    }
    if old_paths.is_empty() {
        return RemoteUpdate::Add;
    }

    let removed: Vec<PathBuf> = old_paths
        .iter()
        .filter(|path| !new_paths.contains(path))
        .cloned()
        .collect();
    let added: Vec<PathBuf> = new_paths
        .iter()
        .filter(|path| !old_paths.contains(path))
        .cloned()
        .collect();
    if removed.is_empty() && added.is_empty() {
        return RemoteUpdate::Ignore;
    }
    RemoteUpdate::Delta { removed, added }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, parents: &[&str], md5: &str, modified: &str) -> FileRecord {
        FileRecord {
            id: "f1".into(),
            name: name.into(),
            mime_type: "text/plain".into(),
            md5_checksum: Some(md5.into()),
            size: Some(3),
            modified_time: Some(modified.into()),
            parents: parents.iter().map(|p| p.to_string()).collect(),
            trashed: false,
        }
    }

    fn path(value: &str) -> PathBuf {
        PathBuf::from(value)
    }

    #[test]
    fn unchanged_record_is_ignored() {
        let old = record("a.txt", &["F"], "h1", "2024-01-02T00:00:00Z");
        let new = record("a.txt", &["F"], "h1", "2024-01-01T00:00:00Z");
        assert_eq!(
            classify_update(&old, &new, &[path("/r/F/a.txt")], &[path("/r/F/a.txt")]),
            RemoteUpdate::Ignore
        );
    }

    #[test]
    fn checksum_change_forces_redownload() {
        let old = record("a.txt", &["F"], "h1", "2024-01-01T00:00:00Z");
        let new = record("a.txt", &["F"], "h2", "2024-01-02T00:00:00Z");
        assert_eq!(
            classify_update(&old, &new, &[path("/r/F/a.txt")], &[path("/r/F/a.txt")]),
            RemoteUpdate::Redownload
        );
    }

    #[test]
    fn rename_yields_a_path_delta() {
        let old = record("a.txt", &["F"], "h1", "2024-01-01T00:00:00Z");
        let new = record("a2.txt", &["F"], "h1", "2024-01-02T00:00:00Z");
        assert_eq!(
            classify_update(&old, &new, &[path("/r/F/a.txt")], &[path("/r/F/a2.txt")]),
            RemoteUpdate::Delta {
                removed: vec![path("/r/F/a.txt")],
                added: vec![path("/r/F/a2.txt")],
            }
        );
    }

    #[test]
    fn record_reaching_the_tree_becomes_an_add() {
        let old = record("a.txt", &["orphan"], "h1", "2024-01-01T00:00:00Z");
        let new = record("a.txt", &["F"], "h1", "2024-01-02T00:00:00Z");
        assert_eq!(
            classify_update(&old, &new, &[], &[path("/r/F/a.txt")]),
            RemoteUpdate::Add
        );
    }

    #[test]
    fn record_outside_the_tree_is_ignored() {
        let old = record("a.txt", &["orphan"], "h1", "2024-01-01T00:00:00Z");
        let new = record("a.txt", &["other"], "h1", "2024-01-02T00:00:00Z");
        assert_eq!(classify_update(&old, &new, &[], &[]), RemoteUpdate::Ignore);
    }

    #[test]
    fn same_paths_in_different_order_are_ignored() {
        let old = record("a.txt", &["F", "G"], "h1", "2024-01-01T00:00:00Z");
        let new = record("a.txt", &["G", "F"], "h1", "2024-01-02T00:00:00Z");
        let old_paths = [path("/r/F/a.txt"), path("/r/G/a.txt")];
        let new_paths = [path("/r/G/a.txt"), path("/r/F/a.txt")];
        assert_eq!(
            classify_update(&old, &new, &old_paths, &new_paths),
            RemoteUpdate::Ignore
        );
    }

    #[test]
    fn missing_modified_time_counts_as_not_newer() {
        let old = record("a.txt", &["F"], "h1", "2024-01-01T00:00:00Z");
        let mut new = record("a.txt", &["F"], "h2", "2024-01-01T00:00:00Z");
        new.modified_time = None;
        assert_eq!(
            classify_update(&old, &new, &[path("/r/F/a.txt")], &[path("/r/F/a.txt")]),
            RemoteUpdate::Ignore
        );
    }
}
