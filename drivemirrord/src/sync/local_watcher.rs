use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::ignore::IgnoreRegistry;

/// The five event kinds the reconciler understands. Renames are reported as
/// a remove of the source plus an add of the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    FileAdded { path: PathBuf },
    FileChanged { path: PathBuf },
    FileRemoved { path: PathBuf },
    DirAdded { path: PathBuf },
    DirRemoved { path: PathBuf },
}

impl LocalEvent {
    pub fn path(&self) -> &Path {
        match self {
            LocalEvent::FileAdded { path }
            | LocalEvent::FileChanged { path }
            | LocalEvent::FileRemoved { path }
            | LocalEvent::DirAdded { path }
            | LocalEvent::DirRemoved { path } => path,
        }
    }
}

pub fn start_notify_watcher(
    root: &Path,
    ignore: IgnoreRegistry,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<LocalEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let root = root.to_path_buf();
    let watch_root = root.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            for local in map_event(&watch_root, event) {
                if ignore.consume(local.path()) {
                    continue;
                }
                let _ = tx.send(local);
            }
        }
    })?;
    watcher.watch(root.as_path(), RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

fn map_event(root: &Path, event: Event) -> Vec<LocalEvent> {
    match event.kind {
        EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
            if event.paths.len() >= 2 {
                let from = event.paths[0].clone();
                let to = event.paths[1].clone();
                let mut out = Vec::new();
                if let Some(removed) = map_removed_path(root, &from) {
                    out.push(removed);
                }
                if let Some(added) = map_created_path(root, &to) {
                    out.push(added);
                }
                return out;
            }
            Vec::new()
        }
        EventKind::Create(_) => event
            .paths
            .iter()
            .filter_map(|path| map_created_path(root, path))
            .collect(),
        EventKind::Modify(_) => event
            .paths
            .iter()
            .filter_map(|path| map_modified_path(root, path))
            .collect(),
        EventKind::Remove(kind) => event
            .paths
            .iter()
            .filter_map(|path| {
                if !admits(root, path) {
                    return None;
                }
                if kind == notify::event::RemoveKind::Folder {
                    Some(LocalEvent::DirRemoved { path: path.clone() })
                } else {
                    Some(LocalEvent::FileRemoved { path: path.clone() })
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn map_created_path(root: &Path, path: &Path) -> Option<LocalEvent> {
    if !admits(root, path) {
        return None;
    }
    let meta = std::fs::symlink_metadata(path).ok()?;
    if meta.file_type().is_symlink() {
        return None;
    }
    if meta.is_dir() {
        Some(LocalEvent::DirAdded {
            path: path.to_path_buf(),
        })
    } else {
        Some(LocalEvent::FileAdded {
            path: path.to_path_buf(),
        })
    }
}

fn map_modified_path(root: &Path, path: &Path) -> Option<LocalEvent> {
    if !admits(root, path) {
        return None;
    }
    let meta = std::fs::symlink_metadata(path).ok()?;
    if meta.file_type().is_symlink() || meta.is_dir() {
        return None;
    }
    Some(LocalEvent::FileChanged {
        path: path.to_path_buf(),
    })
}

fn map_removed_path(root: &Path, path: &Path) -> Option<LocalEvent> {
    if !admits(root, path) {
        return None;
    }
    // The source of a rename is gone; classify by what remains in the index
    // later. Directories removed this way still hit the root guard.
    Some(LocalEvent::FileRemoved {
        path: path.to_path_buf(),
    })
}

fn admits(root: &Path, path: &Path) -> bool {
    path.starts_with(root) && !is_temp_path(path)
}

/// Matches the download convention: `.<name>.tmp` files never reach the
/// reconciler.
fn is_temp_path(path: &Path) -> bool {
    match path.file_name().and_then(|name| name.to_str()) {
        Some(name) => name.starts_with('.') && name.ends_with(".tmp"),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_modify_event_to_file_changed() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        let file = root.join("Docs/A.txt");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, b"x").unwrap();
        let event = Event {
            kind: EventKind::Modify(notify::event::ModifyKind::Data(
                notify::event::DataChange::Any,
            )),
            paths: vec![file.clone()],
            attrs: Default::default(),
        };
        assert_eq!(
            map_event(root, event),
            vec![LocalEvent::FileChanged { path: file }]
        );
    }

    #[test]
    fn maps_create_dir_event_to_dir_added() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        let dir = root.join("Docs");
        std::fs::create_dir_all(&dir).unwrap();
        let event = Event {
            kind: EventKind::Create(notify::event::CreateKind::Folder),
            paths: vec![dir.clone()],
            attrs: Default::default(),
        };
        assert_eq!(
            map_event(root, event),
            vec![LocalEvent::DirAdded { path: dir }]
        );
    }

    #[test]
    fn maps_rename_to_remove_plus_add() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        let from = root.join("A.txt");
        let to = root.join("B.txt");
        std::fs::write(&to, b"x").unwrap();
        let event = Event {
            kind: EventKind::Modify(notify::event::ModifyKind::Name(
                notify::event::RenameMode::Both,
            )),
            paths: vec![from.clone(), to.clone()],
            attrs: Default::default(),
        };
        assert_eq!(
            map_event(root, event),
            vec![
                LocalEvent::FileRemoved { path: from },
                LocalEvent::FileAdded { path: to },
            ]
        );
    }

    #[test]
    fn drops_temp_download_paths() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        let tmp_file = root.join(".A.txt.tmp");
        std::fs::write(&tmp_file, b"x").unwrap();
        let event = Event {
            kind: EventKind::Create(notify::event::CreateKind::File),
            paths: vec![tmp_file],
            attrs: Default::default(),
        };
        assert!(map_event(root, event).is_empty());
    }

    #[test]
    fn drops_removal_of_temp_paths() {
        let root = Path::new("/sync");
        let event = Event {
            kind: EventKind::Remove(notify::event::RemoveKind::File),
            paths: vec![PathBuf::from("/sync/.B.txt.tmp")],
            attrs: Default::default(),
        };
        assert!(map_event(root, event).is_empty());
    }
}
