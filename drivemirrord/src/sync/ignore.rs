use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Echo suppression: the reconciler declares every path it is about to
/// write, and the watcher drops the matching event. Each `ignore` call adds
/// one independent token, so repeated writes to the same path are each
/// suppressed exactly once.
#[derive(Clone, Default)]
pub struct IgnoreRegistry {
    inner: Arc<Mutex<HashMap<PathBuf, u32>>>,
}

impl IgnoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ignore(&self, path: &Path) {
        let mut map = self.inner.lock().expect("ignore mutex poisoned");
        *map.entry(path.to_path_buf()).or_insert(0) += 1;
    }

    /// Removes one token for `path` and reports whether one existed.
    pub fn consume(&self, path: &Path) -> bool {
        let mut map = self.inner.lock().expect("ignore mutex poisoned");
        match map.get_mut(path) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                map.remove(path);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("ignore mutex poisoned").is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_removes_a_single_token() {
        let registry = IgnoreRegistry::new();
        let path = Path::new("/root/a.txt");
        registry.ignore(path);
        assert!(registry.consume(path));
        assert!(!registry.consume(path));
        assert!(registry.is_empty());
    }

    #[test]
    fn tokens_stack_per_write() {
        let registry = IgnoreRegistry::new();
        let path = Path::new("/root/a.txt");
        registry.ignore(path);
        registry.ignore(path);
        assert!(registry.consume(path));
        assert!(registry.consume(path));
        assert!(!registry.consume(path));
    }
}
