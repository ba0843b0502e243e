impl SyncEngine {
    /// Applies one watcher event. Events arrive one at a time through the
    /// local queue; the queue consumer decides what to do with the errors.
    pub async fn apply_local_event(&self, event: &LocalEvent) -> Result<(), EngineError> {
        match event {
            LocalEvent::FileAdded { path } => self.local_file_added(path).await,
            LocalEvent::FileChanged { path } => self.local_file_changed(path).await,
            LocalEvent::FileRemoved { path } => {
                if path == self.local_root() {
                    return Err(EngineError::RootRemoved);
                }
                self.local_removed(path).await
            }
            LocalEvent::DirAdded { path } => self.local_dir_added(path).await,
            LocalEvent::DirRemoved { path } => {
                // Losing the root means every mirrored file would be deleted
                // remotely on the next step. Stop instead.
                if path == self.local_root() {
                    return Err(EngineError::RootRemoved);
                }
                self.local_removed(path).await
            }
        }
    }

    async fn local_file_added(&self, path: &Path) -> Result<(), EngineError> {
        if self.metadata.id_for_path(path).is_some() {
            return Box::pin(self.local_file_changed(path)).await;
        }
        let parent = self.parent_of_path(path)?;
        let name = file_name_of(path);
        let metadata = FilePatch {
            name: Some(name),
            parents: Some(vec![parent]),
            ..FilePatch::default()
        };
        let record = self.client.create_file(&metadata, Some(path)).await?;
        self.metadata.store(record).await?;
        self.metadata.mark_materialized(path);
        self.status.record(|summary| summary.added += 1);
        Ok(())
    }

    async fn local_file_changed(&self, path: &Path) -> Result<(), EngineError> {
        let Some(id) = self.metadata.id_for_path(path) else {
            return Box::pin(self.local_file_added(path)).await;
        };
        let Some(record) = self.metadata.cached(&id) else {
            return Err(EngineError::MissingRecord(id));
        };
        if record.md5_checksum.is_none() {
            // Nothing downloadable to compare or upload.
            return Ok(());
        }
        let disk_md5 = Self::file_md5(path).await?;
        if record.md5_checksum.as_deref() == Some(disk_md5.as_str()) {
            return Ok(());
        }

        let updated = self.client.update_content(&id, path).await?;
        let paths = self.metadata.store(updated).await?;
        for other in paths.iter().filter(|other| other.as_path() != path) {
            if let Some(parent) = other.parent() {
                self.ensure_dir_with_ignore(parent).await?;
            }
            self.ignore.ignore(other);
            tokio::fs::copy(path, other).await?;
            self.metadata.mark_materialized(other);
        }
        self.metadata.mark_materialized(path);
        self.status.record(|summary| summary.updated += 1);
        Ok(())
    }

    /// Shared by file and directory removals: clean up the sibling
    /// materializations, then delete or trash the record remotely.
    async fn local_removed(&self, path: &Path) -> Result<(), EngineError> {
        let Some(id) = self.metadata.id_for_path(path) else {
            // Not a path we materialized; nothing to propagate.
            return Ok(());
        };
        let is_folder = self
            .metadata
            .cached(&id)
            .map(|record| record.is_folder())
            .unwrap_or(false);
        for sibling in self.metadata.paths_for_id(&id) {
            if sibling == path {
                continue;
            }
            self.remove_path_with_ignore(&sibling, is_folder).await?;
        }
        if self.delete_permanently {
            self.client.delete_record(&id).await?;
            self.status.record(|summary| summary.removed += 1);
        } else {
            self.client.update_metadata(&id, &FilePatch::trash()).await?;
            self.status.record(|summary| summary.trashed += 1);
        }
        self.metadata.remove(&id);
        Ok(())
    }

    async fn local_dir_added(&self, path: &Path) -> Result<(), EngineError> {
        if self.metadata.id_for_path(path).is_some() {
            return Ok(());
        }
        let parent = self.parent_of_path(path)?;
        let metadata = FilePatch {
            name: Some(file_name_of(path)),
            mime_type: Some(FOLDER_MIME.to_string()),
            parents: Some(vec![parent]),
            ..FilePatch::default()
        };
        let record = self.client.create_file(&metadata, None).await?;
        self.metadata.store(record).await?;
        self.metadata.mark_materialized(path);
        self.status.record(|summary| summary.added += 1);
        Ok(())
    }

    /// Resolves the remote parent of a local path through the path index. A
    /// miss means the event raced ahead of a remote change still pending.
    fn parent_of_path(&self, path: &Path) -> Result<String, EngineError> {
        let parent = path
            .parent()
            .ok_or_else(|| EngineError::UnknownParent(path.to_path_buf()))?;
        self.metadata
            .id_for_path(parent)
            .ok_or_else(|| EngineError::UnknownParent(path.to_path_buf()))
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
