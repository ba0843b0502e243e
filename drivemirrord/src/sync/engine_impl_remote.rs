impl SyncEngine {
    /// Applies one change feed entry to the local tree. Returns whether
    /// anything on disk changed. Applying the same entry twice is a no-op
    /// the second time.
    pub async fn apply_remote_change(&self, change: &ChangeItem) -> Result<bool, EngineError> {
        let trashed = change.file.as_ref().map(|f| f.trashed).unwrap_or(false);
        if change.removed || trashed {
            return self.remove_locally(&change.file_id).await;
        }
        let Some(record) = change.file.clone() else {
            return Ok(false);
        };
        match self.metadata.cached(&record.id) {
            None => self.add_locally(record).await,
            Some(old) => self.update_locally(old, record).await,
        }
    }

    /// Deletes every materialization of a record, then forgets it.
    async fn remove_locally(&self, id: &str) -> Result<bool, EngineError> {
        let Some(record) = self.metadata.cached(id) else {
            return Ok(false);
        };
        let paths = self.metadata.paths_for_id(id);
        let mut removed = 0usize;
        for path in &paths {
            if self.remove_path_with_ignore(path, record.is_folder()).await? {
                removed += 1;
            }
        }
        self.metadata.remove(id);
        if removed > 0 {
            self.status.record(|summary| summary.removed += 1);
        }
        Ok(removed > 0)
    }

    /// Stores a record the engine has not seen before and materializes it.
    async fn add_locally(&self, record: FileRecord) -> Result<bool, EngineError> {
        let paths = self.metadata.store(record.clone()).await?;
        if paths.is_empty() {
            return Ok(false);
        }
        let changed = self.materialize_record(&record, &paths).await?;
        if changed {
            self.status.record(|summary| summary.added += 1);
        }
        Ok(changed)
    }

    async fn update_locally(&self, old: FileRecord, new: FileRecord) -> Result<bool, EngineError> {
        let old_paths = self.metadata.peek_paths(&old);
        let new_paths = self.metadata.store(new.clone()).await?;
        match decision::classify_update(&old, &new, &old_paths, &new_paths) {
            RemoteUpdate::Ignore => Ok(false),
            RemoteUpdate::Add => {
                let changed = self.materialize_record(&new, &new_paths).await?;
                if changed {
                    self.status.record(|summary| summary.added += 1);
                }
                Ok(changed)
            }
            RemoteUpdate::Redownload => {
                let mut changed = false;
                for path in &old_paths {
                    if self.remove_path_with_ignore(path, old.is_folder()).await? {
                        changed = true;
                    }
                    if !new_paths.contains(path) {
                        self.metadata.drop_index_path(path);
                        self.metadata.unmark_materialized(path);
                    }
                }
                if self.materialize_record(&new, &new_paths).await? {
                    changed = true;
                }
                if changed {
                    self.status.record(|summary| summary.updated += 1);
                }
                Ok(changed)
            }
            RemoteUpdate::Delta { removed, added } => {
                self.apply_path_delta(&new, &new_paths, &removed, &added)
                    .await
            }
        }
    }

    /// Moves, deletes and copies until the on-disk path set matches the
    /// record's new path set. Same content throughout, so surplus targets
    /// are filled from a surviving copy.
    async fn apply_path_delta(
        &self,
        record: &FileRecord,
        new_paths: &[PathBuf],
        removed: &[PathBuf],
        added: &[PathBuf],
    ) -> Result<bool, EngineError> {
        let mut changed = false;
        let mut unfilled: Vec<PathBuf> = Vec::new();
        let pairs = removed.len().min(added.len());

        for (from, to) in removed.iter().zip(added.iter()) {
            if let Some(parent) = to.parent() {
                self.ensure_dir_with_ignore(parent).await?;
            }
            self.ignore.ignore(from);
            self.ignore.ignore(to);
            match tokio::fs::rename(from, to).await {
                Ok(()) => changed = true,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    unfilled.push(to.clone());
                }
                Err(err) => return Err(err.into()),
            }
            self.metadata.drop_index_path(from);
            self.metadata.unmark_materialized(from);
            self.metadata.mark_materialized(to);
        }

        for surplus in &removed[pairs..] {
            if self.remove_path_with_ignore(surplus, record.is_folder()).await? {
                changed = true;
            }
            self.metadata.drop_index_path(surplus);
            self.metadata.unmark_materialized(surplus);
        }

        unfilled.extend(added[pairs..].iter().cloned());
        if !unfilled.is_empty() {
            if record.is_folder() {
                for target in &unfilled {
                    self.ensure_dir_with_ignore(target).await?;
                    self.metadata.mark_materialized(target);
                    changed = true;
                }
            } else if let Some(source) = Self::first_existing(new_paths).await {
                for target in &unfilled {
                    if let Some(parent) = target.parent() {
                        self.ensure_dir_with_ignore(parent).await?;
                    }
                    self.ignore.ignore(target);
                    tokio::fs::copy(&source, target).await?;
                    self.metadata.mark_materialized(target);
                    changed = true;
                }
            } else if self.materialize_record(record, new_paths).await? {
                // No surviving copy to duplicate; fetch the content fresh.
                changed = true;
            }
        }

        if changed {
            self.status.record(|summary| summary.updated += 1);
        }
        Ok(changed)
    }

    /// Brings every materialized path of a record up to date on disk.
    /// Folders become directories; blobs download once to the canonical
    /// path and fan out by local copy; records without content are skipped.
    pub(crate) async fn materialize_record(
        &self,
        record: &FileRecord,
        paths: &[PathBuf],
    ) -> Result<bool, EngineError> {
        if paths.is_empty() {
            return Ok(false);
        }
        if record.is_folder() {
            let mut changed = false;
            for path in paths {
                if !tokio::fs::try_exists(path).await? {
                    self.ensure_dir_with_ignore(path).await?;
                    changed = true;
                }
                self.metadata.mark_materialized(path);
            }
            return Ok(changed);
        }
        if !record.has_content() {
            return Ok(false);
        }
        self.download_record(record, paths).await
    }

    /// Streams content to `.<name>.tmp` under the local root, verifies,
    /// atomically rename onto the canonical path, copy to the fan-out paths.
    /// An up-to-date canonical copy skips the transfer entirely.
    async fn download_record(
        &self,
        record: &FileRecord,
        paths: &[PathBuf],
    ) -> Result<bool, EngineError> {
        let canonical = &paths[0];
        let expected_md5 = record
            .md5_checksum
            .as_deref()
            .ok_or_else(|| EngineError::MissingRecord(record.id.clone()))?;

        let mut changed = false;
        let up_to_date = tokio::fs::try_exists(canonical).await?
            && Self::matches_checksum(canonical, expected_md5).await;
        if !up_to_date {
            let tmp = self.local_root().join(format!(".{}.tmp", record.name));
            if let Some(parent) = canonical.parent() {
                self.ensure_dir_with_ignore(parent).await?;
            }
            if let Err(err) = self
                .client
                .download_to_path(&record.id, &tmp, Some(expected_md5))
                .await
            {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(err.into());
            }
            self.ignore.ignore(canonical);
            tokio::fs::rename(&tmp, canonical).await?;
            changed = true;
        }
        self.metadata.mark_materialized(canonical);

        for other in &paths[1..] {
            let ok = tokio::fs::try_exists(other).await?
                && Self::matches_checksum(other, expected_md5).await;
            if !ok {
                if let Some(parent) = other.parent() {
                    self.ensure_dir_with_ignore(parent).await?;
                }
                self.ignore.ignore(other);
                tokio::fs::copy(canonical, other).await?;
                changed = true;
            }
            self.metadata.mark_materialized(other);
        }
        Ok(changed)
    }
}
