//! Write-back of committed candidates into the working tree.
//!
//! Validation reads the tree under a shared lock; commits and rollbacks
//! rewrite it under the exclusive one. Every file is replaced through a
//! sibling temp file and a rename. The journal remembers what each graph
//! version wrote so a rollback can put the files back.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use super::overlay::Overlay;
use super::tools::ValidationError;

/// One file replaced in the working tree. `None` means absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub file: String,
    pub before: Option<String>,
    pub after: Option<String>,
}

impl FileChange {
    fn inverse(&self) -> Self {
        Self {
            file: self.file.clone(),
            before: self.after.clone(),
            after: self.before.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Journal {
    writes: BTreeMap<u64, Vec<FileChange>>,
    /// Version ranges whose writes were reverted.
    abandoned: Vec<RangeInclusive<u64>>,
}

/// The working tree candidates are written back to.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    lock: RwLock<()>,
    journal: Mutex<Journal>,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: RwLock::new(()),
            journal: Mutex::new(Journal::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Held while reading the tree.
    pub async fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().await
    }

    /// Held while rewriting the tree.
    pub async fn write(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().await
    }

    /// Write every file the overlay touched and return what changed.
    ///
    /// Files already written are put back when a later one fails.
    pub async fn apply(&self, overlay: &Overlay) -> Result<Vec<FileChange>, ValidationError> {
        let mut changes = Vec::new();
        for (file, content) in overlay.files() {
            let before = self.read_file(file).await?;
            if before.as_deref() == Some(content) {
                continue;
            }
            changes.push(FileChange {
                file: file.to_string(),
                before,
                after: Some(content.to_string()),
            });
        }
        self.write_all(&changes).await?;
        if !changes.is_empty() {
            debug!(files = changes.len(), "Wrote candidate into workspace");
        }
        Ok(changes)
    }

    /// Put back the files `changes` replaced.
    pub async fn undo(&self, changes: &[FileChange]) -> Result<(), ValidationError> {
        let inverse: Vec<FileChange> = changes.iter().rev().map(FileChange::inverse).collect();
        self.write_all(&inverse).await
    }

    /// Remember what `version` wrote.
    pub fn record(&self, version: u64, changes: Vec<FileChange>) {
        if !changes.is_empty() {
            self.journal.lock().writes.insert(version, changes);
        }
    }

    /// Fails when the files of `target` were reverted by an earlier rollback.
    pub fn ensure_reachable(&self, target: u64) -> Result<(), ValidationError> {
        if self.journal.lock().abandoned.iter().any(|r| r.contains(&target)) {
            return Err(ValidationError::Tool {
                tool: "workspace".to_string(),
                message: format!("files written up to version {target} were already reverted"),
            });
        }
        Ok(())
    }

    /// Restore every file written by versions after `target`.
    ///
    /// Refused when a file no longer holds what the newest version wrote.
    /// The journal is untouched until [`Workspace::settle_revert`].
    pub async fn revert_after(&self, target: u64) -> Result<Vec<FileChange>, ValidationError> {
        let entries: Vec<FileChange> = self
            .journal
            .lock()
            .writes
            .range(target + 1..)
            .flat_map(|(_, c)| c.clone())
            .collect();

        // Newest `after` is expected on disk; oldest `before` is restored.
        let mut plan: BTreeMap<String, FileChange> = BTreeMap::new();
        for change in &entries {
            plan.entry(change.file.clone())
                .and_modify(|c| c.before = change.after.clone())
                .or_insert_with(|| change.inverse());
        }

        for change in plan.values() {
            if self.read_file(&change.file).await? != change.before {
                return Err(ValidationError::Tool {
                    tool: "workspace".to_string(),
                    message: format!("{} was modified outside the gate", change.file),
                });
            }
        }

        let changes: Vec<FileChange> = plan.into_values().collect();
        self.write_all(&changes).await?;
        info!(target, files = changes.len(), "Reverted workspace files");
        Ok(changes)
    }

    /// Forget the writes after `target` once the graph moved back from `head`.
    pub fn settle_revert(&self, target: u64, head: u64) {
        let mut journal = self.journal.lock();
        journal.writes.split_off(&(target + 1));
        if head > target {
            journal.abandoned.push(target + 1..=head);
        }
    }

    async fn read_file(&self, file: &str) -> Result<Option<String>, ValidationError> {
        match tokio::fs::read_to_string(self.root.join(file)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, changes: &[FileChange]) -> Result<(), ValidationError> {
        for (done, change) in changes.iter().enumerate() {
            if let Err(e) = self.replace(&change.file, change.after.as_deref()).await {
                for written in changes[..done].iter().rev() {
                    if let Err(undo) = self.replace(&written.file, written.before.as_deref()).await {
                        warn!(file = %written.file, error = %undo, "Could not restore file");
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn replace(&self, file: &str, content: Option<&str>) -> Result<(), ValidationError> {
        let path = self.root.join(file);
        let Some(content) = content else {
            return match tokio::fs::remove_file(&path).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            };
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(".isg-tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
