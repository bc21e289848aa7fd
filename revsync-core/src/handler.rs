//! Installing fetched revisions into local storage
//!
//! A handler receives the files a client copied into scratch directories and
//! applies them to its destination directories so that readers never see a
//! mix of two revisions. Data files are copied and synced first, the commit
//! pointer last; the pointer becoming durable is what makes the new commit
//! visible. A failure before that point deletes everything copied so far and
//! leaves the installed state untouched.

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::commit::{is_commit_pointer, is_engine_file, parse_generation, write_generation_marker, GENERATION_MARKER};
use crate::directory::{same_directory, Directory};
use crate::error::{ReplicationError, Result};
use crate::revision::SourceFiles;

/// Tracing target of the handlers
pub const LOG_TARGET: &str = "revsync::handler";

/// Names of the files copied per source, in revision order
pub type CopiedFiles = BTreeMap<String, Vec<String>>;

/// Scratch directory holding the copied files, per source
pub type SourceDirectories = BTreeMap<String, Arc<dyn Directory>>;

/// Invoked once a new revision is durably installed
pub type CommitCallback = Box<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Applies fetched revisions to local storage
pub trait ReplicationHandler: Send + Sync {
    /// Version of the installed revision, if any
    fn current_version(&self) -> Option<String>;

    /// Files of the installed revision, if any
    fn current_revision_files(&self) -> Option<SourceFiles>;

    /// Install a revision whose missing files were copied into
    /// `source_directories`.
    ///
    /// A `CommitCallback` error means the install itself succeeded.
    fn revision_ready(
        &self,
        version: &str,
        revision_files: &SourceFiles,
        copied_files: &CopiedFiles,
        source_directories: &SourceDirectories,
    ) -> Result<()>;
}

/// Snapshot of what a handler has installed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledState {
    pub version: String,
    pub revision_files: SourceFiles,
    pub installed_at: DateTime<Utc>,
}

impl InstalledState {
    pub fn new(version: impl Into<String>, revision_files: SourceFiles) -> Self {
        Self {
            version: version.into(),
            revision_files,
            installed_at: Utc::now(),
        }
    }
}

/// Lock-free slot holding the installed state
#[derive(Debug, Default)]
pub(crate) struct InstalledSlot {
    state: ArcSwapOption<InstalledState>,
}

impl InstalledSlot {
    pub(crate) fn new(initial: Option<InstalledState>) -> Self {
        Self {
            state: ArcSwapOption::from(initial.map(Arc::new)),
        }
    }

    pub(crate) fn load(&self) -> Option<Arc<InstalledState>> {
        self.state.load_full()
    }

    pub(crate) fn store(&self, state: InstalledState) {
        self.state.store(Some(Arc::new(state)));
    }

    pub(crate) fn version(&self) -> Option<String> {
        self.load().map(|s| s.version.clone())
    }

    pub(crate) fn revision_files(&self) -> Option<SourceFiles> {
        self.load().map(|s| s.revision_files.clone())
    }
}

/// Split a copied file list into its data files and the trailing commit
/// pointer
pub(crate) fn split_pointer<'a>(source: &str, files: &'a [String]) -> Result<(&'a [String], &'a str)> {
    match files.split_last() {
        Some((pointer, data)) if is_commit_pointer(pointer) => Ok((data, pointer.as_str())),
        Some((last, _)) => Err(ReplicationError::illegal_state(format!(
            "last file to copy for source {} must be a commit pointer, got {}",
            source, last
        ))),
        None => Err(ReplicationError::illegal_state(format!(
            "empty list of files for source {}",
            source
        ))),
    }
}

/// Copies of one source into its destination
#[derive(Debug)]
pub(crate) struct SourceInstall<'a> {
    pub source: &'a str,
    pub from: &'a Arc<dyn Directory>,
    pub to: &'a Arc<dyn Directory>,
    pub data_files: &'a [String],
    pub pointer: &'a str,
}

impl<'a> SourceInstall<'a> {
    /// Resolve the scratch directory and pointer of `source`
    pub(crate) fn prepare(
        source: &'a str,
        to: &'a Arc<dyn Directory>,
        copied: &'a [String],
        source_directories: &'a SourceDirectories,
    ) -> Result<Self> {
        let (data_files, pointer) = split_pointer(source, copied)?;
        let from = source_directories.get(source).ok_or_else(|| {
            ReplicationError::illegal_state(format!("no source directory for source {}", source))
        })?;
        Ok(Self {
            source,
            from,
            to,
            data_files,
            pointer,
        })
    }

    /// Copy and sync the data files, then the pointer.
    ///
    /// Every name about to be written into the destination is pushed to
    /// `written` first, so a failure can be cleaned up.
    pub(crate) fn copy_and_sync(&self, written: &mut Vec<String>) -> Result<()> {
        let copy = !same_directory(self.from, self.to);
        if copy {
            for name in self.data_files {
                written.push(name.clone());
                self.from.copy_to(self.to.as_ref(), name, name)?;
            }
        }
        self.to.sync(self.data_files)?;

        let pointer = [self.pointer.to_string()];
        if copy {
            written.push(self.pointer.to_string());
            self.from.copy_to(self.to.as_ref(), self.pointer, self.pointer)?;
        }
        self.to.sync(&pointer)?;
        debug!(
            target: LOG_TARGET,
            source = self.source,
            files = self.data_files.len() + 1,
            pointer = self.pointer,
            "source files durable"
        );
        Ok(())
    }

    /// Refresh the generation marker and collect files of older commits
    pub(crate) fn finish(&self, revision_files: &SourceFiles) {
        write_marker(self.to.as_ref(), self.pointer);
        let keep: HashSet<&str> = revision_files
            .get(self.source)
            .map(|files| files.iter().map(|f| f.file_name.as_str()).collect())
            .unwrap_or_default();
        cleanup_old_files(self.to.as_ref(), &keep);
    }
}

/// Delete files written by a failed install. Errors are swallowed.
pub(crate) fn cleanup_files_on_failure(dir: &dyn Directory, names: &[String]) {
    for name in names {
        if let Err(e) = dir.delete_file(name) {
            debug!(target: LOG_TARGET, file = %name, "failed to delete {} after failed install: {}", dir.describe(), e);
        }
    }
}

/// Point the generation marker at `pointer`, or remove it so readers
/// scan pointer files instead of trusting a stale value
pub(crate) fn write_marker(dir: &dyn Directory, pointer: &str) {
    let Some(generation) = parse_generation(pointer) else {
        return;
    };
    if let Err(e) = write_generation_marker(dir, generation) {
        warn!(target: LOG_TARGET, "failed to write generation marker in {}: {}", dir.describe(), e);
        if let Err(e) = dir.delete_file(GENERATION_MARKER) {
            debug!(target: LOG_TARGET, "failed to delete generation marker: {}", e);
        }
    }
}

/// Delete engine files that the installed commit does not reference.
/// Errors are logged and retried by the next install.
pub(crate) fn cleanup_old_files(dir: &dyn Directory, keep: &HashSet<&str>) {
    let names = match dir.list_all() {
        Ok(names) => names,
        Err(e) => {
            warn!(target: LOG_TARGET, "failed to list {}: {}", dir.describe(), e);
            return;
        }
    };
    for name in names {
        if !is_engine_file(&name) || keep.contains(name.as_str()) {
            continue;
        }
        match dir.delete_file(&name) {
            Ok(()) => debug!(target: LOG_TARGET, file = %name, "deleted stale file"),
            Err(e) => warn!(target: LOG_TARGET, file = %name, "failed to delete stale file: {}", e),
        }
    }
}

/// Run the commit callback, if any
pub(crate) fn notify_commit(callback: Option<&CommitCallback>) -> Result<()> {
    match callback {
        Some(callback) => callback().map_err(|e| ReplicationError::CommitCallback(io::Error::other(e))),
        None => Ok(()),
    }
}
