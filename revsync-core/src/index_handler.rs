//! Single-source installs

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use crate::commit::latest_commit;
use crate::directory::Directory;
use crate::error::{ReplicationError, Result};
use crate::handler::{
    cleanup_files_on_failure, notify_commit, CommitCallback, CopiedFiles, InstalledSlot,
    InstalledState, ReplicationHandler, SourceDirectories, SourceInstall, LOG_TARGET,
};
use crate::index_revision::{IndexRevision, INDEX_SOURCE};
use crate::revision::SourceFiles;

/// Installs revisions of one source into one destination directory
pub struct IndexReplicationHandler {
    dir: Arc<dyn Directory>,
    state: InstalledSlot,
    callback: Option<CommitCallback>,
}

impl IndexReplicationHandler {
    /// Create a handler over `dir`, seeding the installed state from its
    /// latest commit
    pub fn new(dir: Arc<dyn Directory>, callback: Option<CommitCallback>) -> Result<Self> {
        let initial = match latest_commit(dir.as_ref())? {
            Some(commit) => {
                let mut files = SourceFiles::new();
                files.insert(INDEX_SOURCE.to_string(), commit.revision_files(dir.as_ref())?);
                let version = IndexRevision::revision_version(commit.generation);
                info!(target: LOG_TARGET, dir = %dir.describe(), version = %version, "found installed commit");
                Some(InstalledState::new(version, files))
            }
            None => None,
        };
        Ok(Self {
            dir,
            state: InstalledSlot::new(initial),
            callback,
        })
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.dir
    }

    /// Installed state, for status reporting
    pub fn installed_state(&self) -> Option<Arc<InstalledState>> {
        self.state.load()
    }
}

impl fmt::Debug for IndexReplicationHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexReplicationHandler")
            .field("dir", &self.dir.describe())
            .field("version", &self.state.version())
            .finish()
    }
}

impl ReplicationHandler for IndexReplicationHandler {
    fn current_version(&self) -> Option<String> {
        self.state.version()
    }

    fn current_revision_files(&self) -> Option<SourceFiles> {
        self.state.revision_files()
    }

    fn revision_ready(
        &self,
        version: &str,
        revision_files: &SourceFiles,
        copied_files: &CopiedFiles,
        source_directories: &SourceDirectories,
    ) -> Result<()> {
        if revision_files.len() != 1 {
            return Err(ReplicationError::illegal_state(format!(
                "this handler handles a single source, got {:?}",
                revision_files.keys().collect::<Vec<_>>()
            )));
        }
        let Some(source) = revision_files.keys().next() else {
            return Err(ReplicationError::illegal_state("revision has no sources"));
        };
        let copied = copied_files.get(source).map(Vec::as_slice).unwrap_or_default();
        let install = SourceInstall::prepare(source, &self.dir, copied, source_directories)?;

        let mut written = Vec::new();
        if let Err(e) = install.copy_and_sync(&mut written) {
            warn!(target: LOG_TARGET, version, "install failed, removing {} copied files: {}", written.len(), e);
            cleanup_files_on_failure(self.dir.as_ref(), &written);
            return Err(e);
        }

        self.state
            .store(InstalledState::new(version, revision_files.clone()));
        info!(target: LOG_TARGET, version, dir = %self.dir.describe(), "installed revision");

        install.finish(revision_files);
        notify_commit(self.callback.as_ref())
    }
}
