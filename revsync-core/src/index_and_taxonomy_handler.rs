//! Dual-source installs
//!
//! The taxonomy is installed before the index: a reader may see a taxonomy
//! ahead of the index that refers to it, never behind.

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
use crate::index_revision::{IndexAndTaxonomyRevision, INDEX_SOURCE, TAXONOMY_SOURCE};
use crate::revision::SourceFiles;

/// Installs revisions of an index and its taxonomy
pub struct IndexAndTaxonomyReplicationHandler {
    index_dir: Arc<dyn Directory>,
    taxonomy_dir: Arc<dyn Directory>,
    state: InstalledSlot,
    callback: Option<CommitCallback>,
}

impl IndexAndTaxonomyReplicationHandler {
    /// Create a handler over both destinations.
    ///
    /// Either both directories hold a commit or neither does.
    pub fn new(
        index_dir: Arc<dyn Directory>,
        taxonomy_dir: Arc<dyn Directory>,
        callback: Option<CommitCallback>,
    ) -> Result<Self> {
        let index_commit = latest_commit(index_dir.as_ref())?;
        let taxonomy_commit = latest_commit(taxonomy_dir.as_ref())?;
        let initial = match (index_commit, taxonomy_commit) {
            (Some(index), Some(taxonomy)) => {
                let mut files = SourceFiles::new();
                files.insert(INDEX_SOURCE.to_string(), index.revision_files(index_dir.as_ref())?);
                files.insert(
                    TAXONOMY_SOURCE.to_string(),
                    taxonomy.revision_files(taxonomy_dir.as_ref())?,
                );
                let version =
                    IndexAndTaxonomyRevision::revision_version(index.generation, taxonomy.generation);
                info!(target: LOG_TARGET, version = %version, "found installed index and taxonomy commits");
                Some(InstalledState::new(version, files))
            }
            (None, None) => None,
            (index, taxonomy) => {
                return Err(ReplicationError::illegal_state(format!(
                    "index and taxonomy must both have a commit or neither: index={} taxonomy={}",
                    index.is_some(),
                    taxonomy.is_some()
                )));
            }
        };
        Ok(Self {
            index_dir,
            taxonomy_dir,
            state: InstalledSlot::new(initial),
            callback,
        })
    }

    /// Installed state, for status reporting
    pub fn installed_state(&self) -> Option<Arc<InstalledState>> {
        self.state.load()
    }

    fn destination(&self, source: &str) -> &Arc<dyn Directory> {
        if source == TAXONOMY_SOURCE {
            &self.taxonomy_dir
        } else {
            &self.index_dir
        }
    }
}

impl fmt::Debug for IndexAndTaxonomyReplicationHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexAndTaxonomyReplicationHandler")
            .field("index_dir", &self.index_dir.describe())
            .field("taxonomy_dir", &self.taxonomy_dir.describe())
            .field("version", &self.state.version())
            .finish()
    }
}

impl ReplicationHandler for IndexAndTaxonomyReplicationHandler {
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
        if revision_files.len() != 2
            || !revision_files.contains_key(INDEX_SOURCE)
            || !revision_files.contains_key(TAXONOMY_SOURCE)
        {
            return Err(ReplicationError::illegal_state(format!(
                "expected sources {} and {}, got {:?}",
                INDEX_SOURCE,
                TAXONOMY_SOURCE,
                revision_files.keys().collect::<Vec<_>>()
            )));
        }

        // a source whose commit did not change has nothing copied
        let mut installs = Vec::with_capacity(2);
        for source in [TAXONOMY_SOURCE, INDEX_SOURCE] {
            let copied = copied_files.get(source).map(Vec::as_slice).unwrap_or_default();
            if copied.is_empty() {
                continue;
            }
            installs.push(SourceInstall::prepare(
                source,
                self.destination(source),
                copied,
                source_directories,
            )?);
        }
        if installs.is_empty() {
            return Err(ReplicationError::illegal_state(format!(
                "no files to install for revision {}",
                version
            )));
        }

        let mut written: Vec<Vec<String>> = vec![Vec::new(); installs.len()];
        let mut failure = None;
        for (install, names) in installs.iter().zip(written.iter_mut()) {
            if let Err(e) = install.copy_and_sync(names) {
                failure = Some(e);
                break;
            }
        }
        if let Some(e) = failure {
            warn!(target: LOG_TARGET, version, "install failed, removing copied files: {}", e);
            for (install, names) in installs.iter().zip(&written) {
                cleanup_files_on_failure(install.to.as_ref(), names);
            }
            return Err(e);
        }

        self.state
            .store(InstalledState::new(version, revision_files.clone()));
        info!(target: LOG_TARGET, version, "installed index and taxonomy revision");

        // taxonomy first, matching the copy order
        for install in &installs {
            install.finish(revision_files);
        }
        notify_commit(self.callback.as_ref())
    }
}
