//! Scratch directories for files fetched during a replication session.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::directory::{Directory, FsDirectory};
use crate::error::{ReplicationError, Result};

/// Hands out a scratch directory per `(session, source)` pair
pub trait SourceDirectoryFactory: Send + Sync {
    /// Directory that receives the files of `source` for `session_id`
    fn get_directory(&self, session_id: &str, source: &str) -> Result<Arc<dyn Directory>>;

    /// Reclaim all scratch storage of a session.
    ///
    /// Failing here is not fatal to the replication protocol.
    fn cleanup_session(&self, session_id: &str) -> Result<()>;
}

/// Lays scratch files out as `<working_dir>/<session>/<source>/`
#[derive(Debug, Clone)]
pub struct PerSessionDirectoryFactory {
    working_dir: PathBuf,
}

impl PerSessionDirectoryFactory {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf> {
        if session_id.is_empty() {
            return Err(ReplicationError::invalid_argument("session id must not be empty"));
        }
        Ok(self.working_dir.join(session_id))
    }
}

impl SourceDirectoryFactory for PerSessionDirectoryFactory {
    fn get_directory(&self, session_id: &str, source: &str) -> Result<Arc<dyn Directory>> {
        let path = self.session_dir(session_id)?.join(source);
        Ok(Arc::new(FsDirectory::open(path)?))
    }

    fn cleanup_session(&self, session_id: &str) -> Result<()> {
        let path = self.session_dir(session_id)?;
        match fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
