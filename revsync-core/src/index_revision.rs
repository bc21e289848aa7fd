//! Revisions over commit stores
//!
//! `IndexRevision` replicates one store under the `index` source.
//! `IndexAndTaxonomyRevision` replicates a primary store together with an
//! auxiliary store under the `index` and `taxonomy` sources.

use std::any::Any;
use std::cmp::Ordering;
use std::io::Read;
use std::sync::Arc;

use crate::commit::{CommitPoint, CommitStore};
use crate::error::{ReplicationError, Result};
use crate::revision::{Revision, RevisionFile, SourceFiles};

const LOG_TARGET: &str = "revsync::revision";

/// Source name of the primary store
pub const INDEX_SOURCE: &str = "index";

/// Source name of the auxiliary store
pub const TAXONOMY_SOURCE: &str = "taxonomy";

fn parse_hex(version: &str, part: &str) -> Result<u64> {
    u64::from_str_radix(part, 16).map_err(|_| {
        ReplicationError::invalid_argument(format!("malformed revision version: {:?}", version))
    })
}

fn open_from(store: &CommitStore, file_name: &str) -> Result<Box<dyn Read + Send>> {
    store.directory().open_input(file_name)
}

/// Snapshot the latest commit of a store, unpinning it again if describing
/// its files fails
fn pin_latest(store: &CommitStore) -> Result<(CommitPoint, Vec<RevisionFile>)> {
    let commit = store.snapshot()?;
    match commit.revision_files(store.directory().as_ref()) {
        Ok(files) => Ok((commit, files)),
        Err(e) => {
            if let Err(release_err) = store.release(commit.generation) {
                tracing::warn!(target: LOG_TARGET, "failed to unpin generation {:x}: {}", commit.generation, release_err);
            }
            Err(e)
        }
    }
}

/// Revision of a single commit store
#[derive(Debug)]
pub struct IndexRevision {
    store: Arc<CommitStore>,
    commit: CommitPoint,
    version: String,
    source_files: SourceFiles,
}

impl IndexRevision {
    /// Pin the latest commit of `store`
    pub fn new(store: Arc<CommitStore>) -> Result<Self> {
        let (commit, files) = pin_latest(&store)?;
        let mut source_files = SourceFiles::new();
        source_files.insert(INDEX_SOURCE.to_string(), files);
        Ok(Self {
            version: Self::revision_version(commit.generation),
            store,
            commit,
            source_files,
        })
    }

    /// Version string of a generation
    pub fn revision_version(generation: u64) -> String {
        format!("{:x}", generation)
    }

    pub fn generation(&self) -> u64 {
        self.commit.generation
    }
}

impl Revision for IndexRevision {
    fn version(&self) -> &str {
        &self.version
    }

    fn source_files(&self) -> &SourceFiles {
        &self.source_files
    }

    fn open(&self, source: &str, file_name: &str) -> Result<Box<dyn Read + Send>> {
        if source != INDEX_SOURCE {
            return Err(ReplicationError::UnknownSource(format!(
                "{} (expected {})",
                source, INDEX_SOURCE
            )));
        }
        open_from(&self.store, file_name)
    }

    fn compare_version(&self, version: &str) -> Result<Ordering> {
        let generation = parse_hex(version, version)?;
        Ok(self.commit.generation.cmp(&generation))
    }

    fn compare_to(&self, other: &dyn Revision) -> Result<Ordering> {
        let other = other.as_any().downcast_ref::<IndexRevision>().ok_or_else(|| {
            ReplicationError::IncompatibleRevision {
                expected: "IndexRevision".to_string(),
                found: format!("revision {}", other.version()),
            }
        })?;
        Ok(self.commit.generation.cmp(&other.commit.generation))
    }

    fn release(&self) -> Result<()> {
        self.store.release(self.commit.generation)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Revision of a primary store and its auxiliary store
#[derive(Debug)]
pub struct IndexAndTaxonomyRevision {
    index: Arc<CommitStore>,
    taxonomy: Arc<CommitStore>,
    index_commit: CommitPoint,
    taxonomy_commit: CommitPoint,
    version: String,
    source_files: SourceFiles,
}

impl IndexAndTaxonomyRevision {
    /// Pin the latest commits of both stores.
    ///
    /// The taxonomy is pinned first: it must never be older than the index
    /// that refers to it.
    pub fn new(index: Arc<CommitStore>, taxonomy: Arc<CommitStore>) -> Result<Self> {
        let (taxonomy_commit, taxonomy_files) = pin_latest(&taxonomy)?;
        let (index_commit, index_files) = match pin_latest(&index) {
            Ok(pinned) => pinned,
            Err(e) => {
                if let Err(release_err) = taxonomy.release(taxonomy_commit.generation) {
                    tracing::warn!(target: LOG_TARGET, "failed to unpin taxonomy: {}", release_err);
                }
                return Err(e);
            }
        };

        let mut source_files = SourceFiles::new();
        source_files.insert(INDEX_SOURCE.to_string(), index_files);
        source_files.insert(TAXONOMY_SOURCE.to_string(), taxonomy_files);
        Ok(Self {
            version: Self::revision_version(index_commit.generation, taxonomy_commit.generation),
            index,
            taxonomy,
            index_commit,
            taxonomy_commit,
            source_files,
        })
    }

    /// Version string of an index/taxonomy generation pair
    pub fn revision_version(index_generation: u64, taxonomy_generation: u64) -> String {
        format!("{:x}:{:x}", index_generation, taxonomy_generation)
    }

    fn generations(&self) -> (u64, u64) {
        (self.index_commit.generation, self.taxonomy_commit.generation)
    }
}

impl Revision for IndexAndTaxonomyRevision {
    fn version(&self) -> &str {
        &self.version
    }

    fn source_files(&self) -> &SourceFiles {
        &self.source_files
    }

    fn open(&self, source: &str, file_name: &str) -> Result<Box<dyn Read + Send>> {
        match source {
            INDEX_SOURCE => open_from(&self.index, file_name),
            TAXONOMY_SOURCE => open_from(&self.taxonomy, file_name),
            other => Err(ReplicationError::UnknownSource(format!(
                "{} (expected {} or {})",
                other, INDEX_SOURCE, TAXONOMY_SOURCE
            ))),
        }
    }

    fn compare_version(&self, version: &str) -> Result<Ordering> {
        let (index_part, taxonomy_part) = version.split_once(':').ok_or_else(|| {
            ReplicationError::invalid_argument(format!("malformed revision version: {:?}", version))
        })?;
        let other = (
            parse_hex(version, index_part)?,
            parse_hex(version, taxonomy_part)?,
        );
        // tuple order: index generation first, then taxonomy
        Ok(self.generations().cmp(&other))
    }

    fn compare_to(&self, other: &dyn Revision) -> Result<Ordering> {
        let other = other
            .as_any()
            .downcast_ref::<IndexAndTaxonomyRevision>()
            .ok_or_else(|| ReplicationError::IncompatibleRevision {
                expected: "IndexAndTaxonomyRevision".to_string(),
                found: format!("revision {}", other.version()),
            })?;
        Ok(self.generations().cmp(&other.generations()))
    }

    fn release(&self) -> Result<()> {
        let index_result = self.index.release(self.index_commit.generation);
        let taxonomy_result = self.taxonomy.release(self.taxonomy_commit.generation);
        index_result.and(taxonomy_result)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
