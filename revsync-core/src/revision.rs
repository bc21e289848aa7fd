//! Revision model
//!
//! A revision is an immutable, versioned, multi-source set of named files
//! representing one consistent point of the replicated dataset. The storage
//! engine pins the files of a revision while it is alive; `release` unpins
//! them.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;

use crate::error::Result;

/// A file of a revision, with its length in bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RevisionFile {
    pub file_name: String,
    pub size: u64,
}

impl RevisionFile {
    pub fn new(file_name: impl Into<String>, size: u64) -> Self {
        Self {
            file_name: file_name.into(),
            size,
        }
    }
}

impl fmt::Display for RevisionFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.file_name, self.size)
    }
}

/// Files of a revision per source, in source-name order.
///
/// The last file of every source is its commit-pointer file.
pub type SourceFiles = BTreeMap<String, Vec<RevisionFile>>;

/// A pinned, versioned file set produced by the storage engine
pub trait Revision: Send + Sync + fmt::Debug {
    /// Version string of this revision
    fn version(&self) -> &str;

    /// Files of this revision, per source
    fn source_files(&self) -> &SourceFiles;

    /// Open a file of this revision for reading.
    ///
    /// Fails with `UnknownSource` if the revision was not built from `source`.
    fn open(&self, source: &str, file_name: &str) -> Result<Box<dyn Read + Send>>;

    /// Compare this revision against a version string
    fn compare_version(&self, version: &str) -> Result<Ordering>;

    /// Compare this revision against another revision of the same kind.
    ///
    /// Fails with `IncompatibleRevision` if `other` is of a different kind.
    fn compare_to(&self, other: &dyn Revision) -> Result<Ordering>;

    /// Unpin the files of this revision.
    ///
    /// Called at most once per revision; the caller guarantees that.
    fn release(&self) -> Result<()>;

    /// Downcasting hook for `compare_to`
    fn as_any(&self) -> &dyn Any;
}

/// Render a source-files map compactly for logs
pub fn describe_source_files(files: &SourceFiles) -> String {
    let parts: Vec<String> = files
        .iter()
        .map(|(source, list)| {
            let names: Vec<String> = list.iter().map(|f| f.to_string()).collect();
            format!("{}=[{}]", source, names.join(", "))
        })
        .collect();
    format!("{{{}}}", parts.join(", "))
}
