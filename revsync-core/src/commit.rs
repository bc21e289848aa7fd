//! Commit storage model
//!
//! A commit is made visible by its commit-pointer file, `commit_<gen>`
//! (generation in lowercase hex). The pointer lists, one per line, the data
//! files the commit references. A pointer is only ever written after every
//! file it references is durable, so the newest pointer in a directory always
//! describes a complete commit.
//!
//! `commit.gen` is a helper holding the newest generation. It may be stale or
//! missing; readers fall back to scanning pointer files.
//!
//! `CommitStore` is the producer side: it writes commits, pins them while a
//! revision references them, and prunes files of superseded, unpinned
//! commits.

use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::directory::Directory;
use crate::error::{ReplicationError, Result};
use crate::revision::RevisionFile;

/// Tracing target of the commit store
pub const LOG_TARGET: &str = "revsync::commit";

/// Prefix of commit-pointer file names
pub const POINTER_PREFIX: &str = "commit_";

/// Name of the generation marker helper file
pub const GENERATION_MARKER: &str = "commit.gen";

lazy_static::lazy_static! {
    static ref POINTER_PATTERN: Regex = Regex::new(r"^commit_([0-9a-f]+)$").unwrap();
    static ref TRANSIENT_PATTERN: Regex = Regex::new(r"^_[a-z0-9]+(\.[a-z0-9]+)?$").unwrap();
}

/// Commit-pointer file name for a generation
pub fn pointer_file_name(generation: u64) -> String {
    format!("{}{:x}", POINTER_PREFIX, generation)
}

/// Generation encoded in a commit-pointer file name
pub fn parse_generation(name: &str) -> Option<u64> {
    POINTER_PATTERN
        .captures(name)
        .and_then(|caps| u64::from_str_radix(&caps[1], 16).ok())
}

/// Whether `name` is a commit-pointer file
pub fn is_commit_pointer(name: &str) -> bool {
    parse_generation(name).is_some()
}

/// Whether `name` is owned by the storage engine and may be garbage
/// collected once no commit references it
pub fn is_engine_file(name: &str) -> bool {
    TRANSIENT_PATTERN.is_match(name) || is_commit_pointer(name)
}

/// One commit: its generation and the data files it references
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitPoint {
    pub generation: u64,
    /// Data files, in commit order. The pointer itself is not included.
    pub files: Vec<String>,
}

impl CommitPoint {
    /// Name of this commit's pointer file
    pub fn pointer_name(&self) -> String {
        pointer_file_name(self.generation)
    }

    /// Every file of the commit, the pointer last
    pub fn file_names(&self) -> Vec<String> {
        let mut names = self.files.clone();
        names.push(self.pointer_name());
        names
    }

    /// Files of the commit with their lengths in `dir`, the pointer last
    pub fn revision_files(&self, dir: &dyn Directory) -> Result<Vec<RevisionFile>> {
        self.file_names()
            .into_iter()
            .map(|name| -> Result<RevisionFile> {
                let size = dir.file_length(&name)?;
                Ok(RevisionFile::new(name, size))
            })
            .collect()
    }
}

/// Read the commit of a given generation
pub fn read_commit(dir: &dyn Directory, generation: u64) -> Result<CommitPoint> {
    let mut body = String::new();
    dir.open_input(&pointer_file_name(generation))?
        .read_to_string(&mut body)?;
    let files = body
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    Ok(CommitPoint { generation, files })
}

/// Generations of every commit pointer in `dir`, ascending
pub fn list_generations(dir: &dyn Directory) -> Result<Vec<u64>> {
    let mut generations: Vec<u64> = dir
        .list_all()?
        .iter()
        .filter_map(|name| parse_generation(name))
        .collect();
    generations.sort_unstable();
    Ok(generations)
}

/// Newest commit of `dir`, if any
pub fn latest_commit(dir: &dyn Directory) -> Result<Option<CommitPoint>> {
    match list_generations(dir)?.last() {
        Some(&generation) => Ok(Some(read_commit(dir, generation)?)),
        None => Ok(None),
    }
}

/// Generation recorded in the marker file, if present and parseable
pub fn read_generation_marker(dir: &dyn Directory) -> Result<Option<u64>> {
    if !dir.file_exists(GENERATION_MARKER)? {
        return Ok(None);
    }
    let mut body = String::new();
    dir.open_input(GENERATION_MARKER)?.read_to_string(&mut body)?;
    Ok(u64::from_str_radix(body.trim(), 16).ok())
}

/// Write (and sync) the generation marker
pub fn write_generation_marker(dir: &dyn Directory, generation: u64) -> Result<()> {
    let mut out = dir.create_output(GENERATION_MARKER)?;
    out.write_all(format!("{:x}\n", generation).as_bytes())?;
    out.flush()?;
    drop(out);
    dir.sync(&[GENERATION_MARKER.to_string()])
}

/// Producer-side commit store over one directory
#[derive(Debug)]
pub struct CommitStore {
    dir: Arc<dyn Directory>,
    /// Pinned generation -> number of pins
    pins: Mutex<HashMap<u64, usize>>,
}

impl CommitStore {
    pub fn open(dir: Arc<dyn Directory>) -> Self {
        Self {
            dir,
            pins: Mutex::new(HashMap::new()),
        }
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.dir
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, usize>> {
        self.pins.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write a data file. It stays invisible until a commit references it.
    pub fn write_file(&self, name: &str, data: &[u8]) -> Result<()> {
        if !TRANSIENT_PATTERN.is_match(name) {
            return Err(ReplicationError::invalid_argument(format!(
                "data file names must match {}: {}",
                TRANSIENT_PATTERN.as_str(),
                name
            )));
        }
        let mut out = self.dir.create_output(name)?;
        out.write_all(data)?;
        out.flush()?;
        Ok(())
    }

    /// Commit `files` as the next generation.
    ///
    /// Data files are synced before the pointer is written, and the pointer
    /// is synced before the generation marker is updated.
    pub fn commit(&self, files: &[String]) -> Result<CommitPoint> {
        let mut pins = self.lock();
        for name in files {
            if is_commit_pointer(name) || name == GENERATION_MARKER {
                return Err(ReplicationError::invalid_argument(format!(
                    "cannot reference {} from a commit",
                    name
                )));
            }
            if !self.dir.file_exists(name)? {
                return Err(ReplicationError::invalid_argument(format!(
                    "cannot commit missing file {}",
                    name
                )));
            }
        }

        let generation = list_generations(self.dir.as_ref())?
            .last()
            .map_or(1, |g| g + 1);
        let commit = CommitPoint {
            generation,
            files: files.to_vec(),
        };

        self.dir.sync(files)?;
        let pointer = commit.pointer_name();
        let mut out = self.dir.create_output(&pointer)?;
        for name in files {
            writeln!(out, "{}", name)?;
        }
        out.flush()?;
        drop(out);
        self.dir.sync(std::slice::from_ref(&pointer))?;
        write_generation_marker(self.dir.as_ref(), generation)?;

        tracing::debug!(target: LOG_TARGET, generation, files = files.len(), "committed");
        self.prune_locked(&mut pins)?;
        Ok(commit)
    }

    /// Newest commit, if any
    pub fn latest(&self) -> Result<Option<CommitPoint>> {
        let _pins = self.lock();
        latest_commit(self.dir.as_ref())
    }

    /// Pin the newest commit so pruning keeps its files
    pub fn snapshot(&self) -> Result<CommitPoint> {
        let mut pins = self.lock();
        let commit = latest_commit(self.dir.as_ref())?.ok_or_else(|| {
            ReplicationError::illegal_state(format!(
                "no commit to snapshot in {}",
                self.dir.describe()
            ))
        })?;
        *pins.entry(commit.generation).or_insert(0) += 1;
        Ok(commit)
    }

    /// Unpin a generation pinned by `snapshot` and prune what it kept alive
    pub fn release(&self, generation: u64) -> Result<()> {
        let mut pins = self.lock();
        match pins.get_mut(&generation) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                pins.remove(&generation);
            }
            None => {
                return Err(ReplicationError::illegal_state(format!(
                    "generation {:x} is not pinned",
                    generation
                )));
            }
        }
        self.prune_locked(&mut pins)?;
        Ok(())
    }

    /// Currently pinned generations, ascending
    pub fn pinned(&self) -> Vec<u64> {
        let mut generations: Vec<u64> = self.lock().keys().copied().collect();
        generations.sort_unstable();
        generations
    }

    /// Delete superseded, unpinned commits and the files only they reference.
    ///
    /// Returns the deleted file names.
    pub fn prune(&self) -> Result<Vec<String>> {
        let mut pins = self.lock();
        self.prune_locked(&mut pins)
    }

    fn prune_locked(&self, pins: &mut HashMap<u64, usize>) -> Result<Vec<String>> {
        let generations = list_generations(self.dir.as_ref())?;
        let Some(&newest) = generations.last() else {
            return Ok(Vec::new());
        };

        let mut keep = BTreeSet::new();
        let mut obsolete = BTreeSet::new();
        for &generation in &generations {
            let commit = read_commit(self.dir.as_ref(), generation)?;
            let target = if generation == newest || pins.contains_key(&generation) {
                &mut keep
            } else {
                &mut obsolete
            };
            target.extend(commit.file_names());
        }

        let mut deleted = Vec::new();
        for name in obsolete.difference(&keep) {
            match self.dir.delete_file(name) {
                Ok(()) => deleted.push(name.clone()),
                Err(e) => tracing::warn!(target: LOG_TARGET, "failed to prune {}: {}", name, e),
            }
        }
        if !deleted.is_empty() {
            tracing::debug!(target: LOG_TARGET, ?deleted, "pruned superseded commit files");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::RamDirectory;
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    /// Records the target of every event
    struct Targets(Arc<Mutex<Vec<String>>>);

    impl<S: tracing::Subscriber> Layer<S> for Targets {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            self.0.lock().unwrap().push(event.metadata().target().to_string());
        }
    }

    fn store() -> (RamDirectory, CommitStore) {
        let dir = RamDirectory::new();
        let store = CommitStore::open(Arc::new(dir.clone()));
        (dir, store)
    }

    #[test]
    fn test_pointer_names() {
        assert_eq!(pointer_file_name(26), "commit_1a");
        assert_eq!(parse_generation("commit_1a"), Some(26));
        assert_eq!(parse_generation("commit_"), None);
        assert_eq!(parse_generation("commit.gen"), None);
        assert!(is_engine_file("_0.dat"));
        assert!(is_engine_file("_a1"));
        assert!(is_engine_file("commit_3"));
        assert!(!is_engine_file("commit.gen"));
        assert!(!is_engine_file("notes.txt"));
    }

    #[test]
    fn test_commit_and_read_back() {
        let (dir, store) = store();
        store.write_file("_0.dat", b"abc").unwrap();
        store.write_file("_1.dat", b"defg").unwrap();

        let commit = store
            .commit(&["_0.dat".to_string(), "_1.dat".to_string()])
            .unwrap();
        assert_eq!(commit.generation, 1);
        assert_eq!(commit.pointer_name(), "commit_1");

        let latest = latest_commit(&dir).unwrap().unwrap();
        assert_eq!(latest, commit);
        assert_eq!(read_generation_marker(&dir).unwrap(), Some(1));

        let files = latest.revision_files(&dir).unwrap();
        assert_eq!(files.len(), 3);
        assert_eq!(files[1], RevisionFile::new("_1.dat", 4));
        assert_eq!(files[2].file_name, "commit_1");
    }

    #[test]
    fn test_commit_rejects_missing_and_pointer_files() {
        let (_dir, store) = store();
        assert!(store.commit(&["_9.dat".to_string()]).is_err());
        assert!(store.commit(&["commit_1".to_string()]).is_err());
        assert!(store.write_file("Notes.txt", b"x").is_err());
    }

    #[test]
    fn test_superseded_commit_is_pruned() {
        let (dir, store) = store();
        store.write_file("_0.dat", b"a").unwrap();
        store.commit(&["_0.dat".to_string()]).unwrap();
        store.write_file("_1.dat", b"b").unwrap();
        store.commit(&["_1.dat".to_string()]).unwrap();

        let names = dir.list_all().unwrap();
        assert!(!names.contains(&"_0.dat".to_string()));
        assert!(!names.contains(&"commit_1".to_string()));
        assert!(names.contains(&"commit_2".to_string()));
    }

    #[test]
    fn test_logs_under_commit_target() {
        let targets = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(Targets(Arc::clone(&targets)));
        tracing::subscriber::with_default(subscriber, || {
            let (_, store) = store();
            store.write_file("_0.dat", b"a").unwrap();
            store.commit(&["_0.dat".to_string()]).unwrap();
            store.write_file("_1.dat", b"b").unwrap();
            store.commit(&["_1.dat".to_string()]).unwrap();
        });

        let targets = targets.lock().unwrap();
        assert!(!targets.is_empty());
        assert!(targets.iter().all(|t| t == LOG_TARGET), "{:?}", targets);
    }

    #[test]
    fn test_pinned_commit_survives_until_released() {
        let (dir, store) = store();
        store.write_file("_0.dat", b"a").unwrap();
        store.commit(&["_0.dat".to_string()]).unwrap();
        let pinned = store.snapshot().unwrap();
        assert_eq!(store.pinned(), vec![1]);

        store.write_file("_1.dat", b"b").unwrap();
        store.commit(&["_1.dat".to_string()]).unwrap();
        assert!(dir.file_exists("_0.dat").unwrap());
        assert!(dir.file_exists("commit_1").unwrap());

        store.release(pinned.generation).unwrap();
        assert!(!dir.file_exists("_0.dat").unwrap());
        assert!(!dir.file_exists("commit_1").unwrap());
        assert!(store.pinned().is_empty());
        assert!(store.release(pinned.generation).is_err());
    }

    #[test]
    fn test_shared_files_are_kept() {
        let (dir, store) = store();
        store.write_file("_0.dat", b"a").unwrap();
        store.commit(&["_0.dat".to_string()]).unwrap();
        store.write_file("_1.dat", b"b").unwrap();
        store
            .commit(&["_0.dat".to_string(), "_1.dat".to_string()])
            .unwrap();
        assert!(dir.file_exists("_0.dat").unwrap());
        assert!(!dir.file_exists("commit_1").unwrap());
    }

    #[test]
    fn test_snapshot_without_commit_fails() {
        let (_dir, store) = store();
        assert!(matches!(
            store.snapshot(),
            Err(ReplicationError::IllegalState(_))
        ));
    }
}
