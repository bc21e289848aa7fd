//! Publishing side of the replication protocol
//!
//! The replicator holds the single current revision and hands out sessions
//! pinning it. A revision is released by its storage engine only when
//! nothing references it any more: neither the "current" slot nor any open
//! session.
//!
//! One lock guards the session table, the current revision and every
//! reference count transition, so dropping a count to zero can never race a
//! checkout that would have bumped it a moment later.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{ReplicationError, Result};
use crate::revision::Revision;
use crate::session::SessionToken;

/// Tracing target of the replicator
pub const LOG_TARGET: &str = "revsync::replicator";

/// Sessions idle for longer than this are expired
pub const DEFAULT_SESSION_EXPIRATION_THRESHOLD: Duration = Duration::from_secs(30 * 60);

/// Operations a replication client needs from a publisher
pub trait Replicator: Send + Sync {
    /// Publish a new revision.
    ///
    /// A revision equal to the current one is released and ignored. An older
    /// one is released and rejected with `InvalidArgument`.
    fn publish(&self, revision: Box<dyn Revision>) -> Result<()>;

    /// Check out the current revision if it is newer than `current_version`.
    ///
    /// `None` means the caller has nothing installed yet.
    fn check_for_update(&self, current_version: Option<&str>) -> Result<Option<SessionToken>>;

    /// Stream a file of the revision held by a session
    fn obtain_file(
        &self,
        session_id: &str,
        source: &str,
        file_name: &str,
    ) -> Result<Box<dyn Read + Send>>;

    /// Release a session. Unknown ids are ignored.
    fn release(&self, session_id: &str) -> Result<()>;

    /// Release every session and refuse further calls
    fn close(&self) -> Result<()>;
}

/// A revision with an explicit reference count, starting at one
#[derive(Debug)]
pub struct RefCountedRevision {
    revision: Box<dyn Revision>,
    ref_count: AtomicUsize,
}

impl RefCountedRevision {
    pub fn new(revision: Box<dyn Revision>) -> Self {
        Self {
            revision,
            ref_count: AtomicUsize::new(1),
        }
    }

    pub fn revision(&self) -> &dyn Revision {
        self.revision.as_ref()
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(AtomicOrdering::SeqCst)
    }

    pub fn inc_ref(&self) {
        self.ref_count.fetch_add(1, AtomicOrdering::SeqCst);
    }

    /// Drop one reference, releasing the revision when it was the last.
    ///
    /// If the release fails the reference is restored, so the caller may
    /// retry.
    pub fn dec_ref(&self) -> Result<()> {
        let previous = self.ref_count.fetch_sub(1, AtomicOrdering::SeqCst);
        match previous {
            0 => {
                self.ref_count.fetch_add(1, AtomicOrdering::SeqCst);
                Err(ReplicationError::illegal_state(format!(
                    "too many releases of revision {}",
                    self.revision.version()
                )))
            }
            1 => {
                if let Err(e) = self.revision.release() {
                    self.ref_count.fetch_add(1, AtomicOrdering::SeqCst);
                    return Err(e);
                }
                debug!(target: LOG_TARGET, version = self.revision.version(), "released revision");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// One checked-out revision
#[derive(Debug)]
struct ReplicationSession {
    token: SessionToken,
    revision: Arc<RefCountedRevision>,
    last_access: Instant,
}

impl ReplicationSession {
    fn is_expired(&self, threshold: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_access) > threshold
    }

    fn mark_accessed(&mut self) {
        self.last_access = Instant::now();
    }
}

#[derive(Debug)]
struct ReplicatorState {
    current: Option<Arc<RefCountedRevision>>,
    sessions: HashMap<String, ReplicationSession>,
    last_session_id: u64,
    expiration_threshold: Duration,
    closed: bool,
}

impl ReplicatorState {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(ReplicationError::AlreadyClosed(
                "this replicator has already been closed".to_string(),
            ));
        }
        Ok(())
    }

    fn release_session(&mut self, session_id: &str) -> Result<()> {
        // a session may be gone already, e.g. expired and swept
        if let Some(session) = self.sessions.remove(session_id) {
            debug!(target: LOG_TARGET, session = session_id, "releasing session");
            if let Err(e) = session.revision.dec_ref() {
                // keep the session so the release can be retried
                self.sessions.insert(session_id.to_string(), session);
                return Err(e);
            }
        }
        Ok(())
    }

    fn check_expired_sessions(&mut self) -> Result<()> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.is_expired(self.expiration_threshold, now))
            .map(|(id, _)| id.clone())
            .collect();

        let mut first_error = None;
        for id in expired {
            info!(target: LOG_TARGET, session = %id, "expiring idle session");
            if let Err(e) = self.release_session(&id) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// In-process replicator
#[derive(Debug)]
pub struct LocalReplicator {
    state: Mutex<ReplicatorState>,
}

impl Default for LocalReplicator {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalReplicator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ReplicatorState {
                current: None,
                sessions: HashMap::new(),
                last_session_id: 0,
                expiration_threshold: DEFAULT_SESSION_EXPIRATION_THRESHOLD,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReplicatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Idle time after which a session expires
    pub fn expiration_threshold(&self) -> Duration {
        self.lock().expiration_threshold
    }

    /// Change the expiration threshold and sweep sessions against it
    pub fn set_expiration_threshold(&self, threshold: Duration) -> Result<()> {
        let mut state = self.lock();
        state.ensure_open()?;
        state.expiration_threshold = threshold;
        state.check_expired_sessions()
    }

    /// Version of the current revision, if any
    pub fn current_version(&self) -> Option<String> {
        self.lock()
            .current
            .as_ref()
            .map(|current| current.revision().version().to_string())
    }

    /// Number of outstanding sessions
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Reference count of the current revision
    pub fn current_ref_count(&self) -> Option<usize> {
        self.lock().current.as_ref().map(|current| current.ref_count())
    }
}

/// Release a revision the replicator declined to take over
fn release_offered(revision: &dyn Revision) {
    if let Err(e) = revision.release() {
        warn!(target: LOG_TARGET, version = revision.version(), "failed to release offered revision: {}", e);
    }
}

impl Replicator for LocalReplicator {
    fn publish(&self, revision: Box<dyn Revision>) -> Result<()> {
        let mut state = self.lock();
        if let Err(e) = state.ensure_open() {
            release_offered(revision.as_ref());
            return Err(e);
        }

        if let Some(current) = &state.current {
            let ordering = match revision.compare_to(current.revision()) {
                Ok(ordering) => ordering,
                Err(e) => {
                    release_offered(revision.as_ref());
                    return Err(e);
                }
            };
            match ordering {
                std::cmp::Ordering::Equal => {
                    // same revision published twice, nothing to do
                    debug!(target: LOG_TARGET, version = revision.version(), "revision already current");
                    return revision.release();
                }
                std::cmp::Ordering::Less => {
                    let message = format!(
                        "cannot publish an older revision: current={} new={}",
                        current.revision().version(),
                        revision.version()
                    );
                    release_offered(revision.as_ref());
                    return Err(ReplicationError::InvalidArgument(message));
                }
                std::cmp::Ordering::Greater => {}
            }
        }

        info!(target: LOG_TARGET, version = revision.version(), "publishing revision");
        let previous = state
            .current
            .replace(Arc::new(RefCountedRevision::new(revision)));
        if let Some(previous) = previous {
            previous.dec_ref()?;
        }
        state.check_expired_sessions()
    }

    fn check_for_update(&self, current_version: Option<&str>) -> Result<Option<SessionToken>> {
        let mut state = self.lock();
        state.ensure_open()?;

        let Some(current) = state.current.clone() else {
            return Ok(None);
        };
        if let Some(version) = current_version {
            if current.revision().compare_version(version)? != std::cmp::Ordering::Greater {
                return Ok(None);
            }
        }

        current.inc_ref();
        state.last_session_id += 1;
        let token = SessionToken::new(state.last_session_id.to_string(), current.revision());
        debug!(target: LOG_TARGET, session = %token.id, version = %token.version, "opened session");
        state.sessions.insert(
            token.id.clone(),
            ReplicationSession {
                token: token.clone(),
                revision: current,
                last_access: Instant::now(),
            },
        );
        Ok(Some(token))
    }

    fn obtain_file(
        &self,
        session_id: &str,
        source: &str,
        file_name: &str,
    ) -> Result<Box<dyn Read + Send>> {
        let mut state = self.lock();
        state.ensure_open()?;

        let threshold = state.expiration_threshold;
        let expired = match state.sessions.get(session_id) {
            Some(session) => session.is_expired(threshold, Instant::now()),
            None => true,
        };
        if expired {
            state.release_session(session_id)?;
            return Err(ReplicationError::SessionExpired(format!(
                "session ({}) expired while obtaining file: source={} file={}",
                session_id, source, file_name
            )));
        }

        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ReplicationError::SessionExpired(session_id.to_string()))?;
        session.mark_accessed();
        debug!(target: LOG_TARGET, session = session_id, version = %session.token.version, source, file_name, "obtaining file");
        session.revision.revision().open(source, file_name)
    }

    fn release(&self, session_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.ensure_open()?;
        state.release_session(session_id)
    }

    fn close(&self) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        let mut first_error = None;
        for (_, session) in state.sessions.drain() {
            if let Err(e) = session.revision.dec_ref() {
                first_error.get_or_insert(e);
            }
        }
        if let Some(current) = state.current.take() {
            if let Err(e) = current.dec_ref() {
                first_error.get_or_insert(e);
            }
        }
        info!(target: LOG_TARGET, "replicator closed");
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::{RevisionFile, SourceFiles};
    use std::any::Any;
    use std::cmp::Ordering;
    use std::io::Cursor;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    /// Revision with an integer version that counts its releases
    #[derive(Debug)]
    struct TestRevision {
        version: String,
        generation: u64,
        files: SourceFiles,
        releases: Arc<AtomicUsize>,
        fail_release: Arc<AtomicBool>,
    }

    impl TestRevision {
        fn new(generation: u64) -> (Box<dyn Revision>, Arc<AtomicUsize>) {
            let (rev, releases, _) = Self::with_failure(generation);
            (rev, releases)
        }

        fn with_failure(generation: u64) -> (Box<dyn Revision>, Arc<AtomicUsize>, Arc<AtomicBool>) {
            let releases = Arc::new(AtomicUsize::new(0));
            let fail_release = Arc::new(AtomicBool::new(false));
            let mut files = SourceFiles::new();
            files.insert(
                "index".to_string(),
                vec![
                    RevisionFile::new("_0.dat", 4),
                    RevisionFile::new(format!("commit_{:x}", generation), 6),
                ],
            );
            let rev = TestRevision {
                version: format!("{:x}", generation),
                generation,
                files,
                releases: Arc::clone(&releases),
                fail_release: Arc::clone(&fail_release),
            };
            (Box::new(rev), releases, fail_release)
        }
    }

    impl Revision for TestRevision {
        fn version(&self) -> &str {
            &self.version
        }

        fn source_files(&self) -> &SourceFiles {
            &self.files
        }

        fn open(&self, source: &str, file_name: &str) -> Result<Box<dyn Read + Send>> {
            if source != "index" {
                return Err(ReplicationError::UnknownSource(source.to_string()));
            }
            Ok(Box::new(Cursor::new(file_name.as_bytes().to_vec())))
        }

        fn compare_version(&self, version: &str) -> Result<Ordering> {
            let other = u64::from_str_radix(version, 16)
                .map_err(|_| ReplicationError::invalid_argument(version))?;
            Ok(self.generation.cmp(&other))
        }

        fn compare_to(&self, other: &dyn Revision) -> Result<Ordering> {
            let other = other.as_any().downcast_ref::<TestRevision>().ok_or_else(|| {
                ReplicationError::IncompatibleRevision {
                    expected: "TestRevision".into(),
                    found: other.version().into(),
                }
            })?;
            Ok(self.generation.cmp(&other.generation))
        }

        fn release(&self) -> Result<()> {
            if self.fail_release.load(AtomicOrdering::SeqCst) {
                return Err(std::io::Error::other("release failed").into());
            }
            self.releases.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_nothing_published() {
        let replicator = LocalReplicator::new();
        assert!(replicator.check_for_update(None).unwrap().is_none());
    }

    #[test]
    fn test_check_for_update_versions() {
        let replicator = LocalReplicator::new();
        let (rev, _) = TestRevision::new(2);
        replicator.publish(rev).unwrap();

        let session = replicator.check_for_update(None).unwrap().unwrap();
        assert_eq!(session.version, "2");
        assert_eq!(session.id, "1");
        assert!(replicator.check_for_update(Some("1")).unwrap().is_some());
        assert!(replicator.check_for_update(Some("2")).unwrap().is_none());
        assert!(replicator.check_for_update(Some("3")).unwrap().is_none());
    }

    #[test]
    fn test_session_ids_increase() {
        let replicator = LocalReplicator::new();
        replicator.publish(TestRevision::new(1).0).unwrap();
        let a = replicator.check_for_update(None).unwrap().unwrap();
        let b = replicator.check_for_update(None).unwrap().unwrap();
        assert!(b.id.parse::<u64>().unwrap() > a.id.parse::<u64>().unwrap());
    }

    #[test]
    fn test_publish_equal_releases_offered() {
        let replicator = LocalReplicator::new();
        let (first, first_releases) = TestRevision::new(1);
        let (same, same_releases) = TestRevision::new(1);
        replicator.publish(first).unwrap();
        replicator.publish(same).unwrap();

        assert_eq!(same_releases.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(first_releases.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(replicator.current_version().as_deref(), Some("1"));
    }

    #[test]
    fn test_publish_older_rejected_and_released() {
        let replicator = LocalReplicator::new();
        let (newer, newer_releases) = TestRevision::new(5);
        let (older, older_releases) = TestRevision::new(3);
        replicator.publish(newer).unwrap();

        let err = replicator.publish(older).unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidArgument(_)));
        assert_eq!(older_releases.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(newer_releases.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(replicator.current_version().as_deref(), Some("5"));
    }

    #[test]
    fn test_superseded_revision_waits_for_sessions() {
        let replicator = LocalReplicator::new();
        let (first, first_releases) = TestRevision::new(1);
        replicator.publish(first).unwrap();
        let session = replicator.check_for_update(None).unwrap().unwrap();
        assert_eq!(session.version, "1");

        replicator.publish(TestRevision::new(2).0).unwrap();
        assert_eq!(first_releases.load(AtomicOrdering::SeqCst), 0);

        // the old session can still read its files
        let mut buf = String::new();
        replicator
            .obtain_file(&session.id, "index", "_0.dat")
            .unwrap()
            .read_to_string(&mut buf)
            .unwrap();
        assert_eq!(buf, "_0.dat");

        replicator.release(&session.id).unwrap();
        assert_eq!(first_releases.load(AtomicOrdering::SeqCst), 1);

        // releasing again is a no-op
        replicator.release(&session.id).unwrap();
        assert_eq!(first_releases.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_checkouts_release_once() {
        let replicator = Arc::new(LocalReplicator::new());
        let (rev, releases) = TestRevision::new(1);
        replicator.publish(rev).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let replicator = Arc::clone(&replicator);
                thread::spawn(move || replicator.check_for_update(None).unwrap().unwrap())
            })
            .collect();
        let sessions: Vec<SessionToken> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(replicator.current_ref_count(), Some(9));

        // supersede, then release all sessions from several threads
        replicator.publish(TestRevision::new(2).0).unwrap();
        let handles: Vec<_> = sessions
            .into_iter()
            .map(|session| {
                let replicator = Arc::clone(&replicator);
                let releases = Arc::clone(&releases);
                thread::spawn(move || {
                    assert_eq!(releases.load(AtomicOrdering::SeqCst), 0);
                    replicator.release(&session.id).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(releases.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(replicator.session_count(), 0);
    }

    #[test]
    fn test_expired_session_is_torn_down() {
        let replicator = LocalReplicator::new();
        let (first, first_releases) = TestRevision::new(1);
        replicator.publish(first).unwrap();
        replicator
            .set_expiration_threshold(Duration::from_millis(50))
            .unwrap();
        let session = replicator.check_for_update(None).unwrap().unwrap();
        replicator.publish(TestRevision::new(2).0).unwrap();

        thread::sleep(Duration::from_millis(120));
        let err = match replicator.obtain_file(&session.id, "index", "_0.dat") {
            Err(e) => e,
            Ok(_) => panic!("expected the session to be expired"),
        };
        assert!(matches!(err, ReplicationError::SessionExpired(_)));
        assert_eq!(first_releases.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(replicator.session_count(), 0);

        // a second attempt does not release again
        assert!(replicator.obtain_file(&session.id, "index", "_0.dat").is_err());
        assert_eq!(first_releases.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_session_expired() {
        let replicator = LocalReplicator::new();
        replicator.publish(TestRevision::new(1).0).unwrap();
        assert!(matches!(
            replicator.obtain_file("42", "index", "_0.dat"),
            Err(ReplicationError::SessionExpired(_))
        ));
    }

    #[test]
    fn test_threshold_change_sweeps() {
        let replicator = LocalReplicator::new();
        replicator.publish(TestRevision::new(1).0).unwrap();
        replicator.check_for_update(None).unwrap().unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(replicator.session_count(), 1);

        replicator
            .set_expiration_threshold(Duration::from_millis(1))
            .unwrap();
        assert_eq!(replicator.session_count(), 0);
        assert_eq!(replicator.current_ref_count(), Some(1));
    }

    #[test]
    fn test_failed_release_restores_count() {
        let replicator = LocalReplicator::new();
        let (first, releases, fail) = TestRevision::with_failure(1);
        replicator.publish(first).unwrap();
        let session = replicator.check_for_update(None).unwrap().unwrap();
        replicator.publish(TestRevision::new(2).0).unwrap();

        fail.store(true, AtomicOrdering::SeqCst);
        assert!(replicator.release(&session.id).is_err());
        assert_eq!(releases.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(replicator.session_count(), 1);

        fail.store(false, AtomicOrdering::SeqCst);
        replicator.release(&session.id).unwrap();
        assert_eq!(releases.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(replicator.session_count(), 0);
    }

    #[test]
    fn test_ref_count_rollback() {
        let (rev, releases, fail) = TestRevision::with_failure(1);
        let counted = RefCountedRevision::new(rev);
        fail.store(true, AtomicOrdering::SeqCst);
        assert!(counted.dec_ref().is_err());
        assert_eq!(counted.ref_count(), 1);

        fail.store(false, AtomicOrdering::SeqCst);
        counted.dec_ref().unwrap();
        assert_eq!(counted.ref_count(), 0);
        assert_eq!(releases.load(AtomicOrdering::SeqCst), 1);
        assert!(matches!(counted.dec_ref(), Err(ReplicationError::IllegalState(_))));
    }

    #[test]
    fn test_incompatible_publish_releases_offered() {
        #[derive(Debug)]
        struct OtherRevision(SourceFiles, Arc<AtomicUsize>);
        impl Revision for OtherRevision {
            fn version(&self) -> &str {
                "x"
            }
            fn source_files(&self) -> &SourceFiles {
                &self.0
            }
            fn open(&self, source: &str, _: &str) -> Result<Box<dyn Read + Send>> {
                Err(ReplicationError::UnknownSource(source.to_string()))
            }
            fn compare_version(&self, _: &str) -> Result<Ordering> {
                Ok(Ordering::Greater)
            }
            fn compare_to(&self, other: &dyn Revision) -> Result<Ordering> {
                Err(ReplicationError::IncompatibleRevision {
                    expected: "OtherRevision".into(),
                    found: other.version().into(),
                })
            }
            fn release(&self) -> Result<()> {
                self.1.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
        }

        let replicator = LocalReplicator::new();
        replicator.publish(TestRevision::new(1).0).unwrap();
        let releases = Arc::new(AtomicUsize::new(0));
        let err = replicator
            .publish(Box::new(OtherRevision(SourceFiles::new(), Arc::clone(&releases))))
            .unwrap_err();
        assert!(matches!(err, ReplicationError::IncompatibleRevision { .. }));
        assert_eq!(releases.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(replicator.current_version().as_deref(), Some("1"));
    }

    #[test]
    fn test_close_releases_everything() {
        let replicator = LocalReplicator::new();
        let (rev, releases) = TestRevision::new(1);
        replicator.publish(rev).unwrap();
        replicator.check_for_update(None).unwrap().unwrap();
        replicator.check_for_update(None).unwrap().unwrap();

        replicator.close().unwrap();
        assert_eq!(releases.load(AtomicOrdering::SeqCst), 1);
        assert!(matches!(
            replicator.check_for_update(None),
            Err(ReplicationError::AlreadyClosed(_))
        ));
        assert!(matches!(
            replicator.release("1"),
            Err(ReplicationError::AlreadyClosed(_))
        ));

        let (late, late_releases) = TestRevision::new(2);
        assert!(replicator.publish(late).is_err());
        assert_eq!(late_releases.load(AtomicOrdering::SeqCst), 1);
        // closing twice is harmless
        replicator.close().unwrap();
    }
}
