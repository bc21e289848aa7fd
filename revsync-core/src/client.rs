//! Replication client
//!
//! The client checks the replicator for a newer revision, streams the files
//! it is missing into per-session scratch directories and hands them to a
//! `ReplicationHandler` to install. Cycles run one at a time, either on
//! demand or from a background update thread.

use std::collections::HashSet;
use std::fmt;
use std::io::{self, Write};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::directory::Directory;
use crate::error::{ReplicationError, Result};
use crate::handler::{CopiedFiles, ReplicationHandler, SourceDirectories};
use crate::replicator::Replicator;
use crate::revision::{RevisionFile, SourceFiles};
use crate::session::SessionToken;
use crate::source_factory::SourceDirectoryFactory;
use crate::update_thread::UpdateThread;

/// Tracing target of the client
pub const LOG_TARGET: &str = "revsync::client";

/// Name of the update thread when none is given
pub const DEFAULT_THREAD_NAME: &str = "ReplicationThread";

/// Decides what the update thread does after a failed cycle
pub type ErrorHook = Box<dyn Fn(&ReplicationError) -> ControlFlow<()> + Send + Sync>;

/// Result of one update cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Nothing newer was published
    UpToDate,
    /// A revision was fetched and installed
    Installed { version: String, files: usize, bytes: u64 },
    /// The client was closed while fetching
    Aborted,
}

/// Files of `new_files` missing from `current`, per source, in revision
/// order.
///
/// Files are matched by name only; committed files are never rewritten.
pub fn required_files(new_files: &SourceFiles, current: Option<&SourceFiles>) -> SourceFiles {
    let Some(current) = current else {
        return new_files.clone();
    };
    new_files
        .iter()
        .map(|(source, files)| {
            let installed: HashSet<&str> = current
                .get(source)
                .map(|files| files.iter().map(|f| f.file_name.as_str()).collect())
                .unwrap_or_default();
            let required = files
                .iter()
                .filter(|f| !installed.contains(f.file_name.as_str()))
                .cloned()
                .collect();
            (source.clone(), required)
        })
        .collect()
}

/// Files copied by one cycle
#[derive(Default)]
struct Fetched {
    copied: CopiedFiles,
    directories: SourceDirectories,
    files: usize,
    bytes: u64,
}

struct ClientInner {
    replicator: Arc<dyn Replicator>,
    handler: Arc<dyn ReplicationHandler>,
    factory: Arc<dyn SourceDirectoryFactory>,
    update_lock: Mutex<()>,
    closed: AtomicBool,
    error_hook: Mutex<Option<ErrorHook>>,
}

impl ClientInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ReplicationError::AlreadyClosed(
                "this replication client has already been closed".to_string(),
            ));
        }
        Ok(())
    }

    fn do_update(&self) -> Result<UpdateOutcome> {
        let _gate = self.update_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_open()?;
        let started = Instant::now();

        let current_version = self.handler.current_version();
        let Some(session) = self
            .replicator
            .check_for_update(current_version.as_deref())?
        else {
            debug!(target: LOG_TARGET, version = ?current_version, "no update available");
            return Ok(UpdateOutcome::UpToDate);
        };
        info!(target: LOG_TARGET, session = %session.id, version = %session.version, installed = ?current_version, "update available");

        let fetched = self.fetch(&session);

        // the session is not needed for the install
        if let Err(e) = self.replicator.release(&session.id) {
            warn!(target: LOG_TARGET, session = %session.id, "failed to release session: {}", e);
        }

        let outcome = match fetched {
            Ok(Some(_)) if self.closed.load(Ordering::SeqCst) => {
                info!(target: LOG_TARGET, session = %session.id, "client closed, skipping install");
                Ok(UpdateOutcome::Aborted)
            }
            Ok(Some(fetched)) => self
                .handler
                .revision_ready(
                    &session.version,
                    &session.source_files,
                    &fetched.copied,
                    &fetched.directories,
                )
                .map(|()| UpdateOutcome::Installed {
                    version: session.version.clone(),
                    files: fetched.files,
                    bytes: fetched.bytes,
                }),
            Ok(None) => Ok(UpdateOutcome::Aborted),
            Err(e) => Err(e),
        };
        self.cleanup_session(&session.id);

        if let Ok(UpdateOutcome::Installed { version, files, bytes }) = &outcome {
            info!(
                target: LOG_TARGET,
                version = %version,
                files,
                bytes,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "revision installed"
            );
        }
        outcome
    }

    /// Copy every missing file of the session. `None` means the client was
    /// closed mid-copy.
    fn fetch(&self, session: &SessionToken) -> Result<Option<Fetched>> {
        let installed = self.handler.current_revision_files();
        let required = required_files(&session.source_files, installed.as_ref());

        let mut fetched = Fetched::default();
        for (source, files) in &required {
            let dir = self.factory.get_directory(&session.id, source)?;
            let mut names = Vec::with_capacity(files.len());
            for file in files {
                if self.closed.load(Ordering::SeqCst) {
                    info!(target: LOG_TARGET, session = %session.id, "client closed, aborting update");
                    return Ok(None);
                }
                fetched.bytes += self.copy_file(session, source, file, dir.as_ref())?;
                fetched.files += 1;
                names.push(file.file_name.clone());
            }
            fetched.copied.insert(source.clone(), names);
            fetched.directories.insert(source.clone(), dir);
        }
        Ok(Some(fetched))
    }

    fn copy_file(
        &self,
        session: &SessionToken,
        source: &str,
        file: &RevisionFile,
        dir: &dyn Directory,
    ) -> Result<u64> {
        let mut input = self
            .replicator
            .obtain_file(&session.id, source, &file.file_name)?;
        let mut output = dir.create_output(&file.file_name)?;
        let copied = io::copy(&mut input, &mut output)?;
        output.flush()?;
        if copied != file.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "{}/{}: expected {} bytes, received {}",
                    source, file.file_name, file.size, copied
                ),
            )
            .into());
        }
        debug!(target: LOG_TARGET, source, file = %file.file_name, bytes = copied, "fetched file");
        Ok(copied)
    }

    fn cleanup_session(&self, session_id: &str) {
        if let Err(e) = self.factory.cleanup_session(session_id) {
            warn!(target: LOG_TARGET, session = session_id, "failed to clean up session files: {}", e);
        }
    }

    /// One run of the update thread
    fn run_scheduled(&self) -> ControlFlow<()> {
        if self.closed.load(Ordering::SeqCst) {
            return ControlFlow::Break(());
        }
        match self.do_update() {
            Ok(_) => ControlFlow::Continue(()),
            Err(e) => self.handle_update_error(&e),
        }
    }

    fn handle_update_error(&self, e: &ReplicationError) -> ControlFlow<()> {
        let hook = self.error_hook.lock().unwrap_or_else(PoisonError::into_inner);
        match hook.as_ref() {
            Some(hook) => hook(e),
            None => {
                error!(target: LOG_TARGET, retryable = e.is_retryable(), "update failed: {}", e);
                ControlFlow::Continue(())
            }
        }
    }
}

/// Pulls revisions from a replicator into local storage
pub struct ReplicationClient {
    inner: Arc<ClientInner>,
    update_thread: Mutex<Option<UpdateThread>>,
}

impl ReplicationClient {
    pub fn new(
        replicator: Arc<dyn Replicator>,
        handler: Arc<dyn ReplicationHandler>,
        factory: Arc<dyn SourceDirectoryFactory>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                replicator,
                handler,
                factory,
                update_lock: Mutex::new(()),
                closed: AtomicBool::new(false),
                error_hook: Mutex::new(None),
            }),
            update_thread: Mutex::new(None),
        }
    }

    fn thread_slot(&self) -> MutexGuard<'_, Option<UpdateThread>> {
        self.update_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one update cycle on the calling thread
    pub fn do_update(&self) -> Result<UpdateOutcome> {
        self.inner.do_update()
    }

    /// Check for an update now: wakes the update thread if it runs,
    /// otherwise updates on the calling thread
    pub fn update_now(&self) -> Result<()> {
        self.inner.ensure_open()?;
        {
            let slot = self.thread_slot();
            if let Some(thread) = slot.as_ref().filter(|t| t.is_alive()) {
                thread.execute_immediately();
                return Ok(());
            }
        }
        self.inner.do_update().map(|_| ())
    }

    /// Start checking for updates every `interval`
    pub fn start_update_thread(&self, interval: Duration, name: Option<&str>) -> Result<()> {
        self.inner.ensure_open()?;
        let mut slot = self.thread_slot();
        if slot.as_ref().is_some_and(|t| t.is_alive()) {
            return Err(ReplicationError::illegal_state(
                "cannot start update thread, it is already running",
            ));
        }
        // reap a loop that ended on its own
        if let Some(mut finished) = slot.take() {
            finished.stop();
        }

        let inner = Arc::clone(&self.inner);
        let name = match name {
            Some(name) => format!("{}-{}", DEFAULT_THREAD_NAME, name),
            None => DEFAULT_THREAD_NAME.to_string(),
        };
        let thread = UpdateThread::spawn(name, interval, move || {
            inner.run_scheduled()
        })?;
        info!(target: LOG_TARGET, thread = thread.name(), interval_ms = thread.interval().as_millis() as u64, "update thread started");
        *slot = Some(thread);
        Ok(())
    }

    /// Stop the update thread, waiting for a running cycle to finish.
    /// No-op without one.
    pub fn stop_update_thread(&self) {
        let stopped = self.thread_slot().take();
        if let Some(mut thread) = stopped {
            thread.stop();
            info!(target: LOG_TARGET, thread = thread.name(), "update thread stopped");
        }
    }

    pub fn is_update_thread_alive(&self) -> bool {
        self.thread_slot().as_ref().is_some_and(|t| t.is_alive())
    }

    /// Decide what the update thread does after a failed cycle.
    ///
    /// Without a hook failures are logged and the loop keeps going.
    pub fn set_error_hook<F>(&self, hook: F)
    where
        F: Fn(&ReplicationError) -> ControlFlow<()> + Send + Sync + 'static,
    {
        *self
            .inner
            .error_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));
    }

    /// Version installed by the handler
    pub fn current_version(&self) -> Option<String> {
        self.inner.handler.current_version()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stop the update thread and refuse further updates
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_update_thread();
        debug!(target: LOG_TARGET, "replication client closed");
    }
}

impl Drop for ReplicationClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Display for ReplicationClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let version = self.current_version();
        write!(
            f,
            "ReplicationClient(version={}, closed={})",
            version.as_deref().unwrap_or("none"),
            self.is_closed()
        )
    }
}

impl fmt::Debug for ReplicationClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationClient")
            .field("version", &self.current_version())
            .field("closed", &self.is_closed())
            .field("update_thread_alive", &self.is_update_thread_alive())
            .finish()
    }
}
