//! Background update loop
//!
//! One worker thread runs a job, then sleeps for what is left of the
//! interval. `execute_immediately` wakes it early; triggers arriving while a
//! run is pending coalesce into that one run.

use std::ops::ControlFlow;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::error::Result;

const LOG_TARGET: &str = "revsync::update_thread";

#[derive(Debug, Default)]
struct Signal {
    pending: bool,
    stop: bool,
}

#[derive(Debug, Default)]
struct Shared {
    signal: Mutex<Signal>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Signal> {
        self.signal.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a running update loop
#[derive(Debug)]
pub struct UpdateThread {
    name: String,
    interval: Duration,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl UpdateThread {
    /// Spawn a loop running `job` right away and then every `interval`,
    /// measured from the start of each run. The loop ends when `job`
    /// returns `Break` or when stopped.
    pub fn spawn<F>(name: impl Into<String>, interval: Duration, mut job: F) -> Result<Self>
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        let name = name.into();
        let shared = Arc::new(Shared {
            signal: Mutex::new(Signal {
                pending: true,
                stop: false,
            }),
            wake: Condvar::new(),
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let mut next_run = Instant::now();
            loop {
                {
                    let mut signal = worker.lock();
                    loop {
                        if signal.stop {
                            return;
                        }
                        let now = Instant::now();
                        if signal.pending || now >= next_run {
                            signal.pending = false;
                            break;
                        }
                        signal = worker
                            .wake
                            .wait_timeout(signal, next_run - now)
                            .map(|(guard, _)| guard)
                            .unwrap_or_else(|e| e.into_inner().0);
                    }
                }

                let started = Instant::now();
                if job().is_break() {
                    debug!(target: LOG_TARGET, "update job asked to stop");
                    return;
                }
                // drift correction: the next run is due one interval after
                // this one started, or immediately if the run overran
                next_run = started + interval;
            }
        })?;

        debug!(target: LOG_TARGET, thread = %name, interval_ms = interval.as_millis() as u64, "update thread started");
        Ok(Self {
            name,
            interval,
            shared,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run the job as soon as the current run, if any, completes
    pub fn execute_immediately(&self) {
        self.shared.lock().pending = true;
        self.shared.wake.notify_one();
    }

    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the loop, waiting for an in-flight run to complete
    pub fn stop(&mut self) {
        self.shared.lock().stop = true;
        self.shared.wake.notify_one();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(target: LOG_TARGET, thread = %self.name, "update thread panicked");
            }
        }
    }
}

impl Drop for UpdateThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_job(counter: &Arc<AtomicUsize>) -> impl FnMut() -> ControlFlow<()> + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Continue(())
        }
    }

    fn wait_for(counter: &AtomicUsize, at_least: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < at_least && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_first_run_is_immediate() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut updater =
            UpdateThread::spawn("test-updater", Duration::from_secs(3600), counting_job(&runs)).unwrap();
        wait_for(&runs, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(updater.is_alive());
        assert_eq!(updater.name(), "test-updater");

        updater.stop();
        assert!(!updater.is_alive());
    }

    #[test]
    fn test_execute_immediately_wakes_loop() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut updater =
            UpdateThread::spawn("test-updater", Duration::from_secs(3600), counting_job(&runs)).unwrap();
        wait_for(&runs, 1);

        updater.execute_immediately();
        wait_for(&runs, 2);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        updater.stop();
    }

    #[test]
    fn test_repeats_on_interval() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut updater =
            UpdateThread::spawn("test-updater", Duration::from_millis(10), counting_job(&runs)).unwrap();
        wait_for(&runs, 3);
        assert!(runs.load(Ordering::SeqCst) >= 3);
        updater.stop();
    }

    #[test]
    fn test_interval_measured_from_run_start() {
        let interval = Duration::from_millis(200);
        let job_time = Duration::from_millis(150);
        let starts = Arc::new(Mutex::new(Vec::new()));
        let runs = Arc::new(AtomicUsize::new(0));
        let (s, r) = (Arc::clone(&starts), Arc::clone(&runs));
        let mut updater = UpdateThread::spawn("test-updater", interval, move || {
            s.lock().unwrap().push(Instant::now());
            thread::sleep(job_time);
            r.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Continue(())
        })
        .unwrap();
        assert_eq!(updater.interval(), interval);
        wait_for(&runs, 4);
        updater.stop();

        let starts = starts.lock().unwrap();
        assert!(starts.len() >= 4);
        for pair in starts.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= interval, "gap {:?}", gap);
            // sleeping a full interval after each run would give 350ms
            assert!(gap < interval + job_time / 2, "gap {:?}", gap);
        }
    }

    #[test]
    fn test_triggers_during_run_coalesce() {
        let started = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        let (s, r) = (Arc::clone(&started), Arc::clone(&runs));
        let mut updater = UpdateThread::spawn("test-updater", Duration::from_secs(3600), move || {
            if s.fetch_add(1, Ordering::SeqCst) == 0 {
                thread::sleep(Duration::from_millis(200));
            }
            r.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Continue(())
        })
        .unwrap();
        wait_for(&started, 1);

        for _ in 0..5 {
            updater.execute_immediately();
        }
        wait_for(&runs, 2);
        thread::sleep(Duration::from_millis(200));
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        updater.stop();
    }

    #[test]
    fn test_stop_waits_for_running_job() {
        let finished = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(AtomicUsize::new(0));
        let (f, s) = (Arc::clone(&finished), Arc::clone(&started));
        let mut updater = UpdateThread::spawn("test-updater", Duration::from_secs(3600), move || {
            s.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
            f.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Continue(())
        })
        .unwrap();
        wait_for(&started, 1);

        updater.stop();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_break_ends_loop() {
        let mut updater =
            UpdateThread::spawn("test-updater", Duration::from_millis(1), || ControlFlow::Break(()))
                .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while updater.is_alive() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!updater.is_alive());
        updater.stop();
    }
}
