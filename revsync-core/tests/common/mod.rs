//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use revsync_core::{CommitStore, Directory, Result};

/// Directory wrapper that records syncs into a shared log and can fail the
/// n-th created output
#[derive(Debug)]
pub struct FaultyDirectory {
    label: String,
    inner: Arc<dyn Directory>,
    log: Arc<Mutex<Vec<String>>>,
    outputs: AtomicUsize,
    fail_output: AtomicUsize,
}

impl FaultyDirectory {
    pub fn new(label: &str, inner: Arc<dyn Directory>, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            label: label.to_string(),
            inner,
            log,
            outputs: AtomicUsize::new(0),
            fail_output: AtomicUsize::new(0),
        }
    }

    /// Fail the `n`-th `create_output` call from now on, counting from 1.
    /// Zero disables the fault.
    pub fn fail_output(&self, n: usize) {
        self.outputs.store(0, Ordering::SeqCst);
        self.fail_output.store(n, Ordering::SeqCst);
    }
}

impl Directory for FaultyDirectory {
    fn list_all(&self) -> Result<Vec<String>> {
        self.inner.list_all()
    }

    fn file_exists(&self, name: &str) -> Result<bool> {
        self.inner.file_exists(name)
    }

    fn file_length(&self, name: &str) -> Result<u64> {
        self.inner.file_length(name)
    }

    fn open_input(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        self.inner.open_input(name)
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn Write + Send>> {
        let n = self.outputs.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_output.load(Ordering::SeqCst) {
            return Err(io::Error::other(format!("injected failure writing {}", name)).into());
        }
        self.inner.create_output(name)
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.label, names.join(",")));
        self.inner.sync(names)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.inner.delete_file(name)
    }

    fn describe(&self) -> String {
        format!("faulty({})", self.inner.describe())
    }
}

/// Write `files` and commit them
pub fn commit(store: &CommitStore, files: &[(&str, &str)]) {
    let mut names = Vec::new();
    for (name, body) in files {
        store.write_file(name, body.as_bytes()).unwrap();
        names.push(name.to_string());
    }
    store.commit(&names).unwrap();
}

/// Whole contents of a file
pub fn read_file(dir: &dyn Directory, name: &str) -> String {
    let mut body = String::new();
    dir.open_input(name)
        .unwrap()
        .read_to_string(&mut body)
        .unwrap();
    body
}
