//! Parallel filesystem scanning.
//!
//! Directories are distributed over a bounded pool of worker threads through
//! a shared queue. Each worker appends to its own arena; the arenas are
//! merged into one ordered map when the queue drains, so the worker count
//! and scheduling never show up in the result.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use kiln_common::settings::SnapshotSettings;
use parking_lot::Mutex;

use crate::error::SnapshotError;
use crate::filter::PathFilter;
use crate::metadata::FileMetadata;
use crate::snapshot::{FilesystemSnapshot, child_path, host_path, normalize_scope};

const IDLE_POLL: Duration = Duration::from_millis(2);

/// Scans an image root into a [`FilesystemSnapshot`].
#[derive(Debug, Clone)]
pub struct Scanner {
    workers: usize,
    mtime_granularity: u64,
    exclude: PathFilter,
    tolerate: PathFilter,
    cancel: Option<Arc<AtomicBool>>,
}

impl Default for Scanner {
    fn default() -> Self {
        Self {
            workers: 4,
            mtime_granularity: 1,
            exclude: PathFilter::empty(),
            tolerate: PathFilter::empty(),
            cancel: None,
        }
    }
}

impl Scanner {
    /// A scanner with four workers and no exclusions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a scanner from the `[snapshot]` settings.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::InvalidPattern`] if a pattern is malformed.
    pub fn from_settings(settings: &SnapshotSettings) -> Result<Self, SnapshotError> {
        Ok(Self {
            workers: settings.effective_workers(),
            mtime_granularity: settings.mtime_granularity_secs.max(1),
            exclude: PathFilter::new(&settings.exclude)?,
            tolerate: PathFilter::new(&settings.tolerate)?,
            cancel: None,
        })
    }

    /// Set the number of traversal workers (at least one).
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the always-excluded path patterns.
    #[must_use]
    pub fn with_exclude(mut self, exclude: PathFilter) -> Self {
        self.exclude = exclude;
        self
    }

    /// Set the patterns whose scan errors are skipped.
    #[must_use]
    pub fn with_tolerate(mut self, tolerate: PathFilter) -> Self {
        self.tolerate = tolerate;
        self
    }

    /// Set the mtime truncation granularity in seconds.
    #[must_use]
    pub fn with_mtime_granularity(mut self, secs: u64) -> Self {
        self.mtime_granularity = secs.max(1);
        self
    }

    /// Observe a cancellation flag between directories.
    #[must_use]
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// The exclusion filter.
    #[must_use]
    pub const fn exclude(&self) -> &PathFilter {
        &self.exclude
    }

    /// Number of traversal workers.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Scan `root`, or only the subtrees in `scope`.
    ///
    /// # Errors
    ///
    /// Returns the first non-tolerated I/O error, or
    /// [`SnapshotError::Canceled`] if the cancel flag was raised.
    pub fn scan(&self, root: &Path, scope: Option<&[String]>) -> Result<FilesystemSnapshot, SnapshotError> {
        let scope = scope.map(|s| normalize_scope(s.to_vec()));
        let starts: Vec<String> = scope.clone().unwrap_or_else(|| vec!["/".to_string()]);

        let state = ScanState::new(self.workers);
        let mut seeded = Vec::new();

        for start in &starts {
            if start != "/" {
                if self.exclude.matches(start) {
                    continue;
                }
                match self.stat(root, start, &state) {
                    Ok(Some(meta)) => {
                        let is_dir = meta.kind.is_dir();
                        seeded.push((start.clone(), meta));
                        if is_dir {
                            state.enqueue(start.clone());
                        }
                    }
                    Ok(None) => {}
                    Err(e) => return Err(e),
                }
            } else {
                state.enqueue(start.clone());
            }
        }

        std::thread::scope(|s| {
            for worker in 0..self.workers {
                let state = &state;
                s.spawn(move || self.run_worker(worker, root, state));
            }
        });

        if self.is_canceled() {
            return Err(SnapshotError::Canceled);
        }
        if let Some(err) = state.error.lock().take() {
            return Err(err);
        }

        let mut entries: BTreeMap<String, FileMetadata> = seeded.into_iter().collect();
        for arena in state.arenas.into_iter().map(Mutex::into_inner) {
            entries.extend(arena);
        }
        let skipped = state.skipped.into_inner();

        tracing::debug!(
            root = %root.display(),
            entries = entries.len(),
            skipped = skipped.len(),
            workers = self.workers,
            scoped = scope.is_some(),
            "Filesystem scanned"
        );

        Ok(FilesystemSnapshot::from_entries(entries, scope).with_skipped(skipped))
    }

    fn run_worker(&self, worker: usize, root: &Path, state: &ScanState) {
        let mut arena = Vec::new();

        loop {
            if state.stop.load(Ordering::Acquire) || self.is_canceled() {
                break;
            }
            match state.rx.recv_timeout(IDLE_POLL) {
                Ok(dir) => {
                    if let Err(err) = self.scan_dir(root, &dir, state, &mut arena) {
                        state.fail(err);
                    }
                    state.pending.fetch_sub(1, Ordering::AcqRel);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if state.pending.load(Ordering::Acquire) == 0 {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        state.arenas[worker].lock().extend(arena);
    }

    fn scan_dir(
        &self,
        root: &Path,
        dir: &str,
        state: &ScanState,
        arena: &mut Vec<(String, FileMetadata)>,
    ) -> Result<(), SnapshotError> {
        let read_dir = match fs::read_dir(host_path(root, dir)) {
            Ok(rd) => rd,
            Err(e) => return self.tolerate_or(state, dir, e),
        };

        for entry in read_dir {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    self.tolerate_or(state, dir, e)?;
                    continue;
                }
            };
            let name = entry
                .file_name()
                .into_string()
                .map_err(|_| SnapshotError::NonUtf8Path { path: entry.path() })?;
            let path = child_path(dir, &name);
            if self.exclude.matches(&path) {
                continue;
            }

            let meta = match entry
                .metadata()
                .and_then(|m| FileMetadata::from_std(&entry.path(), &m, self.mtime_granularity))
            {
                Ok(meta) => meta,
                Err(e) => {
                    self.tolerate_or(state, &path, e)?;
                    continue;
                }
            };

            if meta.kind.is_dir() {
                state.enqueue(path.clone());
            }
            arena.push((path, meta));
        }

        Ok(())
    }

    fn stat(
        &self,
        root: &Path,
        path: &str,
        state: &ScanState,
    ) -> Result<Option<FileMetadata>, SnapshotError> {
        match FileMetadata::read(&host_path(root, path), self.mtime_granularity) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotADirectory => Ok(None),
            Err(e) => self.tolerate_or(state, path, e).map(|()| None),
        }
    }

    /// A tolerated error marks `path` as skipped, so its subtree reads as
    /// unknown rather than deleted.
    fn tolerate_or(&self, state: &ScanState, path: &str, err: std::io::Error) -> Result<(), SnapshotError> {
        if self.tolerate.matches(path) {
            tracing::warn!(path, error = %err, "Skipping unreadable path");
            state.skipped.lock().insert(path.to_string());
            Ok(())
        } else {
            Err(SnapshotError::io(path, err))
        }
    }

    fn is_canceled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }
}

/// Shared state for one scan.
struct ScanState {
    tx: Sender<String>,
    rx: Receiver<String>,
    pending: AtomicUsize,
    stop: AtomicBool,
    error: Mutex<Option<SnapshotError>>,
    arenas: Vec<Mutex<Vec<(String, FileMetadata)>>>,
    skipped: Mutex<BTreeSet<String>>,
}

impl ScanState {
    fn new(workers: usize) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            pending: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            error: Mutex::new(None),
            arenas: (0..workers.max(1)).map(|_| Mutex::new(Vec::new())).collect(),
            skipped: Mutex::new(BTreeSet::new()),
        }
    }

    fn enqueue(&self, dir: String) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        // The receiver lives as long as `self`, so sending cannot fail.
        let _ = self.tx.send(dir);
    }

    fn fail(&self, err: SnapshotError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
        self.stop.store(true, Ordering::Release);
    }
}

/// Scan helper used by tests and callers that don't need a configured scanner.
///
/// # Errors
///
/// See [`Scanner::scan`].
pub fn scan_all(root: &Path) -> Result<FilesystemSnapshot, SnapshotError> {
    Scanner::new().scan(root, None)
}
