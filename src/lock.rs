//! Non-blocking, per-key mutual exclusion for derivative generation.
//!
//! [`TryLock::try_acquire`] never waits: it either hands back a
//! [`LockGuard`] or returns `None` because someone else holds the key. The
//! guard releases on drop, so every exit path of a generation attempt
//! (success, error, panic unwinding) gives the key back.
//!
//! Two backends:
//!
//! | Backend | Scope | Mechanism |
//! |---|---|---|
//! | [`ProcessLocks`] | threads of one process | mutex-guarded set of held keys |
//! | [`LockFileLocks`] | processes on one host | `O_EXCL` lock files in a directory |
//!
//! Lock files left behind by a crashed process are taken over once they have
//! not been refreshed for the configured stale interval. Cross-host locking would be a
//! third implementation of the same trait (e.g. a TTL key in a shared KV
//! store).

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, warn};

/// Held lock; dropping it releases the key.
pub struct LockGuard<'a> {
    key: String,
    release: Option<Box<dyn FnOnce() + Send + 'a>>,
}

impl<'a> LockGuard<'a> {
    pub fn new(key: impl Into<String>, release: impl FnOnce() + Send + 'a) -> Self {
        Self {
            key: key.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
            debug!(key = %self.key, "released generation lock");
        }
    }
}

impl std::fmt::Debug for LockGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}

/// Try-acquire lock capability.
pub trait TryLock: Send + Sync {
    /// Acquire `key` if nobody holds it. Never blocks.
    fn try_acquire(&self, key: &str) -> Option<LockGuard<'_>>;
}

/// Locks scoped to the current process.
#[derive(Debug, Default)]
pub struct ProcessLocks {
    held: Mutex<HashSet<String>>,
}

impl ProcessLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held.lock().contains(key)
    }
}

impl TryLock for ProcessLocks {
    fn try_acquire(&self, key: &str) -> Option<LockGuard<'_>> {
        if !self.held.lock().insert(key.to_string()) {
            return None;
        }
        let owned = key.to_string();
        Some(LockGuard::new(key, move || {
            self.held.lock().remove(&owned);
        }))
    }
}

/// Locks shared by every process that uses the same directory.
///
/// Each lock file holds an owner token (`<pid>-<nonce>`), and only its owner
/// refreshes or removes it. While a key is held a heartbeat thread touches
/// the file every third of the stale interval, so only a holder that died
/// (or stalled for longer than the interval) loses its lock.
///
/// Stale takeover is serialized through a `<name>.lock.takeover` file
/// created with `O_EXCL`: of several processes that see the same stale lock,
/// one replaces it and the rest report the key as held.
#[derive(Debug, Clone)]
pub struct LockFileLocks {
    dir: PathBuf,
    stale_after: Duration,
}

impl LockFileLocks {
    pub fn new(dir: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            dir: dir.into(),
            stale_after,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Lock file for a key. Keys that are not plain file names are hashed.
    pub fn lock_path(&self, key: &str) -> PathBuf {
        let safe = !key.is_empty()
            && key
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        let name = if safe {
            key.to_string()
        } else {
            format!("{:x}", Sha256::digest(key.as_bytes()))
        };
        self.dir.join(format!("{name}.lock"))
    }

    fn is_stale(&self, path: &Path) -> bool {
        file_age(path).is_some_and(|age| age >= self.stale_after)
    }

    /// Replace a stale lock file with one owned by `owner`.
    fn take_over(&self, path: &Path, owner: &str) -> bool {
        let mut name = path.as_os_str().to_owned();
        name.push(".takeover");
        let guard_path = PathBuf::from(name);

        match create_exclusive(&guard_path, owner) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                // Left behind by a process that died mid-takeover
                if self.is_stale(&guard_path) {
                    warn!(path = %guard_path.display(), "removing stale takeover file");
                    if let Err(e) = fs::remove_file(&guard_path) {
                        warn!(path = %guard_path.display(), error = %e, "cannot remove takeover file");
                    }
                }
                return false;
            }
            Err(e) => {
                error!(path = %guard_path.display(), error = %e, "cannot create takeover file");
                return false;
            }
        }

        // Another process may have replaced the lock before we got here
        let acquired = if self.is_stale(path) {
            warn!(path = %path.display(), previous = ?read_owner(path), "taking over stale lock file");
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "cannot remove stale lock file"),
            }
            create_exclusive(path, owner).is_ok()
        } else {
            false
        };

        if let Err(e) = fs::remove_file(&guard_path) {
            warn!(path = %guard_path.display(), error = %e, "cannot remove takeover file");
        }
        acquired
    }

    fn heartbeat_interval(&self) -> Option<Duration> {
        (!self.stale_after.is_zero()).then(|| self.stale_after / 3)
    }
}

impl TryLock for LockFileLocks {
    fn try_acquire(&self, key: &str) -> Option<LockGuard<'_>> {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            error!(dir = %self.dir.display(), error = %e, "cannot create lock directory");
            return None;
        }
        let path = self.lock_path(key);
        let owner = owner_token();

        let acquired = match create_exclusive(&path, &owner) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                self.is_stale(&path) && self.take_over(&path, &owner)
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "cannot create lock file");
                false
            }
        };
        if !acquired {
            return None;
        }

        let heartbeat = self
            .heartbeat_interval()
            .and_then(|every| Heartbeat::start(path.clone(), owner.clone(), every));

        Some(LockGuard::new(key, move || {
            if let Some(heartbeat) = heartbeat {
                heartbeat.stop();
            }
            if read_owner(&path).as_deref() != Some(owner.as_str()) {
                warn!(path = %path.display(), "lock file was taken over, leaving it in place");
                return;
            }
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "cannot remove lock file");
            }
        }))
    }
}

/// Keeps a held lock file's modification time fresh.
struct Heartbeat {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    fn start(path: PathBuf, owner: String, every: Duration) -> Option<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let spawned = std::thread::Builder::new()
            .name("lock-heartbeat".into())
            .spawn(move || {
                while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(every) {
                    if read_owner(&path).as_deref() != Some(owner.as_str()) {
                        warn!(path = %path.display(), "lost lock file to another owner");
                        continue;
                    }
                    if let Err(e) = touch(&path) {
                        warn!(path = %path.display(), error = %e, "cannot refresh lock file");
                    }
                }
            });
        match spawned {
            Ok(handle) => Some(Self { stop, handle }),
            Err(e) => {
                warn!(error = %e, "cannot start lock heartbeat; long generations may lose the lock");
                None
            }
        }
    }

    fn stop(self) {
        drop(self.stop);
        if self.handle.join().is_err() {
            error!("lock heartbeat thread panicked");
        }
    }
}

fn owner_token() -> String {
    format!("{}-{:016x}", std::process::id(), rand::random::<u64>())
}

fn create_exclusive(path: &Path, owner: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    writeln!(file, "{owner}")
}

fn read_owner(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn file_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO),
    )
}

fn touch(path: &Path) -> std::io::Result<()> {
    OpenOptions::new()
        .write(true)
        .open(path)?
        .set_modified(SystemTime::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    // =========================================================================
    // ProcessLocks
    // =========================================================================

    #[test]
    fn process_lock_is_exclusive_per_key() {
        let locks = ProcessLocks::new();
        let guard = locks.try_acquire("a").unwrap();
        assert!(locks.try_acquire("a").is_none());
        assert!(locks.try_acquire("b").is_some());
        assert_eq!(guard.key(), "a");
    }

    #[test]
    fn process_lock_released_on_drop() {
        let locks = ProcessLocks::new();
        {
            let _guard = locks.try_acquire("a").unwrap();
            assert!(locks.is_held("a"));
        }
        assert!(!locks.is_held("a"));
        assert!(locks.try_acquire("a").is_some());
    }

    #[test]
    fn process_lock_released_on_panic() {
        let locks = ProcessLocks::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = locks.try_acquire("a").unwrap();
            panic!("generation blew up");
        }));
        assert!(result.is_err());
        assert!(!locks.is_held("a"));
    }

    #[test]
    fn process_lock_single_winner_across_threads() {
        let locks = Arc::new(ProcessLocks::new());
        let barrier = Arc::new(Barrier::new(8));
        let winners = Arc::new(AtomicUsize::new(0));
        let hold = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (locks, barrier, winners, hold) =
                    (locks.clone(), barrier.clone(), winners.clone(), hold.clone());
                std::thread::spawn(move || {
                    barrier.wait();
                    let guard = locks.try_acquire("same");
                    if guard.is_some() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                    // Keep the guard alive until everyone has tried
                    hold.wait();
                    drop(guard);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    // =========================================================================
    // LockFileLocks
    // =========================================================================

    #[test]
    fn lock_file_is_exclusive_and_removed_on_drop() {
        let tmp = TempDir::new().unwrap();
        let locks = LockFileLocks::new(tmp.path().join("locks"), Duration::from_secs(30));
        let path = locks.lock_path("abc");

        let guard = locks.try_acquire("abc").unwrap();
        assert!(path.exists());
        assert!(locks.try_acquire("abc").is_none());

        drop(guard);
        assert!(!path.exists());
        assert!(locks.try_acquire("abc").is_some());
    }

    #[test]
    fn lock_files_shared_between_instances() {
        let tmp = TempDir::new().unwrap();
        let a = LockFileLocks::new(tmp.path(), Duration::from_secs(30));
        let b = LockFileLocks::new(tmp.path(), Duration::from_secs(30));
        let _guard = a.try_acquire("k").unwrap();
        assert!(b.try_acquire("k").is_none());
    }

    #[test]
    fn stale_lock_file_is_taken_over() {
        let tmp = TempDir::new().unwrap();
        let locks = LockFileLocks::new(tmp.path(), Duration::ZERO);
        fs::write(locks.lock_path("k"), "12345\n").unwrap();
        assert!(locks.try_acquire("k").is_some());
    }

    #[test]
    fn fresh_foreign_lock_file_blocks() {
        let tmp = TempDir::new().unwrap();
        let locks = LockFileLocks::new(tmp.path(), Duration::from_secs(3600));
        fs::write(locks.lock_path("k"), "12345\n").unwrap();
        assert!(locks.try_acquire("k").is_none());
    }

    fn backdate(path: &Path, by: Duration) {
        fs::OpenOptions::new()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - by)
            .unwrap();
    }

    #[test]
    fn lock_file_records_owner() {
        let tmp = TempDir::new().unwrap();
        let locks = LockFileLocks::new(tmp.path(), Duration::from_secs(30));
        let _guard = locks.try_acquire("k").unwrap();
        let owner = read_owner(&locks.lock_path("k")).unwrap();
        assert!(owner.starts_with(&format!("{}-", std::process::id())));
    }

    #[test]
    fn held_lock_is_refreshed_past_stale_interval() {
        let tmp = TempDir::new().unwrap();
        let a = LockFileLocks::new(tmp.path(), Duration::from_millis(300));
        let b = LockFileLocks::new(tmp.path(), Duration::from_millis(300));

        let guard = a.try_acquire("k").unwrap();
        std::thread::sleep(Duration::from_secs(1));
        assert!(b.try_acquire("k").is_none());

        drop(guard);
        assert!(b.try_acquire("k").is_some());
    }

    #[test]
    fn release_leaves_foreign_lock_file() {
        let tmp = TempDir::new().unwrap();
        let locks = LockFileLocks::new(tmp.path(), Duration::from_secs(30));
        let path = locks.lock_path("k");

        let guard = locks.try_acquire("k").unwrap();
        // Someone else took the key over while we were generating
        fs::write(&path, "4242-00000000000000ff\n").unwrap();
        drop(guard);

        assert_eq!(fs::read_to_string(&path).unwrap(), "4242-00000000000000ff\n");
        assert!(locks.try_acquire("k").is_none());
    }

    #[test]
    fn stale_lock_single_winner_across_instances() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().to_path_buf();
        let stale = LockFileLocks::new(&dir, Duration::from_secs(30)).lock_path("k");
        fs::write(&stale, "1-dead\n").unwrap();
        backdate(&stale, Duration::from_secs(3600));

        let barrier = Arc::new(Barrier::new(8));
        let hold = Arc::new(Barrier::new(8));
        let winners = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (dir, barrier, hold, winners) =
                    (dir.clone(), barrier.clone(), hold.clone(), winners.clone());
                std::thread::spawn(move || {
                    let locks = LockFileLocks::new(dir, Duration::from_secs(30));
                    barrier.wait();
                    let guard = locks.try_acquire("k");
                    if guard.is_some() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                    hold.wait();
                    drop(guard);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[test]
    fn abandoned_takeover_file_is_cleared() {
        let tmp = TempDir::new().unwrap();
        let locks = LockFileLocks::new(tmp.path(), Duration::from_secs(30));
        let path = locks.lock_path("k");
        fs::write(&path, "1-dead\n").unwrap();
        backdate(&path, Duration::from_secs(3600));
        let takeover = tmp.path().join("k.lock.takeover");
        fs::write(&takeover, "2-dead\n").unwrap();
        backdate(&takeover, Duration::from_secs(3600));

        assert!(locks.try_acquire("k").is_none());
        assert!(!takeover.exists());
        assert!(locks.try_acquire("k").is_some());
    }

    #[test]
    fn unsafe_keys_are_hashed() {
        let locks = LockFileLocks::new("/tmp/locks", Duration::from_secs(1));
        assert_eq!(locks.lock_path("abc_1-2"), Path::new("/tmp/locks/abc_1-2.lock"));
        let hashed = locks.lock_path("../../etc/passwd");
        assert_eq!(hashed.parent(), Some(Path::new("/tmp/locks")));
        assert_eq!(hashed.file_name().unwrap().len(), 64 + ".lock".len());
    }
}
