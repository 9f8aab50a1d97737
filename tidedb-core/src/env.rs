//! Environment: filesystem access and background scheduling
//!
//! Flushes and compactions never run on their own thread inside the engine.
//! They are handed to [`Env::schedule`], so the default environment can run
//! them on a worker thread while tests use [`ManualEnv`] and run them
//! deterministically.

use crate::{Result, TideError};
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::thread;
use tracing::{debug, error};

/// Unit of background work
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Filesystem and scheduling services used by the engine
pub trait Env: Send + Sync {
    /// Run `job` at some later point, off the caller's stack
    fn schedule(&self, job: Job);

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    /// Names of the entries in `dir`
    fn children(&self, dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        fs::remove_dir(path)?;
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to)?;
        Ok(())
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    /// Take an exclusive lock on `path`, creating it if needed
    fn lock_file(&self, path: &Path) -> Result<FileLock> {
        FileLock::lock(path)
    }
}

/// Environment backed by the local filesystem and one background thread
pub struct DefaultEnv {
    sender: Mutex<Option<Sender<Job>>>,
}

impl DefaultEnv {
    pub fn new() -> Self {
        Self {
            sender: Mutex::new(None),
        }
    }

    fn start_worker() -> io::Result<Sender<Job>> {
        let (tx, rx) = unbounded::<Job>();
        thread::Builder::new()
            .name("tidedb-bg".into())
            .spawn(move || {
                for job in rx {
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!("Background job panicked");
                    }
                }
                debug!("Background worker exiting");
            })?;
        Ok(tx)
    }
}

impl Default for DefaultEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Env for DefaultEnv {
    fn schedule(&self, job: Job) {
        let unsent = {
            let mut sender = self.sender.lock();
            if sender.is_none() {
                match Self::start_worker() {
                    Ok(tx) => *sender = Some(tx),
                    Err(e) => error!("Failed to start background worker: {}", e),
                }
            }
            match sender.as_ref() {
                Some(tx) => tx.send(job).err().map(|e| e.into_inner()),
                None => Some(job),
            }
        };

        // No worker: run inline rather than lose the work
        if let Some(job) = unsent {
            job();
        }
    }
}

/// Process-wide default environment
pub fn default_env() -> Arc<dyn Env> {
    static DEFAULT: OnceLock<Arc<DefaultEnv>> = OnceLock::new();
    DEFAULT.get_or_init(|| Arc::new(DefaultEnv::new())).clone()
}

/// Environment that queues background work until the caller runs it
#[derive(Default)]
pub struct ManualEnv {
    pending: Mutex<VecDeque<Job>>,
}

impl ManualEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued jobs
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Run queued jobs, including ones they schedule, until the queue is empty.
    /// Returns how many jobs ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let job = self.pending.lock().pop_front();
            match job {
                Some(job) => {
                    job();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl Env for ManualEnv {
    fn schedule(&self, job: Job) {
        self.pending.lock().push_back(job);
    }
}

/// Exclusive advisory lock on a file, released on drop
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Create (if needed) and lock `path`
    pub fn lock<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        Self::try_lock(&file).map_err(|e| {
            TideError::Io(io::Error::new(
                e.kind(),
                format!("lock {}: already held ({})", path.display(), e),
            ))
        })?;

        // Owner pid, for humans inspecting the directory
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;

        let fd = file.as_raw_fd();
        // SAFETY: `fd` is a valid descriptor owned by `file` for the duration of the call.
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        Ok(())
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FileLock({})", self.path.display())
    }
}
