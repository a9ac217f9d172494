//! File-system helpers shared by sidecars, journals and data files

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Whether an I/O error is worth retrying
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    )
}

/// Run an idempotent byte-level operation, retrying transient failures.
///
/// `attempts` counts the first try; zero is treated as one.
pub fn with_retry<T, F>(attempts: u32, mut op: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    let attempts = attempts.max(1);
    let mut tries = 0;
    loop {
        tries += 1;
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if tries < attempts && is_transient(&e) => {
                debug!("transient I/O failure (attempt {}/{}): {}", tries, attempts, e);
                thread::sleep(Duration::from_millis(2u64 << tries.min(6)));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Path used while a file is being written
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Write `bytes` to `path` atomically: temp file, fsync, rename, fsync dir
pub fn atomic_write(path: &Path, bytes: &[u8], attempts: u32) -> io::Result<()> {
    let tmp = temp_path(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        with_retry(attempts, || file.sync_all())?;
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

/// fsync a directory so renames and unlinks inside it are durable
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let dir = OpenOptions::new().read(true).open(dir)?;
        dir.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// Remove a file, treating "not found" as success
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
