//! Durable sync primitives
//!
//! Maps "make this reach persistent storage" to the strongest guarantee each
//! platform offers, for files, for directory entries (creates, renames) and
//! for whole-directory removal.

use std::fs::File;
use std::io;
use std::path::Path;

/// Ensures file data is durably written to persistent storage before returning.
///
/// - Linux: fdatasync()
/// - macOS/iOS: fcntl(F_FULLFSYNC); plain fsync only reaches the drive's volatile cache
/// - Windows: FlushFileBuffers()
/// - Other: File::sync_data()
///
/// May block for a long time under heavy I/O. Do not call while holding a
/// lock that readers need.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd comes from a live File reference.
        let result = unsafe { libc::fdatasync(file.as_raw_fd()) };
        if result == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd comes from a live File reference.
        let result = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) };
        if result == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        // SAFETY: the handle comes from a live File reference.
        let result = unsafe { FlushFileBuffers(file.as_raw_handle() as *mut _) };
        if result != 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "windows")))]
    {
        file.sync_data()
    }
}

/// Persist directory entries (file creation, rename, unlink) of `dir`.
///
/// Windows cannot open directories as files; NTFS journals metadata, so
/// this is a no-op there.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir)?;
        durable_sync(&handle)
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}

/// Remove `dir` and everything below it, then persist the removal in the
/// parent directory. A missing directory counts as removed.
pub fn remove_dir_durable(dir: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    }
    match dir.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => sync_dir(parent),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_durable_sync_success() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"test data for durable sync").unwrap();

        let result = durable_sync(file.as_file());
        assert!(result.is_ok(), "durable_sync failed: {:?}", result.err());
    }

    #[test]
    fn test_sync_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        assert!(sync_dir(dir.path()).is_ok());
    }

    #[test]
    fn test_remove_dir_durable() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = dir.path().join("store");
        std::fs::create_dir_all(store.join("wal")).unwrap();
        std::fs::write(store.join("wal").join("wal-0"), b"data").unwrap();

        remove_dir_durable(&store).unwrap();
        assert!(!store.exists());

        // Second removal is a no-op
        remove_dir_durable(&store).unwrap();
    }
}
