//! Linux-specific shared memory operations

use crate::error::{ShmError, ShmResult};
use memmap2::{MmapMut, MmapOptions};
use nix::unistd::{getpid, getppid};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Create a fresh backing file of `size` bytes and reserve its pages.
///
/// Fails with `AlreadyExists` if the name is taken and `ResourceExhausted`
/// if the file system cannot hold `size` bytes.
pub fn create_region_file(path: &Path, size: usize) -> ShmResult<File> {
    let file = OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .mode(0o600) // Owner read/write only
        .open(path)
        .map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => ShmError::AlreadyExists {
                name: path.display().to_string(),
            },
            _ => ShmError::Io { source: e },
        })?;

    if let Err(err) = reserve(&file, size) {
        let _ = std::fs::remove_file(path);
        return Err(err);
    }
    Ok(file)
}

// Pages left sparse by set_len fault with SIGBUS on first touch under tmpfs.
fn reserve(file: &File, size: usize) -> ShmResult<()> {
    file.set_len(size as u64)?;
    let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, size as libc::off_t) };
    match rc {
        0 => Ok(()),
        libc::ENOSPC | libc::ENOMEM | libc::EFBIG => Err(ShmError::ResourceExhausted {
            requested: size,
            reason: std::io::Error::from_raw_os_error(rc).to_string(),
        }),
        // Some file systems lack fallocate support; set_len already sized the file
        libc::EOPNOTSUPP | libc::EINVAL => Ok(()),
        _ => Err(ShmError::Io {
            source: std::io::Error::from_raw_os_error(rc),
        }),
    }
}

/// Open an existing backing file.
pub fn open_region_file(path: &Path) -> ShmResult<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => ShmError::NotFound {
                name: path.display().to_string(),
            },
            _ => ShmError::Io { source: e },
        })
}

/// Map the whole backing file shared and writable.
pub fn map_region(file: &File) -> ShmResult<MmapMut> {
    let mmap = unsafe { MmapOptions::new().map_mut(file)? };
    Ok(mmap)
}

/// Check if process is alive using kill(pid, 0)
///
/// Zombies still accept the null signal, so `/proc/<pid>/stat` is consulted
/// to treat an exited but unreaped process as dead.
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 {
        return false;
    }
    let alive = match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::Error::ESRCH) => false, // No such process
        Err(nix::Error::EPERM) => true,  // Process exists but no permission to signal
        Err(_) => false,
    };
    alive && !is_zombie(pid)
}

fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // The command name may contain spaces and parentheses; the state follows the last ')'
    stat.rfind(')')
        .and_then(|idx| stat[idx + 1..].split_whitespace().next())
        .is_some_and(|state| state == "Z" || state == "X")
}

/// Get current process ID
pub fn get_current_pid() -> u32 {
    getpid().as_raw() as u32
}

/// Get parent process ID
pub fn get_parent_pid() -> u32 {
    getppid().as_raw() as u32
}
