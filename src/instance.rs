/// Single-instance enforcement.
///
/// The guard is an exclusive advisory lock on `<lock_dir>/<name>.lock`. The
/// lock is held by the kernel on behalf of the open file, so it is released
/// when the holder exits for any reason, including a crash. The file itself
/// is left in place; deleting it would let a third process lock a fresh inode
/// while a second still waits on the old one.
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Proof that this process is the only running instance.
#[derive(Debug)]
pub struct InstanceToken {
    file: File,
    path: PathBuf,
}

/// Errors returned by [`acquire`].
#[derive(Debug)]
pub enum InstanceError {
    /// Another live process holds the lock. Expected contention, not a failure.
    AlreadyRunning {
        name: String,
        holder_pid: Option<u32>,
    },
    InvalidName { name: String },
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for InstanceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceError::AlreadyRunning { name, holder_pid } => match holder_pid {
                Some(pid) => write!(f, "another instance of {name} is already running (pid {pid})"),
                None => write!(f, "another instance of {name} is already running"),
            },
            InstanceError::InvalidName { name } => {
                write!(f, "{name:?} is not a valid instance name")
            }
            InstanceError::Io { path, source } => {
                write!(f, "instance lock {} failed: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for InstanceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InstanceError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Path of the lock file for `name` inside `lock_dir`.
pub fn lock_path(name: &str, lock_dir: &Path) -> PathBuf {
    lock_dir.join(format!("{name}.lock"))
}

/// Try to become the single running instance named `name`.
///
/// Never blocks: a held lock returns [`InstanceError::AlreadyRunning`]
/// immediately. On that path the opened file is dropped before returning,
/// so no partial resource outlives the call.
pub fn acquire(name: &str, lock_dir: &Path) -> Result<InstanceToken, InstanceError> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(InstanceError::InvalidName {
            name: name.to_string(),
        });
    }

    let path = lock_path(name, lock_dir);
    let io_err = |source| InstanceError::Io {
        path: path.clone(),
        source,
    };

    std::fs::create_dir_all(lock_dir).map_err(io_err)?;

    // No truncate: the current holder's pid must survive a failed attempt
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(io_err)?;

    if let Err(e) = FileExt::try_lock_exclusive(&file) {
        if e.kind() == fs2::lock_contended_error().kind() {
            let holder_pid = read_pid(&mut file);
            return Err(InstanceError::AlreadyRunning {
                name: name.to_string(),
                holder_pid,
            });
        }
        return Err(io_err(e));
    }

    write_pid(&mut file).map_err(io_err)?;
    tracing::debug!(path = %path.display(), "instance lock acquired");

    Ok(InstanceToken { file, path })
}

impl InstanceToken {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Give up the lock. Dropping the token has the same effect.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for InstanceToken {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to unlock instance lock");
        } else {
            tracing::debug!(path = %self.path.display(), "instance lock released");
        }
    }
}

fn write_pid(file: &mut File) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", std::process::id())?;
    file.flush()
}

fn read_pid(file: &mut File) -> Option<u32> {
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}
