//! `authorized_keys` and identity file writing.
//!
//! Writers for the same file serialise on an advisory `flock` held on a
//! sibling `<name>.lock`.  Every write goes to a temporary file in the same
//! directory and is renamed over the target, so a reader never observes a
//! partial file.
//!
//! When files are written on behalf of another account (running as root),
//! the directory chain is checked first: a path the user controls must not
//! redirect root's writes through a symlink.

use std::ffi::OsString;
use std::fs::{self, DirBuilder, File, Metadata, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use ssh_key::PublicKey;
use ssh_key::authorized_keys::Entry;
use tracing::debug;

use crate::context::parent_dir;
use crate::error::PublishError;
use crate::user::UserAccount;

use super::PublishOutcome;

const LOCK_RETRY: Duration = Duration::from_millis(10);

/// Exclusive lock on `<path>.lock`, released when dropped.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
}

impl FileLock {
    /// Acquire the lock, polling until `deadline`.
    pub fn acquire(path: &Path, deadline: Instant) -> Result<Self, PublishError> {
        let lock_path = sibling(path, ".lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .custom_flags(libc::O_NOFOLLOW)
            .open(&lock_path)
            .map_err(|e| PublishError::io(&lock_path, e))?;

        loop {
            // SAFETY: the descriptor is owned by `file` and open.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc == 0 {
                return Ok(Self { _file: file });
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EWOULDBLOCK) => {}
                Some(libc::EINTR) => continue,
                _ => return Err(PublishError::io(&lock_path, err)),
            }
            if Instant::now() >= deadline {
                debug!(path = %lock_path.display(), "lock wait expired");
                return Err(PublishError::Timeout);
            }
            thread::sleep(LOCK_RETRY);
        }
    }
}

/// `path` with `suffix` appended to its file name.
pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Merge `line` into the `authorized_keys` file at `path`.
///
/// With `replace`, earlier lines carrying that comment are dropped.  If the
/// file already holds `key` the file is left untouched.  Lines that do not
/// parse as keys (comments, blanks, unsupported options) are kept verbatim.
pub fn install_authorized_key(
    path: &Path,
    line: &str,
    key: &PublicKey,
    replace: Option<&str>,
    owner: Option<&UserAccount>,
    deadline: Instant,
) -> Result<PublishOutcome, PublishError> {
    ensure_dir(parent_dir(path), owner)?;
    let _lock = FileLock::acquire(path, deadline)?;
    let existing = read_existing(path)?;

    let mut kept = Vec::new();
    let mut replaced = 0usize;
    for existing_line in existing.lines() {
        if let Ok(entry) = Entry::from_str(existing_line) {
            let existing_key = entry.public_key();
            if existing_key.key_data() == key.key_data() {
                return Ok(PublishOutcome::AlreadyRegistered);
            }
            if replace.is_some_and(|c| !c.is_empty() && existing_key.comment() == c) {
                replaced += 1;
                continue;
            }
        }
        kept.push(existing_line);
    }
    kept.push(line);

    let mut contents = kept.join("\n");
    contents.push('\n');
    write_atomic(path, contents.as_bytes(), owner)?;

    debug!(path = %path.display(), replaced, "authorized_keys updated");
    Ok(PublishOutcome::Published)
}

/// Current contents of `path`, empty if missing.  A symlink is refused.
fn read_existing(path: &Path) -> Result<String, PublishError> {
    let opened = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path);
    let mut file = match opened {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(PublishError::io(path, e)),
    };
    let mut text = String::new();
    file.read_to_string(&mut text)
        .map_err(|e| PublishError::io(path, e))?;
    Ok(text)
}

/// Create `dir` and any missing parents with mode 0700.
///
/// With an `owner`, every directory this call creates is handed to them and
/// the existing part of the chain is checked: each component must belong to
/// root or the owner, and nothing at or below the first component the owner
/// controls may be a symlink.
pub fn ensure_dir(dir: &Path, owner: Option<&UserAccount>) -> Result<(), PublishError> {
    let mut current = PathBuf::new();
    let mut user_controlled = false;
    for component in dir.components() {
        current.push(component);
        let meta = match fs::symlink_metadata(&current) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => match create_dir(&current, owner) {
                Ok(()) => {
                    user_controlled |= owner.is_some_and(|o| o.uid != 0);
                    continue;
                }
                // Lost a race with a concurrent login; inspect what won.
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    fs::symlink_metadata(&current).map_err(|e| PublishError::io(&current, e))?
                }
                Err(e) => return Err(PublishError::io(&current, e)),
            },
            Err(e) => return Err(PublishError::io(&current, e)),
        };
        if let Some(owner) = owner {
            user_controlled = check_component(&current, &meta, owner, user_controlled)?;
        }
        let is_dir = meta.is_dir() || fs::metadata(&current).is_ok_and(|m| m.is_dir());
        if !is_dir {
            return Err(PublishError::io(
                &current,
                io::Error::new(io::ErrorKind::NotADirectory, "not a directory"),
            ));
        }
    }
    Ok(())
}

fn create_dir(dir: &Path, owner: Option<&UserAccount>) -> io::Result<()> {
    DirBuilder::new().mode(0o700).create(dir)?;
    if let Some(owner) = owner {
        std::os::unix::fs::chown(dir, Some(owner.uid), Some(owner.gid))?;
    }
    Ok(())
}

/// Returns whether the chain is under the owner's control from here on.
fn check_component(
    path: &Path,
    meta: &Metadata,
    owner: &UserAccount,
    user_controlled: bool,
) -> Result<bool, PublishError> {
    let by_owner = owner.uid != 0 && meta.uid() == owner.uid;
    if meta.uid() != 0 && !by_owner {
        return Err(PublishError::UnsafePath {
            path: path.display().to_string(),
            reason: "owned by another account",
        });
    }
    if meta.file_type().is_symlink() && (user_controlled || by_owner) {
        return Err(PublishError::UnsafePath {
            path: path.display().to_string(),
            reason: "symlink under the user's control",
        });
    }
    Ok(user_controlled || by_owner)
}

/// A fully written temporary file waiting to be renamed over its target.
///
/// Dropping it without [`commit`](Self::commit) removes the temporary, so
/// nothing staged becomes visible unless every later step succeeds.
#[derive(Debug)]
pub struct Staged {
    tmp: PathBuf,
    path: PathBuf,
    committed: bool,
}

impl Staged {
    /// Write `data` next to `path`, mode 0600, synced to disk.
    pub fn new(path: &Path, data: &[u8], owner: Option<&UserAccount>) -> Result<Self, PublishError> {
        let name = path
            .file_name()
            .ok_or_else(|| {
                PublishError::io(path, io::Error::new(io::ErrorKind::InvalidInput, "no file name"))
            })?
            .to_string_lossy();
        let tmp = parent_dir(path).join(format!(".{name}.{:016x}.tmp", rand::random::<u64>()));

        let mut f = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&tmp)
            .map_err(|e| PublishError::io(path, e))?;
        let staged = Self {
            tmp,
            path: path.to_path_buf(),
            committed: false,
        };
        write_private(&mut f, data, owner).map_err(|e| PublishError::io(path, e))?;
        Ok(staged)
    }

    /// Rename the temporary over the target.
    pub fn commit(mut self) -> Result<(), PublishError> {
        fs::rename(&self.tmp, &self.path).map_err(|e| PublishError::io(&self.path, e))?;
        self.committed = true;

        // Persist the rename itself.
        if let Ok(d) = File::open(parent_dir(&self.path)) {
            let _ = d.sync_all();
        }
        Ok(())
    }
}

impl Drop for Staged {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.tmp);
        }
    }
}

fn write_private(f: &mut File, data: &[u8], owner: Option<&UserAccount>) -> io::Result<()> {
    f.write_all(data)?;
    if let Some(owner) = owner {
        std::os::unix::fs::fchown(&*f, Some(owner.uid), Some(owner.gid))?;
    }
    f.sync_all()
}

/// Replace `path` with `data`, atomically, mode 0600.
pub fn write_atomic(path: &Path, data: &[u8], owner: Option<&UserAccount>) -> Result<(), PublishError> {
    Staged::new(path, data, owner)?.commit()
}
