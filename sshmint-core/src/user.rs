//! System user database lookup (`getpwnam_r`).

use std::ffi::{CStr, CString, OsStr, c_char};
use std::io;
use std::os::unix::ffi::OsStrExt as _;
use std::path::PathBuf;

/// Upper bound for the `getpwnam_r` scratch buffer.
const MAX_BUFFER: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAccount {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

/// Look up `name` in the passwd database.
///
/// Returns `Ok(None)` when the user does not exist.  Uses the re-entrant
/// variant so concurrent logins in one process do not share libc's static
/// buffer.
pub fn lookup(name: &str) -> io::Result<Option<UserAccount>> {
    let c_name = CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "username contains NUL"))?;

    let mut buf: Vec<c_char> = vec![0; 1024];
    // SAFETY: passwd is plain old data; getpwnam_r fills it in.
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    loop {
        // SAFETY: every pointer is valid for the duration of the call and
        // `buf.len()` is the true buffer length.
        let rc = unsafe {
            libc::getpwnam_r(
                c_name.as_ptr(),
                &mut pwd,
                buf.as_mut_ptr(),
                buf.len(),
                &mut result,
            )
        };
        match rc {
            0 => break,
            libc::ERANGE if buf.len() < MAX_BUFFER => buf.resize(buf.len() * 2, 0),
            // Some libcs report "not found" through errno-style codes.
            libc::ENOENT | libc::ESRCH | libc::EBADF | libc::EPERM => return Ok(None),
            _ => return Err(io::Error::from_raw_os_error(rc)),
        }
    }

    if result.is_null() {
        return Ok(None);
    }

    // SAFETY: on success pw_dir points into `buf`, which is still alive.
    let home = unsafe { CStr::from_ptr(pwd.pw_dir) };
    Ok(Some(UserAccount {
        name: name.to_string(),
        uid: pwd.pw_uid,
        gid: pwd.pw_gid,
        home: PathBuf::from(OsStr::from_bytes(home.to_bytes())),
    }))
}

/// Effective uid of this process.
pub fn effective_uid() -> u32 {
    // SAFETY: geteuid cannot fail.
    unsafe { libc::geteuid() }
}
