//! Copy the PAM argument vector into owned strings.
//!
//! libpam hands modules `const char **argv`.  Some callers back it with
//! read-only memory, so it is only ever read, and nothing borrowed from it
//! outlives the call.

use std::ffi::{CStr, c_char, c_int};

use crate::error::InputError;

/// Copy `argc` C strings out of `argv`.
///
/// # Safety
///
/// When `argc > 0`, `argv` must point to at least `argc` pointers, each null
/// or pointing to a NUL-terminated string, all valid for the duration of the
/// call.
pub unsafe fn marshal(argc: c_int, argv: *const *const c_char) -> Result<Vec<String>, InputError> {
    let count = usize::try_from(argc)
        .map_err(|_| InputError::InvalidArguments(format!("negative argument count {argc}")))?;
    if count == 0 {
        return Ok(Vec::new());
    }
    if argv.is_null() {
        return Err(InputError::InvalidArguments(format!(
            "null argument vector with count {count}"
        )));
    }

    let mut tokens = Vec::with_capacity(count);
    for i in 0..count {
        // SAFETY: the caller guarantees `argv` holds `argc` entries.
        let ptr = unsafe { *argv.add(i) };
        if ptr.is_null() {
            return Err(InputError::InvalidArguments(format!("argument {i} is null")));
        }
        // SAFETY: non-null entries are NUL-terminated strings.
        let arg = unsafe { CStr::from_ptr(ptr) };
        let arg = arg
            .to_str()
            .map_err(|_| InputError::InvalidArguments(format!("argument {i} is not UTF-8")))?;
        tokens.push(arg.to_owned());
    }
    Ok(tokens)
}
