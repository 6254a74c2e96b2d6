//! Read-only access to the libpam handle.

use std::ffi::{CStr, c_char, c_int, c_void};
use std::marker::{PhantomData, PhantomPinned};
use std::ptr;

use sshmint_core::SessionSource;
use tracing::debug;

const PAM_SUCCESS: c_int = 0;

const PAM_SERVICE: c_int = 1;
const PAM_USER: c_int = 2;
const PAM_TTY: c_int = 3;
const PAM_RHOST: c_int = 4;
const PAM_RUSER: c_int = 8;

/// Opaque `pam_handle_t`.
#[repr(C)]
pub struct PamHandle {
    _data: [u8; 0],
    _marker: PhantomData<(*mut u8, PhantomPinned)>,
}

unsafe extern "C" {
    fn pam_get_item(pamh: *const PamHandle, item_type: c_int, item: *mut *const c_void) -> c_int;
}

/// [`SessionSource`] over a live handle.
///
/// Uses `pam_get_item` only, so it never prompts and never changes the
/// handle's items.
pub struct PamSession<'a> {
    handle: &'a PamHandle,
}

impl<'a> PamSession<'a> {
    pub fn new(handle: &'a PamHandle) -> Self {
        Self { handle }
    }

    fn item(&self, item_type: c_int) -> Option<String> {
        let mut value: *const c_void = ptr::null();
        // SAFETY: the handle is live for 'a and `value` is a valid out
        // pointer.
        let rc = unsafe { pam_get_item(self.handle, item_type, &mut value) };
        if rc != PAM_SUCCESS || value.is_null() {
            return None;
        }
        // SAFETY: string items are NUL-terminated and owned by libpam for
        // at least the duration of this call.
        let value = unsafe { CStr::from_ptr(value.cast::<c_char>()) };
        match value.to_str() {
            Ok(s) => Some(s.to_owned()),
            Err(_) => {
                debug!(item_type, "ignoring non-UTF-8 PAM item");
                None
            }
        }
    }
}

impl SessionSource for PamSession<'_> {
    fn user(&self) -> Option<String> {
        self.item(PAM_USER)
    }

    fn service(&self) -> Option<String> {
        self.item(PAM_SERVICE)
    }

    fn remote_host(&self) -> Option<String> {
        self.item(PAM_RHOST)
    }

    fn remote_user(&self) -> Option<String> {
        self.item(PAM_RUSER)
    }

    fn tty(&self) -> Option<String> {
        self.item(PAM_TTY)
    }
}
