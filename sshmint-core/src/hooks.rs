//! The six PAM service-module entry points as a single dispatch surface.
//!
//! A module type implements [`SessionHooks`] and overrides only the hooks it
//! handles; every other hook keeps its constant-success default.  The
//! [`pam_hooks!`](crate::pam_hooks) macro then emits the `pam_sm_*` symbols
//! that libpam resolves when it loads the shared object.
//!
//! ```rust,ignore
//! struct Module;
//!
//! impl SessionHooks for Module {
//!     type Handle = PamHandle;
//!
//!     fn open_session(call: RawInvocation<'_, PamHandle>) -> PamStatus {
//!         // ...
//!     }
//! }
//!
//! sshmint_core::pam_hooks!(Module);
//! ```

use std::ffi::{c_char, c_int};
use std::marker::PhantomData;

/// Status codes returned across the C ABI.  Values match Linux-PAM's
/// `_pam_types.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PamStatus {
    Success = 0,
    ServiceErr = 3,
    SystemErr = 4,
    UserUnknown = 10,
    SessionErr = 14,
}

impl PamStatus {
    pub fn code(self) -> c_int {
        self as c_int
    }
}

/// Everything a single `pam_sm_*` call receives.
///
/// Borrowed for the duration of the call only; the pointers belong to the
/// PAM runtime and must not be stored.
#[derive(Debug)]
pub struct RawInvocation<'a, H> {
    pub handle: *const H,
    pub flags: c_int,
    pub argc: c_int,
    pub argv: *const *const c_char,
    _call: PhantomData<&'a H>,
}

impl<'a, H> RawInvocation<'a, H> {
    pub fn new(handle: *const H, flags: c_int, argc: c_int, argv: *const *const c_char) -> Self {
        Self {
            handle,
            flags,
            argc,
            argv,
            _call: PhantomData,
        }
    }

    /// Borrow the opaque handle, if the runtime passed one.
    ///
    /// # Safety
    ///
    /// `handle` must be null or point to a live PAM handle for `'a`.
    pub unsafe fn handle(&self) -> Option<&'a H> {
        // SAFETY: upheld by the caller.
        unsafe { self.handle.as_ref() }
    }
}

/// Hooks invoked by the generated `pam_sm_*` entry points.
///
/// Only [`open_session`](Self::open_session) is meant to be overridden.
/// The remaining hooks report success unconditionally: this module never
/// authenticates, validates accounts or changes tokens, and turning any of
/// them into a gate changes the module's trust model.
#[allow(unused_variables)]
pub trait SessionHooks {
    type Handle;

    fn open_session(call: RawInvocation<'_, Self::Handle>) -> PamStatus {
        PamStatus::Success
    }

    /// Issued credentials are not revoked here; they carry their own expiry.
    fn close_session(call: RawInvocation<'_, Self::Handle>) -> PamStatus {
        PamStatus::Success
    }

    fn setcred(call: RawInvocation<'_, Self::Handle>) -> PamStatus {
        PamStatus::Success
    }

    fn acct_mgmt(call: RawInvocation<'_, Self::Handle>) -> PamStatus {
        PamStatus::Success
    }

    fn authenticate(call: RawInvocation<'_, Self::Handle>) -> PamStatus {
        PamStatus::Success
    }

    fn chauthtok(call: RawInvocation<'_, Self::Handle>) -> PamStatus {
        PamStatus::Success
    }
}

/// Run a hook, converting a panic into `PAM_SYSTEM_ERR`.
///
/// Unwinding out of an `extern "C"` function aborts the host process, which
/// for `sshd` means every login on the box.
pub fn guard(hook: impl FnOnce() -> PamStatus) -> c_int {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(hook))
        .unwrap_or(PamStatus::SystemErr)
        .code()
}

/// Emit the six `pam_sm_*` symbols for a type implementing
/// [`SessionHooks`].
#[macro_export]
macro_rules! pam_hooks {
    ($module:ident) => {
        mod pam_hooks_scope {
            use std::ffi::{c_char, c_int};

            use $crate::hooks::{RawInvocation, SessionHooks, guard};

            type Handle = <super::$module as SessionHooks>::Handle;

            #[unsafe(no_mangle)]
            pub extern "C" fn pam_sm_open_session(
                pamh: *const Handle,
                flags: c_int,
                argc: c_int,
                argv: *const *const c_char,
            ) -> c_int {
                guard(|| <super::$module>::open_session(RawInvocation::new(pamh, flags, argc, argv)))
            }

            #[unsafe(no_mangle)]
            pub extern "C" fn pam_sm_close_session(
                pamh: *const Handle,
                flags: c_int,
                argc: c_int,
                argv: *const *const c_char,
            ) -> c_int {
                guard(|| <super::$module>::close_session(RawInvocation::new(pamh, flags, argc, argv)))
            }

            #[unsafe(no_mangle)]
            pub extern "C" fn pam_sm_setcred(
                pamh: *const Handle,
                flags: c_int,
                argc: c_int,
                argv: *const *const c_char,
            ) -> c_int {
                guard(|| <super::$module>::setcred(RawInvocation::new(pamh, flags, argc, argv)))
            }

            #[unsafe(no_mangle)]
            pub extern "C" fn pam_sm_acct_mgmt(
                pamh: *const Handle,
                flags: c_int,
                argc: c_int,
                argv: *const *const c_char,
            ) -> c_int {
                guard(|| <super::$module>::acct_mgmt(RawInvocation::new(pamh, flags, argc, argv)))
            }

            #[unsafe(no_mangle)]
            pub extern "C" fn pam_sm_authenticate(
                pamh: *const Handle,
                flags: c_int,
                argc: c_int,
                argv: *const *const c_char,
            ) -> c_int {
                guard(|| <super::$module>::authenticate(RawInvocation::new(pamh, flags, argc, argv)))
            }

            #[unsafe(no_mangle)]
            pub extern "C" fn pam_sm_chauthtok(
                pamh: *const Handle,
                flags: c_int,
                argc: c_int,
                argv: *const *const c_char,
            ) -> c_int {
                guard(|| <super::$module>::chauthtok(RawInvocation::new(pamh, flags, argc, argv)))
            }
        }
    };
}
