//! `pam_sshmint.so`: a PAM session module that mints a fresh SSH credential
//! whenever a session opens.
//!
//! ```text
//! session  optional  pam_sshmint.so  dest=file path=%h/.ssh/authorized_keys lifetime=12h
//! session  optional  pam_sshmint.so  dest=agent socket=/run/sshmint/%u.sock lifetime=8h
//! session  required  pam_sshmint.so  dest=ca url=https://ca.internal/sign cert=%h/.ssh/id_ed25519-cert.pub identity=%h/.ssh/id_ed25519
//! ```
//!
//! Only `pam_sm_open_session` does any work.  Every other entry point
//! returns `PAM_SUCCESS`.

mod handle;

use std::sync::Arc;

use sshmint_agent::SocketAgent;
use sshmint_ca::HttpAuthority;
use sshmint_core::{PamStatus, Providers, RawInvocation, SessionHooks, pipeline};
use tracing::warn;

use crate::handle::{PamHandle, PamSession};

pub struct SshMint;

impl SessionHooks for SshMint {
    type Handle = PamHandle;

    fn open_session(call: RawInvocation<'_, PamHandle>) -> PamStatus {
        // SAFETY: the handle comes straight from libpam and outlives this
        // call.
        let session = unsafe { call.handle() }.map(PamSession::new);
        // SAFETY: libpam passes `argc` valid entries in `argv` for the
        // duration of the call.
        unsafe { pipeline::open_session_call(call.argc, call.argv, session.as_ref(), providers) }
    }
}

fn providers() -> Providers {
    let providers = Providers::default().with_agent(Arc::new(SocketAgent::new()));
    match HttpAuthority::new() {
        Ok(authority) => providers.with_authority(Arc::new(authority)),
        Err(e) => {
            warn!(error = %e, "certificate authority client unavailable");
            providers
        }
    }
}

sshmint_core::pam_hooks!(SshMint);
