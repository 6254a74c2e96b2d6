//! The session-open pipeline: resolve, extract, issue, publish.

use std::ffi::{c_char, c_int};
use std::time::Instant;

use tracing::{error, info, warn};

use crate::args;
use crate::config::{ModuleConfig, Policy, resolve, wants_debug};
use crate::context::{SessionSource, extract};
use crate::error::{ContextError, InputError, PublishError, SessionError};
use crate::hooks::PamStatus;
use crate::issue::issue;
use crate::logging;
use crate::provider::Providers;
use crate::publish::{PublishPlan, PublishResult, publish};
use crate::user;

/// Entry for `pam_sm_open_session`: copy the arguments, scope logging and
/// run [`open_session`].
///
/// `source` is `None` when libpam passed a null handle.  `providers` is
/// only called once the call is known to be well formed.
///
/// # Safety
///
/// `argc` and `argv` must satisfy the contract of [`args::marshal`].
pub unsafe fn open_session_call<S>(
    argc: c_int,
    argv: *const *const c_char,
    source: Option<&S>,
    providers: impl FnOnce() -> Providers,
) -> PamStatus
where
    S: SessionSource + ?Sized,
{
    // SAFETY: forwarded from the caller.
    let tokens = match unsafe { args::marshal(argc, argv) } {
        Ok(tokens) => tokens,
        Err(e) => return logging::scoped(false, || refuse(e)),
    };

    logging::scoped(wants_debug(&tokens), || match source {
        Some(source) => open_session(&tokens, source, &providers()),
        None => refuse(InputError::NullHandle),
    })
}

fn refuse(err: InputError) -> PamStatus {
    error!(error = %err, "refusing PAM call");
    SessionError::from(err).status(Policy::Strict)
}

/// Run the pipeline for one `pam_sm_open_session` call.
///
/// Never panics on bad input.  Issuance and publishing share one deadline,
/// `timeout` from the module arguments.
pub fn open_session<S>(tokens: &[String], source: &S, providers: &Providers) -> PamStatus
where
    S: SessionSource + ?Sized,
{
    let config = match resolve(tokens) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "rejecting module configuration");
            return SessionError::from(e).status(Policy::Strict);
        }
    };

    match run(&config, source, providers) {
        Ok(published) => {
            info!(
                destination = config.destination.name(),
                reference = %published.reference,
                "session credential ready"
            );
            PamStatus::Success
        }
        Err(e) => {
            let status = e.status(config.policy);
            if status == PamStatus::Success {
                warn!(error = %e, "continuing without a fresh credential (lenient policy)");
            } else {
                error!(error = %e, status = status.code(), "session open failed");
            }
            status
        }
    }
}

fn run<S>(config: &ModuleConfig, source: &S, providers: &Providers) -> Result<PublishResult, SessionError>
where
    S: SessionSource + ?Sized,
{
    let deadline = Instant::now() + config.timeout;
    let ctx = extract(source)?;
    let account = if PublishPlan::needs_account(config) {
        user::lookup(&ctx.username).map_err(|e| ContextError::Lookup(e.to_string()))?
    } else {
        None
    };
    let mut plan = PublishPlan::new(config, &ctx, account.as_ref())?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| PublishError::Other(anyhow::Error::new(e).context("starting async runtime")))?;
    let result = runtime.block_on(async {
        let credential = {
            let (config, ctx) = (config.clone(), ctx.clone());
            within(deadline, move || issue(&config, &ctx)).await??
        };
        info!(
            user = %ctx.username,
            service = %ctx.service,
            rhost = ctx.remote_host.as_deref().unwrap_or("-"),
            fingerprint = %credential.fingerprint,
            "issued session key"
        );

        plan.timeout = deadline.saturating_duration_since(Instant::now());
        Ok::<_, SessionError>(publish(credential, &plan, providers).await?)
    });
    // An abandoned key generation finishes on its own thread.
    runtime.shutdown_background();
    result
}

/// Run blocking `work` off the runtime thread, giving up at `deadline`.
///
/// Work that misses the deadline is left to finish in the background and its
/// result is dropped.
async fn within<T, F>(deadline: Instant, work: F) -> Result<T, PublishError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let deadline = tokio::time::Instant::from_std(deadline);
    match tokio::time::timeout_at(deadline, tokio::task::spawn_blocking(work)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Ok(Err(e)) => Err(PublishError::Other(anyhow::Error::new(e).context("issuance task"))),
        Err(_) => Err(PublishError::Timeout),
    }
}
