//! Session identity read from the PAM handle.
//!
//! Core code never sees the raw handle.  It depends on [`SessionSource`], a
//! read-only view that the boundary implements over `pam_get_item` and that
//! tests replace with [`StaticSession`].

use std::path::{Path, PathBuf};

use crate::error::ContextError;
use crate::user::UserAccount;

/// Read-only access to the PAM items the pipeline needs.
///
/// Implementations must not modify the handle's item store.  A lookup that
/// fails is reported as `None`.
pub trait SessionSource {
    /// The authenticated user (`PAM_USER`).
    fn user(&self) -> Option<String>;
    /// `PAM_SERVICE`, e.g. `sshd`.
    fn service(&self) -> Option<String>;
    /// `PAM_RHOST`.
    fn remote_host(&self) -> Option<String>;
    /// `PAM_RUSER`.
    fn remote_user(&self) -> Option<String>;
    /// `PAM_TTY`.
    fn tty(&self) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub username: String,
    pub service: String,
    pub remote_host: Option<String>,
    pub remote_user: Option<String>,
    pub tty: Option<String>,
}

/// Build a [`SessionContext`] from `source`.
///
/// Only the user is mandatory; every other item is optional.
pub fn extract<S: SessionSource + ?Sized>(source: &S) -> Result<SessionContext, ContextError> {
    let username = source
        .user()
        .filter(|u| !u.is_empty())
        .ok_or(ContextError::NoAuthenticatedUser)?;
    let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());

    Ok(SessionContext {
        username,
        service: non_empty(source.service()).unwrap_or_else(|| "unknown".to_string()),
        remote_host: non_empty(source.remote_host()),
        remote_user: non_empty(source.remote_user()),
        tty: non_empty(source.tty()),
    })
}

impl SessionContext {
    /// Whether the username can be substituted into a filesystem path.
    fn path_safe_username(&self) -> Result<&str, ContextError> {
        let name = self.username.as_str();
        if name == "." || name == ".." || name.contains(['/', '\0']) {
            return Err(ContextError::UnsafeUsername(name.to_string()));
        }
        Ok(name)
    }

    /// Expand `%u` (username), `%h` (home directory) and `%%` in `template`.
    ///
    /// `%h` requires `account`; without it the expansion fails with
    /// [`ContextError::UnknownUser`].
    pub fn expand(&self, template: &str, account: Option<&UserAccount>) -> Result<PathBuf, ContextError> {
        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('u') => out.push_str(self.path_safe_username()?),
                Some('h') => {
                    let account =
                        account.ok_or_else(|| ContextError::UnknownUser(self.username.clone()))?;
                    out.push_str(&account.home.to_string_lossy());
                }
                Some('%') => out.push('%'),
                Some(other) => {
                    out.push('%');
                    out.push(other);
                }
                None => out.push('%'),
            }
        }
        Ok(PathBuf::from(out))
    }
}

/// Whether `template` needs a resolved account to expand.
pub fn needs_account(template: &str) -> bool {
    template.replace("%%", "").contains("%h")
}

/// A fixed set of PAM items.
#[derive(Debug, Clone, Default)]
pub struct StaticSession {
    pub user: Option<String>,
    pub service: Option<String>,
    pub remote_host: Option<String>,
    pub remote_user: Option<String>,
    pub tty: Option<String>,
}

impl StaticSession {
    pub fn for_user(user: &str) -> Self {
        Self {
            user: Some(user.to_string()),
            service: Some("sshd".to_string()),
            ..Self::default()
        }
    }
}

impl SessionSource for StaticSession {
    fn user(&self) -> Option<String> {
        self.user.clone()
    }

    fn service(&self) -> Option<String> {
        self.service.clone()
    }

    fn remote_host(&self) -> Option<String> {
        self.remote_host.clone()
    }

    fn remote_user(&self) -> Option<String> {
        self.remote_user.clone()
    }

    fn tty(&self) -> Option<String> {
        self.tty.clone()
    }
}

/// Directory part of `path`, or `.` for a bare file name.
pub(crate) fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}
