//! Privilege drop to the service account.

use thiserror::Error;
use tracing::info;

const IDENTITY_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::identity");

/// Switches the process to an unprivileged identity.
pub trait Identity: Send + Sync {
    /// Drops to the named user, group first. Idempotent when the process
    /// already runs as that user.
    fn drop_privileges(&self, user: &str) -> Result<(), IdentityError>;
}

/// Identity backed by the operating system's account database.
#[derive(Debug, Clone, Default)]
pub struct ServiceIdentity;

impl Identity for ServiceIdentity {
    #[cfg(unix)]
    fn drop_privileges(&self, user: &str) -> Result<(), IdentityError> {
        use nix::unistd::{geteuid, setgid, setuid, User};

        let account = User::from_name(user)
            .map_err(|errno| IdentityError::Lookup {
                user: user.to_owned(),
                errno,
            })?
            .ok_or_else(|| IdentityError::UnknownUser {
                user: user.to_owned(),
            })?;

        if geteuid() == account.uid {
            return Ok(());
        }

        // Group first: once the uid changes the process may no longer be
        // allowed to change its gid.
        setgid(account.gid).map_err(|errno| IdentityError::SetGroup {
            user: user.to_owned(),
            errno,
        })?;
        setuid(account.uid).map_err(|errno| IdentityError::SetUser {
            user: user.to_owned(),
            errno,
        })?;
        info!(target: IDENTITY_TARGET, user, "dropped privileges");
        Ok(())
    }

    #[cfg(not(unix))]
    fn drop_privileges(&self, user: &str) -> Result<(), IdentityError> {
        Err(IdentityError::UnknownUser {
            user: user.to_owned(),
        })
    }
}

/// Errors raised while dropping privileges.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Querying the account database failed.
    #[error("failed to look up user '{user}': {errno}")]
    Lookup {
        user: String,
        errno: nix::errno::Errno,
    },
    /// The service account does not exist.
    #[error("service user '{user}' does not exist")]
    UnknownUser { user: String },
    /// Changing the group id failed.
    #[error("failed to switch to the group of user '{user}': {errno}")]
    SetGroup {
        user: String,
        errno: nix::errno::Errno,
    },
    /// Changing the user id failed.
    #[error("failed to switch to user '{user}': {errno}")]
    SetUser {
        user: String,
        errno: nix::errno::Errno,
    },
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn unknown_user_is_reported() {
        let identity = ServiceIdentity;
        let error = identity
            .drop_privileges("no-such-foreman-user")
            .expect_err("lookup must fail");
        assert!(matches!(error, IdentityError::UnknownUser { .. }));
    }
}
