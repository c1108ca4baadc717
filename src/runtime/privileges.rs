//! OS user and group switching for child processes.

use nix::unistd::{getegid, geteuid, setgid, setuid, Group, User};

use crate::{AppError, Result};

/// Switch to the given group, then to the given user.
///
/// Group first: once the user is dropped the process may no longer be
/// allowed to change its group. A target equal to the current identity
/// is a no-op.
///
/// # Errors
///
/// Returns `AppError::Privilege` when a name cannot be resolved or the
/// switch is refused by the OS.
pub fn switch_identity(user: Option<&str>, group: Option<&str>) -> Result<()> {
    if let Some(name) = group {
        let target = Group::from_name(name)
            .map_err(|err| AppError::Privilege(format!("group lookup '{name}': {err}")))?
            .ok_or_else(|| AppError::Privilege(format!("unknown group '{name}'")))?;
        if target.gid != getegid() {
            setgid(target.gid)
                .map_err(|err| AppError::Privilege(format!("cannot switch to group '{name}': {err}")))?;
        }
    }

    if let Some(name) = user {
        let target = User::from_name(name)
            .map_err(|err| AppError::Privilege(format!("user lookup '{name}': {err}")))?
            .ok_or_else(|| AppError::Privilege(format!("unknown user '{name}'")))?;
        if target.uid != geteuid() {
            setuid(target.uid)
                .map_err(|err| AppError::Privilege(format!("cannot switch to user '{name}': {err}")))?;
        }
    }

    Ok(())
}

/// Name of the effective user, or the numeric uid when it has no entry.
#[must_use]
pub fn current_user_name() -> String {
    let uid = geteuid();
    User::from_uid(uid)
        .ok()
        .flatten()
        .map_or_else(|| uid.to_string(), |user| user.name)
}
