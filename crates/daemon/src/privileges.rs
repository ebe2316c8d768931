//! Switching to an unprivileged identity once raw sockets and the TUN
//! device are open

use nix::unistd::{setgid, setgroups, setuid, Gid, Uid, User};
use tracing::info;

use crate::{DaemonError, Result};

/// Group to switch to: `gid` when given, otherwise the user's primary group
pub fn resolve_group(uid: u32, gid: Option<u32>) -> Result<u32> {
    if let Some(gid) = gid {
        return Ok(gid);
    }
    let user = User::from_uid(Uid::from_raw(uid))
        .map_err(|e| DaemonError::Privileges(format!("looking up uid {}: {}", uid, e)))?
        .ok_or_else(|| {
            DaemonError::Privileges(format!("no user with uid {}, set a group id", uid))
        })?;
    Ok(user.gid.as_raw())
}

/// Clear supplementary groups, then set the group and user ids
pub fn drop_privileges(uid: u32, gid: Option<u32>) -> Result<()> {
    let gid = resolve_group(uid, gid)?;

    setgroups(&[])
        .map_err(|e| DaemonError::Privileges(format!("clearing groups: {}", e)))?;
    setgid(Gid::from_raw(gid))
        .map_err(|e| DaemonError::Privileges(format!("setgid {}: {}", gid, e)))?;
    setuid(Uid::from_raw(uid))
        .map_err(|e| DaemonError::Privileges(format!("setuid {}: {}", uid, e)))?;

    info!("Dropped privileges to uid {} gid {}", uid, gid);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_group_wins() {
        assert_eq!(resolve_group(12345, Some(42)).unwrap(), 42);
    }

    #[test]
    fn test_root_primary_group() {
        assert_eq!(resolve_group(0, None).unwrap(), 0);
    }

    #[test]
    fn test_unknown_user_needs_group() {
        let err = resolve_group(u32::MAX - 7, None).unwrap_err();
        assert!(matches!(err, DaemonError::Privileges(_)));
    }
}
