//! The permission predicate applied once per component during traversal.

use crate::error::{Result, VfsError};
use crate::stat::Stat;

/// Access bits a caller can request, matching the low rwx octal digits.
pub const PERM_READ: u32 = 0o4;
pub const PERM_WRITE: u32 = 0o2;
pub const PERM_EXEC: u32 = 0o1;

/// Checks the requested access against the cached permissions. The class is
/// selected by ownership (user, group, other); uid 0 passes unconditionally.
pub fn check_perms(stat: &Stat, requested: u32, uid: u32, gid: u32) -> Result<()> {
    if uid == 0 {
        return Ok(());
    }

    let shift = if stat.uid == uid {
        6
    } else if stat.gid == gid {
        3
    } else {
        0
    };

    let granted = (stat.mode >> shift) & 0o7;
    let requested = requested & 0o7;

    if granted & requested == requested {
        Ok(())
    } else {
        Err(VfsError::PermissionDenied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stat::S_IFREG;

    fn stat(mode: u32, uid: u32, gid: u32) -> Stat {
        Stat {
            mode: S_IFREG | mode,
            uid,
            gid,
            ..Default::default()
        }
    }

    #[test]
    fn root_bypasses_all_checks() {
        assert!(check_perms(&stat(0o000, 10, 10), PERM_READ | PERM_WRITE, 0, 0).is_ok());
    }

    #[test]
    fn owner_class_is_used_for_the_owner() {
        let st = stat(0o640, 10, 20);
        assert!(check_perms(&st, PERM_READ | PERM_WRITE, 10, 99).is_ok());
        assert_eq!(
            check_perms(&st, PERM_EXEC, 10, 99),
            Err(VfsError::PermissionDenied)
        );
    }

    #[test]
    fn group_and_other_classes() {
        let st = stat(0o640, 10, 20);
        assert!(check_perms(&st, PERM_READ, 11, 20).is_ok());
        assert_eq!(
            check_perms(&st, PERM_WRITE, 11, 20),
            Err(VfsError::PermissionDenied)
        );
        assert_eq!(
            check_perms(&st, PERM_READ, 11, 21),
            Err(VfsError::PermissionDenied)
        );
    }
}
