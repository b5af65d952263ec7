//! Mount options accepted by the mount helper.

use std::io;

/// Options for mounting a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountOption {
    /// Set the name of the source in mtab
    FSName(String),
    /// Set the filesystem subtype
    Subtype(String),
    /// Allow all users to access files on this filesystem. By default access
    /// is restricted to the user who mounted it
    AllowOther,
    /// Allow the root user to access this filesystem, in addition to the
    /// user who mounted it
    AllowRoot,
    /// Automatically unmount when the mounting process exits
    AutoUnmount,
    /// Enable permission checking in the kernel
    DefaultPermissions,
    /// Honor set-user-id and set-group-id bits on files
    Suid,
    /// Don't honor set-user-id and set-group-id bits on files
    NoSuid,
    /// Read-only filesystem
    RO,
    /// Read-write filesystem
    RW,
    /// Allow execution of binaries
    Exec,
    /// Don't allow execution of binaries
    NoExec,
    /// Support inode access time
    Atime,
    /// Don't update inode access time
    NoAtime,
    /// Interpret device special files
    Dev,
    /// Don't interpret device special files
    NoDev,
    /// All I/O will be done synchronously
    Sync,
    /// All I/O will be done asynchronously
    Async,
    /// Directory changes will be done synchronously
    DirSync,
    /// Pass an option through to the mount helper verbatim
    CUSTOM(String),
}

pub(crate) fn option_to_string(option: &MountOption) -> String {
    match option {
        MountOption::FSName(name) => format!("fsname={name}"),
        MountOption::Subtype(subtype) => format!("subtype={subtype}"),
        MountOption::AllowOther => "allow_other".to_string(),
        // AllowRoot is implemented by allowing everyone and checking uid in
        // the helper; fusermount only knows allow_other.
        MountOption::AllowRoot => "allow_other".to_string(),
        MountOption::AutoUnmount => "auto_unmount".to_string(),
        MountOption::DefaultPermissions => "default_permissions".to_string(),
        MountOption::Suid => "suid".to_string(),
        MountOption::NoSuid => "nosuid".to_string(),
        MountOption::RO => "ro".to_string(),
        MountOption::RW => "rw".to_string(),
        MountOption::Exec => "exec".to_string(),
        MountOption::NoExec => "noexec".to_string(),
        MountOption::Atime => "atime".to_string(),
        MountOption::NoAtime => "noatime".to_string(),
        MountOption::Dev => "dev".to_string(),
        MountOption::NoDev => "nodev".to_string(),
        MountOption::Sync => "sync".to_string(),
        MountOption::Async => "async".to_string(),
        MountOption::DirSync => "dirsync".to_string(),
        MountOption::CUSTOM(value) => value.to_string(),
    }
}

const CONFLICTS: &[(&MountOption, &MountOption)] = &[
    (&MountOption::Suid, &MountOption::NoSuid),
    (&MountOption::RO, &MountOption::RW),
    (&MountOption::Exec, &MountOption::NoExec),
    (&MountOption::Atime, &MountOption::NoAtime),
    (&MountOption::Dev, &MountOption::NoDev),
    (&MountOption::Sync, &MountOption::Async),
    (&MountOption::AllowOther, &MountOption::AllowRoot),
];

pub(crate) fn check_option_conflicts(options: &[MountOption]) -> io::Result<()> {
    for (a, b) in CONFLICTS {
        if options.contains(a) && options.contains(b) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("conflicting mount options: {a:?} and {b:?}"),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_strings() {
        assert_eq!(option_to_string(&MountOption::AllowOther), "allow_other");
        assert_eq!(
            option_to_string(&MountOption::FSName("demo".into())),
            "fsname=demo"
        );
        assert_eq!(
            option_to_string(&MountOption::CUSTOM("max_read=4096".into())),
            "max_read=4096"
        );
    }

    #[test]
    fn conflicting_options_are_rejected() {
        assert!(check_option_conflicts(&[MountOption::RO, MountOption::RW]).is_err());
        assert!(
            check_option_conflicts(&[MountOption::RO, MountOption::NoSuid]).is_ok()
        );
    }
}
