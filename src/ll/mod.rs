//! Low level FUSE protocol handling.
//!
//! The submodules translate between the raw byte stream on the device channel
//! and typed requests and responses. Nothing in here touches the inode tree
//! or user callbacks.

pub(crate) mod argument;
pub(crate) mod fuse_abi;
pub(crate) mod ioctl;
pub(crate) mod reply;
pub(crate) mod request;

use std::fmt;
use std::num::NonZeroI32;

/// A kernel-facing inode number. Node-ID 1 is always the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct INodeNo(pub u64);

impl INodeNo {
    /// The root inode, implicitly pinned for the lifetime of the mount.
    pub const ROOT: INodeNo = INodeNo(fuse_abi::FUSE_ROOT_ID);

    pub fn is_root(self) -> bool {
        self.0 == fuse_abi::FUSE_ROOT_ID
    }
}

impl From<INodeNo> for u64 {
    fn from(v: INodeNo) -> u64 {
        v.0
    }
}

impl fmt::Display for INodeNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque per-open state identifier, minted by the session on
/// Open/Opendir/Create and retired on Release/Releasedir.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(pub u64);

impl From<FileHandle> for u64 {
    fn from(v: FileHandle) -> u64 {
        v.0
    }
}

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The unique identifier the kernel assigns to each request. Replies carry it
/// back so the kernel can match them regardless of ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Distinguishes successive uses of the same inode number within one mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(pub u64);

impl From<Generation> for u64 {
    fn from(v: Generation) -> u64 {
        v.0
    }
}

/// FUSE protocol version as `major.minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version(pub u32, pub u32);

impl Version {
    pub fn major(&self) -> u32 {
        self.0
    }
    pub fn minor(&self) -> u32 {
        self.1
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0, self.1)
    }
}

/// A POSIX errno, guaranteed non-zero.
///
/// Handlers return these; the reply encoder negates them into the reply
/// header status field. Zero (success) is represented by `Ok`, never by an
/// `Errno` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub NonZeroI32);

macro_rules! errno_consts {
    ($($name:ident),+ $(,)?) => {
        $(pub const $name: Errno = Errno::from_code(libc::$name);)+
    };
}

impl Errno {
    const fn from_code(code: i32) -> Errno {
        match NonZeroI32::new(code) {
            Some(n) => Errno(n),
            None => panic!("errno must be non-zero"),
        }
    }

    errno_consts!(
        EPERM, ENOENT, EINTR, EIO, EAGAIN, ENOMEM, EACCES, EBUSY, EEXIST,
        EXDEV, ENODEV, ENOTDIR, EISDIR, EINVAL, ENOTTY, EFBIG, ENOSPC, EROFS,
        EMLINK, ERANGE, ENAMETOOLONG, ENOSYS, ENOTEMPTY, ENODATA, EOVERFLOW,
        EPROTO, ENOTSUP,
    );

    pub fn from_i32(code: i32) -> Errno {
        NonZeroI32::new(code).map(Errno).unwrap_or(Errno::EIO)
    }

    pub fn code(&self) -> i32 {
        self.0.get()
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

impl From<std::io::Error> for Errno {
    fn from(err: std::io::Error) -> Errno {
        err.raw_os_error().map(Errno::from_i32).unwrap_or(Errno::EIO)
    }
}

impl From<nix::errno::Errno> for Errno {
    fn from(err: nix::errno::Errno) -> Errno {
        Errno::from_i32(err as i32)
    }
}

/// Either a specific time or a request to use the current time, as carried by
/// the atime/mtime fields of SETATTR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOrNow {
    SpecificTime(std::time::SystemTime),
    Now,
}
