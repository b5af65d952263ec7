//! The surface presented to filesystem authors.
//!
//! A filesystem is a tree of nodes. Each node implements whatever subset of
//! [`NodeOps`] it cares about; unimplemented operations fall back to the
//! documented default reply for that opcode. This trait is the only runtime
//! polymorphism in the core: the dispatcher resolves a node by its kernel
//! node-ID and calls straight into the method.

use std::ffi::OsStr;
use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::channel::DeviceFd;
use crate::ll::fuse_abi::RenameFlags;
use crate::ll::{Errno, FileHandle, INodeNo, RequestId, TimeOrNow};
use crate::passthrough::BackingId;
use crate::tree::StableAttr;

/// File types
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FileType {
    /// Named pipe (`S_IFIFO`)
    NamedPipe,
    /// Character device (`S_IFCHR`)
    CharDevice,
    /// Block device (`S_IFBLK`)
    BlockDevice,
    /// Directory (`S_IFDIR`)
    Directory,
    /// Regular file (`S_IFREG`)
    RegularFile,
    /// Symbolic link (`S_IFLNK`)
    Symlink,
    /// Unix domain socket (`S_IFSOCK`)
    Socket,
}

impl FileType {
    /// Convert std `FileType` to ours.
    pub fn from_std(file_type: std::fs::FileType) -> Option<Self> {
        use std::os::unix::fs::FileTypeExt;
        if file_type.is_file() {
            Some(FileType::RegularFile)
        } else if file_type.is_dir() {
            Some(FileType::Directory)
        } else if file_type.is_symlink() {
            Some(FileType::Symlink)
        } else if file_type.is_fifo() {
            Some(FileType::NamedPipe)
        } else if file_type.is_socket() {
            Some(FileType::Socket)
        } else if file_type.is_char_device() {
            Some(FileType::CharDevice)
        } else if file_type.is_block_device() {
            Some(FileType::BlockDevice)
        } else {
            None
        }
    }
}

/// File attributes
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileAttr {
    /// Inode number. The dispatcher overwrites this with the number the tree
    /// assigned, so nodes may leave it zero.
    pub ino: u64,
    /// Size in bytes
    pub size: u64,
    /// Allocated size in 512-byte blocks
    pub blocks: u64,
    /// Time of last access
    pub atime: SystemTime,
    /// Time of last modification
    pub mtime: SystemTime,
    /// Time of last change
    pub ctime: SystemTime,
    /// Kind of file (directory, file, pipe, etc)
    pub kind: FileType,
    /// Permission bits
    pub perm: u16,
    /// Number of hard links
    pub nlink: u32,
    /// User id
    pub uid: u32,
    /// Group id
    pub gid: u32,
    /// Device number, for device nodes
    pub rdev: u32,
    /// Block size reported by `stat()`. If unsure, use 4096.
    pub blksize: u32,
}

impl FileAttr {
    pub fn new(kind: FileType) -> Self {
        FileAttr {
            ino: 0,
            size: 0,
            blocks: 0,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            kind,
            perm: match kind {
                FileType::Directory => 0o755,
                _ => 0o644,
            },
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 4096,
        }
    }
}

/// Attribute reply plus how long the kernel may cache it.
#[derive(Clone, Copy, Debug)]
pub struct AttrOut {
    pub attr: FileAttr,
    pub ttl: Duration,
}

impl AttrOut {
    pub fn new(attr: FileAttr) -> Self {
        AttrOut {
            attr,
            ttl: Duration::from_secs(1),
        }
    }
}

/// What a LOOKUP-class reply carries besides the stable identity.
#[derive(Clone, Copy, Debug)]
pub struct EntryParams {
    pub attr: FileAttr,
    pub attr_ttl: Duration,
    pub entry_ttl: Duration,
}

impl EntryParams {
    pub fn new(attr: FileAttr) -> Self {
        EntryParams {
            attr,
            attr_ttl: Duration::from_secs(1),
            entry_ttl: Duration::from_secs(1),
        }
    }
}

/// A child minted by lookup, create, mkdir, mknod or symlink: the operations
/// object that will serve the new inode, its stable identity, and the entry
/// data for the kernel's cache.
pub struct ChildNode {
    pub stable: StableAttr,
    pub ops: Arc<dyn NodeOps>,
    pub entry: EntryParams,
}

impl ChildNode {
    pub fn new(kind: FileType, ops: Arc<dyn NodeOps>) -> Self {
        ChildNode {
            stable: StableAttr::new(kind),
            ops,
            entry: EntryParams::new(FileAttr::new(kind)),
        }
    }
}

impl std::fmt::Debug for ChildNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildNode")
            .field("stable", &self.stable)
            .field("entry", &self.entry)
            .finish()
    }
}

/// Per-open state returned from [`NodeOps::open`] / [`NodeOps::create`]. The
/// session mints the 64-bit handle ID; the node only chooses cache behavior
/// and, optionally, a passthrough backing.
#[derive(Debug, Default)]
pub struct OpenedFile {
    /// Bypass the page cache for this open file.
    pub direct_io: bool,
    /// Keep the data cache from a previous open.
    pub keep_cache: bool,
    /// The file is not seekable.
    pub nonseekable: bool,
    /// Stream-like file, no position at all.
    pub stream: bool,
    /// Kernel skips FUSE_FLUSH on close.
    pub noflush: bool,
    /// Allow parallel direct writes on this file.
    pub parallel_direct_writes: bool,
    /// Execute reads and writes against this backing file in the kernel,
    /// bypassing the server. Register via [`OpContext::open_backing`].
    pub backing: Option<BackingId>,
}

/// Per-open state returned from [`NodeOps::opendir`].
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenedDir {
    /// Allow the kernel to cache this directory's entries.
    pub cache_dir: bool,
    pub keep_cache: bool,
}

/// A read payload identified by a file descriptor instead of bytes in
/// memory. The session splices it to the device when the kernel negotiated
/// splice support, and falls back to a buffered copy otherwise.
#[derive(Debug, Clone)]
pub struct FdPayload {
    pub file: Arc<File>,
    pub offset: u64,
    pub len: u32,
}

/// Result of a read.
#[derive(Debug)]
pub enum ReadResult {
    /// Bytes already in memory.
    Data(Vec<u8>),
    /// A span of an open file; candidates for zero-copy.
    Fd(FdPayload),
}

/// Filesystem statistics for STATFS. The zero default is accepted by the
/// kernel and is the reply for nodes that do not implement the operation.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatfsOut {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// A POSIX byte-range lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileLock {
    pub start: u64,
    pub end: u64,
    /// `F_RDLCK`, `F_WRLCK` or `F_UNLCK`.
    pub typ: i32,
    pub pid: u32,
}

/// Reply to getxattr/listxattr: either the size the caller should allocate
/// (when it probed with size 0) or the data itself.
#[derive(Debug)]
pub enum XattrReply {
    Size(u32),
    Data(Vec<u8>),
}

/// Reply to a restricted ioctl.
#[derive(Debug, Default)]
pub struct IoctlOut {
    pub result: i32,
    pub data: Vec<u8>,
}

/// The attribute changes requested by one SETATTR. Absent fields are not to
/// be touched.
#[derive(Debug, Default, Clone, Copy)]
pub struct SetAttrChanges {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeOrNow>,
    pub mtime: Option<TimeOrNow>,
    pub ctime: Option<SystemTime>,
    pub fh: Option<FileHandle>,
}

/// One directory entry produced by a [`DirStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: FileType,
    /// Leave zero to let the session substitute the tree's number when the
    /// name is bound, or an opaque placeholder otherwise.
    pub ino: u64,
}

/// Cursor over a directory's entries.
///
/// Streams must be deterministic: for the same directory state, two cursors
/// yield the same entries in the same order, so that concurrent READDIR
/// readers resuming at kernel-provided offsets see a coherent listing.
/// Implementations backed by hashed containers must impose an order first.
pub trait DirStream: Send {
    fn has_next(&self) -> bool;
    fn next_entry(&mut self) -> Option<DirEntry>;
    fn close(&mut self) {}
}

/// A `DirStream` over a pre-built entry list.
#[derive(Debug, Default)]
pub struct VecDirStream {
    entries: std::vec::IntoIter<DirEntry>,
}

impl VecDirStream {
    pub fn new(entries: Vec<DirEntry>) -> Self {
        VecDirStream {
            entries: entries.into_iter(),
        }
    }
}

impl DirStream for VecDirStream {
    fn has_next(&self) -> bool {
        self.entries.len() > 0
    }

    fn next_entry(&mut self) -> Option<DirEntry> {
        self.entries.next()
    }
}

/// Per-request context handed to every node operation: the caller's
/// credentials, the request's unique ID, and its cancellation flag.
pub struct OpContext {
    pub unique: RequestId,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub(crate) interrupted: Arc<AtomicBool>,
    pub(crate) device: Weak<DeviceFd>,
}

impl OpContext {
    /// True once an INTERRUPT addressed this request. Checking is optional;
    /// a handler that observes it should bail out with `Errno::EINTR`, and
    /// the session replies EINTR regardless once the flag is set.
    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Register `fd` as a passthrough backing file with the kernel. Keep the
    /// returned ID alive (usually inside your per-open state) until release;
    /// dropping it unregisters the backing.
    pub fn open_backing(&self, fd: impl AsFd) -> io::Result<BackingId> {
        let device = self.device.upgrade().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "fuse session is shut down")
        })?;
        BackingId::create(&device, fd)
    }
}

impl std::fmt::Debug for OpContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpContext")
            .field("unique", &self.unique)
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("pid", &self.pid)
            .finish()
    }
}

/// The operations a node may implement.
///
/// Every method has a default matching the documented reply for the opcode
/// when a filesystem leaves it unimplemented; most are `ENOSYS`, with the
/// exceptions noted per method. Handlers run concurrently on the session's
/// reader threads and never hold internal locks of the core, so they may
/// block freely.
#[allow(unused_variables)]
pub trait NodeOps: Send + Sync + 'static {
    /// Resolve `name` to a child. The default `ENOENT` makes a node with no
    /// lookup implementation an empty directory.
    fn lookup(&self, ctx: &OpContext, name: &OsStr) -> Result<ChildNode, Errno> {
        Err(Errno::ENOENT)
    }

    /// Report attributes. On the default `ENOSYS` the session synthesizes
    /// zeroed attributes of the node's type, which is enough for nodes that
    /// only exist as structure.
    fn getattr(&self, ctx: &OpContext, fh: Option<FileHandle>) -> Result<AttrOut, Errno> {
        Err(Errno::ENOSYS)
    }

    fn setattr(&self, ctx: &OpContext, changes: &SetAttrChanges) -> Result<AttrOut, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Read a symlink target. `EINVAL` is what the kernel expects from
    /// non-symlinks.
    fn readlink(&self, ctx: &OpContext) -> Result<Vec<u8>, Errno> {
        Err(Errno::EINVAL)
    }

    fn mknod(
        &self,
        ctx: &OpContext,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
    ) -> Result<ChildNode, Errno> {
        Err(Errno::ENOSYS)
    }

    fn mkdir(&self, ctx: &OpContext, name: &OsStr, mode: u32, umask: u32) -> Result<ChildNode, Errno> {
        Err(Errno::ENOSYS)
    }

    fn symlink(&self, ctx: &OpContext, name: &OsStr, target: &OsStr) -> Result<ChildNode, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Remove the child `name`. On success the session also removes the
    /// tree edge; the child inode survives while the kernel references it.
    fn unlink(&self, ctx: &OpContext, name: &OsStr) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    fn rmdir(&self, ctx: &OpContext, name: &OsStr) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    /// Move `name` under `new_parent` as `new_name`. On success the session
    /// performs the corresponding tree move (or exchange) atomically.
    fn rename(
        &self,
        ctx: &OpContext,
        name: &OsStr,
        new_parent: INodeNo,
        new_name: &OsStr,
        flags: RenameFlags,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    /// Create a hard link to `target` named `name` under this node. On
    /// success the session binds the edge and replies with the target's
    /// entry.
    fn link(&self, ctx: &OpContext, name: &OsStr, target: INodeNo) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    /// Open this node. The default `ENOSYS` enables the kernel's
    /// zero-message opens: reads and writes then arrive without a handle.
    fn open(&self, ctx: &OpContext, flags: i32) -> Result<OpenedFile, Errno> {
        Err(Errno::ENOSYS)
    }

    fn create(
        &self,
        ctx: &OpContext,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
    ) -> Result<(ChildNode, OpenedFile), Errno> {
        Err(Errno::ENOSYS)
    }

    fn read(
        &self,
        ctx: &OpContext,
        fh: Option<FileHandle>,
        offset: u64,
        size: u32,
        flags: i32,
    ) -> Result<ReadResult, Errno> {
        Err(Errno::ENOSYS)
    }

    fn write(
        &self,
        ctx: &OpContext,
        fh: Option<FileHandle>,
        offset: u64,
        data: &[u8],
        flags: i32,
    ) -> Result<u32, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Called on every close of a file descriptor. Default OK.
    fn flush(&self, ctx: &OpContext, fh: Option<FileHandle>, lock_owner: u64) -> Result<(), Errno> {
        Ok(())
    }

    /// Called when the last reference to an open file goes away. Default OK.
    fn release(&self, ctx: &OpContext, fh: FileHandle, flags: i32) -> Result<(), Errno> {
        Ok(())
    }

    fn fsync(&self, ctx: &OpContext, fh: Option<FileHandle>, datasync: bool) -> Result<(), Errno> {
        Ok(())
    }

    /// Open this directory. The default `ENOSYS` enables zero-message
    /// opendir.
    fn opendir(&self, ctx: &OpContext, flags: i32) -> Result<OpenedDir, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Enumerate this directory. The default `ENOSYS` makes the session
    /// enumerate the node's children in the tree, in insertion order.
    fn readdir(&self, ctx: &OpContext, fh: Option<FileHandle>) -> Result<Box<dyn DirStream>, Errno> {
        Err(Errno::ENOSYS)
    }

    fn releasedir(&self, ctx: &OpContext, fh: FileHandle, flags: i32) -> Result<(), Errno> {
        Ok(())
    }

    fn fsyncdir(&self, ctx: &OpContext, fh: Option<FileHandle>, datasync: bool) -> Result<(), Errno> {
        Ok(())
    }

    /// Filesystem statistics. The zeroed default keeps statfs(2) working on
    /// structural filesystems.
    fn statfs(&self, ctx: &OpContext) -> Result<StatfsOut, Errno> {
        Ok(StatfsOut::default())
    }

    /// Default `ENODATA`: the attribute does not exist.
    fn getxattr(&self, ctx: &OpContext, name: &OsStr, size: u32) -> Result<XattrReply, Errno> {
        Err(Errno::ENODATA)
    }

    fn setxattr(
        &self,
        ctx: &OpContext,
        name: &OsStr,
        value: &[u8],
        flags: u32,
    ) -> Result<(), Errno> {
        Err(Errno::ENOTSUP)
    }

    /// Default: an empty attribute list.
    fn listxattr(&self, ctx: &OpContext, size: u32) -> Result<XattrReply, Errno> {
        Ok(XattrReply::Data(Vec::new()))
    }

    fn removexattr(&self, ctx: &OpContext, name: &OsStr) -> Result<(), Errno> {
        Err(Errno::ENOTSUP)
    }

    /// Permission check. Default OK; the kernel only asks when the mount
    /// uses `default_permissions` without its own checks.
    fn access(&self, ctx: &OpContext, mask: u32) -> Result<(), Errno> {
        Ok(())
    }

    fn getlk(
        &self,
        ctx: &OpContext,
        fh: FileHandle,
        owner: u64,
        lock: &FileLock,
        flock: bool,
    ) -> Result<FileLock, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Set a lock; `sleep` distinguishes SETLKW from SETLK.
    fn setlk(
        &self,
        ctx: &OpContext,
        fh: FileHandle,
        owner: u64,
        lock: &FileLock,
        sleep: bool,
        flock: bool,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    fn allocate(
        &self,
        ctx: &OpContext,
        fh: FileHandle,
        offset: u64,
        length: u64,
        mode: u32,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_file_range(
        &self,
        ctx: &OpContext,
        fh_in: FileHandle,
        off_in: u64,
        target: INodeNo,
        fh_out: FileHandle,
        off_out: u64,
        len: u64,
        flags: u64,
    ) -> Result<u32, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Default `ENOSYS` makes the kernel fall back to its generic lseek.
    fn lseek(&self, ctx: &OpContext, fh: FileHandle, offset: u64, whence: u32) -> Result<i64, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Restricted ioctl. Default `ENOTTY`: not a special file.
    fn ioctl(
        &self,
        ctx: &OpContext,
        fh: Option<FileHandle>,
        flags: u32,
        cmd: u32,
        in_data: &[u8],
        out_size: u32,
    ) -> Result<IoctlOut, Errno> {
        Err(Errno::ENOTTY)
    }

    /// The node was attached to the tree under the given kernel node-ID.
    fn on_add(&self, ino: INodeNo) {}

    /// The node became unreachable: zero lookups, no bindings, reaped from
    /// the table. Fired at most once, never under the tree lock, and never
    /// spuriously from a rename (moves are atomic in the tree).
    fn on_forget(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Empty;
    impl NodeOps for Empty {}

    fn ctx() -> OpContext {
        OpContext {
            unique: RequestId(1),
            uid: 0,
            gid: 0,
            pid: 0,
            interrupted: Arc::new(AtomicBool::new(false)),
            device: Weak::new(),
        }
    }

    #[test]
    fn documented_defaults() {
        let n = Empty;
        let ctx = ctx();
        assert_eq!(n.lookup(&ctx, OsStr::new("x")).unwrap_err(), Errno::ENOENT);
        assert_eq!(n.open(&ctx, 0).unwrap_err(), Errno::ENOSYS);
        assert_eq!(
            n.getxattr(&ctx, OsStr::new("user.x"), 0).unwrap_err(),
            Errno::ENODATA
        );
        assert_eq!(
            n.setxattr(&ctx, OsStr::new("user.x"), b"", 0).unwrap_err(),
            Errno::ENOTSUP
        );
        assert_eq!(n.readlink(&ctx).unwrap_err(), Errno::EINVAL);
        assert!(n.access(&ctx, 7).is_ok());
        assert!(n.flush(&ctx, None, 0).is_ok());
        assert!(n.statfs(&ctx).is_ok());
        assert_eq!(
            n.ioctl(&ctx, None, 0, 0, b"", 0).unwrap_err(),
            Errno::ENOTTY
        );
    }

    #[test]
    fn vec_dir_stream_cursor() {
        let mut s = VecDirStream::new(vec![
            DirEntry {
                name: "a".into(),
                kind: FileType::RegularFile,
                ino: 2,
            },
            DirEntry {
                name: "b".into(),
                kind: FileType::Directory,
                ino: 3,
            },
        ]);
        assert!(s.has_next());
        assert_eq!(s.next_entry().unwrap().name, "a");
        assert_eq!(s.next_entry().unwrap().name, "b");
        assert!(!s.has_next());
        assert!(s.next_entry().is_none());
        s.close();
    }

    #[test]
    fn interrupted_flag_is_observable() {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = OpContext {
            unique: RequestId(7),
            uid: 0,
            gid: 0,
            pid: 0,
            interrupted: flag.clone(),
            device: Weak::new(),
        };
        assert!(!ctx.interrupted());
        flag.store(true, Ordering::Release);
        assert!(ctx.interrupted());
    }
}
