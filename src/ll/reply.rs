//! Reply serialization.
//!
//! Every reply is an out-header followed by an opcode-specific payload. The
//! header's length field is filled last, once the payload size is known, and
//! the whole reply is handed to the channel as one iovec list so it reaches
//! the device in a single atomic write.

use std::convert::TryInto;
use std::ffi::OsStr;
use std::io::IoSlice;
use std::os::unix::ffi::OsStrExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use smallvec::{SmallVec, smallvec};
use zerocopy::{Immutable, IntoBytes};

use super::fuse_abi as abi;
use super::fuse_abi::FopenFlags;
use super::{Errno, FileHandle, Generation, INodeNo, RequestId};
use crate::node::{FileAttr, FileLock, FileType, StatfsOut};

const INLINE_DATA_THRESHOLD: usize = size_of::<u64>() * 4;
pub(crate) type ResponseBuf = SmallVec<[u8; INLINE_DATA_THRESHOLD]>;

#[derive(Debug)]
pub(crate) enum Response<'a> {
    Error(Option<Errno>),
    Data(ResponseBuf),
    Slice(&'a [u8]),
}

impl<'a> Response<'a> {
    /// Assemble the out-header plus payload and hand them to `f` as iovecs.
    pub(crate) fn with_iovec<F: FnOnce(&[IoSlice<'_>]) -> T, T>(
        &self,
        unique: RequestId,
        f: F,
    ) -> T {
        let datalen = match &self {
            Response::Error(_) => 0,
            Response::Data(v) => v.len(),
            Response::Slice(d) => d.len(),
        };
        let header = abi::fuse_out_header {
            unique: unique.0,
            error: if let Response::Error(Some(errno)) = self {
                -errno.0.get()
            } else {
                0
            },
            len: (size_of::<abi::fuse_out_header>() + datalen)
                .try_into()
                .expect("reply larger than u32"),
        };
        let mut v: SmallVec<[IoSlice<'_>; 3]> = smallvec![IoSlice::new(header.as_bytes())];
        match &self {
            Response::Error(_) => {}
            Response::Data(d) => v.push(IoSlice::new(d)),
            Response::Slice(d) => v.push(IoSlice::new(d)),
        }
        f(&v)
    }

    pub(crate) fn new_ok() -> Self {
        Self::Error(None)
    }

    pub(crate) fn new_error(error: Errno) -> Self {
        Self::Error(Some(error))
    }

    pub(crate) fn new_data(data: &[u8]) -> Self {
        Self::Data(ResponseBuf::from_slice(data))
    }

    pub(crate) fn new_vec(data: Vec<u8>) -> Self {
        Self::Data(ResponseBuf::from_vec(data))
    }

    pub(crate) fn new_slice(data: &'a [u8]) -> Self {
        Self::Slice(data)
    }

    pub(crate) fn new_entry(
        ino: INodeNo,
        generation: Generation,
        attr: &FileAttr,
        attr_ttl: Duration,
        entry_ttl: Duration,
    ) -> Self {
        Self::from_struct(&entry_out(ino, generation, attr, attr_ttl, entry_ttl))
    }

    pub(crate) fn new_attr(ttl: Duration, attr: &FileAttr) -> Self {
        let r = abi::fuse_attr_out {
            attr_valid: ttl.as_secs(),
            attr_valid_nsec: ttl.subsec_nanos(),
            dummy: 0,
            attr: fuse_attr_from_attr(attr),
        };
        Self::from_struct(&r)
    }

    pub(crate) fn new_open(fh: FileHandle, flags: FopenFlags, backing_id: u32) -> Self {
        let r = abi::fuse_open_out {
            fh: fh.into(),
            open_flags: flags.bits(),
            backing_id,
        };
        Self::from_struct(&r)
    }

    pub(crate) fn new_create(
        ino: INodeNo,
        generation: Generation,
        attr: &FileAttr,
        attr_ttl: Duration,
        entry_ttl: Duration,
        fh: FileHandle,
        flags: FopenFlags,
        backing_id: u32,
    ) -> Self {
        let r = abi::fuse_create_out(
            entry_out(ino, generation, attr, attr_ttl, entry_ttl),
            abi::fuse_open_out {
                fh: fh.into(),
                open_flags: flags.bits(),
                backing_id,
            },
        );
        Self::from_struct(&r)
    }

    pub(crate) fn new_write(written: u32) -> Self {
        let r = abi::fuse_write_out {
            size: written,
            padding: 0,
        };
        Self::from_struct(&r)
    }

    pub(crate) fn new_statfs(st: &StatfsOut) -> Self {
        let r = abi::fuse_statfs_out {
            st: abi::fuse_kstatfs {
                blocks: st.blocks,
                bfree: st.bfree,
                bavail: st.bavail,
                files: st.files,
                ffree: st.ffree,
                bsize: st.bsize,
                namelen: st.namelen,
                frsize: st.frsize,
                padding: 0,
                spare: [0; 6],
            },
        };
        Self::from_struct(&r)
    }

    pub(crate) fn new_lock(lock: &FileLock) -> Self {
        let r = abi::fuse_lk_out {
            lk: abi::fuse_file_lock {
                start: lock.start,
                end: lock.end,
                typ: lock.typ,
                pid: lock.pid,
            },
        };
        Self::from_struct(&r)
    }

    pub(crate) fn new_xattr_size(size: u32) -> Self {
        let r = abi::fuse_getxattr_out { size, padding: 0 };
        Self::from_struct(&r)
    }

    pub(crate) fn new_lseek(offset: i64) -> Self {
        let r = abi::fuse_lseek_out { offset };
        Self::from_struct(&r)
    }

    pub(crate) fn new_ioctl(result: i32, data: &[u8]) -> Self {
        let r = abi::fuse_ioctl_out {
            result,
            // only needed for unrestricted ioctls
            flags: 0,
            in_iovs: 1,
            out_iovs: u32::from(!data.is_empty()),
        };
        let mut v: ResponseBuf = ResponseBuf::from_slice(r.as_bytes());
        v.extend_from_slice(data);
        Self::Data(v)
    }

    pub(crate) fn new_statx(ttl: Duration, attr: &FileAttr) -> Self {
        let (atime_secs, atime_nanos) = time_from_system_time(&attr.atime);
        let (mtime_secs, mtime_nanos) = time_from_system_time(&attr.mtime);
        let (ctime_secs, ctime_nanos) = time_from_system_time(&attr.ctime);
        let sx_time = |secs, nanos| abi::fuse_sx_time {
            tv_sec: secs,
            tv_nsec: nanos,
            reserved: 0,
        };
        let r = abi::fuse_statx_out {
            attr_valid: ttl.as_secs(),
            attr_valid_nsec: ttl.subsec_nanos(),
            flags: 0,
            spare: [0; 2],
            stat: abi::fuse_statx {
                mask: libc::STATX_BASIC_STATS,
                blksize: attr.blksize,
                attributes: 0,
                nlink: attr.nlink,
                uid: attr.uid,
                gid: attr.gid,
                mode: mode_from_kind_and_perm(attr.kind, attr.perm) as u16,
                spare0: [0; 1],
                ino: attr.ino,
                size: attr.size,
                blocks: attr.blocks,
                attributes_mask: 0,
                atime: sx_time(atime_secs, atime_nanos),
                btime: abi::fuse_sx_time::default(),
                ctime: sx_time(ctime_secs, ctime_nanos),
                mtime: sx_time(mtime_secs, mtime_nanos),
                rdev_major: attr.rdev >> 8,
                rdev_minor: attr.rdev & 0xff,
                dev_major: 0,
                dev_minor: 0,
                spare2: [0; 14],
            },
        };
        Self::from_struct(&r)
    }

    pub(crate) fn new_directory(list: EntListBuf) -> Self {
        debug_assert!(list.buf.len() <= list.max_size);
        Self::Data(list.buf)
    }

    fn from_struct<T: IntoBytes + Immutable + ?Sized>(data: &T) -> Self {
        Self::Data(SmallVec::from_slice(data.as_bytes()))
    }
}

fn entry_out(
    ino: INodeNo,
    generation: Generation,
    attr: &FileAttr,
    attr_ttl: Duration,
    entry_ttl: Duration,
) -> abi::fuse_entry_out {
    abi::fuse_entry_out {
        nodeid: ino.into(),
        generation: generation.0,
        entry_valid: entry_ttl.as_secs(),
        attr_valid: attr_ttl.as_secs(),
        entry_valid_nsec: entry_ttl.subsec_nanos(),
        attr_valid_nsec: attr_ttl.subsec_nanos(),
        attr: fuse_attr_from_attr(attr),
    }
}

pub(crate) fn time_from_system_time(system_time: &SystemTime) -> (i64, u32) {
    match system_time.duration_since(UNIX_EPOCH) {
        Ok(duration) => (duration.as_secs() as i64, duration.subsec_nanos()),
        Err(before_epoch_error) => (
            -(before_epoch_error.duration().as_secs() as i64),
            before_epoch_error.duration().subsec_nanos(),
        ),
    }
}

#[allow(trivial_numeric_casts)]
#[allow(clippy::unnecessary_cast)]
pub(crate) fn mode_from_kind_and_perm(kind: FileType, perm: u16) -> u32 {
    (match kind {
        FileType::NamedPipe => libc::S_IFIFO,
        FileType::CharDevice => libc::S_IFCHR,
        FileType::BlockDevice => libc::S_IFBLK,
        FileType::Directory => libc::S_IFDIR,
        FileType::RegularFile => libc::S_IFREG,
        FileType::Symlink => libc::S_IFLNK,
        FileType::Socket => libc::S_IFSOCK,
    }) as u32
        | u32::from(perm)
}

pub(crate) fn fuse_attr_from_attr(attr: &FileAttr) -> abi::fuse_attr {
    let (atime_secs, atime_nanos) = time_from_system_time(&attr.atime);
    let (mtime_secs, mtime_nanos) = time_from_system_time(&attr.mtime);
    let (ctime_secs, ctime_nanos) = time_from_system_time(&attr.ctime);
    abi::fuse_attr {
        ino: attr.ino,
        size: attr.size,
        blocks: attr.blocks,
        atime: atime_secs,
        mtime: mtime_secs,
        ctime: ctime_secs,
        atimensec: atime_nanos,
        mtimensec: mtime_nanos,
        ctimensec: ctime_nanos,
        mode: mode_from_kind_and_perm(attr.kind, attr.perm),
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        blksize: attr.blksize,
        flags: 0,
    }
}

/// Accumulates dirent records, 8-byte aligned, up to the size the kernel
/// asked for.
#[derive(Debug)]
pub(crate) struct EntListBuf {
    max_size: usize,
    buf: ResponseBuf,
}

impl EntListBuf {
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            max_size,
            buf: ResponseBuf::new(),
        }
    }

    /// Append one record (header bytes + name bytes). Returns true if the
    /// buffer is full and the entry was not added.
    #[must_use]
    fn push(&mut self, ent: [&[u8]; 2]) -> bool {
        debug_assert!(self.buf.len() % size_of::<u64>() == 0);
        let entlen = ent[0].len() + ent[1].len();
        let entsize = entlen.next_multiple_of(size_of::<u64>());
        if self.buf.len() + entsize > self.max_size {
            return true;
        }
        self.buf.reserve(entsize);
        self.buf.extend_from_slice(ent[0]);
        self.buf.extend_from_slice(ent[1]);
        self.buf.resize(self.buf.len() + (entsize - entlen), 0);
        false
    }

    /// Append a plain READDIR record. The offset is the cursor position the
    /// kernel will resume from on its next READDIR call.
    #[must_use]
    pub(crate) fn push_dirent(
        &mut self,
        ino: INodeNo,
        offset: u64,
        kind: FileType,
        name: &OsStr,
    ) -> bool {
        let name = name.as_bytes();
        let header = abi::fuse_dirent {
            ino: ino.into(),
            off: offset,
            namelen: name.len().try_into().expect("name too long"),
            typ: mode_from_kind_and_perm(kind, 0) >> 12,
        };
        self.push([header.as_bytes(), name])
    }

    /// Append a READDIRPLUS record carrying a full entry.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub(crate) fn push_direntplus(
        &mut self,
        ino: INodeNo,
        generation: Generation,
        offset: u64,
        name: &OsStr,
        attr: &FileAttr,
        attr_ttl: Duration,
        entry_ttl: Duration,
    ) -> bool {
        let name = name.as_bytes();
        let entry = entry_out(ino, generation, attr, attr_ttl, entry_ttl);
        let header = abi::fuse_direntplus {
            dirent: abi::fuse_dirent {
                ino: entry.attr.ino,
                off: offset,
                namelen: name.len().try_into().expect("name too long"),
                typ: entry.attr.mode >> 12,
            },
            entry_out: entry,
        };
        self.push([header.as_bytes(), name])
    }
}
