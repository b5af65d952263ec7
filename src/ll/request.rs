//! Typed view of an incoming kernel request.
//!
//! A raw buffer read from the device channel is parsed into a common header
//! plus a per-opcode `Operation`. Parsing borrows from the buffer; nothing is
//! copied.

use std::convert::TryFrom;
use std::ffi::OsStr;
use std::{error, fmt, mem};

use super::argument::ArgReader;
use super::fuse_abi as abi;
use super::fuse_abi::fuse_opcode;
use super::{FileHandle, INodeNo, RequestId, Version};

/// Error that may occur while parsing a request from the kernel driver.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RequestError {
    /// Not enough bytes for the common header.
    ShortHeader(usize),
    /// The length declared in the header disagrees with the bytes received.
    LengthMismatch { declared: u32, received: usize },
    /// Kernel requested an operation we have no decoder for. Carries the
    /// unique ID so the session can still owe a reply.
    UnknownOpcode { opcode: u32, unique: RequestId },
    /// The per-opcode arguments were truncated.
    Truncated { opcode: u32, unique: RequestId },
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::ShortHeader(len) => write!(
                f,
                "short read of request header ({} < {})",
                len,
                mem::size_of::<abi::fuse_in_header>()
            ),
            RequestError::LengthMismatch { declared, received } => write!(
                f,
                "request length mismatch (header says {declared}, got {received})"
            ),
            RequestError::UnknownOpcode { opcode, .. } => write!(f, "unknown opcode {opcode}"),
            RequestError::Truncated { opcode, .. } => {
                write!(f, "truncated arguments for opcode {opcode}")
            }
        }
    }
}

impl error::Error for RequestError {}

/// One decoded request operation. Lifetimes borrow from the receive buffer.
#[derive(Debug)]
pub(crate) enum Operation<'a> {
    Init {
        version: Version,
        max_readahead: u32,
        flags: u64,
    },
    Destroy,
    Interrupt {
        unique: RequestId,
    },
    Forget {
        nlookup: u64,
    },
    BatchForget {
        nodes: &'a [abi::fuse_forget_one],
    },
    Lookup {
        name: &'a OsStr,
    },
    GetAttr {
        fh: Option<FileHandle>,
    },
    SetAttr(&'a abi::fuse_setattr_in),
    ReadLink,
    SymLink {
        name: &'a OsStr,
        target: &'a OsStr,
    },
    MkNod {
        arg: &'a abi::fuse_mknod_in,
        name: &'a OsStr,
    },
    MkDir {
        arg: &'a abi::fuse_mkdir_in,
        name: &'a OsStr,
    },
    Unlink {
        name: &'a OsStr,
    },
    RmDir {
        name: &'a OsStr,
    },
    Rename {
        newdir: INodeNo,
        name: &'a OsStr,
        newname: &'a OsStr,
        flags: u32,
    },
    Link {
        target: INodeNo,
        name: &'a OsStr,
    },
    Open(&'a abi::fuse_open_in),
    Read(&'a abi::fuse_read_in),
    Write {
        arg: &'a abi::fuse_write_in,
        data: &'a [u8],
    },
    Flush(&'a abi::fuse_flush_in),
    Release(&'a abi::fuse_release_in),
    FSync(&'a abi::fuse_fsync_in),
    OpenDir(&'a abi::fuse_open_in),
    ReadDir(&'a abi::fuse_read_in),
    ReadDirPlus(&'a abi::fuse_read_in),
    ReleaseDir(&'a abi::fuse_release_in),
    FSyncDir(&'a abi::fuse_fsync_in),
    StatFs,
    SetXAttr {
        arg: &'a abi::fuse_setxattr_in,
        name: &'a OsStr,
        value: &'a [u8],
    },
    GetXAttr {
        arg: &'a abi::fuse_getxattr_in,
        name: &'a OsStr,
    },
    ListXAttr(&'a abi::fuse_getxattr_in),
    RemoveXAttr {
        name: &'a OsStr,
    },
    Access(&'a abi::fuse_access_in),
    Create {
        arg: &'a abi::fuse_create_in,
        name: &'a OsStr,
    },
    GetLk(&'a abi::fuse_lk_in),
    SetLk(&'a abi::fuse_lk_in),
    SetLkW(&'a abi::fuse_lk_in),
    Ioctl {
        arg: &'a abi::fuse_ioctl_in,
        data: &'a [u8],
    },
    Poll,
    FAllocate(&'a abi::fuse_fallocate_in),
    Lseek(&'a abi::fuse_lseek_in),
    CopyFileRange(&'a abi::fuse_copy_file_range_in),
    Statx(&'a abi::fuse_statx_in),
    /// Valid opcode that this server answers with a fixed default and never
    /// routes to a node (SETUPMAPPING, SYNCFS, ...).
    Unsupported(u32),
}

impl<'a> Operation<'a> {
    fn decode(
        opcode: fuse_opcode,
        reader: &mut ArgReader<'a>,
    ) -> Option<Operation<'a>> {
        use fuse_opcode::*;
        Some(match opcode {
            FUSE_INIT => {
                let arg: &abi::fuse_init_in = reader.take()?;
                let mut flags = u64::from(arg.flags);
                if flags & abi::InitFlags::FUSE_INIT_EXT.bits() != 0 {
                    // Extended init carries the upper capability bits.
                    if let Some(ext) = reader.take::<abi::fuse_init_in_ext>() {
                        flags |= u64::from(ext.flags2) << 32;
                    }
                }
                Operation::Init {
                    version: Version(arg.major, arg.minor),
                    max_readahead: arg.max_readahead,
                    flags,
                }
            }
            FUSE_DESTROY => Operation::Destroy,
            FUSE_INTERRUPT => {
                let arg: &abi::fuse_interrupt_in = reader.take()?;
                Operation::Interrupt {
                    unique: RequestId(arg.unique),
                }
            }
            FUSE_FORGET => {
                let arg: &abi::fuse_forget_in = reader.take()?;
                Operation::Forget {
                    nlookup: arg.nlookup,
                }
            }
            FUSE_BATCH_FORGET => {
                let arg: &abi::fuse_batch_forget_in = reader.take()?;
                Operation::BatchForget {
                    nodes: reader.take_slice(arg.count as usize)?,
                }
            }
            FUSE_LOOKUP => Operation::Lookup {
                name: reader.take_name()?,
            },
            FUSE_GETATTR => {
                let arg: &abi::fuse_getattr_in = reader.take()?;
                Operation::GetAttr {
                    fh: (arg.getattr_flags & abi::consts::FUSE_GETATTR_FH != 0)
                        .then_some(FileHandle(arg.fh)),
                }
            }
            FUSE_SETATTR => Operation::SetAttr(reader.take()?),
            FUSE_READLINK => Operation::ReadLink,
            FUSE_SYMLINK => Operation::SymLink {
                name: reader.take_name()?,
                target: reader.take_name()?,
            },
            FUSE_MKNOD => Operation::MkNod {
                arg: reader.take()?,
                name: reader.take_name()?,
            },
            FUSE_MKDIR => Operation::MkDir {
                arg: reader.take()?,
                name: reader.take_name()?,
            },
            FUSE_UNLINK => Operation::Unlink {
                name: reader.take_name()?,
            },
            FUSE_RMDIR => Operation::RmDir {
                name: reader.take_name()?,
            },
            FUSE_RENAME => {
                let arg: &abi::fuse_rename_in = reader.take()?;
                Operation::Rename {
                    newdir: INodeNo(arg.newdir),
                    name: reader.take_name()?,
                    newname: reader.take_name()?,
                    flags: 0,
                }
            }
            FUSE_RENAME2 => {
                let arg: &abi::fuse_rename2_in = reader.take()?;
                Operation::Rename {
                    newdir: INodeNo(arg.newdir),
                    name: reader.take_name()?,
                    newname: reader.take_name()?,
                    flags: arg.flags,
                }
            }
            FUSE_LINK => {
                let arg: &abi::fuse_link_in = reader.take()?;
                Operation::Link {
                    target: INodeNo(arg.oldnodeid),
                    name: reader.take_name()?,
                }
            }
            FUSE_OPEN => Operation::Open(reader.take()?),
            FUSE_READ => Operation::Read(reader.take()?),
            FUSE_WRITE => {
                let arg: &abi::fuse_write_in = reader.take()?;
                let data = reader.take_rest();
                if data.len() < arg.size as usize {
                    return None;
                }
                Operation::Write {
                    arg,
                    data: &data[..arg.size as usize],
                }
            }
            FUSE_FLUSH => Operation::Flush(reader.take()?),
            FUSE_RELEASE => Operation::Release(reader.take()?),
            FUSE_FSYNC => Operation::FSync(reader.take()?),
            FUSE_OPENDIR => Operation::OpenDir(reader.take()?),
            FUSE_READDIR => Operation::ReadDir(reader.take()?),
            FUSE_READDIRPLUS => Operation::ReadDirPlus(reader.take()?),
            FUSE_RELEASEDIR => Operation::ReleaseDir(reader.take()?),
            FUSE_FSYNCDIR => Operation::FSyncDir(reader.take()?),
            FUSE_STATFS => Operation::StatFs,
            FUSE_SETXATTR => {
                let arg: &abi::fuse_setxattr_in = reader.take()?;
                let name = reader.take_name()?;
                let data = reader.take_rest();
                if data.len() < arg.size as usize {
                    return None;
                }
                Operation::SetXAttr {
                    arg,
                    name,
                    value: &data[..arg.size as usize],
                }
            }
            FUSE_GETXATTR => Operation::GetXAttr {
                arg: reader.take()?,
                name: reader.take_name()?,
            },
            FUSE_LISTXATTR => Operation::ListXAttr(reader.take()?),
            FUSE_REMOVEXATTR => Operation::RemoveXAttr {
                name: reader.take_name()?,
            },
            FUSE_ACCESS => Operation::Access(reader.take()?),
            FUSE_CREATE => Operation::Create {
                arg: reader.take()?,
                name: reader.take_name()?,
            },
            FUSE_GETLK => Operation::GetLk(reader.take()?),
            FUSE_SETLK => Operation::SetLk(reader.take()?),
            FUSE_SETLKW => Operation::SetLkW(reader.take()?),
            FUSE_IOCTL => {
                let arg: &abi::fuse_ioctl_in = reader.take()?;
                Operation::Ioctl {
                    arg,
                    data: reader.take_rest(),
                }
            }
            FUSE_POLL => Operation::Poll,
            FUSE_FALLOCATE => Operation::FAllocate(reader.take()?),
            FUSE_LSEEK => Operation::Lseek(reader.take()?),
            FUSE_COPY_FILE_RANGE => Operation::CopyFileRange(reader.take()?),
            FUSE_STATX => Operation::Statx(reader.take()?),
            FUSE_BMAP | FUSE_NOTIFY_REPLY | FUSE_SETUPMAPPING | FUSE_REMOVEMAPPING
            | FUSE_SYNCFS | FUSE_TMPFILE => Operation::Unsupported(opcode as u32),
        })
    }

    /// Operations the kernel never expects a reply to.
    pub(crate) fn is_no_reply(&self) -> bool {
        matches!(
            self,
            Operation::Forget { .. } | Operation::BatchForget { .. } | Operation::Interrupt { .. }
        )
    }
}

/// A fully parsed request: common header plus typed operation.
#[derive(Debug)]
pub(crate) struct AnyRequest<'a> {
    header: &'a abi::fuse_in_header,
    operation: Operation<'a>,
}

impl<'a> AnyRequest<'a> {
    pub(crate) fn unique(&self) -> RequestId {
        RequestId(self.header.unique)
    }

    pub(crate) fn nodeid(&self) -> INodeNo {
        INodeNo(self.header.nodeid)
    }

    pub(crate) fn uid(&self) -> u32 {
        self.header.uid
    }

    pub(crate) fn gid(&self) -> u32 {
        self.header.gid
    }

    pub(crate) fn pid(&self) -> u32 {
        self.header.pid
    }

    pub(crate) fn operation(&self) -> &Operation<'a> {
        &self.operation
    }
}

impl fmt::Display for AnyRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "request {} opcode {} node {}",
            self.header.unique, self.header.opcode, self.header.nodeid
        )
    }
}

impl<'a> TryFrom<&'a [u8]> for AnyRequest<'a> {
    type Error = RequestError;

    fn try_from(data: &'a [u8]) -> Result<Self, Self::Error> {
        let mut reader = ArgReader::new(data);
        let header: &abi::fuse_in_header = reader
            .take()
            .ok_or(RequestError::ShortHeader(data.len()))?;
        // A mismatch between the declared and received length means we lost
        // framing on the device stream.
        if header.len as usize != data.len() {
            return Err(RequestError::LengthMismatch {
                declared: header.len,
                received: data.len(),
            });
        }
        let opcode = fuse_opcode::try_from(header.opcode).map_err(|_| {
            RequestError::UnknownOpcode {
                opcode: header.opcode,
                unique: RequestId(header.unique),
            }
        })?;
        let operation =
            Operation::decode(opcode, &mut reader).ok_or(RequestError::Truncated {
                opcode: header.opcode,
                unique: RequestId(header.unique),
            })?;
        Ok(AnyRequest { header, operation })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test::AlignedData;
    use super::*;

    // A LOOKUP of "hello" on node 1, unique id 0xde..ad.
    const LOOKUP_REQUEST: AlignedData<[u8; 46]> = AlignedData([
        0x2e, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0xad, 0xde, 0xad, 0xde, 0xad, 0xde, 0xad,
        0xde, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xe8, 0x03, 0x00, 0x00, 0xe8, 0x03,
        0x00, 0x00, 0x90, 0x3f, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x68, 0x65, 0x6c, 0x6c, 0x6f,
        0x00,
    ]);

    #[test]
    fn lookup() {
        let req = AnyRequest::try_from(&LOOKUP_REQUEST[..]).unwrap();
        assert_eq!(req.unique(), RequestId(0xdeaddeaddeaddead));
        assert_eq!(req.nodeid(), INodeNo(1));
        assert_eq!(req.uid(), 1000);
        assert_eq!(req.gid(), 1000);
        assert_eq!(req.pid(), 0x3f90);
        match req.operation() {
            Operation::Lookup { name } => assert_eq!(*name, "hello"),
            op => panic!("unexpected operation {op:?}"),
        }
    }

    #[test]
    fn short_header() {
        let err = AnyRequest::try_from(&LOOKUP_REQUEST[..20]).unwrap_err();
        assert_eq!(err, RequestError::ShortHeader(20));
    }

    #[test]
    fn length_mismatch() {
        let mut data = LOOKUP_REQUEST;
        data.0[0] = 0xff;
        let err = AnyRequest::try_from(&data[..]).unwrap_err();
        assert_eq!(
            err,
            RequestError::LengthMismatch {
                declared: 0xff,
                received: 46
            }
        );
    }

    #[test]
    fn unknown_opcode() {
        let mut data = LOOKUP_REQUEST;
        data.0[4] = 0xff;
        data.0[5] = 0xff;
        let err = AnyRequest::try_from(&data[..]).unwrap_err();
        assert_eq!(
            err,
            RequestError::UnknownOpcode {
                opcode: 0xffff,
                unique: RequestId(0xdeaddeaddeaddead)
            }
        );
    }

    #[test]
    fn truncated_arguments() {
        // LOOKUP whose name has no NUL terminator.
        let mut data = LOOKUP_REQUEST;
        data.0[45] = b'x';
        let err = AnyRequest::try_from(&data[..]).unwrap_err();
        assert_eq!(
            err,
            RequestError::Truncated {
                opcode: 1,
                unique: RequestId(0xdeaddeaddeaddead)
            }
        );
    }
}
