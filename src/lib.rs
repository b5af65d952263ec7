//! Node-tree framework for writing FUSE filesystems.
//!
//! fusetree speaks the Linux FUSE kernel protocol over a `/dev/fuse`
//! descriptor and presents filesystem authors with a tree of nodes instead
//! of a flat opcode surface. Implement whichever [`NodeOps`] methods your
//! nodes care about, mount a [`Session`], and the crate handles the wire
//! protocol, the kernel's lookup-count bookkeeping, file handles,
//! interrupts and shutdown.
//!
//! ```no_run
//! use std::sync::Arc;
//! use fusetree::{MountOption, NodeOps, Session, SessionConfig};
//!
//! struct EmptyRoot;
//! impl NodeOps for EmptyRoot {}
//!
//! let session = Session::mount(
//!     Arc::new(EmptyRoot),
//!     "/mnt/demo".as_ref(),
//!     &[MountOption::AutoUnmount],
//!     SessionConfig::default(),
//! )?;
//! session.run()?;
//! # Ok::<(), std::io::Error>(())
//! ```

#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

mod buffer;
mod channel;
mod handle;
mod ll;
mod mnt;
mod node;
mod passthrough;
mod request;
mod session;
mod tree;

pub use crate::buffer::MAX_WRITE_SIZE;
pub use crate::ll::fuse_abi::{FUSE_ROOT_ID, InitFlags, RenameFlags};
pub use crate::ll::{Errno, FileHandle, Generation, INodeNo, RequestId, TimeOrNow, Version};
pub use crate::mnt::MountOption;
pub use crate::node::{
    AttrOut, ChildNode, DirEntry, DirStream, EntryParams, FdPayload, FileAttr, FileLock,
    FileType, IoctlOut, NodeOps, OpContext, OpenedDir, OpenedFile, ReadResult, SetAttrChanges,
    StatfsOut, VecDirStream, XattrReply,
};
pub use crate::passthrough::BackingId;
pub use crate::session::{BackgroundSession, Session, SessionConfig};
pub use crate::tree::{ChildEntry, InodeTable, NodeRef, StableAttr};
