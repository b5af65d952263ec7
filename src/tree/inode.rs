//! Per-inode record kept inside the tree's arena.

use std::collections::HashSet;
use std::ffi::OsString;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::node::{FileType, NodeOps};

/// The identity of an inode that never changes once assigned: number,
/// generation, and file type.
///
/// Pass `ino: 0` to have the tree mint a fresh number; a non-zero value pins
/// the number (useful for filesystems that mirror an external identity
/// space). Generation is always assigned by the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StableAttr {
    pub ino: u64,
    pub kind: FileType,
}

impl StableAttr {
    pub fn new(kind: FileType) -> Self {
        StableAttr { ino: 0, kind }
    }

    pub fn with_ino(kind: FileType, ino: u64) -> Self {
        StableAttr { ino, kind }
    }
}

/// One name binding inside a directory. Persistent edges are part of a
/// static tree and pin their target; transient edges are discovery cache
/// created by lookups and die with the kernel's interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChildEdge {
    pub(crate) ino: u64,
    pub(crate) persistent: bool,
}

pub(crate) struct InodeData {
    pub(crate) ino: u64,
    pub(crate) generation: u64,
    pub(crate) kind: FileType,
    /// Kernel-held reference count, maintained by LOOKUP-class replies and
    /// FORGET. The kernel may only address this inode while it is positive
    /// (the root is pinned regardless).
    pub(crate) lookup: u64,
    pub(crate) persistent: bool,
    /// Name -> child, in insertion order so enumeration is deterministic.
    pub(crate) children: IndexMap<OsString, ChildEdge>,
    /// Reverse edges; a set because hard links give a file several names.
    /// Directories have at most one parent.
    pub(crate) parents: HashSet<(u64, OsString)>,
    pub(crate) ops: Arc<dyn NodeOps>,
}

impl InodeData {
    pub(crate) fn new(
        ino: u64,
        generation: u64,
        kind: FileType,
        ops: Arc<dyn NodeOps>,
    ) -> InodeData {
        InodeData {
            ino,
            generation,
            kind,
            lookup: 0,
            persistent: false,
            children: IndexMap::new(),
            parents: HashSet::new(),
            ops,
        }
    }

    pub(crate) fn is_dir(&self) -> bool {
        self.kind == FileType::Directory
    }
}

impl std::fmt::Debug for InodeData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeData")
            .field("ino", &self.ino)
            .field("generation", &self.generation)
            .field("kind", &self.kind)
            .field("lookup", &self.lookup)
            .field("persistent", &self.persistent)
            .field("children", &self.children.len())
            .field("parents", &self.parents.len())
            .finish()
    }
}
