//! The inode tree.
//!
//! The authoritative in-process picture of the mounted namespace: an arena of
//! inodes keyed by number, with (parent, name) edges between them. Hard links
//! give an inode several parent edges; directories have at most one.
//!
//! Every mutation of lookup counts and edges happens under one table-wide
//! lock, and reaping inspects the count under that same lock. A LOOKUP racing
//! a FORGET therefore either observes the inode before it is reaped (and
//! re-references it) or re-creates it afterwards; it can never resurrect a
//! half-freed node. User callbacks are never invoked with the lock held.

mod inode;

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::sync::Arc;

use parking_lot::Mutex;

pub use inode::StableAttr;
pub(crate) use inode::{ChildEdge, InodeData};

use crate::ll::fuse_abi::{FUSE_ROOT_ID, RenameFlags};
use crate::ll::{Errno, Generation, INodeNo};
use crate::node::{FileType, NodeOps};

/// A resolved inode: its stable identity plus the operations object.
#[derive(Clone)]
pub struct NodeRef {
    pub ino: INodeNo,
    pub generation: Generation,
    pub kind: FileType,
    pub ops: Arc<dyn NodeOps>,
}

impl std::fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRef")
            .field("ino", &self.ino)
            .field("generation", &self.generation)
            .field("kind", &self.kind)
            .finish()
    }
}

/// One directory entry as enumerated from a node's children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEntry {
    pub name: OsString,
    pub ino: INodeNo,
    pub kind: FileType,
}

struct TableInner {
    nodes: HashMap<u64, InodeData>,
    next_ino: u64,
    /// Generation of explicitly-numbered inodes at the time they were
    /// reaped. A number that comes back gets the next generation, so the
    /// kernel never confuses the two incarnations.
    retired: HashMap<u64, u64>,
}

impl TableInner {
    fn mint(&mut self, stable: StableAttr) -> (u64, u64) {
        if stable.ino == 0 {
            let ino = self.next_ino;
            self.next_ino += 1;
            (ino, 1)
        } else {
            let generation = self.retired.get(&stable.ino).map_or(1, |g| g + 1);
            (stable.ino, generation)
        }
    }
}

/// The inode table for one mounted session.
pub struct InodeTable {
    inner: Mutex<TableInner>,
}

impl std::fmt::Debug for InodeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InodeTable({} nodes)", self.inner.lock().nodes.len())
    }
}

impl InodeTable {
    /// Create a table holding only the root, which is persistent and never
    /// reaped while the session lives.
    pub fn new(root_ops: Arc<dyn NodeOps>) -> InodeTable {
        let mut root = InodeData::new(FUSE_ROOT_ID, 1, FileType::Directory, root_ops);
        root.persistent = true;
        let mut nodes = HashMap::new();
        nodes.insert(FUSE_ROOT_ID, root);
        InodeTable {
            inner: Mutex::new(TableInner {
                nodes,
                next_ino: FUSE_ROOT_ID + 1,
                retired: HashMap::new(),
            }),
        }
    }

    /// The pinned root node.
    pub fn root(&self) -> NodeRef {
        self.get(INodeNo::ROOT)
            .expect("root is never removed while the table exists")
    }

    /// Resolve a kernel node-ID. Present inodes are exactly those the kernel
    /// may still address: positive lookup count, pinned, or reachable from a
    /// static tree.
    pub fn get(&self, ino: INodeNo) -> Option<NodeRef> {
        let inner = self.inner.lock();
        inner.nodes.get(&ino.0).map(|d| NodeRef {
            ino: INodeNo(d.ino),
            generation: Generation(d.generation),
            kind: d.kind,
            ops: d.ops.clone(),
        })
    }

    /// Create an inode and bind it under `parent` without touching lookup
    /// counts. This is how static trees are assembled before (or while)
    /// serving; `persistent` edges pin both the binding and the node against
    /// reaping.
    pub fn attach(
        &self,
        parent: INodeNo,
        name: &OsStr,
        stable: StableAttr,
        ops: Arc<dyn NodeOps>,
        persistent: bool,
    ) -> Result<NodeRef, Errno> {
        let node = {
            let mut inner = self.inner.lock();
            let pdata = inner.nodes.get(&parent.0).ok_or(Errno::ENOENT)?;
            if !pdata.is_dir() {
                return Err(Errno::ENOTDIR);
            }
            if pdata.children.contains_key(name) {
                return Err(Errno::EEXIST);
            }
            let (ino, generation) = inner.mint(stable);
            if inner.nodes.contains_key(&ino) {
                return Err(Errno::EEXIST);
            }
            let mut data = InodeData::new(ino, generation, stable.kind, ops.clone());
            data.persistent = persistent;
            data.parents.insert((parent.0, name.to_os_string()));
            inner.nodes.insert(ino, data);
            Self::bind_edge(&mut inner, parent.0, name, ino, persistent);
            NodeRef {
                ino: INodeNo(ino),
                generation: Generation(generation),
                kind: stable.kind,
                ops,
            }
        };
        node.ops.on_add(node.ino);
        Ok(node)
    }

    /// Resolve or create the child `name` of `parent` and take one kernel
    /// reference on it.
    ///
    /// If the parent already binds that name to the same operations object
    /// (identity comparison) or the same explicit inode number, the existing
    /// inode wins. A binding to a different inode is stale: the old edge is
    /// detached (its target survives while the kernel still references it)
    /// and the name is rebound.
    pub(crate) fn lookup_or_create(
        &self,
        parent: INodeNo,
        name: &OsStr,
        stable: StableAttr,
        ops: Arc<dyn NodeOps>,
    ) -> Result<(NodeRef, bool), Errno> {
        let mut forgotten = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            Self::lookup_or_create_locked(&mut inner, parent, name, stable, ops, &mut forgotten)
        };
        for ops in forgotten {
            ops.on_forget();
        }
        if let Ok((node, true)) = &result {
            node.ops.on_add(node.ino);
        }
        result
    }

    fn lookup_or_create_locked(
        inner: &mut TableInner,
        parent: INodeNo,
        name: &OsStr,
        stable: StableAttr,
        ops: Arc<dyn NodeOps>,
        forgotten: &mut Vec<Arc<dyn NodeOps>>,
    ) -> Result<(NodeRef, bool), Errno> {
        let pdata = inner.nodes.get(&parent.0).ok_or(Errno::ENOENT)?;
        if !pdata.is_dir() {
            return Err(Errno::ENOTDIR);
        }

        if let Some(edge) = pdata.children.get(name).copied() {
            let same = match inner.nodes.get(&edge.ino) {
                Some(cdata) => {
                    (stable.ino != 0 && stable.ino == edge.ino) || Arc::ptr_eq(&cdata.ops, &ops)
                }
                None => false,
            };
            if same {
                let cdata = inner.nodes.get_mut(&edge.ino).ok_or(Errno::ENOENT)?;
                cdata.lookup += 1;
                return Ok((
                    NodeRef {
                        ino: INodeNo(cdata.ino),
                        generation: Generation(cdata.generation),
                        kind: cdata.kind,
                        ops: cdata.ops.clone(),
                    },
                    false,
                ));
            }
            // The name now resolves elsewhere; drop the stale edge.
            Self::unbind_edge(inner, parent.0, name, edge.ino);
            Self::try_reap(inner, edge.ino, forgotten);
        }

        // An existing inode found under a new name: a hard link.
        if stable.ino != 0 && inner.nodes.contains_key(&stable.ino) {
            let cdata = inner.nodes.get_mut(&stable.ino).ok_or(Errno::ENOENT)?;
            if cdata.is_dir() && !cdata.parents.is_empty() {
                return Err(Errno::EPERM);
            }
            cdata.lookup += 1;
            cdata.parents.insert((parent.0, name.to_os_string()));
            let node = NodeRef {
                ino: INodeNo(cdata.ino),
                generation: Generation(cdata.generation),
                kind: cdata.kind,
                ops: cdata.ops.clone(),
            };
            Self::bind_edge(inner, parent.0, name, stable.ino, false);
            return Ok((node, false));
        }

        let (ino, generation) = inner.mint(stable);
        if inner.nodes.contains_key(&ino) {
            return Err(Errno::EEXIST);
        }
        let mut data = InodeData::new(ino, generation, stable.kind, ops);
        data.lookup = 1;
        data.parents.insert((parent.0, name.to_os_string()));
        let node = NodeRef {
            ino: INodeNo(ino),
            generation: Generation(generation),
            kind: stable.kind,
            ops: data.ops.clone(),
        };
        inner.nodes.insert(ino, data);
        Self::bind_edge(inner, parent.0, name, ino, false);
        Ok((node, true))
    }

    /// Take one additional kernel reference (READDIRPLUS entries, LINK
    /// replies). Returns false if the inode is gone.
    pub(crate) fn retain(&self, ino: INodeNo) -> bool {
        let mut inner = self.inner.lock();
        match inner.nodes.get_mut(&ino.0) {
            Some(data) => {
                data.lookup += 1;
                true
            }
            None => false,
        }
    }

    /// Drop `nlookup` kernel references. A count of zero is a no-op and an
    /// unknown node-ID is silently ignored; FORGET must never fail the
    /// session. Reaping cascades to transiently-bound children that become
    /// unreachable.
    pub fn forget(&self, ino: INodeNo, nlookup: u64) {
        let mut forgotten = Vec::new();
        {
            let mut inner = self.inner.lock();
            let Some(data) = inner.nodes.get_mut(&ino.0) else {
                return;
            };
            data.lookup = data.lookup.saturating_sub(nlookup);
            if data.lookup == 0 {
                Self::try_reap(&mut inner, ino.0, &mut forgotten);
            }
        }
        for ops in forgotten {
            ops.on_forget();
        }
    }

    /// Bind an existing inode as a child under a new name (LINK, and the
    /// overwrite half of RENAME).
    pub fn add_child(
        &self,
        parent: INodeNo,
        name: &OsStr,
        child: INodeNo,
        persistent: bool,
        overwrite: bool,
    ) -> Result<(), Errno> {
        let mut forgotten = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            Self::add_child_locked(
                &mut inner,
                parent,
                name,
                child,
                persistent,
                overwrite,
                &mut forgotten,
            )
        };
        for ops in forgotten {
            ops.on_forget();
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn add_child_locked(
        inner: &mut TableInner,
        parent: INodeNo,
        name: &OsStr,
        child: INodeNo,
        persistent: bool,
        overwrite: bool,
        forgotten: &mut Vec<Arc<dyn NodeOps>>,
    ) -> Result<(), Errno> {
        let pdata = inner.nodes.get(&parent.0).ok_or(Errno::ENOENT)?;
        if !pdata.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        let existing = pdata.children.get(name).copied();
        if existing.is_some() && !overwrite {
            return Err(Errno::EEXIST);
        }
        let cdata = inner.nodes.get_mut(&child.0).ok_or(Errno::ENOENT)?;
        if cdata.is_dir() && !cdata.parents.is_empty() {
            return Err(Errno::EPERM);
        }
        cdata.parents.insert((parent.0, name.to_os_string()));
        if persistent {
            cdata.persistent = true;
        }
        if let Some(old) = existing {
            if old.ino != child.0 {
                Self::unbind_edge(inner, parent.0, name, old.ino);
                Self::try_reap(inner, old.ino, forgotten);
            }
        }
        Self::bind_edge(inner, parent.0, name, child.0, persistent);
        Ok(())
    }

    /// Remove the edge `parent/name`. A hard-linked target survives through
    /// its other names; otherwise the target follows the usual reaping rule.
    pub fn rm_child(&self, parent: INodeNo, name: &OsStr) -> Result<(), Errno> {
        let mut forgotten = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            let pdata = inner.nodes.get(&parent.0).ok_or(Errno::ENOENT)?;
            if !pdata.is_dir() {
                return Err(Errno::ENOTDIR);
            }
            match pdata.children.get(name).copied() {
                Some(edge) => {
                    Self::unbind_edge(&mut inner, parent.0, name, edge.ino);
                    Self::try_reap(&mut inner, edge.ino, &mut forgotten);
                    Ok(())
                }
                None => Err(Errno::ENOENT),
            }
        };
        for ops in forgotten {
            ops.on_forget();
        }
        result
    }

    /// Move or exchange a name, atomically under the tree lock.
    pub fn mv_child(
        &self,
        parent: INodeNo,
        name: &OsStr,
        new_parent: INodeNo,
        new_name: &OsStr,
        flags: RenameFlags,
    ) -> Result<(), Errno> {
        let mut forgotten = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            if flags.contains(RenameFlags::EXCHANGE) {
                Self::exchange_locked(&mut inner, parent, name, new_parent, new_name)
            } else {
                Self::move_locked(
                    &mut inner,
                    parent,
                    name,
                    new_parent,
                    new_name,
                    flags.contains(RenameFlags::NOREPLACE),
                    &mut forgotten,
                )
            }
        };
        for ops in forgotten {
            ops.on_forget();
        }
        result
    }

    fn move_locked(
        inner: &mut TableInner,
        parent: INodeNo,
        name: &OsStr,
        new_parent: INodeNo,
        new_name: &OsStr,
        noreplace: bool,
        forgotten: &mut Vec<Arc<dyn NodeOps>>,
    ) -> Result<(), Errno> {
        let pdata = inner.nodes.get(&parent.0).ok_or(Errno::ENOENT)?;
        let src = pdata.children.get(name).copied().ok_or(Errno::ENOENT)?;
        let npdata = inner.nodes.get(&new_parent.0).ok_or(Errno::ENOENT)?;
        if !npdata.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        if let Some(dst) = npdata.children.get(new_name).copied() {
            if noreplace {
                return Err(Errno::EEXIST);
            }
            if parent == new_parent && name == new_name {
                return Ok(());
            }
            Self::unbind_edge(inner, new_parent.0, new_name, dst.ino);
            Self::try_reap(inner, dst.ino, forgotten);
        }
        Self::unbind_edge(inner, parent.0, name, src.ino);
        if let Some(cdata) = inner.nodes.get_mut(&src.ino) {
            cdata.parents.insert((new_parent.0, new_name.to_os_string()));
        }
        Self::bind_edge(inner, new_parent.0, new_name, src.ino, src.persistent);
        Ok(())
    }

    fn exchange_locked(
        inner: &mut TableInner,
        parent: INodeNo,
        name: &OsStr,
        new_parent: INodeNo,
        new_name: &OsStr,
    ) -> Result<(), Errno> {
        let pdata = inner.nodes.get(&parent.0).ok_or(Errno::ENOENT)?;
        let a = pdata.children.get(name).copied().ok_or(Errno::ENOENT)?;
        let npdata = inner.nodes.get(&new_parent.0).ok_or(Errno::ENOENT)?;
        let b = npdata.children.get(new_name).copied().ok_or(Errno::ENOENT)?;
        if parent == new_parent && name == new_name {
            return Ok(());
        }
        // Swap the two targets; lookup counts are untouched and nothing is
        // reaped because both inodes stay bound.
        if let Some(adata) = inner.nodes.get_mut(&a.ino) {
            adata.parents.remove(&(parent.0, name.to_os_string()));
            adata.parents.insert((new_parent.0, new_name.to_os_string()));
        }
        if let Some(bdata) = inner.nodes.get_mut(&b.ino) {
            bdata.parents.remove(&(new_parent.0, new_name.to_os_string()));
            bdata.parents.insert((parent.0, name.to_os_string()));
        }
        if let Some(pdata) = inner.nodes.get_mut(&parent.0) {
            if let Some(slot) = pdata.children.get_mut(name) {
                *slot = b;
            }
        }
        if let Some(npdata) = inner.nodes.get_mut(&new_parent.0) {
            if let Some(slot) = npdata.children.get_mut(new_name) {
                *slot = a;
            }
        }
        Ok(())
    }

    /// Snapshot a directory's children in insertion order. Two snapshots of
    /// the same directory state enumerate identically, which keeps
    /// concurrent READDIR cursors deterministic.
    pub fn children(&self, ino: INodeNo) -> Result<Vec<ChildEntry>, Errno> {
        let inner = self.inner.lock();
        let data = inner.nodes.get(&ino.0).ok_or(Errno::ENOENT)?;
        if !data.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        Ok(data
            .children
            .iter()
            .filter_map(|(name, edge)| {
                inner.nodes.get(&edge.ino).map(|cdata| ChildEntry {
                    name: name.clone(),
                    ino: INodeNo(edge.ino),
                    kind: cdata.kind,
                })
            })
            .collect())
    }

    /// Number of live inodes, root included.
    pub fn len(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// Current kernel reference count, if the inode is live.
    pub fn lookup_count(&self, ino: INodeNo) -> Option<u64> {
        self.inner.lock().nodes.get(&ino.0).map(|d| d.lookup)
    }

    pub fn contains(&self, ino: INodeNo) -> bool {
        self.inner.lock().nodes.contains_key(&ino.0)
    }

    /// Drop every inode. Used at session teardown, after the kernel can no
    /// longer address anything.
    pub(crate) fn clear(&self) {
        let forgotten: Vec<Arc<dyn NodeOps>> = {
            let mut inner = self.inner.lock();
            inner.nodes.drain().map(|(_, d)| d.ops).collect()
        };
        for ops in forgotten {
            ops.on_forget();
        }
    }

    fn bind_edge(inner: &mut TableInner, parent: u64, name: &OsStr, child: u64, persistent: bool) {
        if let Some(pdata) = inner.nodes.get_mut(&parent) {
            pdata.children.insert(
                name.to_os_string(),
                ChildEdge {
                    ino: child,
                    persistent,
                },
            );
        }
    }

    fn unbind_edge(inner: &mut TableInner, parent: u64, name: &OsStr, child: u64) {
        if let Some(pdata) = inner.nodes.get_mut(&parent) {
            if pdata.children.get(name).is_some_and(|e| e.ino == child) {
                pdata.children.shift_remove(name);
            }
        }
        if let Some(cdata) = inner.nodes.get_mut(&child) {
            cdata.parents.remove(&(parent, name.to_os_string()));
        }
    }

    /// Remove an inode if nothing keeps it alive: zero lookups, not
    /// persistent, no persistent bindings in either direction. Transient
    /// parent edges are dropped, children are orphaned (they live on their
    /// own lookup counts), and the sweep continues through anything that
    /// became unreferenced.
    fn try_reap(inner: &mut TableInner, ino: u64, forgotten: &mut Vec<Arc<dyn NodeOps>>) {
        let mut queue = vec![ino];
        while let Some(ino) = queue.pop() {
            if ino == FUSE_ROOT_ID {
                continue;
            }
            let Some(node) = inner.nodes.get(&ino) else {
                continue;
            };
            if node.lookup > 0 || node.persistent {
                continue;
            }
            if node.children.values().any(|e| e.persistent) {
                continue;
            }
            let parent_edges: Vec<(u64, OsString)> = node.parents.iter().cloned().collect();
            let pinned = parent_edges.iter().any(|(p, name)| {
                inner
                    .nodes
                    .get(p)
                    .and_then(|pd| pd.children.get(name.as_os_str()))
                    .is_some_and(|e| e.persistent && e.ino == ino)
            });
            if pinned {
                continue;
            }
            for (p, name) in &parent_edges {
                if let Some(pd) = inner.nodes.get_mut(p) {
                    if pd.children.get(name.as_os_str()).is_some_and(|e| e.ino == ino) {
                        pd.children.shift_remove(name.as_os_str());
                    }
                }
            }
            let children: Vec<(OsString, ChildEdge)> = match inner.nodes.get_mut(&ino) {
                Some(node) => {
                    node.parents.clear();
                    node.children.drain(..).collect()
                }
                None => continue,
            };
            for (name, edge) in &children {
                if let Some(cd) = inner.nodes.get_mut(&edge.ino) {
                    cd.parents.remove(&(ino, name.clone()));
                }
                queue.push(edge.ino);
            }
            if let Some(data) = inner.nodes.remove(&ino) {
                inner.retired.insert(ino, data.generation);
                forgotten.push(data.ops);
            }
            // A parent that just lost its last child may itself be ready.
            for (p, _) in parent_edges {
                queue.push(p);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct TestNode {
        forgotten: AtomicUsize,
    }

    impl NodeOps for TestNode {
        fn on_forget(&self) {
            self.forgotten.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn dir() -> StableAttr {
        StableAttr::new(FileType::Directory)
    }

    fn file() -> StableAttr {
        StableAttr::new(FileType::RegularFile)
    }

    fn table() -> InodeTable {
        InodeTable::new(Arc::new(TestNode::default()))
    }

    #[test]
    fn root_is_node_one_and_pinned() {
        let t = table();
        assert_eq!(t.root().ino, INodeNo::ROOT);
        t.forget(INodeNo::ROOT, 100);
        assert!(t.contains(INodeNo::ROOT));
    }

    #[test]
    fn lookup_increments_and_repeated_lookup_reuses() {
        let t = table();
        let ops: Arc<dyn NodeOps> = Arc::new(TestNode::default());
        let (a, is_new) = t
            .lookup_or_create(INodeNo::ROOT, OsStr::new("a"), dir(), ops.clone())
            .unwrap();
        assert!(is_new);
        assert_eq!(t.lookup_count(a.ino), Some(1));

        let (a2, is_new) = t
            .lookup_or_create(INodeNo::ROOT, OsStr::new("a"), dir(), ops)
            .unwrap();
        assert!(!is_new);
        assert_eq!(a2.ino, a.ino);
        assert_eq!(t.lookup_count(a.ino), Some(2));
    }

    #[test]
    fn persistent_tree_survives_forget_at_zero() {
        // Mirrors a static mount of /a/b: nodes stay in-table at lookup 0.
        let t = table();
        let a = t
            .attach(
                INodeNo::ROOT,
                OsStr::new("a"),
                dir(),
                Arc::new(TestNode::default()),
                true,
            )
            .unwrap();
        let b = t
            .attach(
                a.ino,
                OsStr::new("b"),
                file(),
                Arc::new(TestNode::default()),
                true,
            )
            .unwrap();

        let (a2, _) = t
            .lookup_or_create(INodeNo::ROOT, OsStr::new("a"), dir(), a.ops.clone())
            .unwrap();
        assert_eq!(a2.ino, a.ino);
        let (b2, _) = t
            .lookup_or_create(a.ino, OsStr::new("b"), file(), b.ops.clone())
            .unwrap();
        assert_eq!(b2.ino, b.ino);
        assert_eq!(t.lookup_count(a.ino), Some(1));
        assert_eq!(t.lookup_count(b.ino), Some(1));

        t.forget(b.ino, 1);
        t.forget(a.ino, 1);
        assert!(t.contains(a.ino));
        assert!(t.contains(b.ino));
        assert_eq!(t.lookup_count(a.ino), Some(0));
        assert_eq!(t.lookup_count(b.ino), Some(0));
    }

    #[test]
    fn dynamic_tree_reaps_on_forget() {
        let t = table();
        let (a, _) = t
            .lookup_or_create(
                INodeNo::ROOT,
                OsStr::new("a"),
                dir(),
                Arc::new(TestNode::default()),
            )
            .unwrap();
        let (b, _) = t
            .lookup_or_create(a.ino, OsStr::new("b"), file(), Arc::new(TestNode::default()))
            .unwrap();

        t.forget(b.ino, 1);
        assert!(!t.contains(b.ino));
        t.forget(a.ino, 1);
        assert!(!t.contains(a.ino));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn forget_is_tolerant() {
        let t = table();
        // n = 0 and unknown node-IDs are no-ops.
        t.forget(INodeNo(999), 5);
        let (a, _) = t
            .lookup_or_create(
                INodeNo::ROOT,
                OsStr::new("a"),
                file(),
                Arc::new(TestNode::default()),
            )
            .unwrap();
        t.forget(a.ino, 0);
        assert!(t.contains(a.ino));
        t.forget(a.ino, 1);
        assert!(!t.contains(a.ino));
    }

    #[test]
    fn on_forget_fires_once_when_unreachable() {
        let t = table();
        let ops = Arc::new(TestNode::default());
        let (a, _) = t
            .lookup_or_create(INodeNo::ROOT, OsStr::new("a"), file(), ops.clone())
            .unwrap();
        assert_eq!(ops.forgotten.load(Ordering::SeqCst), 0);
        t.forget(a.ino, 1);
        assert_eq!(ops.forgotten.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hard_link_keeps_target_alive_after_rm_child() {
        let t = table();
        let (f, _) = t
            .lookup_or_create(
                INodeNo::ROOT,
                OsStr::new("x"),
                file(),
                Arc::new(TestNode::default()),
            )
            .unwrap();
        t.add_child(INodeNo::ROOT, OsStr::new("y"), f.ino, false, false)
            .unwrap();
        t.rm_child(INodeNo::ROOT, OsStr::new("x")).unwrap();
        // Still reachable through "y" and the kernel's reference.
        assert!(t.contains(f.ino));
        let names = t.children(INodeNo::ROOT).unwrap();
        assert_eq!(names.len(), 1);
        assert_eq!(names[0].name, "y");
    }

    #[test]
    fn add_child_respects_overwrite_flag() {
        let t = table();
        let (x, _) = t
            .lookup_or_create(
                INodeNo::ROOT,
                OsStr::new("x"),
                file(),
                Arc::new(TestNode::default()),
            )
            .unwrap();
        let (y, _) = t
            .lookup_or_create(
                INodeNo::ROOT,
                OsStr::new("y"),
                file(),
                Arc::new(TestNode::default()),
            )
            .unwrap();
        assert_eq!(
            t.add_child(INodeNo::ROOT, OsStr::new("x"), y.ino, false, false),
            Err(Errno::EEXIST)
        );
        t.add_child(INodeNo::ROOT, OsStr::new("x"), y.ino, false, true)
            .unwrap();
        // x's old target is still kernel-referenced, so it survives.
        assert!(t.contains(x.ino));
        t.forget(x.ino, 1);
        assert!(!t.contains(x.ino));
    }

    #[test]
    fn rename_exchange_swaps_targets_and_preserves_lookups() {
        let t = table();
        let (dir_a, _) = t
            .lookup_or_create(
                INodeNo::ROOT,
                OsStr::new("A"),
                dir(),
                Arc::new(TestNode::default()),
            )
            .unwrap();
        let (dir_b, _) = t
            .lookup_or_create(
                INodeNo::ROOT,
                OsStr::new("B"),
                dir(),
                Arc::new(TestNode::default()),
            )
            .unwrap();
        let (x, _) = t
            .lookup_or_create(dir_a.ino, OsStr::new("x"), file(), Arc::new(TestNode::default()))
            .unwrap();
        let (y, _) = t
            .lookup_or_create(dir_b.ino, OsStr::new("y"), file(), Arc::new(TestNode::default()))
            .unwrap();

        t.mv_child(
            dir_a.ino,
            OsStr::new("x"),
            dir_b.ino,
            OsStr::new("y"),
            RenameFlags::EXCHANGE,
        )
        .unwrap();

        let a_children = t.children(dir_a.ino).unwrap();
        let b_children = t.children(dir_b.ino).unwrap();
        assert_eq!(a_children[0].ino, y.ino);
        assert_eq!(b_children[0].ino, x.ino);
        assert_eq!(t.lookup_count(x.ino), Some(1));
        assert_eq!(t.lookup_count(y.ino), Some(1));
        assert!(t.contains(x.ino) && t.contains(y.ino));
    }

    #[test]
    fn rename_exchange_requires_both_names() {
        let t = table();
        let (_, _) = t
            .lookup_or_create(
                INodeNo::ROOT,
                OsStr::new("x"),
                file(),
                Arc::new(TestNode::default()),
            )
            .unwrap();
        assert_eq!(
            t.mv_child(
                INodeNo::ROOT,
                OsStr::new("x"),
                INodeNo::ROOT,
                OsStr::new("missing"),
                RenameFlags::EXCHANGE,
            ),
            Err(Errno::ENOENT)
        );
    }

    #[test]
    fn rename_overwrite_detaches_target() {
        let t = table();
        let (x, _) = t
            .lookup_or_create(
                INodeNo::ROOT,
                OsStr::new("x"),
                file(),
                Arc::new(TestNode::default()),
            )
            .unwrap();
        let (y, _) = t
            .lookup_or_create(
                INodeNo::ROOT,
                OsStr::new("y"),
                file(),
                Arc::new(TestNode::default()),
            )
            .unwrap();
        assert_eq!(
            t.mv_child(
                INodeNo::ROOT,
                OsStr::new("x"),
                INodeNo::ROOT,
                OsStr::new("y"),
                RenameFlags::NOREPLACE,
            ),
            Err(Errno::EEXIST)
        );
        t.mv_child(
            INodeNo::ROOT,
            OsStr::new("x"),
            INodeNo::ROOT,
            OsStr::new("y"),
            RenameFlags::empty(),
        )
        .unwrap();
        let children = t.children(INodeNo::ROOT).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].ino, x.ino);
        // The displaced target is still kernel-referenced.
        assert!(t.contains(y.ino));
        t.forget(y.ino, 1);
        assert!(!t.contains(y.ino));
    }

    #[test]
    fn stale_binding_is_replaced_by_new_attr() {
        let t = table();
        let old_ops: Arc<dyn NodeOps> = Arc::new(TestNode::default());
        let (old, _) = t
            .lookup_or_create(INodeNo::ROOT, OsStr::new("f"), file(), old_ops)
            .unwrap();
        // The same name now resolves to a different operations object.
        let new_ops: Arc<dyn NodeOps> = Arc::new(TestNode::default());
        let (new, is_new) = t
            .lookup_or_create(INodeNo::ROOT, OsStr::new("f"), file(), new_ops)
            .unwrap();
        assert!(is_new);
        assert_ne!(new.ino, old.ino);
        // The old inode is detached but not destroyed: the kernel still
        // holds a reference from the first lookup.
        assert!(t.contains(old.ino));
        assert_eq!(t.lookup_count(old.ino), Some(1));
        t.forget(old.ino, 1);
        assert!(!t.contains(old.ino));
    }

    #[test]
    fn explicit_ino_reuse_bumps_generation() {
        let t = table();
        let stable = StableAttr::with_ino(FileType::RegularFile, 777);
        let (first, _) = t
            .lookup_or_create(
                INodeNo::ROOT,
                OsStr::new("f"),
                stable,
                Arc::new(TestNode::default()),
            )
            .unwrap();
        assert_eq!(first.generation, Generation(1));
        t.forget(first.ino, 1);
        assert!(!t.contains(first.ino));

        let (second, _) = t
            .lookup_or_create(
                INodeNo::ROOT,
                OsStr::new("f"),
                stable,
                Arc::new(TestNode::default()),
            )
            .unwrap();
        assert_eq!(second.ino, first.ino);
        assert_eq!(second.generation, Generation(2));
    }

    #[test]
    fn children_enumeration_is_insertion_ordered() {
        let t = table();
        for name in ["zeta", "alpha", "mid"] {
            t.lookup_or_create(
                INodeNo::ROOT,
                OsStr::new(name),
                file(),
                Arc::new(TestNode::default()),
            )
            .unwrap();
        }
        let names: Vec<_> = t
            .children(INodeNo::ROOT)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["zeta", "alpha", "mid"]);
        // A second snapshot of the same state enumerates identically.
        let again: Vec<_> = t
            .children(INodeNo::ROOT)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, again);
    }

    #[test]
    fn back_edges_stay_consistent() {
        let t = table();
        let (a, _) = t
            .lookup_or_create(
                INodeNo::ROOT,
                OsStr::new("a"),
                dir(),
                Arc::new(TestNode::default()),
            )
            .unwrap();
        let (f, _) = t
            .lookup_or_create(a.ino, OsStr::new("f"), file(), Arc::new(TestNode::default()))
            .unwrap();
        {
            let inner = t.inner.lock();
            let fdata = inner.nodes.get(&f.ino.0).unwrap();
            assert!(fdata.parents.contains(&(a.ino.0, "f".into())));
            let adata = inner.nodes.get(&a.ino.0).unwrap();
            assert_eq!(adata.children.get(OsStr::new("f")).unwrap().ino, f.ino.0);
        }
        t.mv_child(
            a.ino,
            OsStr::new("f"),
            INodeNo::ROOT,
            OsStr::new("g"),
            RenameFlags::empty(),
        )
        .unwrap();
        {
            let inner = t.inner.lock();
            let fdata = inner.nodes.get(&f.ino.0).unwrap();
            assert!(fdata.parents.contains(&(FUSE_ROOT_ID, "g".into())));
            assert!(!fdata.parents.contains(&(a.ino.0, "f".into())));
        }
    }

    #[test]
    fn concurrent_lookup_and_forget_nets_out() {
        use std::thread;

        let t = Arc::new(table());
        let ops: Arc<dyn NodeOps> = Arc::new(TestNode::default());
        // Seed with enough references that the forget threads can never
        // drive the count to zero while lookups are still in flight.
        let (node, _) = t
            .lookup_or_create(INodeNo::ROOT, OsStr::new("c"), file(), ops.clone())
            .unwrap();
        for _ in 0..49 {
            t.lookup_or_create(INodeNo::ROOT, OsStr::new("c"), file(), ops.clone())
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let t = Arc::clone(&t);
            let ops = ops.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    t.lookup_or_create(INodeNo::ROOT, OsStr::new("c"), file(), ops.clone())
                        .unwrap();
                }
            }));
        }
        for _ in 0..4 {
            let t = Arc::clone(&t);
            let ino = node.ino;
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    t.forget(ino, 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // 50 seed + 400 lookups - 400 forgets
        assert_eq!(t.lookup_count(node.ino), Some(50));
        t.forget(node.ino, 50);
        assert!(!t.contains(node.ino));
    }
}
