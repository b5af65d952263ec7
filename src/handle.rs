//! File handle table.
//!
//! Handles are minted on Open/Opendir/Create and owned by the session until
//! Release/Releasedir. The table is a concurrent map so handlers on
//! different reader threads can open and release without a shared lock.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::ll::{FileHandle, INodeNo};
use crate::passthrough::BackingId;

#[derive(Debug)]
pub(crate) struct HandleEntry {
    pub(crate) ino: INodeNo,
    pub(crate) dir: bool,
    /// Keeps the passthrough registration alive for the duration of the
    /// open; dropping the entry unregisters it.
    pub(crate) backing: Option<BackingId>,
}

#[derive(Debug)]
pub(crate) struct HandleTable {
    map: DashMap<u64, HandleEntry>,
    next: AtomicU64,
}

impl HandleTable {
    pub(crate) fn new() -> Self {
        HandleTable {
            map: DashMap::new(),
            next: AtomicU64::new(1),
        }
    }

    pub(crate) fn mint(&self, entry: HandleEntry) -> FileHandle {
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        self.map.insert(fh, entry);
        FileHandle(fh)
    }

    pub(crate) fn release(&self, fh: FileHandle) -> Option<HandleEntry> {
        self.map.remove(&fh.0).map(|(_, entry)| entry)
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    /// Drop every handle (session shutdown). Backing registrations are
    /// released as the entries drop.
    pub(crate) fn clear(&self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_release_cycle() {
        let t = HandleTable::new();
        let fh = t.mint(HandleEntry {
            ino: INodeNo(2),
            dir: false,
            backing: None,
        });
        let fh2 = t.mint(HandleEntry {
            ino: INodeNo(2),
            dir: true,
            backing: None,
        });
        assert_ne!(fh, fh2);
        assert_eq!(t.len(), 2);

        let entry = t.release(fh).unwrap();
        assert_eq!(entry.ino, INodeNo(2));
        assert!(!entry.dir);
        assert!(t.release(fh).is_none());
        t.clear();
        assert_eq!(t.len(), 0);
    }
}
