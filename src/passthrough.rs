//! Passthrough backing registration.
//!
//! With `FUSE_PASSTHROUGH` negotiated, an open reply can point the kernel at
//! a backing file descriptor; reads and writes then run in the kernel
//! against that fd, never reaching the server.

use std::os::fd::AsFd;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Weak};

use log::error;

use crate::channel::DeviceFd;
use crate::ll::fuse_abi::fuse_backing_map;
use crate::ll::ioctl::{fuse_dev_ioc_backing_close, fuse_dev_ioc_backing_open};

/// A registered passthrough backing file.
///
/// Created with [`OpContext::open_backing`](crate::OpContext::open_backing)
/// and returned to the kernel inside an [`OpenedFile`](crate::OpenedFile).
/// The registration lives until this value drops, which issues the matching
/// close ioctl; keep it in your per-open state so userspace access does not
/// hit a dangling backing (the session's handle table does this for you when
/// the ID is part of an open reply).
#[derive(Debug)]
pub struct BackingId {
    device: Weak<DeviceFd>,
    backing_id: u32,
}

impl BackingId {
    pub(crate) fn create(device: &Arc<DeviceFd>, fd: impl AsFd) -> std::io::Result<Self> {
        if !cfg!(target_os = "linux") {
            return Err(std::io::Error::other(
                "passthrough backing is only supported on Linux",
            ));
        }
        let map = fuse_backing_map {
            fd: fd.as_fd().as_raw_fd() as u32,
            flags: 0,
            padding: 0,
        };
        let id = unsafe { fuse_dev_ioc_backing_open(device.as_raw_fd(), &map) }?;
        Ok(BackingId {
            device: Arc::downgrade(device),
            backing_id: id as u32,
        })
    }

    pub(crate) fn id(&self) -> u32 {
        self.backing_id
    }
}

impl Drop for BackingId {
    fn drop(&mut self) {
        if let Some(device) = self.device.upgrade() {
            if let Err(e) =
                unsafe { fuse_dev_ioc_backing_close(device.as_raw_fd(), &self.backing_id) }
            {
                error!("failed to close backing id {}: {e}", self.backing_id);
            }
        }
    }
}
