//! Ioctls on the `/dev/fuse` device.
//!
//! `FUSE_DEV_IOC_CLONE` attaches another descriptor to an existing session so
//! multiple readers can pull requests in parallel. The backing-open/close
//! pair registers file descriptors for passthrough I/O.

use nix::{ioctl_read, ioctl_write_ptr};

use super::fuse_abi::fuse_backing_map;

const FUSE_DEV_IOC_MAGIC: u8 = 229;

ioctl_read!(fuse_dev_ioc_clone, FUSE_DEV_IOC_MAGIC, 0, u32);
ioctl_write_ptr!(
    fuse_dev_ioc_backing_open,
    FUSE_DEV_IOC_MAGIC,
    1,
    fuse_backing_map
);
ioctl_write_ptr!(fuse_dev_ioc_backing_close, FUSE_DEV_IOC_MAGIC, 2, u32);
