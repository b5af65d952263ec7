//! FUSE kernel driver communication.
//!
//! A `Channel` wraps one descriptor on `/dev/fuse`. Requests are read with
//! plain blocking reads; replies go out as a single writev (or a splice
//! sequence for fd-backed payloads) so each reply hits the device atomically.

use std::io;
use std::io::IoSlice;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::io::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::error;
use nix::fcntl::{FcntlArg, SpliceFFlags};
use zerocopy::IntoBytes;

use crate::ll::RequestId;
use crate::ll::fuse_abi as abi;
use crate::ll::ioctl::fuse_dev_ioc_clone;
use crate::node::FdPayload;
use crate::request::ReplySender;

const FUSE_DEV_NAME: &str = "/dev/fuse";

/// The session's descriptor on `/dev/fuse`, shared between readers, reply
/// writers and passthrough registration. Close is idempotent so shutdown can
/// release the fd while clones of the handle still exist.
pub(crate) struct DeviceFd {
    fd: RawFd,
    closed: AtomicBool,
}

impl DeviceFd {
    pub(crate) fn new(fd: OwnedFd) -> Self {
        DeviceFd {
            fd: fd.into_raw_fd(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

impl Drop for DeviceFd {
    fn drop(&mut self) {
        self.close();
    }
}

impl AsRawFd for DeviceFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl AsFd for DeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        unsafe { BorrowedFd::borrow_raw(self.fd) }
    }
}

impl std::fmt::Debug for DeviceFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceFd({})", self.fd)
    }
}

/// A raw communication channel to the FUSE kernel driver.
#[derive(Debug, Clone)]
pub(crate) struct Channel(Arc<DeviceFd>);

impl Channel {
    pub(crate) fn new(device: Arc<DeviceFd>) -> Self {
        Channel(device)
    }

    /// Open another descriptor on the device and attach it to this session,
    /// so an additional reader can pull requests in parallel.
    /// See <https://john-millikin.com/the-fuse-protocol#multi-threading>.
    pub(crate) fn clone_worker(&self) -> io::Result<Channel> {
        let file = match std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(FUSE_DEV_NAME)
        {
            Ok(file) => file,
            Err(err) => {
                if err.kind() == io::ErrorKind::NotFound {
                    error!("{} not found. Try 'modprobe fuse'", FUSE_DEV_NAME);
                }
                return Err(err);
            }
        };
        let fd: OwnedFd = file.into();
        nix::fcntl::fcntl(&fd, FcntlArg::F_SETFD(nix::fcntl::FdFlag::FD_CLOEXEC))?;
        let mut session_fd = self.0.as_raw_fd() as u32;
        unsafe { fuse_dev_ioc_clone(fd.as_raw_fd(), &mut session_fd) }?;
        Ok(Channel(Arc::new(DeviceFd::new(fd))))
    }

    /// Blocking read of one request. Returns the number of bytes received.
    /// Error classification (EINTR retry, ENODEV shutdown) is the caller's.
    pub(crate) fn receive(&self, buffer: &mut [u8]) -> io::Result<usize> {
        let rc = unsafe {
            libc::read(
                self.0.as_raw_fd(),
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
            )
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }

    /// Write one reply as a single vectored write. The kernel requires each
    /// reply to arrive whole; a short write leaves the stream unframed, so it
    /// is reported as an error and the session must come down.
    pub(crate) fn send_iovec(&self, iov: &[IoSlice<'_>]) -> io::Result<()> {
        let total: usize = iov.iter().map(|s| s.len()).sum();
        let rc = unsafe {
            libc::writev(
                self.0.as_raw_fd(),
                iov.as_ptr() as *const libc::iovec,
                iov.len() as libc::c_int,
            )
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else if rc as usize != total {
            Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "partial reply write to fuse device",
            ))
        } else {
            Ok(())
        }
    }

    /// Zero-copy reply for fd-backed read payloads: the header and the file
    /// span are staged in a pipe, then the pipe is spliced to the device in
    /// one call. Any failure is returned so the caller can fall back to a
    /// buffered reply.
    pub(crate) fn send_spliced(&self, unique: RequestId, payload: &FdPayload) -> io::Result<()> {
        let header = abi::fuse_out_header {
            len: (size_of::<abi::fuse_out_header>() + payload.len as usize) as u32,
            error: 0,
            unique: unique.0,
        };
        let total = header.len as usize;

        let (pipe_r, pipe_w) = nix::unistd::pipe()?;
        if total > 64 * 1024 {
            // Default pipe capacity is 64k; the whole reply must fit so the
            // final splice is one atomic write.
            nix::fcntl::fcntl(&pipe_w, FcntlArg::F_SETPIPE_SZ(total as libc::c_int))?;
        }

        let written = nix::unistd::write(&pipe_w, header.as_bytes())?;
        if written != header.as_bytes().len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "short header write into splice pipe",
            ));
        }

        let mut off = payload.offset as i64;
        let mut remaining = payload.len as usize;
        while remaining > 0 {
            let n = nix::fcntl::splice(
                payload.file.as_fd(),
                Some(&mut off),
                pipe_w.as_fd(),
                None,
                remaining,
                SpliceFFlags::SPLICE_F_MOVE,
            )?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "backing file shorter than read reply",
                ));
            }
            remaining -= n;
        }

        let n = nix::fcntl::splice(
            pipe_r.as_fd(),
            None,
            self.0.as_fd(),
            None,
            total,
            SpliceFFlags::SPLICE_F_MOVE,
        )?;
        if n != total {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "partial spliced reply to fuse device",
            ));
        }
        Ok(())
    }
}

impl ReplySender for Channel {
    fn send(&self, iov: &[IoSlice<'_>]) -> io::Result<()> {
        self.send_iovec(iov)
    }

    fn send_fd(&self, unique: RequestId, payload: &FdPayload) -> io::Result<()> {
        self.send_spliced(unique, payload)
    }
}
