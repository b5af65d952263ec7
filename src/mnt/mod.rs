//! Mount helper interface.
//!
//! Mounting is delegated to the setuid fusermount binary: we invoke it with
//! the mount point and option string, and it hands the opened `/dev/fuse`
//! descriptor back over a socketpair. The core never opens the device
//! itself. Unmounting tries umount2(2) first and falls back to
//! `fusermount -u` for unprivileged users.

pub(crate) mod mount_options;

use std::ffi::OsStr;
use std::fs::File;
use std::io;
use std::io::{Error, ErrorKind};
use std::mem;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use libc::c_int;
use log::{debug, error};

pub use mount_options::MountOption;
use mount_options::{check_option_conflicts, option_to_string};

const FUSERMOUNT_BIN: &str = "fusermount";
const FUSERMOUNT3_BIN: &str = "fusermount3";
const FUSERMOUNT_COMM_ENV: &str = "_FUSE_COMMFD";

fn detect_fusermount_bin() -> String {
    if let Some(path) = std::env::var_os("FUSERMOUNT_PATH") {
        if let Some(path) = path.to_str() {
            return path.to_owned();
        }
    }
    for name in [
        FUSERMOUNT3_BIN.to_string(),
        FUSERMOUNT_BIN.to_string(),
        format!("/bin/{FUSERMOUNT3_BIN}"),
        format!("/bin/{FUSERMOUNT_BIN}"),
        format!("/sbin/{FUSERMOUNT3_BIN}"),
        format!("/sbin/{FUSERMOUNT_BIN}"),
    ] {
        if Command::new(&name).arg("-h").output().is_ok() {
            return name;
        }
    }
    // Default to fusermount3
    FUSERMOUNT3_BIN.to_string()
}

/// A live mount; unmounts on drop.
#[derive(Debug)]
pub(crate) struct Mount {
    mountpoint: PathBuf,
    /// Dup of the session fd, used to poll whether the mount is still up.
    fuse_device: OwnedFd,
    /// With `auto_unmount`, fusermount lingers and unmounts when this
    /// socket closes.
    auto_unmount_socket: Option<UnixStream>,
}

impl Mount {
    pub(crate) fn new(
        mountpoint: &Path,
        options: &[MountOption],
    ) -> io::Result<(OwnedFd, Mount)> {
        check_option_conflicts(options)?;
        let mountpoint = mountpoint.canonicalize()?;
        let (fd, sock) = mount_fusermount(&mountpoint, options)?;
        let fuse_device = fd.as_fd().try_clone_to_owned()?;
        Ok((
            fd,
            Mount {
                mountpoint,
                fuse_device,
                auto_unmount_socket: sock,
            },
        ))
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        if !is_mounted(&self.fuse_device) {
            // Already unmounted. Trying again could race a new filesystem
            // mounted at the same path.
            return;
        }
        if let Some(sock) = mem::take(&mut self.auto_unmount_socket) {
            drop(sock);
            // fusermount in auto-unmount mode, no more work to do.
            return;
        }
        if let Err(err) = unmount(&self.mountpoint) {
            error!("failed to unmount {}: {err}", self.mountpoint.display());
        }
    }
}

/// Invoke fusermount and receive the mounted descriptor over a socketpair.
fn mount_fusermount(
    mountpoint: &Path,
    options: &[MountOption],
) -> io::Result<(OwnedFd, Option<UnixStream>)> {
    let (child_socket, receive_socket) = UnixStream::pair()?;
    // The child's end must survive exec.
    unsafe {
        libc::fcntl(child_socket.as_raw_fd(), libc::F_SETFD, 0);
    }

    let mut builder = Command::new(detect_fusermount_bin());
    builder.stdout(Stdio::piped()).stderr(Stdio::piped());
    for option in options {
        builder.arg("-o").arg(option_to_string(option));
    }
    builder
        .arg("--")
        .arg(mountpoint)
        .env(FUSERMOUNT_COMM_ENV, child_socket.as_raw_fd().to_string());
    debug!("mounting via {builder:?}");

    let fusermount = builder.spawn()?;
    drop(child_socket);

    let file = match receive_fusermount_fd(&receive_socket) {
        Ok(file) => file,
        Err(err) => {
            // fusermount exits without sending anything when the mount
            // fails; surface its stderr instead of the socket EOF.
            let output = fusermount.wait_with_output()?;
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::other(format!(
                "fusermount failed: {} ({err})",
                stderr.trim()
            )));
        }
    };

    let output = fusermount.wait_with_output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::other(format!(
            "fusermount exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    debug!(
        "fusermount: {}",
        String::from_utf8_lossy(&output.stdout).trim()
    );

    let sock = if options.contains(&MountOption::AutoUnmount) {
        // Keep the socket around; closing it tells fusermount to unmount.
        Some(receive_socket)
    } else {
        None
    };
    Ok((file.into(), sock))
}

/// Receive the `/dev/fuse` fd fusermount sends via SCM_RIGHTS.
fn receive_fusermount_fd(socket: &UnixStream) -> io::Result<File> {
    let mut io_vec_buf = [0u8];
    let mut io_vec = libc::iovec {
        iov_base: io_vec_buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: io_vec_buf.len(),
    };
    let cmsg_buffer_len = unsafe { libc::CMSG_SPACE(mem::size_of::<c_int>() as libc::c_uint) };
    let mut cmsg_buffer = vec![0u8; cmsg_buffer_len as usize];
    let mut message: libc::msghdr = unsafe { mem::zeroed() };
    message.msg_iov = &mut io_vec;
    message.msg_iovlen = 1;
    message.msg_control = cmsg_buffer.as_mut_ptr() as *mut libc::c_void;
    message.msg_controllen = cmsg_buffer.len() as _;

    let rc = loop {
        let rc = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut message, 0) };
        if rc < 0 {
            let err = Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        break rc;
    };
    if rc == 0 {
        return Err(Error::new(
            ErrorKind::UnexpectedEof,
            "fusermount closed the socket before sending the fd",
        ));
    }

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&message) };
    if cmsg.is_null() {
        return Err(Error::other("no control message from fusermount"));
    }
    let cmsg = unsafe { &*cmsg };
    if cmsg.cmsg_level != libc::SOL_SOCKET || cmsg.cmsg_type != libc::SCM_RIGHTS {
        return Err(Error::other("unexpected control message from fusermount"));
    }
    let fd: RawFd = unsafe { *(libc::CMSG_DATA(cmsg) as *const c_int) };
    // stdin/stdout/stderr must stay reserved so subprocess fd remapping
    // cannot collide with the mount infrastructure.
    assert!(fd > 2, "fusermount returned a low fd ({fd})");
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Unmount a mount point.
pub(crate) fn unmount(mountpoint: &Path) -> io::Result<()> {
    match nix::mount::umount2(mountpoint, nix::mount::MntFlags::MNT_DETACH) {
        Ok(()) => return Ok(()),
        // Linux returns EPERM for non-root users; go through the
        // setuid fusermount instead.
        Err(nix::errno::Errno::EPERM) => {}
        Err(err) => return Err(err.into()),
    }

    let mut builder = Command::new(detect_fusermount_bin());
    builder.stdout(Stdio::piped()).stderr(Stdio::piped());
    builder
        .arg("-u")
        .arg("-q")
        .arg("-z")
        .arg("--")
        .arg(OsStr::new(mountpoint));
    let output = builder.output()?;
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::other(format!(
            "fusermount -u exited with {}: {}",
            output.status,
            stderr.trim()
        )))
    }
}

/// Whether the filesystem is still attached. Note this reports true for a
/// lazily-detached mount the kernel has not destroyed yet.
fn is_mounted(fuse_device: &OwnedFd) -> bool {
    use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

    loop {
        let mut poll_fd = PollFd::new(fuse_device.as_fd(), PollFlags::empty());
        let res = poll(std::slice::from_mut(&mut poll_fd), PollTimeout::ZERO);
        break match res {
            Ok(0) => true,
            Ok(1) => poll_fd
                .revents()
                .is_some_and(|r| r.contains(PollFlags::POLLERR)),
            Ok(_) => unreachable!(),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => {
                // The fd is owned and valid; poll only fails here if the
                // system is in serious trouble.
                panic!("poll on fuse device failed: {err}")
            }
        };
    }
}
