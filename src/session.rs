//! Filesystem session.
//!
//! A session owns the mount descriptor and runs the serve loop: reader
//! threads pull requests off the device, dispatch them, and write replies.
//! The session also performs the INIT handshake, consumes FORGET and
//! INTERRUPT inline, and coordinates orderly shutdown when the mount goes
//! away or the caller asks it to stop.

use std::io;
use std::os::unix::io::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use libc::{EAGAIN, EINTR, ENODEV, ENOENT};
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use zerocopy::IntoBytes;

use crate::buffer::{BUFFER_SIZE, BufferPool, MAX_WRITE_SIZE};
use crate::channel::{Channel, DeviceFd};
use crate::handle::HandleTable;
use crate::ll::fuse_abi::{
    self as abi, FUSE_KERNEL_MINOR_VERSION, FUSE_KERNEL_VERSION, FUSE_MIN_KERNEL_MINOR_VERSION,
    InitFlags,
};
use crate::ll::reply::Response;
use crate::ll::request::{AnyRequest, Operation, RequestError};
use crate::ll::{Errno, INodeNo, RequestId, Version};
use crate::mnt::{Mount, MountOption, unmount};
use crate::node::NodeOps;
use crate::request::dispatch;
use crate::tree::InodeTable;

/// How long shutdown waits for in-flight handlers before tearing state down
/// under them.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Serving parameters for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Number of concurrent reader threads. On Linux the kernel serializes
    /// what it must, so several readers are safe and keep handlers parallel.
    /// Platforms with unmount races on concurrent reads want exactly one.
    pub readers: usize,
    /// Request the writeback page cache.
    pub writeback_cache: bool,
    /// Maximum filesystem stacking depth to declare. Non-zero enables
    /// passthrough opens (the kernel caps this at 2).
    pub max_stack_depth: u32,
    /// Maximum number of pending background requests.
    pub max_background: u16,
    /// Background level at which the kernel considers the queue congested.
    /// Defaults to 3/4 of `max_background`.
    pub congestion_threshold: Option<u16>,
    /// Receive buffers kept idle in the pool.
    pub max_idle_buffers: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            readers: default_readers(),
            writeback_cache: false,
            max_stack_depth: 0,
            max_background: 16,
            congestion_threshold: None,
            max_idle_buffers: 4,
        }
    }
}

fn default_readers() -> usize {
    if cfg!(target_os = "linux") {
        thread::available_parallelism()
            .map(|n| n.get().min(8))
            .unwrap_or(2)
    } else {
        1
    }
}

/// Everything negotiated during INIT.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Negotiated {
    pub(crate) minor: u32,
    pub(crate) max_write: u32,
    pub(crate) max_readahead: u32,
    pub(crate) flags: InitFlags,
}

/// State shared by every reader thread and handler of one session.
pub(crate) struct SessionInner {
    device: Arc<DeviceFd>,
    pub(crate) tree: InodeTable,
    pub(crate) handles: HandleTable,
    /// unique-ID -> cancellation flag for every request being handled;
    /// INTERRUPT routes through here.
    pub(crate) inflight: DashMap<u64, Arc<AtomicBool>>,
    pub(crate) pool: BufferPool,
    config: SessionConfig,
    proto: RwLock<Option<Negotiated>>,
    initialized: AtomicBool,
    destroyed: AtomicBool,
    exit: AtomicBool,
}

impl SessionInner {
    pub(crate) fn device(&self) -> &Arc<DeviceFd> {
        &self.device
    }

    /// Whether read replies may go out via splice. Gated on the kernel
    /// accepting splice writes on the device.
    pub(crate) fn splice_read(&self) -> bool {
        self.proto
            .read()
            .map_or(false, |p| p.flags.contains(InitFlags::FUSE_SPLICE_WRITE))
    }

    pub(crate) fn passthrough(&self) -> bool {
        self.proto
            .read()
            .map_or(false, |p| p.flags.contains(InitFlags::FUSE_PASSTHROUGH))
    }

    /// Largest read payload a reply may carry; bounded by the buffer the
    /// reply would fall back into.
    pub(crate) fn max_read(&self) -> u32 {
        MAX_WRITE_SIZE as u32
    }

    pub(crate) fn request_exit(&self) {
        self.exit.store(true, Ordering::SeqCst);
    }

    fn exiting(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }

    fn initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Stop accepting requests, drain handlers, release handles, clear the
    /// tree, close the device.
    fn shutdown(&self) {
        self.request_exit();
        let deadline = Instant::now() + DRAIN_GRACE;
        while !self.inflight.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if !self.inflight.is_empty() {
            warn!(
                "shutting down with {} handler(s) still in flight",
                self.inflight.len()
            );
        }
        self.handles.clear();
        self.tree.clear();
        self.device.close();
    }
}

impl std::fmt::Debug for SessionInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionInner")
            .field("device", &self.device)
            .field("initialized", &self.initialized)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

/// A mounted (or about-to-serve) filesystem session.
#[derive(Debug)]
pub struct Session {
    inner: Arc<SessionInner>,
    chan: Channel,
    mount: Option<Mount>,
    mountpoint: Option<PathBuf>,
}

impl Session {
    /// Mount `root` at `mountpoint` and return the session ready to serve.
    pub fn mount(
        root: Arc<dyn NodeOps>,
        mountpoint: &Path,
        options: &[MountOption],
        config: SessionConfig,
    ) -> io::Result<Session> {
        let (fd, mount) = Mount::new(mountpoint, options)?;
        let mut session = Session::from_fd(root, fd, config);
        session.mount = Some(mount);
        session.mountpoint = Some(mountpoint.to_path_buf());
        Ok(session)
    }

    /// Build a session over an already-mounted `/dev/fuse` descriptor, as
    /// handed over by an external mount helper. The core never opens the
    /// device itself.
    pub fn from_fd(root: Arc<dyn NodeOps>, fd: OwnedFd, config: SessionConfig) -> Session {
        let device = Arc::new(DeviceFd::new(fd));
        let inner = Arc::new(SessionInner {
            device: device.clone(),
            tree: InodeTable::new(root),
            handles: HandleTable::new(),
            inflight: DashMap::new(),
            pool: BufferPool::new(BUFFER_SIZE, config.max_idle_buffers),
            config,
            proto: RwLock::new(None),
            initialized: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            exit: AtomicBool::new(false),
        });
        Session {
            chan: Channel::new(device),
            inner,
            mount: None,
            mountpoint: None,
        }
    }

    /// The session's inode tree, e.g. for assembling a static namespace
    /// with [`InodeTable::attach`] before serving.
    pub fn tree(&self) -> &InodeTable {
        &self.inner.tree
    }

    /// Serve until unmount or a fatal device error. Consumes the session;
    /// the mount is released when this returns.
    pub fn run(mut self) -> io::Result<()> {
        let readers = self.inner.config.readers.max(1);
        let mut workers: Vec<JoinHandle<io::Result<()>>> = Vec::new();
        for idx in 1..readers {
            let chan = match self.chan.clone_worker() {
                Ok(chan) => chan,
                Err(err) => {
                    warn!("could not clone device fd for reader {idx}: {err}");
                    self.chan.clone()
                }
            };
            let inner = self.inner.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("fusetree-reader-{idx}"))
                    .spawn(move || reader_loop(inner, chan))?,
            );
        }

        let result = reader_loop(self.inner.clone(), self.chan.clone());
        self.inner.shutdown();
        for worker in workers {
            match worker.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("reader exited with error: {err}"),
                Err(_) => warn!("reader thread panicked"),
            }
        }
        // Dropping the mount unmounts; by now the device fd is closed.
        self.mount.take();
        result
    }

    /// Serve on a background thread, returning a handle that unmounts and
    /// joins on drop.
    pub fn spawn(mut self) -> io::Result<BackgroundSession> {
        let mountpoint = self.mountpoint.clone();
        let inner = self.inner.clone();
        // The background thread owns the Mount; drop-unmount happens there.
        let guard = thread::Builder::new()
            .name("fusetree-session".to_string())
            .spawn(move || self.run())?;
        Ok(BackgroundSession {
            mountpoint,
            inner,
            guard: Some(guard),
        })
    }
}

/// Handle to a session serving on a background thread. Dropping it unmounts
/// the filesystem and waits for the serve loop to finish.
#[derive(Debug)]
pub struct BackgroundSession {
    mountpoint: Option<PathBuf>,
    inner: Arc<SessionInner>,
    guard: Option<JoinHandle<io::Result<()>>>,
}

impl BackgroundSession {
    pub fn mountpoint(&self) -> Option<&Path> {
        self.mountpoint.as_deref()
    }
}

impl Drop for BackgroundSession {
    fn drop(&mut self) {
        if let Some(mountpoint) = &self.mountpoint {
            info!("unmounting {}", mountpoint.display());
            if let Err(err) = unmount(mountpoint) {
                error!("failed to unmount {}: {err}", mountpoint.display());
            }
        }
        self.inner.request_exit();
        if let Some(guard) = self.guard.take() {
            let _ = guard.join();
        }
    }
}

/// One reader: receive, classify errors, hand complete messages to the
/// message handler. Each in-flight request owns one pool buffer.
fn reader_loop(inner: Arc<SessionInner>, chan: Channel) -> io::Result<()> {
    while !inner.exiting() {
        let mut buffer = inner.pool.acquire();
        let received = chan.receive(buffer.as_mut_slice());
        match received {
            Err(err) => {
                inner.pool.release(buffer);
                match err.raw_os_error() {
                    // Interrupted or raced with another reader; retry.
                    Some(ENOENT) | Some(EINTR) | Some(EAGAIN) => continue,
                    // The kernel tore the mount down.
                    Some(ENODEV) => {
                        debug!("mount is gone, shutting down");
                        inner.request_exit();
                        return Ok(());
                    }
                    _ => {
                        error!("error reading from fuse device: {err}");
                        inner.request_exit();
                        return Err(err);
                    }
                }
            }
            Ok(size) => {
                handle_message(&inner, &chan, &buffer.as_slice()[..size]);
                inner.pool.release(buffer);
            }
        }
    }
    Ok(())
}

fn send_error(chan: &Channel, unique: RequestId, errno: Errno) {
    let response = Response::new_error(errno);
    if let Err(err) = response.with_iovec(unique, |iov| chan.send_iovec(iov)) {
        warn!("failed to write error reply for request {unique}: {err}");
    }
}

/// Decode one message and route it. FORGET-class traffic and the session
/// handshake are consumed here; everything else goes through the dispatcher.
fn handle_message(inner: &Arc<SessionInner>, chan: &Channel, data: &[u8]) {
    let req = match AnyRequest::try_from(data) {
        Ok(req) => req,
        Err(err @ (RequestError::ShortHeader(_) | RequestError::LengthMismatch { .. })) => {
            // Framing is lost; nothing sane can follow on this stream.
            error!("protocol error on fuse device: {err}");
            inner.request_exit();
            return;
        }
        Err(RequestError::UnknownOpcode { opcode, unique }) => {
            warn!("unknown opcode {opcode}, replying ENOSYS");
            send_error(chan, unique, Errno::ENOSYS);
            return;
        }
        Err(RequestError::Truncated { opcode, unique }) => {
            error!("truncated arguments for opcode {opcode}, replying EIO");
            send_error(chan, unique, Errno::EIO);
            return;
        }
    };

    match req.operation() {
        Operation::Init {
            version,
            max_readahead,
            flags,
        } => handle_init(inner, chan, &req, *version, *max_readahead, *flags),
        // Everything else is invalid until the handshake finished.
        _ if !inner.initialized() => {
            warn!("operation before init: {req}");
            if !req.operation().is_no_reply() {
                send_error(chan, req.unique(), Errno::EIO);
            }
        }
        Operation::Destroy => {
            debug!("destroy received");
            inner.destroyed.store(true, Ordering::Release);
            let response = Response::new_ok();
            if let Err(err) = response.with_iovec(req.unique(), |iov| chan.send_iovec(iov)) {
                warn!("failed to acknowledge destroy: {err}");
            }
        }
        _ if inner.destroyed() => {
            if !req.operation().is_no_reply() {
                send_error(chan, req.unique(), Errno::EIO);
            }
        }
        Operation::Forget { nlookup } => inner.tree.forget(req.nodeid(), *nlookup),
        Operation::BatchForget { nodes } => {
            for node in *nodes {
                inner.tree.forget(INodeNo(node.nodeid), node.nlookup);
            }
        }
        Operation::Interrupt { unique } => {
            // Mark the target cancelled; no reply to the interrupt itself.
            // A target that already replied is gone from the map: no-op.
            if let Some(flag) = inner.inflight.get(&unique.0) {
                debug!("interrupting request {unique}");
                flag.store(true, Ordering::Release);
            }
        }
        _ => dispatch(inner, &req, chan),
    }
}

/// Negotiate the protocol. The reply is truncated to what the kernel's
/// minor revision expects.
fn handle_init(
    inner: &Arc<SessionInner>,
    chan: &Channel,
    req: &AnyRequest<'_>,
    kernel: Version,
    max_readahead: u32,
    kernel_flags: u64,
) {
    if kernel.major() != FUSE_KERNEL_VERSION || kernel.minor() < FUSE_MIN_KERNEL_MINOR_VERSION {
        error!("unsupported FUSE ABI {kernel}");
        send_error(chan, req.unique(), Errno::EPROTO);
        inner.request_exit();
        return;
    }

    let minor = kernel.minor().min(FUSE_KERNEL_MINOR_VERSION);
    let capabilities = InitFlags::from_bits_retain(kernel_flags);
    let mut requested = InitFlags::FUSE_ASYNC_READ
        | InitFlags::FUSE_BIG_WRITES
        | InitFlags::FUSE_ATOMIC_O_TRUNC
        | InitFlags::FUSE_PARALLEL_DIROPS
        | InitFlags::FUSE_DO_READDIRPLUS
        | InitFlags::FUSE_READDIRPLUS_AUTO
        | InitFlags::FUSE_SPLICE_WRITE
        | InitFlags::FUSE_SPLICE_MOVE
        | InitFlags::FUSE_SPLICE_READ
        | InitFlags::FUSE_MAX_PAGES
        | InitFlags::FUSE_NO_OPEN_SUPPORT
        | InitFlags::FUSE_NO_OPENDIR_SUPPORT
        | InitFlags::FUSE_INIT_EXT;
    if inner.config.writeback_cache {
        requested |= InitFlags::FUSE_WRITEBACK_CACHE;
    }
    if inner.config.max_stack_depth > 0 {
        requested |= InitFlags::FUSE_PASSTHROUGH;
    }
    let flags = capabilities & requested;

    let max_write = MAX_WRITE_SIZE as u32;
    let max_pages = if flags.contains(InitFlags::FUSE_MAX_PAGES) {
        ((max_write - 1) / page_size::get() as u32) as u16 + 1
    } else {
        0
    };
    let congestion_threshold = inner
        .config
        .congestion_threshold
        .unwrap_or(inner.config.max_background * 3 / 4)
        .min(inner.config.max_background);

    *inner.proto.write() = Some(Negotiated {
        minor,
        max_write,
        max_readahead,
        flags,
    });

    let init = abi::fuse_init_out {
        major: FUSE_KERNEL_VERSION,
        minor,
        max_readahead,
        flags: flags.bits() as u32,
        max_background: inner.config.max_background,
        congestion_threshold,
        max_write,
        time_gran: 1,
        max_pages,
        map_alignment: 0,
        flags2: (flags.bits() >> 32) as u32,
        max_stack_depth: inner.config.max_stack_depth,
        unused: [0; 6],
    };
    // Kernels older than the field additions expect the shorter layouts.
    let bytes = init.as_bytes();
    let reply_len = if minor < 5 {
        8
    } else if minor < 23 {
        24
    } else {
        bytes.len()
    };
    debug!(
        "INIT response: ABI {}.{}, flags {:#x}, max readahead {}, max write {}",
        init.major,
        init.minor,
        flags.bits(),
        init.max_readahead,
        init.max_write
    );
    let response = Response::new_data(&bytes[..reply_len]);
    if let Err(err) = response.with_iovec(req.unique(), |iov| chan.send_iovec(iov)) {
        error!("failed to write INIT reply: {err}");
        inner.request_exit();
        return;
    }
    inner.initialized.store(true, Ordering::Release);
    info!("FUSE session initialized: protocol {}.{}", FUSE_KERNEL_VERSION, minor);
}

#[cfg(test)]
pub(crate) mod test_support {
    //! In-memory harness: a session over a closed fd, driven by feeding
    //! encoded requests straight into the message handler and capturing the
    //! replies.

    use std::io::IoSlice;
    use std::os::fd::OwnedFd;
    use std::os::unix::io::FromRawFd;
    use std::sync::Mutex;

    use zerocopy::IntoBytes;

    use super::*;
    use crate::node::FdPayload;
    use crate::request::ReplySender;

    /// Captures every reply written during a test.
    #[derive(Default)]
    pub(crate) struct CapturingSender {
        pub(crate) replies: Mutex<Vec<Vec<u8>>>,
    }

    impl ReplySender for CapturingSender {
        fn send(&self, iov: &[IoSlice<'_>]) -> io::Result<()> {
            let mut bytes = Vec::new();
            for s in iov {
                bytes.extend_from_slice(s);
            }
            self.replies.lock().unwrap().push(bytes);
            Ok(())
        }

        fn send_fd(&self, _unique: RequestId, _payload: &FdPayload) -> io::Result<()> {
            Err(io::Error::other("no splice in tests"))
        }
    }

    pub(crate) fn test_session(root: Arc<dyn NodeOps>) -> Arc<SessionInner> {
        let _ = env_logger::builder().is_test(true).try_init();
        // Any fd stands in for the device; nothing is written through it
        // because tests use a capturing sender.
        let fd = unsafe { OwnedFd::from_raw_fd(libc::dup(libc::STDERR_FILENO)) };
        let session = Session::from_fd(root, fd, SessionConfig::default());
        session.inner.initialized.store(true, Ordering::Release);
        *session.inner.proto.write() = Some(Negotiated {
            minor: FUSE_KERNEL_MINOR_VERSION,
            max_write: MAX_WRITE_SIZE as u32,
            max_readahead: 128 * 1024,
            flags: InitFlags::empty(),
        });
        session.inner.clone()
    }

    /// Encode a request the way the kernel would: header with the length
    /// filled in, then the argument bytes.
    pub(crate) fn encode_request(
        unique: u64,
        opcode: u32,
        nodeid: u64,
        args: &[&[u8]],
    ) -> Vec<u8> {
        let payload_len: usize = args.iter().map(|a| a.len()).sum();
        let header = abi::fuse_in_header {
            len: (size_of::<abi::fuse_in_header>() + payload_len) as u32,
            opcode,
            unique,
            nodeid,
            uid: 1000,
            gid: 1000,
            pid: 4242,
            total_extlen: 0,
            padding: 0,
        };
        let mut out = header.as_bytes().to_vec();
        for arg in args {
            out.extend_from_slice(arg);
        }
        out
    }

    /// Parse a request from `data` and run it through the dispatcher,
    /// returning the captured replies.
    pub(crate) fn drive(se: &Arc<SessionInner>, data: &[u8]) -> Vec<Vec<u8>> {
        let sender = CapturingSender::default();
        match AnyRequest::try_from(data) {
            Ok(req) => match req.operation() {
                Operation::Forget { nlookup } => se.tree.forget(req.nodeid(), *nlookup),
                Operation::BatchForget { nodes } => {
                    for node in *nodes {
                        se.tree.forget(INodeNo(node.nodeid), node.nlookup);
                    }
                }
                Operation::Interrupt { unique } => {
                    if let Some(flag) = se.inflight.get(&unique.0) {
                        flag.store(true, Ordering::Release);
                    }
                }
                _ => dispatch(se, &req, &sender),
            },
            Err(err) => panic!("test request failed to parse: {err}"),
        }
        sender.replies.into_inner().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    use zerocopy::{FromBytes, IntoBytes};

    use super::test_support::encode_request;
    use super::*;
    use crate::ll::fuse_abi::fuse_opcode;

    struct EmptyRoot;
    impl NodeOps for EmptyRoot {}

    fn init_request(unique: u64, major: u32, minor: u32, flags: InitFlags) -> Vec<u8> {
        let init = abi::fuse_init_in {
            major,
            minor,
            max_readahead: 128 * 1024,
            flags: flags.bits() as u32,
        };
        let ext = abi::fuse_init_in_ext {
            flags2: (flags.bits() >> 32) as u32,
            unused: [0; 11],
        };
        let mut args = init.as_bytes().to_vec();
        args.extend_from_slice(ext.as_bytes());
        encode_request(unique, fuse_opcode::FUSE_INIT as u32, 0, &[&args])
    }

    fn serve_over_socketpair(
        config: SessionConfig,
    ) -> (UnixStream, std::thread::JoinHandle<io::Result<()>>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let (kernel_side, device_side) = UnixStream::pair().unwrap();
        let session = Session::from_fd(Arc::new(EmptyRoot), device_side.into(), config);
        let guard = thread::spawn(move || session.run());
        (kernel_side, guard)
    }

    #[test]
    fn init_handshake_negotiates_minor_flags_and_passthrough() {
        let mut config = SessionConfig::default();
        config.readers = 1;
        config.max_stack_depth = 1;
        let (mut kernel, guard) = serve_over_socketpair(config);

        // A 7.39 kernel offering passthrough and splice.
        let kernel_flags = InitFlags::FUSE_ASYNC_READ
            | InitFlags::FUSE_BIG_WRITES
            | InitFlags::FUSE_MAX_PAGES
            | InitFlags::FUSE_SPLICE_WRITE
            | InitFlags::FUSE_INIT_EXT
            | InitFlags::FUSE_PASSTHROUGH
            | InitFlags::FUSE_POSIX_ACL;
        kernel.write_all(&init_request(1, 7, 39, kernel_flags)).unwrap();

        let mut reply = [0u8; 16 + 64];
        kernel.read_exact(&mut reply).unwrap();
        let header = abi::fuse_out_header::read_from_bytes(&reply[..16]).unwrap();
        assert_eq!(header.error, 0);
        assert_eq!(header.unique, 1);
        assert_eq!(header.len as usize, reply.len());

        let init = abi::fuse_init_out::read_from_bytes(&reply[16..]).unwrap();
        assert_eq!(init.major, 7);
        // min(kernel 39, ours 40)
        assert_eq!(init.minor, 39);
        assert_eq!(init.max_write, MAX_WRITE_SIZE as u32);
        assert_eq!(init.max_stack_depth, 1);
        let negotiated =
            InitFlags::from_bits_retain(u64::from(init.flags) | (u64::from(init.flags2) << 32));
        assert!(negotiated.contains(InitFlags::FUSE_SPLICE_WRITE));
        assert!(negotiated.contains(InitFlags::FUSE_PASSTHROUGH));
        // Capabilities we never asked for are not echoed back.
        assert!(!negotiated.contains(InitFlags::FUSE_POSIX_ACL));
        assert!(init.max_pages > 0);

        // A lookup on the (empty) root round-trips as ENOENT.
        let lookup = encode_request(2, fuse_opcode::FUSE_LOOKUP as u32, 1, &[b"missing\0"]);
        kernel.write_all(&lookup).unwrap();
        let mut reply = [0u8; 16];
        kernel.read_exact(&mut reply).unwrap();
        let header = abi::fuse_out_header::read_from_bytes(&reply[..]).unwrap();
        assert_eq!(header.unique, 2);
        assert_eq!(header.error, -libc::ENOENT);

        drop(kernel);
        guard.join().unwrap().unwrap();
    }

    #[test]
    fn init_with_unsupported_major_replies_eproto_and_stops() {
        let mut config = SessionConfig::default();
        config.readers = 1;
        let (mut kernel, guard) = serve_over_socketpair(config);

        kernel
            .write_all(&init_request(1, 8, 40, InitFlags::FUSE_ASYNC_READ))
            .unwrap();
        let mut reply = [0u8; 16];
        kernel.read_exact(&mut reply).unwrap();
        let header = abi::fuse_out_header::read_from_bytes(&reply[..]).unwrap();
        assert_eq!(header.error, -libc::EPROTO);

        // The session stops on its own; no need to close our end first.
        guard.join().unwrap().unwrap();
    }

    #[test]
    fn operations_before_init_get_eio() {
        let mut config = SessionConfig::default();
        config.readers = 1;
        let (mut kernel, guard) = serve_over_socketpair(config);

        let lookup = encode_request(9, fuse_opcode::FUSE_LOOKUP as u32, 1, &[b"early\0"]);
        kernel.write_all(&lookup).unwrap();
        let mut reply = [0u8; 16];
        kernel.read_exact(&mut reply).unwrap();
        let header = abi::fuse_out_header::read_from_bytes(&reply[..]).unwrap();
        assert_eq!(header.unique, 9);
        assert_eq!(header.error, -libc::EIO);

        drop(kernel);
        guard.join().unwrap().unwrap();
    }
}
