//! Request lifecycle and operation dispatch.
//!
//! One call to [`dispatch`] takes a parsed request from decode to reply:
//! resolve the target inode, run the node's handler (or the opcode default),
//! fold in cancellation, serialize, and hand the bytes to the reply sender.
//! FORGET, INTERRUPT and INIT never get here; the session consumes them
//! inline.

use std::io;
use std::io::IoSlice;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, warn};

use crate::ll::fuse_abi::{RenameFlags, consts};
use crate::ll::reply::{EntListBuf, Response};
use crate::ll::request::{AnyRequest, Operation};
use crate::ll::{Errno, FileHandle, INodeNo, RequestId, TimeOrNow};
use crate::node::{
    ChildNode, DirEntry, DirStream, FdPayload, FileAttr, FileLock, OpContext, OpenedDir,
    OpenedFile, ReadResult, SetAttrChanges, XattrReply,
};
use crate::handle::HandleEntry;
use crate::session::SessionInner;
use crate::tree::NodeRef;

/// Writes one serialized reply to the device (or captures it, in tests).
pub(crate) trait ReplySender: Send + Sync {
    fn send(&self, iov: &[IoSlice<'_>]) -> io::Result<()>;

    /// Zero-copy path for fd-backed read payloads. The default refuses so
    /// senders without splice support fall back to a buffered reply.
    fn send_fd(&self, _unique: RequestId, _payload: &FdPayload) -> io::Result<()> {
        Err(io::Error::other("splice not supported by this sender"))
    }
}

enum Outcome {
    Reply(Response<'static>),
    /// Read served from a file descriptor; written by the splice path.
    Spliced(FdPayload),
    NoReply,
}

impl From<Result<Response<'static>, Errno>> for Outcome {
    fn from(r: Result<Response<'static>, Errno>) -> Outcome {
        Outcome::Reply(match r {
            Ok(resp) => resp,
            Err(errno) => Response::new_error(errno),
        })
    }
}

/// Dispatch one decoded request and emit exactly one reply (or none, for
/// no-reply operations).
pub(crate) fn dispatch(se: &Arc<SessionInner>, req: &AnyRequest<'_>, sender: &dyn ReplySender) {
    debug!("{req}");
    let unique = req.unique();
    let cancel = Arc::new(AtomicBool::new(false));
    if !req.operation().is_no_reply() {
        se.inflight.insert(unique.0, cancel.clone());
    }
    let ctx = OpContext {
        unique,
        uid: req.uid(),
        gid: req.gid(),
        pid: req.pid(),
        interrupted: cancel.clone(),
        device: Arc::downgrade(se.device()),
    };

    let outcome = handle_operation(se, req, &ctx);

    // A request observed as interrupted replies EINTR and discards whatever
    // the handler produced. The in-flight entry is removed before the write,
    // so a late INTERRUPT is a no-op and at most one reply ever goes out.
    let cancelled = cancel.load(Ordering::Acquire);
    se.inflight.remove(&unique.0);
    match outcome {
        Outcome::NoReply => {}
        Outcome::Reply(response) => {
            let response = if cancelled {
                Response::new_error(Errno::EINTR)
            } else {
                response
            };
            send_response(sender, unique, &response);
        }
        Outcome::Spliced(payload) => {
            if cancelled {
                send_response(sender, unique, &Response::new_error(Errno::EINTR));
            } else {
                send_fd_or_fallback(se, sender, unique, payload);
            }
        }
    }
}

fn send_response(sender: &dyn ReplySender, unique: RequestId, response: &Response<'_>) {
    if let Err(err) = response.with_iovec(unique, |iov| sender.send(iov)) {
        warn!("failed to write reply for request {unique}: {err}");
    }
}

/// Try the splice path; any failure downgrades to reading the span into
/// memory and emitting a regular two-vector reply.
fn send_fd_or_fallback(
    se: &SessionInner,
    sender: &dyn ReplySender,
    unique: RequestId,
    payload: FdPayload,
) {
    if se.splice_read() {
        match sender.send_fd(unique, &payload) {
            Ok(()) => return,
            Err(err) => {
                debug!("splice reply failed, falling back to buffered write: {err}");
            }
        }
    }
    let mut buf = vec![0u8; payload.len as usize];
    let response = match payload.file.read_at(&mut buf, payload.offset) {
        Ok(n) => {
            buf.truncate(n);
            Response::new_vec(buf)
        }
        Err(err) => Response::new_error(Errno::from(err)),
    };
    send_response(sender, unique, &response);
}

fn handle_operation(se: &Arc<SessionInner>, req: &AnyRequest<'_>, ctx: &OpContext) -> Outcome {
    use Operation::*;

    // FORGET-class messages are consumed by the session's readers; INIT and
    // DESTROY likewise. Anything that still lands here is a protocol error.
    match req.operation() {
        Init { .. } | Destroy | Forget { .. } | BatchForget { .. } | Interrupt { .. } => {
            return Outcome::Reply(Response::new_error(Errno::EIO));
        }
        // Always refused, and before anything can epoll a descriptor on this
        // mount: a server that polls its own mount would deadlock on itself.
        Poll => return Outcome::Reply(Response::new_error(Errno::ENOSYS)),
        Unsupported(_) => return Outcome::Reply(Response::new_error(Errno::ENOSYS)),
        _ => {}
    }

    let Some(node) = se.tree.get(req.nodeid()) else {
        return Outcome::Reply(Response::new_error(Errno::ENOENT));
    };

    match req.operation() {
        Lookup { name } => entry_reply(se, req.nodeid(), name, node.ops.lookup(ctx, name)).into(),
        GetAttr { fh } => attr_reply(&node, node.ops.getattr(ctx, *fh)).into(),
        SetAttr(arg) => {
            let changes = setattr_changes(arg);
            attr_reply_strict(&node, node.ops.setattr(ctx, &changes)).into()
        }
        ReadLink => node
            .ops
            .readlink(ctx)
            .map(Response::new_vec)
            .into(),
        MkNod { arg, name } => entry_reply(
            se,
            req.nodeid(),
            name,
            node.ops.mknod(ctx, name, arg.mode, arg.umask, arg.rdev),
        )
        .into(),
        MkDir { arg, name } => entry_reply(
            se,
            req.nodeid(),
            name,
            node.ops.mkdir(ctx, name, arg.mode, arg.umask),
        )
        .into(),
        SymLink { name, target } => entry_reply(
            se,
            req.nodeid(),
            name,
            node.ops.symlink(ctx, name, target),
        )
        .into(),
        Unlink { name } => node
            .ops
            .unlink(ctx, name)
            .map(|()| {
                let _ = se.tree.rm_child(req.nodeid(), name);
                Response::new_ok()
            })
            .into(),
        RmDir { name } => node
            .ops
            .rmdir(ctx, name)
            .map(|()| {
                let _ = se.tree.rm_child(req.nodeid(), name);
                Response::new_ok()
            })
            .into(),
        Rename {
            newdir,
            name,
            newname,
            flags,
        } => {
            let flags = RenameFlags::from_bits_retain(*flags);
            if se.tree.get(*newdir).is_none() {
                return Outcome::Reply(Response::new_error(Errno::ENOENT));
            }
            node.ops
                .rename(ctx, name, *newdir, newname, flags)
                .map(|()| {
                    // The handler is the authority on conflicts; the tree
                    // only mirrors the outcome. Bindings the kernel never
                    // looked up may legitimately be absent.
                    let mirror = flags & RenameFlags::EXCHANGE;
                    if let Err(err) =
                        se.tree
                            .mv_child(req.nodeid(), name, *newdir, newname, mirror)
                    {
                        debug!("rename not reflected in tree: {err}");
                    }
                    Response::new_ok()
                })
                .into()
        }
        Link { target, name } => {
            let Some(target_node) = se.tree.get(*target) else {
                return Outcome::Reply(Response::new_error(Errno::ENOENT));
            };
            let link_result = node.ops.link(ctx, name, *target).map(|()| {
                let attr = getattr_or_synthesized(&target_node, ctx);
                ChildNode {
                    stable: crate::tree::StableAttr::with_ino(target_node.kind, target_node.ino.0),
                    ops: target_node.ops.clone(),
                    entry: crate::node::EntryParams::new(attr),
                }
            });
            entry_reply(se, req.nodeid(), name, link_result).into()
        }
        Open(arg) => match node.ops.open(ctx, arg.flags) {
            Ok(opened) => Outcome::Reply(open_reply(se, req.nodeid(), opened)),
            Err(errno) => Outcome::Reply(Response::new_error(errno)),
        },
        OpenDir(arg) => match node.ops.opendir(ctx, arg.flags) {
            Ok(opened) => Outcome::Reply(opendir_reply(se, req.nodeid(), opened)),
            Err(errno) => Outcome::Reply(Response::new_error(errno)),
        },
        Create { arg, name } => match node.ops.create(ctx, name, arg.mode, arg.umask, arg.flags) {
            Ok((child, opened)) => {
                match se
                    .tree
                    .lookup_or_create(req.nodeid(), name, child.stable, child.ops)
                {
                    Ok((bound, _)) => {
                        let mut attr = child.entry.attr;
                        attr.ino = bound.ino.0;
                        let backing_id = opened.backing.as_ref().map_or(0, |b| b.id());
                        let fopen = opened_file_flags(&opened, se);
                        let fh = se.handles.mint(HandleEntry {
                            ino: bound.ino,
                            dir: false,
                            backing: opened.backing,
                        });
                        Outcome::Reply(Response::new_create(
                            bound.ino,
                            bound.generation,
                            &attr,
                            child.entry.attr_ttl,
                            child.entry.entry_ttl,
                            fh,
                            fopen,
                            backing_id,
                        ))
                    }
                    Err(errno) => Outcome::Reply(Response::new_error(errno)),
                }
            }
            Err(errno) => Outcome::Reply(Response::new_error(errno)),
        },
        Read(arg) => {
            let size = arg.size.min(se.max_read());
            match node
                .ops
                .read(ctx, nonzero_fh(arg.fh), arg.offset, size, arg.flags)
            {
                Ok(ReadResult::Data(mut data)) => {
                    data.truncate(size as usize);
                    Outcome::Reply(Response::new_vec(data))
                }
                Ok(ReadResult::Fd(mut payload)) => {
                    payload.len = payload.len.min(size);
                    Outcome::Spliced(payload)
                }
                Err(errno) => Outcome::Reply(Response::new_error(errno)),
            }
        }
        Write { arg, data } => node
            .ops
            .write(ctx, nonzero_fh(arg.fh), arg.offset, data, arg.flags)
            .map(Response::new_write)
            .into(),
        Flush(arg) => node
            .ops
            .flush(ctx, nonzero_fh(arg.fh), arg.lock_owner)
            .map(|()| Response::new_ok())
            .into(),
        Release(arg) => {
            se.handles.release(FileHandle(arg.fh));
            node.ops
                .release(ctx, FileHandle(arg.fh), arg.flags)
                .map(|()| Response::new_ok())
                .into()
        }
        ReleaseDir(arg) => {
            se.handles.release(FileHandle(arg.fh));
            node.ops
                .releasedir(ctx, FileHandle(arg.fh), arg.flags)
                .map(|()| Response::new_ok())
                .into()
        }
        FSync(arg) => node
            .ops
            .fsync(
                ctx,
                nonzero_fh(arg.fh),
                arg.fsync_flags & consts::FUSE_FSYNC_FDATASYNC != 0,
            )
            .map(|()| Response::new_ok())
            .into(),
        FSyncDir(arg) => node
            .ops
            .fsyncdir(
                ctx,
                nonzero_fh(arg.fh),
                arg.fsync_flags & consts::FUSE_FSYNC_FDATASYNC != 0,
            )
            .map(|()| Response::new_ok())
            .into(),
        ReadDir(arg) => readdir_reply(se, req.nodeid(), &node, ctx, arg, false),
        ReadDirPlus(arg) => readdir_reply(se, req.nodeid(), &node, ctx, arg, true),
        StatFs => node
            .ops
            .statfs(ctx)
            .map(|st| Response::new_statfs(&st))
            .into(),
        SetXAttr { arg, name, value } => node
            .ops
            .setxattr(ctx, name, value, arg.flags)
            .map(|()| Response::new_ok())
            .into(),
        GetXAttr { arg, name } => {
            xattr_reply(node.ops.getxattr(ctx, name, arg.size), arg.size).into()
        }
        ListXAttr(arg) => xattr_reply(node.ops.listxattr(ctx, arg.size), arg.size).into(),
        RemoveXAttr { name } => node
            .ops
            .removexattr(ctx, name)
            .map(|()| Response::new_ok())
            .into(),
        Access(arg) => node
            .ops
            .access(ctx, arg.mask)
            .map(|()| Response::new_ok())
            .into(),
        GetLk(arg) => {
            let lock = file_lock(arg);
            node.ops
                .getlk(
                    ctx,
                    FileHandle(arg.fh),
                    arg.owner,
                    &lock,
                    arg.lk_flags & consts::FUSE_LK_FLOCK != 0,
                )
                .map(|l| Response::new_lock(&l))
                .into()
        }
        SetLk(arg) => setlk_reply(&node, ctx, arg, false).into(),
        SetLkW(arg) => setlk_reply(&node, ctx, arg, true).into(),
        Ioctl { arg, data } => {
            if arg.flags & consts::FUSE_IOCTL_UNRESTRICTED != 0 {
                Outcome::Reply(Response::new_error(Errno::ENOSYS))
            } else {
                node.ops
                    .ioctl(
                        ctx,
                        nonzero_fh(arg.fh),
                        arg.flags,
                        arg.cmd,
                        &data[..(arg.in_size as usize).min(data.len())],
                        arg.out_size,
                    )
                    .map(|out| Response::new_ioctl(out.result, &out.data))
                    .into()
            }
        }
        FAllocate(arg) => node
            .ops
            .allocate(ctx, FileHandle(arg.fh), arg.offset, arg.length, arg.mode)
            .map(|()| Response::new_ok())
            .into(),
        Lseek(arg) => node
            .ops
            .lseek(ctx, FileHandle(arg.fh), arg.offset, arg.whence)
            .map(Response::new_lseek)
            .into(),
        CopyFileRange(arg) => node
            .ops
            .copy_file_range(
                ctx,
                FileHandle(arg.fh_in),
                arg.off_in,
                INodeNo(arg.nodeid_out),
                FileHandle(arg.fh_out),
                arg.off_out,
                arg.len,
                arg.flags,
            )
            .map(Response::new_write)
            .into(),
        Statx(arg) => {
            // STATX is answered from the getattr capability; the extra statx
            // fields the node cannot express are left unset in the mask.
            let fh = nonzero_fh(arg.fh)
                .filter(|_| arg.getattr_flags & consts::FUSE_GETATTR_FH != 0);
            match node.ops.getattr(ctx, fh) {
                Ok(out) => {
                    let mut attr = out.attr;
                    attr.ino = node.ino.0;
                    Outcome::Reply(Response::new_statx(out.ttl, &attr))
                }
                Err(errno) if errno == Errno::ENOSYS => {
                    let attr = synthesized_attr(&node);
                    Outcome::Reply(Response::new_statx(Duration::from_secs(1), &attr))
                }
                Err(errno) => Outcome::Reply(Response::new_error(errno)),
            }
        }
        // Handled above; kept for exhaustiveness.
        Init { .. } | Destroy | Forget { .. } | BatchForget { .. } | Interrupt { .. } | Poll
        | Unsupported(_) => Outcome::NoReply,
    }
}

fn nonzero_fh(fh: u64) -> Option<FileHandle> {
    (fh != 0).then_some(FileHandle(fh))
}

fn file_lock(arg: &crate::ll::fuse_abi::fuse_lk_in) -> FileLock {
    FileLock {
        start: arg.lk.start,
        end: arg.lk.end,
        typ: arg.lk.typ,
        pid: arg.lk.pid,
    }
}

fn setlk_reply(
    node: &NodeRef,
    ctx: &OpContext,
    arg: &crate::ll::fuse_abi::fuse_lk_in,
    sleep: bool,
) -> Result<Response<'static>, Errno> {
    let lock = file_lock(arg);
    node.ops
        .setlk(
            ctx,
            FileHandle(arg.fh),
            arg.owner,
            &lock,
            sleep,
            arg.lk_flags & consts::FUSE_LK_FLOCK != 0,
        )
        .map(|()| Response::new_ok())
}

fn synthesized_attr(node: &NodeRef) -> FileAttr {
    let mut attr = FileAttr::new(node.kind);
    attr.ino = node.ino.0;
    attr
}

fn getattr_or_synthesized(node: &NodeRef, ctx: &OpContext) -> FileAttr {
    match node.ops.getattr(ctx, None) {
        Ok(out) => {
            let mut attr = out.attr;
            attr.ino = node.ino.0;
            attr
        }
        Err(_) => synthesized_attr(node),
    }
}

fn attr_reply(
    node: &NodeRef,
    result: Result<crate::node::AttrOut, Errno>,
) -> Result<Response<'static>, Errno> {
    match result {
        Ok(out) => {
            let mut attr = out.attr;
            attr.ino = node.ino.0;
            Ok(Response::new_attr(out.ttl, &attr))
        }
        Err(errno) if errno == Errno::ENOSYS => Ok(Response::new_attr(
            Duration::from_secs(1),
            &synthesized_attr(node),
        )),
        Err(errno) => Err(errno),
    }
}

fn attr_reply_strict(
    node: &NodeRef,
    result: Result<crate::node::AttrOut, Errno>,
) -> Result<Response<'static>, Errno> {
    result.map(|out| {
        let mut attr = out.attr;
        attr.ino = node.ino.0;
        Response::new_attr(out.ttl, &attr)
    })
}

/// Bind a LOOKUP-class result into the tree (taking the kernel reference)
/// and encode the entry reply.
fn entry_reply(
    se: &SessionInner,
    parent: INodeNo,
    name: &std::ffi::OsStr,
    result: Result<ChildNode, Errno>,
) -> Result<Response<'static>, Errno> {
    let child = result?;
    let entry = child.entry;
    let (bound, _) = se
        .tree
        .lookup_or_create(parent, name, child.stable, child.ops)?;
    let mut attr = entry.attr;
    attr.ino = bound.ino.0;
    Ok(Response::new_entry(
        bound.ino,
        bound.generation,
        &attr,
        entry.attr_ttl,
        entry.entry_ttl,
    ))
}

fn open_reply(se: &SessionInner, ino: INodeNo, opened: OpenedFile) -> Response<'static> {
    let backing_id = opened.backing.as_ref().map_or(0, |b| b.id());
    let fopen = opened_file_flags(&opened, se);
    let fh = se.handles.mint(HandleEntry {
        ino,
        dir: false,
        backing: opened.backing,
    });
    Response::new_open(fh, fopen, backing_id)
}

fn opened_file_flags(
    opened: &OpenedFile,
    se: &SessionInner,
) -> crate::ll::fuse_abi::FopenFlags {
    use crate::ll::fuse_abi::FopenFlags;
    let mut flags = FopenFlags::empty();
    flags.set(FopenFlags::FOPEN_DIRECT_IO, opened.direct_io);
    flags.set(FopenFlags::FOPEN_KEEP_CACHE, opened.keep_cache);
    flags.set(FopenFlags::FOPEN_NONSEEKABLE, opened.nonseekable);
    flags.set(FopenFlags::FOPEN_STREAM, opened.stream);
    flags.set(FopenFlags::FOPEN_NOFLUSH, opened.noflush);
    flags.set(
        FopenFlags::FOPEN_PARALLEL_DIRECT_WRITES,
        opened.parallel_direct_writes,
    );
    flags.set(
        FopenFlags::FOPEN_PASSTHROUGH,
        opened.backing.is_some() && se.passthrough(),
    );
    flags
}

fn opendir_reply(se: &SessionInner, ino: INodeNo, opened: OpenedDir) -> Response<'static> {
    use crate::ll::fuse_abi::FopenFlags;
    let mut flags = FopenFlags::empty();
    flags.set(FopenFlags::FOPEN_CACHE_DIR, opened.cache_dir);
    flags.set(FopenFlags::FOPEN_KEEP_CACHE, opened.keep_cache);
    let fh = se.handles.mint(HandleEntry {
        ino,
        dir: true,
        backing: None,
    });
    Response::new_open(fh, flags, 0)
}

fn xattr_reply(
    result: Result<XattrReply, Errno>,
    requested_size: u32,
) -> Result<Response<'static>, Errno> {
    match result? {
        XattrReply::Size(size) => Ok(Response::new_xattr_size(size)),
        XattrReply::Data(data) => {
            if requested_size == 0 {
                Ok(Response::new_xattr_size(data.len() as u32))
            } else if data.len() > requested_size as usize {
                Err(Errno::ERANGE)
            } else {
                Ok(Response::new_vec(data))
            }
        }
    }
}

/// Serve READDIR / READDIRPLUS. The stream comes from the node if it
/// implements enumeration, otherwise from the node's children in the tree.
/// Offsets index into the deterministic entry sequence, so a resumed cursor
/// continues exactly where the previous reply stopped.
fn readdir_reply(
    se: &SessionInner,
    ino: INodeNo,
    node: &NodeRef,
    ctx: &OpContext,
    arg: &crate::ll::fuse_abi::fuse_read_in,
    plus: bool,
) -> Outcome {
    let mut stream: Box<dyn DirStream> = match node.ops.readdir(ctx, nonzero_fh(arg.fh)) {
        Ok(stream) => stream,
        Err(errno) if errno == Errno::ENOSYS => {
            let children = match se.tree.children(ino) {
                Ok(children) => children,
                Err(errno) => return Outcome::Reply(Response::new_error(errno)),
            };
            Box::new(crate::node::VecDirStream::new(
                children
                    .into_iter()
                    .map(|c| DirEntry {
                        name: c.name,
                        kind: c.kind,
                        ino: c.ino.0,
                    })
                    .collect(),
            ))
        }
        Err(errno) => return Outcome::Reply(Response::new_error(errno)),
    };

    let mut buf = EntListBuf::new(arg.size as usize);
    let mut index: u64 = 0;
    while let Some(entry) = stream.next_entry() {
        index += 1;
        if index <= arg.offset {
            continue;
        }
        let full = if plus {
            push_plus_entry(se, ino, ctx, &mut buf, &entry, index)
        } else {
            let ino = INodeNo(if entry.ino != 0 { entry.ino } else { u64::MAX });
            buf.push_dirent(ino, index, entry.kind, &entry.name)
        };
        if full {
            break;
        }
    }
    stream.close();
    Outcome::Reply(Response::new_directory(buf))
}

/// One READDIRPLUS record: resolve the child through the normal lookup path
/// so the kernel's reference counting matches what it caches.
fn push_plus_entry(
    se: &SessionInner,
    parent: INodeNo,
    ctx: &OpContext,
    buf: &mut EntListBuf,
    entry: &DirEntry,
    index: u64,
) -> bool {
    if entry.name == "." || entry.name == ".." {
        let ino = INodeNo(if entry.ino != 0 { entry.ino } else { u64::MAX });
        return buf.push_dirent(ino, index, entry.kind, &entry.name);
    }
    let Some(parent_node) = se.tree.get(parent) else {
        return true;
    };
    match parent_node.ops.lookup(ctx, &entry.name) {
        Ok(child) => {
            let entry_params = child.entry;
            match se
                .tree
                .lookup_or_create(parent, &entry.name, child.stable, child.ops)
            {
                Ok((bound, _)) => {
                    let mut attr = entry_params.attr;
                    attr.ino = bound.ino.0;
                    let full = buf.push_direntplus(
                        bound.ino,
                        bound.generation,
                        index,
                        &entry.name,
                        &attr,
                        entry_params.attr_ttl,
                        entry_params.entry_ttl,
                    );
                    if full {
                        // The entry did not fit; the kernel will ask again
                        // and take a fresh reference then.
                        se.tree.forget(bound.ino, 1);
                    }
                    full
                }
                Err(_) => {
                    let ino = INodeNo(if entry.ino != 0 { entry.ino } else { u64::MAX });
                    buf.push_dirent(ino, index, entry.kind, &entry.name)
                }
            }
        }
        Err(_) => {
            let ino = INodeNo(if entry.ino != 0 { entry.ino } else { u64::MAX });
            buf.push_dirent(ino, index, entry.kind, &entry.name)
        }
    }
}

fn setattr_changes(arg: &crate::ll::fuse_abi::fuse_setattr_in) -> SetAttrChanges {
    use crate::ll::fuse_abi::consts::*;
    use std::time::{Duration, UNIX_EPOCH};

    let time_at = |secs: i64, nanos: u32| {
        if secs >= 0 {
            UNIX_EPOCH + Duration::new(secs as u64, nanos)
        } else {
            UNIX_EPOCH - Duration::new((-secs) as u64, nanos)
        }
    };
    SetAttrChanges {
        mode: (arg.valid & FATTR_MODE != 0).then_some(arg.mode),
        uid: (arg.valid & FATTR_UID != 0).then_some(arg.uid),
        gid: (arg.valid & FATTR_GID != 0).then_some(arg.gid),
        size: (arg.valid & FATTR_SIZE != 0).then_some(arg.size),
        atime: if arg.valid & FATTR_ATIME_NOW != 0 {
            Some(TimeOrNow::Now)
        } else if arg.valid & FATTR_ATIME != 0 {
            Some(TimeOrNow::SpecificTime(time_at(arg.atime, arg.atimensec)))
        } else {
            None
        },
        mtime: if arg.valid & FATTR_MTIME_NOW != 0 {
            Some(TimeOrNow::Now)
        } else if arg.valid & FATTR_MTIME != 0 {
            Some(TimeOrNow::SpecificTime(time_at(arg.mtime, arg.mtimensec)))
        } else {
            None
        },
        ctime: (arg.valid & FATTR_CTIME != 0).then(|| time_at(arg.ctime, arg.ctimensec)),
        fh: (arg.valid & FATTR_FH != 0).then_some(FileHandle(arg.fh)),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::ffi::{OsStr, OsString};
    use std::io::Write as _;
    use std::sync::Mutex;
    use std::thread;

    use zerocopy::{FromBytes, IntoBytes};

    use super::*;
    use crate::ll::fuse_abi::{self as abi, fuse_opcode};
    use crate::node::{AttrOut, NodeOps, VecDirStream};
    use crate::session::test_support::{drive, encode_request, test_session};

    /// A directory whose children are fixed at construction. Rename is
    /// accepted unconditionally so the tree mirror can be observed.
    struct TestDir {
        children: Mutex<HashMap<OsString, (crate::node::FileType, Arc<dyn NodeOps>)>>,
    }

    impl TestDir {
        fn new() -> Arc<TestDir> {
            Arc::new(TestDir {
                children: Mutex::new(HashMap::new()),
            })
        }

        fn add(&self, name: &str, kind: crate::node::FileType, ops: Arc<dyn NodeOps>) {
            self.children
                .lock()
                .unwrap()
                .insert(name.into(), (kind, ops));
        }
    }

    impl NodeOps for TestDir {
        fn lookup(&self, _ctx: &OpContext, name: &OsStr) -> Result<ChildNode, Errno> {
            let children = self.children.lock().unwrap();
            let (kind, ops) = children.get(name).ok_or(Errno::ENOENT)?;
            Ok(ChildNode::new(*kind, ops.clone()))
        }

        fn rename(
            &self,
            _ctx: &OpContext,
            _name: &OsStr,
            _new_parent: INodeNo,
            _new_name: &OsStr,
            _flags: RenameFlags,
        ) -> Result<(), Errno> {
            Ok(())
        }

        fn unlink(&self, _ctx: &OpContext, name: &OsStr) -> Result<(), Errno> {
            self.children
                .lock()
                .unwrap()
                .remove(name)
                .map(|_| ())
                .ok_or(Errno::ENOENT)
        }
    }

    struct BytesFile(Vec<u8>);

    impl NodeOps for BytesFile {
        fn read(
            &self,
            _ctx: &OpContext,
            _fh: Option<FileHandle>,
            offset: u64,
            size: u32,
            _flags: i32,
        ) -> Result<ReadResult, Errno> {
            let start = (offset as usize).min(self.0.len());
            let end = (start + size as usize).min(self.0.len());
            Ok(ReadResult::Data(self.0[start..end].to_vec()))
        }

        fn getattr(&self, _ctx: &OpContext, _fh: Option<FileHandle>) -> Result<AttrOut, Errno> {
            let mut attr = FileAttr::new(crate::node::FileType::RegularFile);
            attr.size = self.0.len() as u64;
            Ok(AttrOut::new(attr))
        }
    }

    struct FdFile(Arc<std::fs::File>);

    impl NodeOps for FdFile {
        fn read(
            &self,
            _ctx: &OpContext,
            _fh: Option<FileHandle>,
            offset: u64,
            size: u32,
            _flags: i32,
        ) -> Result<ReadResult, Errno> {
            Ok(ReadResult::Fd(FdPayload {
                file: self.0.clone(),
                offset,
                len: size,
            }))
        }
    }

    /// Blocks until interrupted, then reports EINTR.
    struct SlowFile;

    impl NodeOps for SlowFile {
        fn read(
            &self,
            ctx: &OpContext,
            _fh: Option<FileHandle>,
            _offset: u64,
            _size: u32,
            _flags: i32,
        ) -> Result<ReadResult, Errno> {
            while !ctx.interrupted() {
                thread::sleep(std::time::Duration::from_millis(1));
            }
            Err(Errno::EINTR)
        }
    }

    fn out_header(reply: &[u8]) -> abi::fuse_out_header {
        abi::fuse_out_header::read_from_bytes(&reply[..16]).unwrap()
    }

    fn lookup(se: &Arc<crate::session::SessionInner>, unique: u64, parent: u64, name: &str) -> u64 {
        let mut arg = name.as_bytes().to_vec();
        arg.push(0);
        let replies = drive(
            se,
            &encode_request(unique, fuse_opcode::FUSE_LOOKUP as u32, parent, &[&arg]),
        );
        assert_eq!(replies.len(), 1);
        let header = out_header(&replies[0]);
        assert_eq!(header.error, 0, "lookup failed");
        assert_eq!(header.len as usize, replies[0].len());
        let entry = abi::fuse_entry_out::read_from_bytes(&replies[0][16..]).unwrap();
        entry.nodeid
    }

    #[test]
    fn lookup_then_forget_reaps_dynamic_nodes() {
        let root = TestDir::new();
        let a = TestDir::new();
        a.add("b", crate::node::FileType::RegularFile, Arc::new(BytesFile(vec![1, 2, 3])));
        root.add("a", crate::node::FileType::Directory, a);
        let se = test_session(root);

        let a_ino = lookup(&se, 2, 1, "a");
        let b_ino = lookup(&se, 3, a_ino, "b");
        assert_eq!(se.tree.lookup_count(INodeNo(a_ino)), Some(1));
        assert_eq!(se.tree.lookup_count(INodeNo(b_ino)), Some(1));

        // FORGET produces no reply and reaps at zero.
        let forget = abi::fuse_forget_in { nlookup: 1 };
        let replies = drive(
            &se,
            &encode_request(4, fuse_opcode::FUSE_FORGET as u32, b_ino, &[forget.as_bytes()]),
        );
        assert!(replies.is_empty());
        assert!(!se.tree.contains(INodeNo(b_ino)));

        // A request addressing the reaped node gets ENOENT.
        let getattr = abi::fuse_getattr_in {
            getattr_flags: 0,
            dummy: 0,
            fh: 0,
        };
        let replies = drive(
            &se,
            &encode_request(5, fuse_opcode::FUSE_GETATTR as u32, b_ino, &[getattr.as_bytes()]),
        );
        assert_eq!(out_header(&replies[0]).error, -libc::ENOENT);

        let forget = abi::fuse_forget_in { nlookup: 1 };
        drive(
            &se,
            &encode_request(6, fuse_opcode::FUSE_FORGET as u32, a_ino, &[forget.as_bytes()]),
        );
        assert!(!se.tree.contains(INodeNo(a_ino)));
        assert_eq!(se.tree.len(), 1);
    }

    #[test]
    fn batch_forget_drops_many() {
        let root = TestDir::new();
        root.add("x", crate::node::FileType::RegularFile, Arc::new(BytesFile(vec![])));
        root.add("y", crate::node::FileType::RegularFile, Arc::new(BytesFile(vec![])));
        let se = test_session(root);
        let x = lookup(&se, 2, 1, "x");
        let y = lookup(&se, 3, 1, "y");

        let head = abi::fuse_batch_forget_in { count: 2, dummy: 0 };
        let one = abi::fuse_forget_one {
            nodeid: x,
            nlookup: 1,
        };
        let two = abi::fuse_forget_one {
            nodeid: y,
            nlookup: 1,
        };
        let replies = drive(
            &se,
            &encode_request(
                4,
                fuse_opcode::FUSE_BATCH_FORGET as u32,
                0,
                &[head.as_bytes(), one.as_bytes(), two.as_bytes()],
            ),
        );
        assert!(replies.is_empty());
        assert!(!se.tree.contains(INodeNo(x)));
        assert!(!se.tree.contains(INodeNo(y)));
    }

    #[test]
    fn read_reply_carries_exact_payload() {
        let content: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let root = TestDir::new();
        root.add(
            "data",
            crate::node::FileType::RegularFile,
            Arc::new(BytesFile(content.clone())),
        );
        let se = test_session(root);
        let ino = lookup(&se, 2, 1, "data");

        let read = abi::fuse_read_in {
            fh: 7,
            offset: 0,
            size: 4096,
            read_flags: 0,
            lock_owner: 0,
            flags: 0,
            padding: 0,
        };
        let replies = drive(
            &se,
            &encode_request(3, fuse_opcode::FUSE_READ as u32, ino, &[read.as_bytes()]),
        );
        assert_eq!(replies.len(), 1);
        let header = out_header(&replies[0]);
        assert_eq!(header.error, 0);
        // Declared length, written bytes and payload all agree.
        assert_eq!(header.len as usize, replies[0].len());
        assert_eq!(replies[0].len(), 16 + 4096);
        assert_eq!(&replies[0][16..], &content[..]);
    }

    #[test]
    fn fd_read_falls_back_to_buffered_copy() {
        let mut tmp = tempfile::tempfile().unwrap();
        let content: Vec<u8> = (0..4096u32).map(|i| (i / 7) as u8).collect();
        tmp.write_all(&content).unwrap();
        let root = TestDir::new();
        root.add(
            "fd",
            crate::node::FileType::RegularFile,
            Arc::new(FdFile(Arc::new(tmp))),
        );
        let se = test_session(root);
        let ino = lookup(&se, 2, 1, "fd");

        let read = abi::fuse_read_in {
            fh: 7,
            offset: 0,
            size: 4096,
            read_flags: 0,
            lock_owner: 0,
            flags: 0,
            padding: 0,
        };
        let replies = drive(
            &se,
            &encode_request(3, fuse_opcode::FUSE_READ as u32, ino, &[read.as_bytes()]),
        );
        assert_eq!(replies.len(), 1);
        let header = out_header(&replies[0]);
        assert_eq!(header.error, 0);
        assert_eq!(header.len as usize, 16 + 4096);
        assert_eq!(&replies[0][16..], &content[..]);
    }

    #[test]
    fn interrupt_produces_exactly_one_eintr_reply() {
        let root = TestDir::new();
        root.add("slow", crate::node::FileType::RegularFile, Arc::new(SlowFile));
        let se = test_session(root);
        let ino = lookup(&se, 2, 1, "slow");

        let read = abi::fuse_read_in {
            fh: 0,
            offset: 0,
            size: 16,
            read_flags: 0,
            lock_owner: 0,
            flags: 0,
            padding: 0,
        };
        let request = encode_request(77, fuse_opcode::FUSE_READ as u32, ino, &[read.as_bytes()]);
        let reader = {
            let se = se.clone();
            thread::spawn(move || drive(&se, &request))
        };

        // Wait for the read to be in flight, then interrupt it.
        while !se.inflight.contains_key(&77) {
            thread::sleep(std::time::Duration::from_millis(1));
        }
        let interrupt = abi::fuse_interrupt_in { unique: 77 };
        let replies = drive(
            &se,
            &encode_request(
                78,
                fuse_opcode::FUSE_INTERRUPT as u32,
                0,
                &[interrupt.as_bytes()],
            ),
        );
        assert!(replies.is_empty(), "INTERRUPT itself is never replied to");

        let replies = reader.join().unwrap();
        assert_eq!(replies.len(), 1);
        let header = out_header(&replies[0]);
        assert_eq!(header.error, -libc::EINTR);
        assert_eq!(header.unique, 77);
        // The in-flight entry is gone; a second interrupt is a no-op.
        assert!(!se.inflight.contains_key(&77));
    }

    #[test]
    fn rename_exchange_swaps_bindings() {
        let root = TestDir::new();
        let dir_a = TestDir::new();
        let dir_b = TestDir::new();
        dir_a.add("x", crate::node::FileType::RegularFile, Arc::new(BytesFile(vec![1])));
        dir_b.add("y", crate::node::FileType::RegularFile, Arc::new(BytesFile(vec![2])));
        root.add("A", crate::node::FileType::Directory, dir_a);
        root.add("B", crate::node::FileType::Directory, dir_b);
        let se = test_session(root);

        let a_ino = lookup(&se, 2, 1, "A");
        let b_ino = lookup(&se, 3, 1, "B");
        let x_ino = lookup(&se, 4, a_ino, "x");
        let y_ino = lookup(&se, 5, b_ino, "y");

        let rename = abi::fuse_rename2_in {
            newdir: b_ino,
            flags: libc::RENAME_EXCHANGE,
            padding: 0,
        };
        let mut args = rename.as_bytes().to_vec();
        args.extend_from_slice(b"x\0y\0");
        let replies = drive(
            &se,
            &encode_request(6, fuse_opcode::FUSE_RENAME2 as u32, a_ino, &[&args]),
        );
        assert_eq!(out_header(&replies[0]).error, 0);

        let a_children = se.tree.children(INodeNo(a_ino)).unwrap();
        let b_children = se.tree.children(INodeNo(b_ino)).unwrap();
        assert_eq!(a_children[0].ino.0, y_ino);
        assert_eq!(b_children[0].ino.0, x_ino);
        assert_eq!(se.tree.lookup_count(INodeNo(x_ino)), Some(1));
        assert_eq!(se.tree.lookup_count(INodeNo(y_ino)), Some(1));
    }

    #[test]
    fn readdir_enumerates_tree_children_deterministically() {
        let root = TestDir::new();
        root.add("zz", crate::node::FileType::RegularFile, Arc::new(BytesFile(vec![])));
        root.add("aa", crate::node::FileType::RegularFile, Arc::new(BytesFile(vec![])));
        let se = test_session(root);
        // Insertion order in the tree is lookup order.
        lookup(&se, 2, 1, "zz");
        lookup(&se, 3, 1, "aa");

        let readdir = abi::fuse_read_in {
            fh: 0,
            offset: 0,
            size: 4096,
            read_flags: 0,
            lock_owner: 0,
            flags: 0,
            padding: 0,
        };
        let replies = drive(
            &se,
            &encode_request(4, fuse_opcode::FUSE_READDIR as u32, 1, &[readdir.as_bytes()]),
        );
        let header = out_header(&replies[0]);
        assert_eq!(header.error, 0);
        let payload = &replies[0][16..];
        // First record: "zz" at offset 1. fuse_dirent is encode-only, so
        // decode the fields by hand.
        let namelen = u32::from_ne_bytes(payload[16..20].try_into().unwrap()) as usize;
        assert_eq!(&payload[24..24 + namelen], b"zz");

        // Resuming at offset 1 yields only the second entry.
        let readdir = abi::fuse_read_in {
            fh: 0,
            offset: 1,
            size: 4096,
            read_flags: 0,
            lock_owner: 0,
            flags: 0,
            padding: 0,
        };
        let replies = drive(
            &se,
            &encode_request(5, fuse_opcode::FUSE_READDIR as u32, 1, &[readdir.as_bytes()]),
        );
        let payload = &replies[0][16..];
        let namelen = u32::from_ne_bytes(payload[16..20].try_into().unwrap()) as usize;
        assert_eq!(&payload[24..24 + namelen], b"aa");
    }

    #[test]
    fn open_mints_handle_and_release_retires_it() {
        struct OpenFile;
        impl NodeOps for OpenFile {
            fn open(&self, _ctx: &OpContext, _flags: i32) -> Result<OpenedFile, Errno> {
                Ok(OpenedFile {
                    keep_cache: true,
                    ..OpenedFile::default()
                })
            }
        }
        let root = TestDir::new();
        root.add("f", crate::node::FileType::RegularFile, Arc::new(OpenFile));
        let se = test_session(root);
        let ino = lookup(&se, 2, 1, "f");

        let open = abi::fuse_open_in {
            flags: libc::O_RDONLY,
            open_flags: 0,
        };
        let replies = drive(
            &se,
            &encode_request(3, fuse_opcode::FUSE_OPEN as u32, ino, &[open.as_bytes()]),
        );
        let header = out_header(&replies[0]);
        assert_eq!(header.error, 0);
        let open_out = abi::fuse_open_out::read_from_bytes(&replies[0][16..]).unwrap();
        assert_ne!(open_out.fh, 0);
        assert_eq!(open_out.open_flags & 0x2, 0x2); // FOPEN_KEEP_CACHE
        assert_eq!(se.handles.len(), 1);

        let release = abi::fuse_release_in {
            fh: open_out.fh,
            flags: 0,
            release_flags: 0,
            lock_owner: 0,
        };
        let replies = drive(
            &se,
            &encode_request(4, fuse_opcode::FUSE_RELEASE as u32, ino, &[release.as_bytes()]),
        );
        assert_eq!(out_header(&replies[0]).error, 0);
        assert_eq!(se.handles.len(), 0);
    }

    #[test]
    fn unknown_node_replies_enoent_and_poll_is_refused() {
        let se = test_session(TestDir::new());
        let getattr = abi::fuse_getattr_in {
            getattr_flags: 0,
            dummy: 0,
            fh: 0,
        };
        let replies = drive(
            &se,
            &encode_request(2, fuse_opcode::FUSE_GETATTR as u32, 999, &[getattr.as_bytes()]),
        );
        assert_eq!(out_header(&replies[0]).error, -libc::ENOENT);

        // POLL is always ENOSYS so the serving process can never deadlock
        // polling its own mount.
        let replies = drive(&se, &encode_request(3, fuse_opcode::FUSE_POLL as u32, 1, &[]));
        assert_eq!(out_header(&replies[0]).error, -libc::ENOSYS);
    }

    #[test]
    fn unlink_removes_binding_but_keeps_referenced_inode() {
        let root = TestDir::new();
        root.add("gone", crate::node::FileType::RegularFile, Arc::new(BytesFile(vec![])));
        let se = test_session(root);
        let ino = lookup(&se, 2, 1, "gone");

        let replies = drive(
            &se,
            &encode_request(3, fuse_opcode::FUSE_UNLINK as u32, 1, &[b"gone\0"]),
        );
        assert_eq!(out_header(&replies[0]).error, 0);
        // The kernel still holds its lookup; only FORGET may reap.
        assert!(se.tree.contains(INodeNo(ino)));
        assert!(se.tree.children(INodeNo(1)).unwrap().is_empty());

        let forget = abi::fuse_forget_in { nlookup: 1 };
        drive(
            &se,
            &encode_request(4, fuse_opcode::FUSE_FORGET as u32, ino, &[forget.as_bytes()]),
        );
        assert!(!se.tree.contains(INodeNo(ino)));
    }

    #[test]
    fn statfs_default_is_zeroed_ok() {
        let se = test_session(TestDir::new());
        let replies = drive(&se, &encode_request(2, fuse_opcode::FUSE_STATFS as u32, 1, &[]));
        let header = out_header(&replies[0]);
        assert_eq!(header.error, 0);
        assert_eq!(header.len as usize, 16 + 80);
        assert!(replies[0][16..].iter().all(|&b| b == 0));
    }

    #[test]
    fn user_dir_stream_is_used_when_implemented() {
        struct ListingDir;
        impl NodeOps for ListingDir {
            fn readdir(
                &self,
                _ctx: &OpContext,
                _fh: Option<FileHandle>,
            ) -> Result<Box<dyn DirStream>, Errno> {
                Ok(Box::new(VecDirStream::new(vec![
                    DirEntry {
                        name: "one".into(),
                        kind: crate::node::FileType::RegularFile,
                        ino: 11,
                    },
                    DirEntry {
                        name: "two".into(),
                        kind: crate::node::FileType::RegularFile,
                        ino: 12,
                    },
                ])))
            }
        }
        let se = test_session(Arc::new(ListingDir));
        let readdir = abi::fuse_read_in {
            fh: 0,
            offset: 0,
            size: 4096,
            read_flags: 0,
            lock_owner: 0,
            flags: 0,
            padding: 0,
        };
        let replies = drive(
            &se,
            &encode_request(2, fuse_opcode::FUSE_READDIR as u32, 1, &[readdir.as_bytes()]),
        );
        let payload = &replies[0][16..];
        let ino = u64::from_ne_bytes(payload[0..8].try_into().unwrap());
        assert_eq!(ino, 11);
        let namelen = u32::from_ne_bytes(payload[16..20].try_into().unwrap()) as usize;
        assert_eq!(&payload[24..24 + namelen], b"one");
    }
}
