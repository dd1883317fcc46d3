//! FUSE adapter: converts kernel filesystem requests into engine calls.
//!
//! The engine is path-keyed while the kernel speaks inode numbers, so the
//! adapter keeps its own ino↔path table with the root pinned at ino 1. The
//! root has no inode in the engine; its attributes are synthesized here.
//! `uid`/`gid` are taken from the request context on every call — the
//! engine does not persist ownership.

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyLseek, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use log::{debug, error};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::engine::{Engine, InodeInfo, TimeSpec};
use crate::error::Error;
use crate::handle::FileHandle;
use crate::inode::path_is_within;

/// Attribute time-to-live handed to the kernel.
const TTL: Duration = Duration::from_secs(1);

/// FUSE inode number of the mount root.
const ROOT_INO: u64 = 1;

fn system_time(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

fn time_secs(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs().min(i64::MAX as u64) as i64,
        Err(before) => -(before.duration().as_secs().min(i64::MAX as u64) as i64),
    }
}

fn file_kind(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        _ => FileType::RegularFile,
    }
}

/// The mounted filesystem: one engine plus the adapter-side tables.
pub struct LedgerFs {
    engine: Arc<Engine>,
    /// ino -> engine path.
    paths: HashMap<u64, String>,
    /// engine path -> ino.
    inos: HashMap<String, u64>,
    next_ino: u64,
    handles: HashMap<u64, FileHandle>,
    next_fh: u64,
}

impl LedgerFs {
    /// Wrap an opened engine for mounting.
    pub fn new(engine: Arc<Engine>) -> Self {
        let mut paths = HashMap::new();
        let mut inos = HashMap::new();
        paths.insert(ROOT_INO, "/".to_string());
        inos.insert("/".to_string(), ROOT_INO);
        LedgerFs {
            engine,
            paths,
            inos,
            next_ino: ROOT_INO + 1,
            handles: HashMap::new(),
            next_fh: 1,
        }
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.paths.get(&ino).cloned()
    }

    fn ino_for(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.inos.get(path) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.paths.insert(ino, path.to_string());
        self.inos.insert(path.to_string(), ino);
        ino
    }

    fn forget_path(&mut self, path: &str) {
        if let Some(ino) = self.inos.remove(path) {
            self.paths.remove(&ino);
        }
    }

    fn remap_subtree(&mut self, from: &str, to: &str) {
        let moves: Vec<(u64, String)> = self
            .paths
            .iter()
            .filter(|(_, path)| path.as_str() == from || path_is_within(path, from))
            .map(|(&ino, path)| (ino, format!("{to}{}", &path[from.len()..])))
            .collect();
        for (ino, new_path) in moves {
            if let Some(old) = self.paths.insert(ino, new_path.clone()) {
                self.inos.remove(&old);
            }
            self.inos.insert(new_path, ino);
        }
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, i32> {
        let name = name.to_str().ok_or(libc::EINVAL)?;
        if name.is_empty() || name.contains('/') {
            return Err(libc::EINVAL);
        }
        let parent_path = self.paths.get(&parent).ok_or(libc::ENOENT)?;
        Ok(if parent_path == "/" {
            format!("/{name}")
        } else {
            format!("{parent_path}/{name}")
        })
    }

    fn attr_from(info: &InodeInfo, ino: u64, req: &Request<'_>) -> FileAttr {
        let kind = file_kind(info.mode);
        FileAttr {
            ino,
            size: info.size,
            blocks: info.size.div_ceil(512),
            atime: system_time(info.atime),
            mtime: system_time(info.mtime),
            ctime: system_time(info.ctime),
            crtime: system_time(info.ctime),
            kind,
            perm: (info.mode & 0o7777) as u16,
            nlink: if kind == FileType::Directory { 2 } else { 1 },
            uid: req.uid(),
            gid: req.gid(),
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    fn root_attr(req: &Request<'_>) -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino: ROOT_INO,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind: FileType::Directory,
            perm: 0o755,
            nlink: 2,
            uid: req.uid(),
            gid: req.gid(),
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    /// Flush every open handle that writes to the engine inode `id`.
    /// Truncating under buffered writes must not let a later flush
    /// resurrect truncated bytes.
    fn flush_handles_for(&mut self, id: u64) -> Result<(), Error> {
        for handle in self.handles.values_mut() {
            if handle.inode_id() == id {
                handle.flush()?;
            }
        }
        Ok(())
    }

    fn stat_attr(&mut self, path: &str, req: &Request<'_>) -> Result<FileAttr, i32> {
        let info = self.engine.stat(path).map_err(|e| e.errno())?;
        let ino = self.ino_for(path);
        Ok(Self::attr_from(&info, ino, req))
    }
}

impl Filesystem for LedgerFs {
    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.stat_attr(&path, req) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        if ino == ROOT_INO {
            return reply.attr(&TTL, &Self::root_attr(req));
        }
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        match self.stat_attr(&path, req) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if ino == ROOT_INO {
            return reply.attr(&TTL, &Self::root_attr(req));
        }
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };

        if let Some(new_size) = size {
            let id = match self.engine.stat(&path) {
                Ok(info) => info.id,
                Err(e) => return reply.error(e.errno()),
            };
            if let Err(e) = self.flush_handles_for(id) {
                return reply.error(e.errno());
            }
            if let Err(e) = self.engine.truncate(&path, new_size) {
                return reply.error(e.errno());
            }
        }

        if atime.is_some() || mtime.is_some() {
            let to_spec = |time: Option<TimeOrNow>| match time {
                None => TimeSpec::Omit,
                Some(TimeOrNow::Now) => TimeSpec::Now,
                Some(TimeOrNow::SpecificTime(t)) => TimeSpec::Seconds(time_secs(t)),
            };
            if let Err(e) = self.engine.set_times(&path, to_spec(atime), to_spec(mtime)) {
                return reply.error(e.errno());
            }
        }

        // Mode and ownership changes are not persisted by the engine;
        // ownership is supplied per request from the caller's context.
        match self.stat_attr(&path, req) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        match self.engine.read_link(&path) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        if mode & libc::S_IFMT != 0 && mode & libc::S_IFMT != libc::S_IFREG {
            return reply.error(libc::EOPNOTSUPP);
        }
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        if let Err(e) = self.engine.create(&path, mode) {
            return reply.error(e.errno());
        }
        match self.stat_attr(&path, req) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        debug!("mkdir {path} (mode {mode:o})");
        if let Err(e) = self.engine.mkdir(&path, mode) {
            return reply.error(e.errno());
        }
        match self.stat_attr(&path, req) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.engine.unlink(&path) {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok()
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.engine.rmdir(&path) {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok()
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, link_name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let target = match target.to_str() {
            Some(target) => target,
            None => return reply.error(libc::EINVAL),
        };
        if let Err(e) = self.engine.symlink(target, &path) {
            return reply.error(e.errno());
        }
        match self.stat_attr(&path, req) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            return reply.error(libc::EOPNOTSUPP);
        }
        let from = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let to = match self.child_path(newparent, newname) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        debug!("rename {from} -> {to}");
        match self.engine.rename(&from, &to) {
            Ok(()) => {
                self.forget_path(&to);
                self.remap_subtree(&from, &to);
                reply.ok()
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        match self.engine.link("", "") {
            Err(e) => reply.error(e.errno()),
            Ok(()) => reply.error(libc::EOPNOTSUPP),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        // The kernel resolves creation through `create`; an open never
        // creates here.
        let flags = flags & !(libc::O_CREAT | libc::O_EXCL);
        match self.engine.open_file(&path, flags, 0) {
            Ok(handle) => {
                let fh = self.next_fh;
                self.next_fh += 1;
                self.handles.insert(fh, handle);
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        debug!("create {path} (mode {mode:o}, flags {flags:#x})");
        let handle = match self.engine.open_file(&path, flags | libc::O_CREAT, mode) {
            Ok(handle) => handle,
            Err(e) => return reply.error(e.errno()),
        };
        let attr = match self.stat_attr(&path, req) {
            Ok(attr) => attr,
            Err(errno) => return reply.error(errno),
        };
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, handle);
        reply.created(&TTL, &attr, 0, fh, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        let mut buf = vec![0u8; size as usize];
        match self.engine.read(&path, &mut buf, offset as u64) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        let handle = match self.handles.get_mut(&fh) {
            Some(handle) => handle,
            None => return reply.error(libc::EBADF),
        };
        match handle.write(data, offset as u64) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let handle = match self.handles.get_mut(&fh) {
            Some(handle) => handle,
            None => return reply.error(libc::EBADF),
        };
        match handle.flush() {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.handles.remove(&fh) {
            Some(handle) => match handle.close() {
                Ok(()) => reply.ok(),
                Err(e) => {
                    error!("flush on release failed: {e}");
                    reply.error(e.errno())
                }
            },
            None => reply.error(libc::EBADF),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let handle = match self.handles.get_mut(&fh) {
            Some(handle) => handle,
            None => return reply.error(libc::EBADF),
        };
        match handle.fsync(datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        if ino == ROOT_INO {
            return reply.opened(0, 0);
        }
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        match self.engine.stat(&path) {
            Ok(info) if info.is_dir() => reply.opened(0, 0),
            Ok(_) => reply.error(libc::ENOTDIR),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };

        let mut children: Vec<(String, InodeInfo)> = Vec::new();
        let result = self.engine.iterate_children(&path, |name, info| {
            children.push((name.to_string(), *info));
            true
        });
        if let Err(e) = result {
            return reply.error(e.errno());
        }

        let parent_ino = match crate::inode::parent_path(&path) {
            Some(parent) => *self.inos.get(parent).unwrap_or(&ROOT_INO),
            None => ROOT_INO,
        };
        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for (name, info) in children {
            let child_path = if path == "/" {
                format!("/{name}")
            } else {
                format!("{path}/{name}")
            };
            let child_ino = self.ino_for(&child_path);
            entries.push((child_ino, file_kind(info.mode), name));
        }

        for (i, (entry_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(entry_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsyncdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        match self.engine.sync_metadata() {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.engine.statfs() {
            Ok(stats) => reply.statfs(
                stats.blocks,
                stats.blocks_free,
                stats.blocks_available,
                stats.files,
                stats.files_free,
                stats.block_size as u32,
                stats.name_max as u32,
                stats.fragment_size as u32,
            ),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        let name = match name.to_str() {
            Some(name) => name,
            None => return reply.error(libc::EINVAL),
        };
        match self.engine.set_xattr(&path, name, value, flags) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        let name = match name.to_str() {
            Some(name) => name,
            None => return reply.error(libc::EINVAL),
        };
        if size == 0 {
            match self.engine.get_xattr(&path, name, None) {
                Ok(len) => reply.size(len as u32),
                Err(e) => reply.error(e.errno()),
            }
            return;
        }
        let mut buf = vec![0u8; size as usize];
        match self.engine.get_xattr(&path, name, Some(&mut buf)) {
            Ok(len) => reply.data(&buf[..len]),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        if size == 0 {
            match self.engine.list_xattr(&path, None) {
                Ok(len) => reply.size(len as u32),
                Err(e) => reply.error(e.errno()),
            }
            return;
        }
        let mut buf = vec![0u8; size as usize];
        match self.engine.list_xattr(&path, Some(&mut buf)) {
            Ok(len) => reply.data(&buf[..len]),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        let name = match name.to_str() {
            Some(name) => name,
            None => return reply.error(libc::EINVAL),
        };
        match self.engine.remove_xattr(&path, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let mode = if ino == ROOT_INO {
            libc::S_IFDIR | 0o755
        } else {
            let path = match self.path_of(ino) {
                Some(path) => path,
                None => return reply.error(libc::ENOENT),
            };
            match self.engine.stat(&path) {
                Ok(info) => info.mode,
                Err(e) => return reply.error(e.errno()),
            }
        };
        if mask & libc::R_OK != 0 && mode & libc::S_IRUSR == 0 {
            return reply.error(libc::EACCES);
        }
        if mask & libc::W_OK != 0 && mode & libc::S_IWUSR == 0 {
            return reply.error(libc::EACCES);
        }
        if mask & libc::X_OK != 0 && mode & libc::S_IXUSR == 0 {
            return reply.error(libc::EACCES);
        }
        reply.ok();
    }

    fn lseek(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        whence: i32,
        reply: ReplyLseek,
    ) {
        let handle = match self.handles.get_mut(&fh) {
            Some(handle) => handle,
            None => return reply.error(libc::EBADF),
        };
        match handle.seek(offset, whence) {
            Ok(position) => reply.offset(position as i64),
            Err(e) => reply.error(e.errno()),
        }
    }
}
