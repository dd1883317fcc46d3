//! The storage engine: mount state, replay, and the operation surface
//! consumed by the filesystem adapter.
//!
//! An [`Engine`] owns the two backing files and the in-memory inode store
//! for one backing directory. All mutating operations (including reads,
//! which touch `atime`) take the write side of one engine-wide lock; pure
//! queries take the read side. Records reach the log in the order their
//! operations complete, and that order is the authoritative history after
//! a crash.

use log::{debug, info, warn};
use parking_lot::RwLock;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::handle::FileHandle;
use crate::inode::{
    immediate_child_name, mode_is_dir, normalize_path, parent_path, path_is_within,
    truncate_extents, Extent, Inode, InodeStore,
};
use crate::record::{NodeRecord, Record};
use crate::segment::{DataSegment, Frame, MetaLog};
use crate::{DEFAULT_WRITE_BUFFER_SIZE, MIN_WRITE_BUFFER_SIZE};

/// File name of the data segment inside the backing directory.
pub const DATA_FILENAME: &str = "data";
/// File name of the metadata log inside the backing directory.
pub const META_FILENAME: &str = "meta";

/// Seconds since the epoch, saturating at the `i64` range.
pub(crate) fn now_secs() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs().min(i64::MAX as u64) as i64,
        Err(before_epoch) => -(before_epoch.duration().as_secs().min(i64::MAX as u64) as i64),
    }
}

fn clamp_timestamp(ts: u64) -> i64 {
    ts.min(i64::MAX as u64) as i64
}

/// Tunable engine options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Per-handle staging buffer capacity in bytes. Defaults to 4 MiB;
    /// values below 4 KiB (the minimum flush granularity) are rejected.
    pub write_buffer_size: usize,
    /// Stop replay at the first checksum failure instead of skipping the
    /// record and continuing. Off by default.
    pub halt_on_corrupt_record: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            halt_on_corrupt_record: false,
        }
    }
}

impl EngineOptions {
    fn validate(&self) -> Result<()> {
        if self.write_buffer_size < MIN_WRITE_BUFFER_SIZE {
            return Err(Error::InvalidArgument);
        }
        // The on-disk extent length field is a u32.
        if self.write_buffer_size > u32::MAX as usize {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

/// Attribute snapshot of one inode, handed to the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeInfo {
    /// Inode id.
    pub id: u64,
    /// POSIX mode bits including the file type.
    pub mode: u32,
    /// Effective EOF in bytes.
    pub size: u64,
    /// Inode change time, seconds since the epoch.
    pub ctime: i64,
    /// Modification time, seconds since the epoch.
    pub mtime: i64,
    /// Access time, seconds since the epoch.
    pub atime: i64,
}

impl InodeInfo {
    fn from_inode(inode: &Inode) -> Self {
        InodeInfo {
            id: inode.id,
            mode: inode.mode,
            size: inode.size,
            ctime: inode.ctime,
            mtime: inode.mtime,
            atime: inode.atime,
        }
    }

    /// Whether the inode is a directory.
    pub fn is_dir(&self) -> bool {
        crate::inode::mode_is_dir(self.mode)
    }

    /// Whether the inode is a symlink.
    pub fn is_symlink(&self) -> bool {
        crate::inode::mode_is_symlink(self.mode)
    }
}

/// One timestamp argument to [`Engine::set_times`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSpec {
    /// Use the current time.
    Now,
    /// Leave the stored value unchanged.
    Omit,
    /// Set the given seconds-since-epoch value (sub-second precision is
    /// not stored).
    Seconds(i64),
}

/// Host-filesystem capacity figures for the backing directory, as reported
/// to `statfs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStats {
    /// Preferred I/O block size.
    pub block_size: u64,
    /// Fundamental block size.
    pub fragment_size: u64,
    /// Total blocks.
    pub blocks: u64,
    /// Free blocks.
    pub blocks_free: u64,
    /// Blocks available to unprivileged callers.
    pub blocks_available: u64,
    /// Total file nodes.
    pub files: u64,
    /// Free file nodes.
    pub files_free: u64,
    /// Maximum file name length.
    pub name_max: u64,
}

pub(crate) struct EngineState {
    pub(crate) data: DataSegment,
    pub(crate) meta: MetaLog,
    pub(crate) store: InodeStore,
    pub(crate) options: EngineOptions,
}

/// The persistence engine for one backing directory.
///
/// Opening replays the metadata log into memory; every mutation afterwards
/// appends to the log (and, for file data, to the data segment) before or
/// atomically with its in-memory effect, so that a crash at any point
/// replays to a state the log truthfully describes.
pub struct Engine {
    root: PathBuf,
    pub(crate) state: RwLock<EngineState>,
}

impl Engine {
    /// Open the engine against `root` with default options, creating the
    /// backing directory and its two files if absent.
    pub fn open(root: impl AsRef<Path>) -> Result<Arc<Self>> {
        Self::open_with_options(root, EngineOptions::default())
    }

    /// Open the engine against `root` with explicit options.
    pub fn open_with_options(root: impl AsRef<Path>, options: EngineOptions) -> Result<Arc<Self>> {
        options.validate()?;
        std::fs::create_dir_all(root.as_ref())?;
        let root = root.as_ref().canonicalize()?;

        let data = DataSegment::open(&root.join(DATA_FILENAME))?;
        let meta = MetaLog::open(&root.join(META_FILENAME))?;
        let mut store = InodeStore::new();
        replay(&meta, &mut store, options.halt_on_corrupt_record)?;

        info!(
            "mounted {}: {} inodes, data segment {} bytes, log {} bytes",
            root.display(),
            store.len(),
            data.len(),
            meta.len()
        );
        Ok(Arc::new(Engine {
            root,
            state: RwLock::new(EngineState {
                data,
                meta,
                store,
                options,
            }),
        }))
    }

    /// The canonicalised backing directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current engine options.
    pub fn options(&self) -> EngineOptions {
        self.state.read().options
    }

    /// Replace the engine options. Buffer capacities of already-open
    /// handles are unaffected.
    pub fn set_options(&self, options: EngineOptions) -> Result<()> {
        options.validate()?;
        self.state.write().options = options;
        Ok(())
    }

    fn canonical(path: &str) -> Result<String> {
        normalize_path(path).ok_or(Error::InvalidArgument)
    }

    fn ensure_parent(store: &InodeStore, path: &str) -> Result<()> {
        let parent = parent_path(path).ok_or(Error::InvalidArgument)?;
        if parent == "/" {
            return Ok(());
        }
        match store.find_by_path(parent) {
            Some(inode) if inode.is_dir() => Ok(()),
            _ => Err(Error::NotFound),
        }
    }

    /// Shared implementation of create, mkdir, and symlink: validate the
    /// namespace, append the record, then insert or revive the inode.
    fn create_node(&self, path: String, mode: u32, symlink_target: Option<&str>) -> Result<()> {
        if path == "/" {
            return Err(Error::InvalidArgument);
        }
        let mut guard = self.state.write();
        let state = &mut *guard;

        if state.store.find_by_path(&path).is_some() {
            return Err(Error::AlreadyExists);
        }
        Self::ensure_parent(&state.store, &path)?;

        let now = now_secs();
        let size = symlink_target.map(|t| t.len() as u64).unwrap_or(0);
        let revived = state.store.deleted_id_by_path(&path);
        let id = revived.unwrap_or_else(|| state.store.next_id());

        let node = NodeRecord {
            id,
            mode,
            size,
            timestamp: now.max(0) as u64,
            path: path.clone(),
            symlink_target: symlink_target.map(str::to_string),
        };
        let record = if mode_is_dir(mode) {
            Record::Mkdir(node)
        } else {
            Record::Create(node)
        };
        state.meta.append(&record)?;

        match revived {
            Some(id) => {
                state.store.revive(id, path.clone(), mode, now);
                debug!("revived inode {id} at {path}");
            }
            None => {
                state.store.insert_new(path.clone(), mode, now);
                debug!("created inode {id} at {path}");
            }
        }
        if let Some(target) = symlink_target {
            if let Some(inode) = state.store.get_mut(id) {
                inode.symlink_target = Some(target.to_string());
                inode.size = size;
            }
        }
        Ok(())
    }

    /// Create a regular file. Fails `EEXIST` if a non-deleted inode exists
    /// at `path` and `ENOENT` if the parent is missing; a deleted entry at
    /// the same path is revived with its id preserved.
    pub fn create(&self, path: &str, mode: u32) -> Result<()> {
        let path = Self::canonical(path)?;
        self.create_node(path, libc::S_IFREG | (mode & !libc::S_IFMT), None)
    }

    /// Create a directory. Same shape as [`Engine::create`]; the root
    /// itself cannot be created.
    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        let path = Self::canonical(path)?;
        self.create_node(path, libc::S_IFDIR | (mode & 0o777), None)
    }

    /// Create a symlink at `linkpath` pointing at `target`.
    pub fn symlink(&self, target: &str, linkpath: &str) -> Result<()> {
        let path = Self::canonical(linkpath)?;
        self.create_node(path, libc::S_IFLNK | 0o777, Some(target))
    }

    /// Return a symlink's stored target. Fails `EINVAL` on non-symlinks.
    pub fn read_link(&self, path: &str) -> Result<String> {
        let path = Self::canonical(path)?;
        let mut guard = self.state.write();
        let state = &mut *guard;
        let id = state.store.id_by_path(&path).ok_or(Error::NotFound)?;
        let inode = state.store.get_mut(id).ok_or(Error::NotFound)?;
        if !inode.is_symlink() {
            return Err(Error::InvalidArgument);
        }
        let target = inode.symlink_target.clone().unwrap_or_default();
        inode.atime = now_secs();
        Ok(target)
    }

    /// Remove a non-directory. The inode is marked deleted; its record
    /// history and data-segment bytes are not reclaimed.
    pub fn unlink(&self, path: &str) -> Result<()> {
        let path = Self::canonical(path)?;
        let mut guard = self.state.write();
        let state = &mut *guard;
        let inode = state.store.find_by_path(&path).ok_or(Error::NotFound)?;
        if inode.is_dir() {
            return Err(Error::IsDirectory);
        }
        let id = inode.id;
        state.meta.append(&Record::Unlink { id })?;
        state.store.mark_deleted(id);
        debug!("unlinked inode {id} at {path}");
        Ok(())
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, path: &str) -> Result<()> {
        let path = Self::canonical(path)?;
        if path == "/" {
            return Err(Error::InvalidArgument);
        }
        let mut guard = self.state.write();
        let state = &mut *guard;
        let inode = state.store.find_by_path(&path).ok_or(Error::NotFound)?;
        if !inode.is_dir() {
            return Err(Error::NotADirectory);
        }
        let id = inode.id;
        if !state.store.is_dir_empty(&path) {
            return Err(Error::NotEmpty);
        }
        state.meta.append(&Record::Unlink { id })?;
        state.store.mark_deleted(id);
        if let Some(inode) = state.store.get_mut(id) {
            inode.mtime = now_secs();
        }
        debug!("removed directory inode {id} at {path}");
        Ok(())
    }

    /// Rename `from` to `to`, replacing a compatible destination.
    ///
    /// Renaming a directory emits one record for the directory followed by
    /// one per descendant; if a descendant record fails to append, the
    /// error surfaces and the descendants already rewritten stay renamed —
    /// the log carries the partial result faithfully.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = Self::canonical(from)?;
        let to = Self::canonical(to)?;
        let mut guard = self.state.write();
        let state = &mut *guard;

        let src_id = state.store.id_by_path(&from).ok_or(Error::NotFound)?;
        if from == to {
            return Ok(());
        }
        let to_parent = parent_path(&to).ok_or(Error::InvalidArgument)?;
        if to_parent != "/" {
            match state.store.find_by_path(to_parent) {
                Some(inode) if inode.is_dir() => {}
                _ => return Err(Error::NotFound),
            }
        }
        let src_is_dir = state
            .store
            .get(src_id)
            .map(|inode| inode.is_dir())
            .unwrap_or(false);
        let now = now_secs();

        if let Some(dest_id) = state.store.id_by_path(&to) {
            let dest_is_dir = state
                .store
                .get(dest_id)
                .map(|inode| inode.is_dir())
                .unwrap_or(false);
            if src_is_dir {
                if !dest_is_dir {
                    return Err(Error::NotADirectory);
                }
                if !state.store.is_dir_empty(&to) {
                    return Err(Error::NotEmpty);
                }
            } else if dest_is_dir {
                return Err(Error::IsDirectory);
            }
            state.meta.append(&Record::Unlink { id: dest_id })?;
            state.store.mark_deleted(dest_id);
            if let Some(dest) = state.store.get_mut(dest_id) {
                dest.mtime = now;
            }
            debug!("rename replaced inode {dest_id} at {to}");
        }

        // Descendant paths are computed against the pre-rename namespace.
        let mut descendants: Vec<(u64, String)> = Vec::new();
        if src_is_dir {
            for inode in state.store.iter() {
                if inode.id == src_id || inode.deleted {
                    continue;
                }
                if path_is_within(&inode.path, &from) {
                    descendants.push((inode.id, format!("{to}{}", &inode.path[from.len()..])));
                }
            }
        }

        state.meta.append(&Record::Rename {
            id: src_id,
            new_path: to.clone(),
        })?;
        state.store.set_path(src_id, to.clone());
        if let Some(inode) = state.store.get_mut(src_id) {
            inode.mtime = now;
        }

        for (id, new_path) in descendants {
            state.meta.append(&Record::Rename {
                id,
                new_path: new_path.clone(),
            })?;
            state.store.set_path(id, new_path);
        }
        debug!("renamed {from} -> {to}");
        Ok(())
    }

    /// Truncate a regular file or symlink to `size`. Data-segment space is
    /// not reclaimed; the extent list is shortened so readers observe the
    /// new EOF.
    ///
    /// Callers holding open handles on this inode must flush them first;
    /// the adapter owns the handles and enforces that ordering.
    pub fn truncate(&self, path: &str, size: u64) -> Result<()> {
        let path = Self::canonical(path)?;
        let mut guard = self.state.write();
        let state = &mut *guard;
        let inode = state.store.find_by_path(&path).ok_or(Error::NotFound)?;
        if !inode.is_regular() && !inode.is_symlink() {
            return Err(Error::InvalidArgument);
        }
        let id = inode.id;
        state.meta.append(&Record::Truncate { id, new_size: size })?;
        let inode = state.store.get_mut(id).ok_or(Error::NotFound)?;
        truncate_extents(&mut inode.extents, size);
        inode.size = size;
        inode.mtime = now_secs();
        debug!("truncated inode {id} to {size} bytes");
        Ok(())
    }

    /// Read up to `buf.len()` bytes at `offset`, resolving the extent
    /// history so that the most recently appended extent wins over any
    /// logical range it overlaps. Bytes inside EOF not covered by any
    /// extent read as zero. Returns the number of bytes produced, which is
    /// the read range clamped to EOF.
    pub fn read(&self, path: &str, buf: &mut [u8], offset: u64) -> Result<usize> {
        let path = Self::canonical(path)?;
        let mut guard = self.state.write();
        let state = &mut *guard;
        let id = state.store.id_by_path(&path).ok_or(Error::NotFound)?;
        let inode = state.store.get_mut(id).ok_or(Error::NotFound)?;
        if offset >= inode.size {
            return Ok(0);
        }
        let effective = (buf.len() as u64).min(inode.size - offset) as usize;
        if effective == 0 {
            return Ok(0);
        }
        let out = &mut buf[..effective];
        out.fill(0);

        // Insertion order is significant: a later extent overwrites what an
        // earlier one put in the output over the overlapping range.
        for extent in &inode.extents {
            let start = offset.max(extent.logical_offset);
            let stop = (offset + effective as u64).min(extent.logical_end());
            if start >= stop {
                continue;
            }
            let data_pos = extent.data_offset + (start - extent.logical_offset);
            let from = (start - offset) as usize;
            let to = (stop - offset) as usize;
            state.data.read_exact_at(&mut out[from..to], data_pos)?;
        }
        inode.atime = now_secs();
        Ok(effective)
    }

    /// Open a file handle. `O_CREAT` creates the file first (`O_EXCL`
    /// makes an existing path fail), `O_TRUNC` truncates to zero before
    /// the handle exists, and `O_APPEND` starts the position at EOF.
    pub fn open_file(self: &Arc<Self>, path: &str, flags: i32, mode: u32) -> Result<FileHandle> {
        let path = Self::canonical(path)?;

        let existing = self.state.read().store.id_by_path(&path);
        let id = match existing {
            Some(id) => {
                if flags & libc::O_CREAT != 0 && flags & libc::O_EXCL != 0 {
                    return Err(Error::AlreadyExists);
                }
                id
            }
            None => {
                if flags & libc::O_CREAT == 0 {
                    return Err(Error::NotFound);
                }
                self.create(&path, mode)?;
                self.state
                    .read()
                    .store
                    .id_by_path(&path)
                    .ok_or(Error::NotFound)?
            }
        };

        {
            let guard = self.state.read();
            let inode = guard.store.get(id).ok_or(Error::NotFound)?;
            if inode.is_dir() {
                return Err(Error::IsDirectory);
            }
        }
        if flags & libc::O_TRUNC != 0 {
            self.truncate(&path, 0)?;
        }

        let guard = self.state.read();
        let position = if flags & libc::O_APPEND != 0 {
            guard.store.get(id).map(|inode| inode.size).unwrap_or(0)
        } else {
            0
        };
        let capacity = guard.options.write_buffer_size;
        drop(guard);

        debug!("opened inode {id} at {path} (flags {flags:#o})");
        Ok(FileHandle::new(Arc::clone(self), id, capacity, flags, position))
    }

    /// Set one extended attribute. `XATTR_CREATE` fails `EEXIST` on an
    /// existing name, `XATTR_REPLACE` fails `ENODATA` on an absent one. A
    /// failed log append rolls the in-memory change back.
    pub fn set_xattr(&self, path: &str, name: &str, value: &[u8], flags: i32) -> Result<()> {
        let path = Self::canonical(path)?;
        let mut guard = self.state.write();
        let state = &mut *guard;
        let id = state.store.id_by_path(&path).ok_or(Error::NotFound)?;

        let prior = {
            let inode = state.store.get_mut(id).ok_or(Error::NotFound)?;
            let exists = inode.xattr(name).is_some();
            if flags & libc::XATTR_CREATE != 0 && exists {
                return Err(Error::AlreadyExists);
            }
            if flags & libc::XATTR_REPLACE != 0 && !exists {
                return Err(Error::NoData);
            }
            inode.set_xattr(name, value)
        };

        let record = Record::SetXattr {
            id,
            name: name.to_string(),
            value: value.to_vec(),
        };
        if let Err(err) = state.meta.append(&record) {
            if let Some(inode) = state.store.get_mut(id) {
                match prior {
                    Some(old) => {
                        inode.set_xattr(name, &old);
                    }
                    None => {
                        inode.remove_xattr(name);
                    }
                }
            }
            return Err(err.into());
        }
        Ok(())
    }

    /// Read one extended attribute. With `buf == None` the value size is
    /// returned; with a buffer smaller than the value the call fails
    /// `ERANGE`.
    pub fn get_xattr(&self, path: &str, name: &str, buf: Option<&mut [u8]>) -> Result<usize> {
        let path = Self::canonical(path)?;
        let guard = self.state.read();
        let inode = guard.store.find_by_path(&path).ok_or(Error::NotFound)?;
        let value = inode.xattr(name).ok_or(Error::NoData)?;
        match buf {
            None => Ok(value.len()),
            Some(buf) => {
                if buf.len() < value.len() {
                    return Err(Error::Range);
                }
                buf[..value.len()].copy_from_slice(value);
                Ok(value.len())
            }
        }
    }

    /// List extended attribute names as NUL-terminated strings in
    /// insertion order. With `buf == None` the total byte count is
    /// returned.
    pub fn list_xattr(&self, path: &str, buf: Option<&mut [u8]>) -> Result<usize> {
        let path = Self::canonical(path)?;
        let guard = self.state.read();
        let inode = guard.store.find_by_path(&path).ok_or(Error::NotFound)?;
        let total: usize = inode.xattrs.iter().map(|x| x.name.len() + 1).sum();
        match buf {
            None => Ok(total),
            Some(buf) => {
                if buf.len() < total {
                    return Err(Error::Range);
                }
                let mut at = 0;
                for xattr in &inode.xattrs {
                    buf[at..at + xattr.name.len()].copy_from_slice(xattr.name.as_bytes());
                    at += xattr.name.len();
                    buf[at] = 0;
                    at += 1;
                }
                Ok(total)
            }
        }
    }

    /// Remove one extended attribute; `ENODATA` if absent. A failed log
    /// append restores the value.
    pub fn remove_xattr(&self, path: &str, name: &str) -> Result<()> {
        let path = Self::canonical(path)?;
        let mut guard = self.state.write();
        let state = &mut *guard;
        let id = state.store.id_by_path(&path).ok_or(Error::NotFound)?;

        let prior = {
            let inode = state.store.get_mut(id).ok_or(Error::NotFound)?;
            inode.remove_xattr(name).ok_or(Error::NoData)?
        };
        let record = Record::RemoveXattr {
            id,
            name: name.to_string(),
        };
        if let Err(err) = state.meta.append(&record) {
            if let Some(inode) = state.store.get_mut(id) {
                inode.set_xattr(name, &prior);
            }
            return Err(err.into());
        }
        Ok(())
    }

    /// Set access and modification times; `ctime` always moves to now.
    pub fn set_times(&self, path: &str, atime: TimeSpec, mtime: TimeSpec) -> Result<()> {
        let path = Self::canonical(path)?;
        let mut guard = self.state.write();
        let state = &mut *guard;
        let id = state.store.id_by_path(&path).ok_or(Error::NotFound)?;
        let now = now_secs();
        let (new_atime, new_mtime) = {
            let inode = state.store.get(id).ok_or(Error::NotFound)?;
            let resolve = |spec: TimeSpec, current: i64| match spec {
                TimeSpec::Now => now,
                TimeSpec::Omit => current,
                TimeSpec::Seconds(secs) => secs,
            };
            (resolve(atime, inode.atime), resolve(mtime, inode.mtime))
        };
        state.meta.append(&Record::Times {
            id,
            atime: new_atime,
            mtime: new_mtime,
        })?;
        let inode = state.store.get_mut(id).ok_or(Error::NotFound)?;
        inode.atime = new_atime;
        inode.mtime = new_mtime;
        inode.ctime = now;
        Ok(())
    }

    /// Attribute snapshot for `path`. The root has no inode of its own;
    /// the adapter synthesizes it.
    pub fn stat(&self, path: &str) -> Result<InodeInfo> {
        let path = Self::canonical(path)?;
        let guard = self.state.read();
        let inode = guard.store.find_by_path(&path).ok_or(Error::NotFound)?;
        Ok(InodeInfo::from_inode(inode))
    }

    /// Host-filesystem capacity of the backing directory.
    pub fn statfs(&self) -> Result<FsStats> {
        let root = CString::new(self.root.as_os_str().as_bytes())
            .map_err(|_| Error::InvalidArgument)?;
        let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(root.as_ptr(), &mut st) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(FsStats {
            block_size: st.f_bsize as u64,
            fragment_size: st.f_frsize as u64,
            blocks: st.f_blocks as u64,
            blocks_free: st.f_bfree as u64,
            blocks_available: st.f_bavail as u64,
            files: st.f_files as u64,
            files_free: st.f_ffree as u64,
            name_max: st.f_namemax as u64,
        })
    }

    /// Hard links are unsupported; always fails `EOPNOTSUPP`.
    pub fn link(&self, _existing: &str, _new: &str) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// True iff no non-deleted inode is an immediate child of `dir_path`.
    pub fn is_dir_empty(&self, dir_path: &str) -> Result<bool> {
        let path = Self::canonical(dir_path)?;
        Ok(self.state.read().store.is_dir_empty(&path))
    }

    /// Invoke `callback` for each immediate child of `dir_path` with its
    /// name and attributes. Returning `false` from the callback stops the
    /// iteration.
    pub fn iterate_children(
        &self,
        dir_path: &str,
        mut callback: impl FnMut(&str, &InodeInfo) -> bool,
    ) -> Result<()> {
        let dir_path = Self::canonical(dir_path)?;
        let guard = self.state.read();
        for inode in guard.store.iter() {
            if inode.deleted || inode.path == dir_path {
                continue;
            }
            if let Some(name) = immediate_child_name(&dir_path, &inode.path) {
                let info = InodeInfo::from_inode(inode);
                if !callback(name, &info) {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Push the metadata log to stable storage. Directory-structure
    /// mutations are log records, so this is all `fsyncdir` needs.
    pub fn sync_metadata(&self) -> Result<()> {
        self.state.read().meta.sync()?;
        Ok(())
    }
}

/// Rebuild the inode store from the metadata log.
///
/// Replay stops at the first truncated frame. A frame whose checksum fails
/// (or whose payload turns out malformed despite a valid checksum) is
/// skipped with a warning and replay continues, unless
/// `halt_on_corrupt_record` asks for stop-on-first-failure.
fn replay(meta: &MetaLog, store: &mut InodeStore, halt_on_corrupt_record: bool) -> Result<()> {
    let mut pos = 0u64;
    let mut applied = 0u64;
    let mut skipped = 0u64;
    loop {
        match meta.read_frame(pos)? {
            Frame::Truncated => break,
            Frame::Corrupt { record_type, next } => {
                warn!("skipping corrupt record (type {record_type}) at log offset {pos}");
                skipped += 1;
                if halt_on_corrupt_record {
                    warn!("halting replay at first corrupt record");
                    break;
                }
                pos = next;
            }
            Frame::Valid {
                record_type,
                payload,
                next,
            } => {
                match Record::decode(record_type, &payload) {
                    Ok(Record::Unknown { record_type }) => {
                        debug!("ignoring unknown record type {record_type} at log offset {pos}");
                    }
                    Ok(record) => {
                        apply_record(store, record);
                        applied += 1;
                    }
                    Err(err) => {
                        warn!(
                            "skipping malformed record (type {record_type}) at log offset {pos}: {err}"
                        );
                        skipped += 1;
                    }
                }
                pos = next;
            }
        }
    }
    if skipped > 0 {
        warn!("metadata replay skipped {skipped} records");
    }
    debug!(
        "metadata replay applied {applied} records, next inode id {}",
        store.next_id()
    );
    Ok(())
}

fn apply_record(store: &mut InodeStore, record: Record) {
    match record {
        Record::Create(node) | Record::Mkdir(node) => {
            let ts = clamp_timestamp(node.timestamp);
            store.apply_create(node.id, node.path, node.mode, node.size, ts, node.symlink_target);
        }
        Record::Extent {
            id,
            logical_offset,
            data_offset,
            length,
            new_size,
        } => {
            if let Some(inode) = store.get_mut(id) {
                inode.extents.push(Extent {
                    logical_offset,
                    length,
                    data_offset,
                });
                if new_size > inode.size {
                    inode.size = new_size;
                }
            }
        }
        Record::Truncate { id, new_size } => {
            if let Some(inode) = store.get_mut(id) {
                truncate_extents(&mut inode.extents, new_size);
                inode.size = new_size;
            }
        }
        Record::Unlink { id } => store.mark_deleted(id),
        Record::Rename { id, new_path } => store.set_path(id, new_path),
        Record::SetXattr { id, name, value } => {
            if let Some(inode) = store.get_mut(id) {
                inode.set_xattr(&name, &value);
            }
        }
        Record::RemoveXattr { id, name } => {
            if let Some(inode) = store.get_mut(id) {
                inode.remove_xattr(&name);
            }
        }
        Record::Times { id, atime, mtime } => {
            if let Some(inode) = store.get_mut(id) {
                inode.atime = atime;
                inode.mtime = mtime;
            }
        }
        Record::Unknown { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn init_logging() {
        env_logger::builder().is_test(true).try_init().ok();
    }

    #[test]
    fn create_requires_parent() {
        init_logging();
        let root = TempDir::new().unwrap();
        let fs = Engine::open(root.path()).unwrap();
        assert!(matches!(
            fs.create("/missing/f", 0o644),
            Err(Error::NotFound)
        ));
        fs.mkdir("/missing", 0o755).unwrap();
        fs.create("/missing/f", 0o644).unwrap();
    }

    #[test]
    fn create_rejects_duplicates() {
        init_logging();
        let root = TempDir::new().unwrap();
        let fs = Engine::open(root.path()).unwrap();
        fs.create("/f", 0o644).unwrap();
        assert!(matches!(fs.create("/f", 0o644), Err(Error::AlreadyExists)));
        assert!(matches!(fs.mkdir("/f", 0o755), Err(Error::AlreadyExists)));
    }

    #[test]
    fn mkdir_rejects_root() {
        init_logging();
        let root = TempDir::new().unwrap();
        let fs = Engine::open(root.path()).unwrap();
        assert!(matches!(fs.mkdir("/", 0o755), Err(Error::InvalidArgument)));
    }

    #[test]
    fn unlink_and_rmdir_enforce_kinds() {
        init_logging();
        let root = TempDir::new().unwrap();
        let fs = Engine::open(root.path()).unwrap();
        fs.mkdir("/d", 0o755).unwrap();
        fs.create("/d/f", 0o644).unwrap();

        assert!(matches!(fs.unlink("/d"), Err(Error::IsDirectory)));
        assert!(matches!(fs.rmdir("/d/f"), Err(Error::NotADirectory)));
        assert!(matches!(fs.rmdir("/d"), Err(Error::NotEmpty)));

        fs.unlink("/d/f").unwrap();
        fs.rmdir("/d").unwrap();
        assert!(matches!(fs.stat("/d"), Err(Error::NotFound)));
    }

    #[test]
    fn rename_validates_destination_kind() {
        init_logging();
        let root = TempDir::new().unwrap();
        let fs = Engine::open(root.path()).unwrap();
        fs.mkdir("/d", 0o755).unwrap();
        fs.create("/f", 0o644).unwrap();

        assert!(matches!(fs.rename("/d", "/f"), Err(Error::NotADirectory)));
        assert!(matches!(fs.rename("/f", "/d"), Err(Error::IsDirectory)));
        assert!(matches!(fs.rename("/nope", "/x"), Err(Error::NotFound)));
        // Identical source and destination is a no-op.
        fs.rename("/f", "/f").unwrap();
    }

    #[test]
    fn rename_replaces_empty_directory_only() {
        init_logging();
        let root = TempDir::new().unwrap();
        let fs = Engine::open(root.path()).unwrap();
        fs.mkdir("/a", 0o755).unwrap();
        fs.mkdir("/b", 0o755).unwrap();
        fs.create("/b/f", 0o644).unwrap();

        assert!(matches!(fs.rename("/a", "/b"), Err(Error::NotEmpty)));
        fs.unlink("/b/f").unwrap();
        fs.rename("/a", "/b").unwrap();
        assert!(matches!(fs.stat("/a"), Err(Error::NotFound)));
        assert!(fs.stat("/b").unwrap().is_dir());
    }

    #[test]
    fn revival_preserves_inode_id() {
        init_logging();
        let root = TempDir::new().unwrap();
        let fs = Engine::open(root.path()).unwrap();
        fs.create("/f", 0o644).unwrap();
        let first = fs.stat("/f").unwrap();
        fs.unlink("/f").unwrap();
        fs.create("/f", 0o600).unwrap();
        let second = fs.stat("/f").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.mode & 0o777, 0o600);
    }

    #[test]
    fn truncate_rejects_directories() {
        init_logging();
        let root = TempDir::new().unwrap();
        let fs = Engine::open(root.path()).unwrap();
        fs.mkdir("/d", 0o755).unwrap();
        assert!(matches!(fs.truncate("/d", 0), Err(Error::InvalidArgument)));
    }

    #[test]
    fn symlink_round_trip() {
        init_logging();
        let root = TempDir::new().unwrap();
        let fs = Engine::open(root.path()).unwrap();
        fs.symlink("/target/elsewhere", "/link").unwrap();
        assert_eq!(fs.read_link("/link").unwrap(), "/target/elsewhere");
        let info = fs.stat("/link").unwrap();
        assert!(info.is_symlink());
        assert_eq!(info.size, "/target/elsewhere".len() as u64);

        fs.create("/plain", 0o644).unwrap();
        assert!(matches!(fs.read_link("/plain"), Err(Error::InvalidArgument)));
    }

    #[test]
    fn xattr_flag_semantics() {
        init_logging();
        let root = TempDir::new().unwrap();
        let fs = Engine::open(root.path()).unwrap();
        fs.create("/f", 0o644).unwrap();

        assert!(matches!(
            fs.set_xattr("/f", "user.k", b"v", libc::XATTR_REPLACE),
            Err(Error::NoData)
        ));
        fs.set_xattr("/f", "user.k", b"v", libc::XATTR_CREATE).unwrap();
        assert!(matches!(
            fs.set_xattr("/f", "user.k", b"v2", libc::XATTR_CREATE),
            Err(Error::AlreadyExists)
        ));
        fs.set_xattr("/f", "user.k", b"v2", libc::XATTR_REPLACE).unwrap();

        let mut buf = [0u8; 8];
        let n = fs.get_xattr("/f", "user.k", Some(&mut buf)).unwrap();
        assert_eq!(&buf[..n], b"v2");

        let mut tiny = [0u8; 1];
        assert!(matches!(
            fs.get_xattr("/f", "user.k", Some(&mut tiny)),
            Err(Error::Range)
        ));
    }

    #[test]
    fn options_validation() {
        init_logging();
        let root = TempDir::new().unwrap();
        let fs = Engine::open(root.path()).unwrap();
        let bad = EngineOptions {
            write_buffer_size: 1024,
            ..EngineOptions::default()
        };
        assert!(matches!(fs.set_options(bad), Err(Error::InvalidArgument)));
        let good = EngineOptions {
            write_buffer_size: MIN_WRITE_BUFFER_SIZE,
            ..EngineOptions::default()
        };
        fs.set_options(good).unwrap();
        assert_eq!(fs.options().write_buffer_size, MIN_WRITE_BUFFER_SIZE);
    }

    #[test]
    fn link_is_unsupported() {
        init_logging();
        let root = TempDir::new().unwrap();
        let fs = Engine::open(root.path()).unwrap();
        assert!(matches!(fs.link("/a", "/b"), Err(Error::Unsupported)));
    }

    #[test]
    fn children_iteration_stops_on_false() {
        init_logging();
        let root = TempDir::new().unwrap();
        let fs = Engine::open(root.path()).unwrap();
        fs.create("/a", 0o644).unwrap();
        fs.create("/b", 0o644).unwrap();
        fs.create("/c", 0o644).unwrap();

        let mut seen = Vec::new();
        fs.iterate_children("/", |name, _| {
            seen.push(name.to_string());
            seen.len() < 2
        })
        .unwrap();
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn statfs_reports_backing_directory() {
        init_logging();
        let root = TempDir::new().unwrap();
        let fs = Engine::open(root.path()).unwrap();
        let stats = fs.statfs().unwrap();
        assert!(stats.block_size > 0);
        assert!(stats.blocks > 0);
    }
}
