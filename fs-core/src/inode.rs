//! In-memory namespace: inodes, extents, and the lookup indexes.
//!
//! The inode set is the materialisation of the metadata log. Entries are
//! never physically removed during a mount: a deleted inode stays resident
//! (excluded from path lookup and iteration) so that later log records
//! addressing its id remain applicable during replay, and so that a create
//! over the same path can revive it with its id preserved.

use std::collections::HashMap;

/// Returns true when `mode` carries the directory file type.
pub fn mode_is_dir(mode: u32) -> bool {
    mode & libc::S_IFMT == libc::S_IFDIR
}

/// Returns true when `mode` carries the regular-file file type.
pub fn mode_is_regular(mode: u32) -> bool {
    mode & libc::S_IFMT == libc::S_IFREG
}

/// Returns true when `mode` carries the symlink file type.
pub fn mode_is_symlink(mode: u32) -> bool {
    mode & libc::S_IFMT == libc::S_IFLNK
}

/// Canonicalise a path: a leading `/` is added if missing and trailing
/// slashes are stripped (except for the root itself). Returns `None` for an
/// empty path.
pub fn normalize_path(path: &str) -> Option<String> {
    if path.is_empty() {
        return None;
    }
    let mut normalized = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    Some(normalized)
}

/// Parent of a canonical path; `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// If `candidate` is an immediate child of the directory at `parent`,
/// return its final name component.
pub fn immediate_child_name<'a>(parent: &str, candidate: &'a str) -> Option<&'a str> {
    let rest = if parent == "/" {
        candidate.strip_prefix('/')?
    } else {
        candidate.strip_prefix(parent)?.strip_prefix('/')?
    };
    if rest.is_empty() || rest.contains('/') {
        return None;
    }
    Some(rest)
}

/// Whether `candidate` lies strictly inside the directory at `dir`.
pub fn path_is_within(candidate: &str, dir: &str) -> bool {
    if dir == "/" {
        return candidate.len() > 1 && candidate.starts_with('/');
    }
    candidate.len() > dir.len()
        && candidate.starts_with(dir)
        && candidate.as_bytes()[dir.len()] == b'/'
}

/// A mapping from a logical byte range of a file to a contiguous region of
/// the data segment. Immutable once appended, except that truncate may
/// shorten it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Offset in the file where this extent begins.
    pub logical_offset: u64,
    /// Number of bytes.
    pub length: u32,
    /// Absolute offset in the data segment where the bytes live.
    pub data_offset: u64,
}

impl Extent {
    /// One past the last logical byte this extent covers.
    pub fn logical_end(&self) -> u64 {
        self.logical_offset + self.length as u64
    }
}

/// Apply a truncate-to-`size` walk to an extent list: drop the tail
/// starting at the first extent whose logical offset is at or past the new
/// size, then shorten any remaining extent that straddles it. Later reads
/// clamp at the inode size, so extents ending exactly at `size` survive
/// untouched and overlapping history is preserved.
pub(crate) fn truncate_extents(extents: &mut Vec<Extent>, size: u64) {
    if let Some(idx) = extents.iter().position(|e| e.logical_offset >= size) {
        extents.truncate(idx);
    }
    for extent in extents.iter_mut() {
        if extent.logical_end() > size {
            extent.length = (size - extent.logical_offset) as u32;
        }
    }
}

/// One extended attribute. Listing preserves insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xattr {
    /// Attribute name; unique within an inode.
    pub name: String,
    /// Attribute value.
    pub value: Vec<u8>,
}

/// An in-memory inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    /// Unique id, assigned in strictly increasing order from 1 and never
    /// reused.
    pub id: u64,
    /// Canonical absolute path.
    pub path: String,
    /// POSIX mode bits including the file type.
    pub mode: u32,
    /// Effective EOF as observed by readers.
    pub size: u64,
    /// Inode change time, seconds since the epoch.
    pub ctime: i64,
    /// Modification time, seconds since the epoch.
    pub mtime: i64,
    /// Access time, seconds since the epoch.
    pub atime: i64,
    /// Deletion flag; a deleted inode is invisible to path lookup but stays
    /// addressable by id.
    pub deleted: bool,
    /// Extent history, ordered by insertion; later extents override earlier
    /// ones over overlapping logical ranges.
    pub extents: Vec<Extent>,
    /// Symlink target, present iff `mode` is a symlink.
    pub symlink_target: Option<String>,
    /// Extended attributes in insertion order.
    pub xattrs: Vec<Xattr>,
}

impl Inode {
    fn new(id: u64, path: String, mode: u32, now: i64) -> Self {
        Inode {
            id,
            path,
            mode,
            size: 0,
            ctime: now,
            mtime: now,
            atime: now,
            deleted: false,
            extents: Vec::new(),
            symlink_target: None,
            xattrs: Vec::new(),
        }
    }

    /// Whether this inode is a directory.
    pub fn is_dir(&self) -> bool {
        mode_is_dir(self.mode)
    }

    /// Whether this inode is a regular file.
    pub fn is_regular(&self) -> bool {
        mode_is_regular(self.mode)
    }

    /// Whether this inode is a symlink.
    pub fn is_symlink(&self) -> bool {
        mode_is_symlink(self.mode)
    }

    /// Look up one xattr value by name.
    pub fn xattr(&self, name: &str) -> Option<&[u8]> {
        self.xattrs
            .iter()
            .find(|x| x.name == name)
            .map(|x| x.value.as_slice())
    }

    /// Insert or replace an xattr, returning the previous value if any.
    pub fn set_xattr(&mut self, name: &str, value: &[u8]) -> Option<Vec<u8>> {
        if let Some(existing) = self.xattrs.iter_mut().find(|x| x.name == name) {
            return Some(std::mem::replace(&mut existing.value, value.to_vec()));
        }
        self.xattrs.push(Xattr {
            name: name.to_string(),
            value: value.to_vec(),
        });
        None
    }

    /// Remove an xattr by name, returning its value if it was present.
    pub fn remove_xattr(&mut self, name: &str) -> Option<Vec<u8>> {
        let idx = self.xattrs.iter().position(|x| x.name == name)?;
        Some(self.xattrs.remove(idx).value)
    }

    /// Reset the inode for reuse under a (possibly new) path: extents,
    /// symlink target, and xattrs are cleared, the deletion flag drops.
    fn reset(&mut self, path: String, mode: u32, size: u64, now: i64) {
        self.path = path;
        self.mode = mode;
        self.size = size;
        self.ctime = now;
        self.mtime = now;
        self.atime = now;
        self.deleted = false;
        self.extents.clear();
        self.symlink_target = None;
        self.xattrs.clear();
    }
}

/// The inode set with its two lookup views: by id (replay, extent and xattr
/// records) and by canonical path (operations).
#[derive(Debug, Default)]
pub struct InodeStore {
    inodes: Vec<Inode>,
    by_id: HashMap<u64, usize>,
    by_path: HashMap<String, u64>,
    next_id: u64,
}

impl InodeStore {
    /// An empty store; ids start at 1.
    pub fn new() -> Self {
        InodeStore {
            inodes: Vec::new(),
            by_id: HashMap::new(),
            by_path: HashMap::new(),
            next_id: 1,
        }
    }

    /// The id the next created inode will receive.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Number of resident inodes, deleted entries included.
    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    /// Whether the store holds no inodes at all.
    pub fn is_empty(&self) -> bool {
        self.inodes.is_empty()
    }

    /// Look up by id; deleted entries are included (replay needs them).
    pub fn get(&self, id: u64) -> Option<&Inode> {
        self.by_id.get(&id).map(|&idx| &self.inodes[idx])
    }

    /// Mutable lookup by id, deleted entries included.
    pub fn get_mut(&mut self, id: u64) -> Option<&mut Inode> {
        let idx = *self.by_id.get(&id)?;
        Some(&mut self.inodes[idx])
    }

    /// Look up a non-deleted inode by canonical path.
    pub fn find_by_path(&self, path: &str) -> Option<&Inode> {
        let id = *self.by_path.get(path)?;
        self.get(id).filter(|inode| !inode.deleted)
    }

    /// Id of the non-deleted inode at `path`, if any.
    pub fn id_by_path(&self, path: &str) -> Option<u64> {
        self.find_by_path(path).map(|inode| inode.id)
    }

    /// Id of the most recently deleted inode whose last path was `path`.
    /// Create revives such an entry instead of allocating a fresh id.
    pub fn deleted_id_by_path(&self, path: &str) -> Option<u64> {
        self.inodes
            .iter()
            .rev()
            .find(|inode| inode.deleted && inode.path == path)
            .map(|inode| inode.id)
    }

    /// Iterate all resident inodes in id-insertion order, deleted entries
    /// included; callers filter.
    pub fn iter(&self) -> impl Iterator<Item = &Inode> {
        self.inodes.iter()
    }

    /// True iff no non-deleted inode is an immediate child of `dir_path`.
    pub fn is_dir_empty(&self, dir_path: &str) -> bool {
        !self.iter().any(|inode| {
            !inode.deleted
                && inode.path != dir_path
                && immediate_child_name(dir_path, &inode.path).is_some()
        })
    }

    /// Insert a brand-new inode at `path` with the next id, which is then
    /// advanced. The caller has already durably logged the creation.
    pub fn insert_new(&mut self, path: String, mode: u32, now: i64) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.insert_inode(Inode::new(id, path, mode, now));
        id
    }

    /// Revive the deleted inode `id` at `path`: id preserved, extents,
    /// xattrs and symlink target cleared, mode and times reset.
    pub fn revive(&mut self, id: u64, path: String, mode: u32, now: i64) {
        self.unmap_path(id);
        let idx = match self.by_id.get(&id) {
            Some(&idx) => idx,
            None => return,
        };
        self.inodes[idx].reset(path.clone(), mode, 0, now);
        self.by_path.insert(path, id);
    }

    /// Mark `id` deleted and drop it from the path index.
    pub fn mark_deleted(&mut self, id: u64) {
        self.unmap_path(id);
        if let Some(inode) = self.get_mut(id) {
            inode.deleted = true;
        }
    }

    /// Move `id` to `new_path`, clearing its deletion flag.
    pub fn set_path(&mut self, id: u64, new_path: String) {
        self.unmap_path(id);
        let idx = match self.by_id.get(&id) {
            Some(&idx) => idx,
            None => return,
        };
        self.inodes[idx].path = new_path.clone();
        self.inodes[idx].deleted = false;
        self.by_path.insert(new_path, id);
    }

    /// Apply a replayed CREATE/MKDIR: allocate the id if it is new,
    /// otherwise reset the existing entry (a revival), and advance the id
    /// counter past it.
    pub fn apply_create(
        &mut self,
        id: u64,
        path: String,
        mode: u32,
        size: u64,
        timestamp: i64,
        symlink_target: Option<String>,
    ) {
        if let Some(&idx) = self.by_id.get(&id) {
            self.unmap_path(id);
            let inode = &mut self.inodes[idx];
            inode.reset(path.clone(), mode, size, timestamp);
            inode.symlink_target = symlink_target;
            self.by_path.insert(path, id);
        } else {
            let mut inode = Inode::new(id, path, mode, timestamp);
            inode.size = size;
            inode.symlink_target = symlink_target;
            self.insert_inode(inode);
        }
        if self.next_id <= id {
            self.next_id = id + 1;
        }
    }

    fn insert_inode(&mut self, inode: Inode) {
        let idx = self.inodes.len();
        self.by_id.insert(inode.id, idx);
        self.by_path.insert(inode.path.clone(), inode.id);
        self.inodes.push(inode);
    }

    /// Drop the path-index entry for `id` if it currently points at it.
    fn unmap_path(&mut self, id: u64) {
        let path = match self.get(id) {
            Some(inode) => inode.path.clone(),
            None => return,
        };
        if self.by_path.get(&path) == Some(&id) {
            self.by_path.remove(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn normalize_paths() {
        assert_eq!(normalize_path("/a/b").as_deref(), Some("/a/b"));
        assert_eq!(normalize_path("a/b").as_deref(), Some("/a/b"));
        assert_eq!(normalize_path("/a/b/").as_deref(), Some("/a/b"));
        assert_eq!(normalize_path("/").as_deref(), Some("/"));
        assert_eq!(normalize_path(""), None);
    }

    #[test]
    fn parent_paths() {
        assert_eq!(parent_path("/a/b"), Some("/a"));
        assert_eq!(parent_path("/a"), Some("/"));
        assert_eq!(parent_path("/"), None);
    }

    #[test]
    fn immediate_children() {
        assert_eq!(immediate_child_name("/", "/a"), Some("a"));
        assert_eq!(immediate_child_name("/", "/a/b"), None);
        assert_eq!(immediate_child_name("/a", "/a/b"), Some("b"));
        assert_eq!(immediate_child_name("/a", "/a/b/c"), None);
        assert_eq!(immediate_child_name("/a", "/ab"), None);
        assert_eq!(immediate_child_name("/a", "/a"), None);
    }

    #[test]
    fn within_checks() {
        assert!(path_is_within("/a/b", "/a"));
        assert!(path_is_within("/a/b/c", "/a"));
        assert!(!path_is_within("/ab", "/a"));
        assert!(!path_is_within("/a", "/a"));
        assert!(path_is_within("/a", "/"));
    }

    #[test]
    fn store_lookup_and_delete() {
        let mut store = InodeStore::new();
        let id = store.insert_new("/f".to_string(), libc::S_IFREG | 0o644, NOW);
        assert_eq!(id, 1);
        assert_eq!(store.next_id(), 2);
        assert_eq!(store.id_by_path("/f"), Some(id));

        store.mark_deleted(id);
        assert_eq!(store.id_by_path("/f"), None);
        // Still addressable by id.
        assert!(store.get(id).unwrap().deleted);
        assert_eq!(store.deleted_id_by_path("/f"), Some(id));
    }

    #[test]
    fn revive_preserves_id_and_clears_state() {
        let mut store = InodeStore::new();
        let id = store.insert_new("/f".to_string(), libc::S_IFREG | 0o644, NOW);
        {
            let inode = store.get_mut(id).unwrap();
            inode.extents.push(Extent {
                logical_offset: 0,
                length: 4,
                data_offset: 0,
            });
            inode.set_xattr("user.k", b"v");
            inode.size = 4;
        }
        store.mark_deleted(id);
        store.revive(id, "/f".to_string(), libc::S_IFREG | 0o600, NOW + 1);

        let inode = store.find_by_path("/f").unwrap();
        assert_eq!(inode.id, id);
        assert_eq!(inode.size, 0);
        assert!(inode.extents.is_empty());
        assert!(inode.xattrs.is_empty());
        assert_eq!(inode.mode, libc::S_IFREG | 0o600);
        // Revival does not burn a fresh id.
        assert_eq!(store.next_id(), 2);
    }

    #[test]
    fn apply_create_bumps_next_id() {
        let mut store = InodeStore::new();
        store.apply_create(7, "/x".to_string(), libc::S_IFDIR | 0o755, 0, NOW, None);
        assert_eq!(store.next_id(), 8);
        assert!(store.find_by_path("/x").unwrap().is_dir());

        // Re-creating the same id is a revival, not a duplicate.
        store.apply_create(7, "/y".to_string(), libc::S_IFREG | 0o644, 0, NOW, None);
        assert_eq!(store.len(), 1);
        assert_eq!(store.id_by_path("/y"), Some(7));
        assert_eq!(store.id_by_path("/x"), None);
    }

    #[test]
    fn truncate_walk_drops_tail_and_shortens_straddler() {
        // Mirrors an overwrite history: (0,4) then (1,2).
        let mut extents = vec![
            Extent {
                logical_offset: 0,
                length: 4,
                data_offset: 0,
            },
            Extent {
                logical_offset: 1,
                length: 2,
                data_offset: 4,
            },
        ];
        truncate_extents(&mut extents, 3);
        assert_eq!(extents.len(), 2);
        assert_eq!(extents[0].length, 3);
        assert_eq!(extents[1].length, 2);

        truncate_extents(&mut extents, 1);
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].length, 1);

        truncate_extents(&mut extents, 0);
        assert!(extents.is_empty());
    }

    #[test]
    fn dir_emptiness() {
        let mut store = InodeStore::new();
        store.insert_new("/d".to_string(), libc::S_IFDIR | 0o755, NOW);
        assert!(store.is_dir_empty("/d"));
        let child = store.insert_new("/d/f".to_string(), libc::S_IFREG | 0o644, NOW);
        assert!(!store.is_dir_empty("/d"));
        store.mark_deleted(child);
        assert!(store.is_dir_empty("/d"));
        // Grandchildren alone do not make a directory non-empty.
        store.insert_new("/d/sub/f".to_string(), libc::S_IFREG | 0o644, NOW);
        assert!(store.is_dir_empty("/d"));
    }
}
