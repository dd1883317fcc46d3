//! Open-file handles: per-handle write buffering and the flush pipeline.
//!
//! A handle stages contiguous writes in a private buffer and turns each
//! buffered run into one data-segment append plus one extent record. The
//! flush is the engine's atomic unit: data bytes land first, then the
//! in-memory extent list and size, then the extent record; a failed record
//! append rolls the data segment and the inode back so no half-written
//! extent is ever observable.

use log::{debug, warn};
use std::sync::Arc;

use crate::engine::{now_secs, Engine, EngineState};
use crate::error::{Error, Result};
use crate::record::Record;

/// An open file handle, created by [`Engine::open_file`] and flushed on
/// drop. Closing implies flushing.
pub struct FileHandle {
    engine: Arc<Engine>,
    inode_id: u64,
    buffer: Vec<u8>,
    capacity: usize,
    buffer_offset: u64,
    flags: i32,
    position: u64,
}

impl FileHandle {
    pub(crate) fn new(
        engine: Arc<Engine>,
        inode_id: u64,
        capacity: usize,
        flags: i32,
        position: u64,
    ) -> Self {
        FileHandle {
            engine,
            inode_id,
            buffer: Vec::with_capacity(capacity),
            capacity,
            buffer_offset: 0,
            flags,
            position,
        }
    }

    /// Id of the inode this handle writes to.
    pub fn inode_id(&self) -> u64 {
        self.inode_id
    }

    /// Open flags the handle was created with.
    pub fn flags(&self) -> i32 {
        self.flags
    }

    /// Current file position, as maintained by writes and seeks.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Number of bytes currently staged in the buffer.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Buffer `data` at `offset`, flushing as needed.
    ///
    /// A write that is not contiguous with the buffered run flushes first
    /// and starts a new run at `offset`. The buffer flushes whenever it
    /// reaches capacity; writes larger than the capacity flush repeatedly.
    /// Returns the number of bytes accepted, which is always `data.len()`.
    pub fn write(&mut self, data: &[u8], offset: u64) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut guard = self.engine.state.write();
        let state = &mut *guard;

        if !self.buffer.is_empty() && offset != self.buffer_offset + self.buffer.len() as u64 {
            flush_buffer(state, self.inode_id, &mut self.buffer, self.buffer_offset)?;
        }
        if self.buffer.is_empty() {
            self.buffer_offset = offset;
        }

        let mut copied = 0usize;
        while copied < data.len() {
            let mut space = self.capacity - self.buffer.len();
            if space == 0 {
                flush_buffer(state, self.inode_id, &mut self.buffer, self.buffer_offset)?;
                self.buffer_offset = offset + copied as u64;
                space = self.capacity;
            }
            let take = space.min(data.len() - copied);
            self.buffer.extend_from_slice(&data[copied..copied + take]);
            copied += take;

            // Full and past the minimum flush granularity: the capacity is
            // the live trigger (the option floor keeps the two aligned).
            if self.buffer.len() >= self.capacity && self.buffer.len() >= crate::MIN_WRITE_BUFFER_SIZE
            {
                flush_buffer(state, self.inode_id, &mut self.buffer, self.buffer_offset)?;
                self.buffer_offset = offset + copied as u64;
            }
        }
        self.position = offset + data.len() as u64;
        Ok(data.len())
    }

    /// Flush any buffered bytes to the data segment and the log.
    pub fn flush(&mut self) -> Result<()> {
        let mut guard = self.engine.state.write();
        flush_buffer(&mut guard, self.inode_id, &mut self.buffer, self.buffer_offset)
    }

    /// Flush, then push the data segment to stable storage; a full (non
    /// data-only) sync also pushes the metadata log.
    pub fn fsync(&mut self, datasync: bool) -> Result<()> {
        let mut guard = self.engine.state.write();
        let state = &mut *guard;
        flush_buffer(state, self.inode_id, &mut self.buffer, self.buffer_offset)?;
        state.data.sync()?;
        if !datasync {
            state.meta.sync()?;
        }
        Ok(())
    }

    /// Reposition the handle. Buffered bytes flush before any seek so the
    /// buffered run never becomes non-contiguous with the position.
    ///
    /// Supports `SEEK_SET`, `SEEK_CUR`, `SEEK_END`, and the extent-aware
    /// `SEEK_DATA`/`SEEK_HOLE`, which walk the extent list and fail
    /// `ENXIO` when no matching region exists past `offset`.
    pub fn seek(&mut self, offset: i64, whence: i32) -> Result<u64> {
        let mut guard = self.engine.state.write();
        let state = &mut *guard;
        if !self.buffer.is_empty() {
            flush_buffer(state, self.inode_id, &mut self.buffer, self.buffer_offset)?;
        }
        let inode = state.store.get(self.inode_id).ok_or(Error::NotFound)?;
        let size = inode.size;

        match whence {
            libc::SEEK_SET | libc::SEEK_CUR | libc::SEEK_END => {
                let base = match whence {
                    libc::SEEK_CUR => self.position as i64,
                    libc::SEEK_END => size as i64,
                    _ => 0,
                };
                let target = base.checked_add(offset).ok_or(Error::InvalidArgument)?;
                if target < 0 {
                    return Err(Error::InvalidArgument);
                }
                self.position = target as u64;
                Ok(self.position)
            }
            libc::SEEK_DATA => {
                if offset < 0 {
                    return Err(Error::InvalidArgument);
                }
                let offset = offset as u64;
                if offset >= size {
                    return Err(Error::OffsetOutOfRange);
                }
                for extent in &inode.extents {
                    if extent.logical_end() <= offset {
                        continue;
                    }
                    let found = offset.max(extent.logical_offset);
                    self.position = found;
                    return Ok(found);
                }
                Err(Error::OffsetOutOfRange)
            }
            libc::SEEK_HOLE => {
                if offset < 0 {
                    return Err(Error::InvalidArgument);
                }
                let offset = offset as u64;
                if offset >= size {
                    self.position = size;
                    return Ok(size);
                }
                let mut pos = offset;
                for extent in &inode.extents {
                    if pos < extent.logical_offset {
                        break;
                    }
                    if pos < extent.logical_end() {
                        pos = extent.logical_end();
                    }
                }
                let pos = pos.min(size);
                self.position = pos;
                Ok(pos)
            }
            _ => Err(Error::InvalidArgument),
        }
    }

    /// Flush and consume the handle.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            if let Err(err) = self.flush() {
                warn!(
                    "dropping handle on inode {} with unflushed data: {err}",
                    self.inode_id
                );
            }
        }
    }
}

/// The flush pipeline (one atomic unit):
///
/// 1. remember the data-segment length `d`,
/// 2. append the buffered bytes,
/// 3. append the extent `(buffer_offset, len, d)` to the inode and raise
///    its size and mtime,
/// 4. append the extent record (which piggy-backs the new size),
/// 5. reset the buffer.
///
/// A failure in step 2 leaves everything untouched. A failure in step 4
/// truncates the data segment back to `d` and restores the inode, so the
/// log and memory agree that the flush never happened.
fn flush_buffer(
    state: &mut EngineState,
    inode_id: u64,
    buffer: &mut Vec<u8>,
    buffer_offset: u64,
) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }
    let length = buffer.len() as u32;
    let data_offset = state.data.len();
    state.data.append(buffer)?;

    let inode = state.store.get_mut(inode_id).ok_or(Error::NotFound)?;
    let prior_size = inode.size;
    let prior_mtime = inode.mtime;
    inode.extents.push(crate::inode::Extent {
        logical_offset: buffer_offset,
        length,
        data_offset,
    });
    let end = buffer_offset + length as u64;
    if end > inode.size {
        inode.size = end;
    }
    inode.mtime = now_secs();
    let new_size = inode.size;

    let record = Record::Extent {
        id: inode_id,
        logical_offset: buffer_offset,
        data_offset,
        length,
        new_size,
    };
    if let Err(err) = state.meta.append(&record) {
        if let Some(inode) = state.store.get_mut(inode_id) {
            inode.extents.pop();
            inode.size = prior_size;
            inode.mtime = prior_mtime;
        }
        if let Err(rollback_err) = state.data.rollback_to(data_offset) {
            warn!("data segment rollback after failed extent append also failed: {rollback_err}");
        }
        return Err(err.into());
    }

    debug!(
        "flushed {length} bytes of inode {inode_id} at logical offset {buffer_offset} (data offset {data_offset})"
    );
    buffer.clear();
    Ok(())
}
