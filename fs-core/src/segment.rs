//! The two append-only backing files.
//!
//! A mounted engine owns exactly two growing files inside its backing
//! directory: the data segment (raw file content, addressed by absolute
//! byte offset, no framing) and the metadata log (framed, checksummed
//! records; the authoritative history). Both are opened read-write and
//! created if absent; the write cursor starts at the file length and only
//! ever moves forward, except for the data-segment rollback taken when a
//! flush fails between its data append and its log append.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::record::{Record, RecordHeader, RECORD_HEADER_SIZE};

fn open_append_file(path: &Path) -> io::Result<(File, u64)> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    let len = file.metadata()?.len();
    Ok((file, len))
}

/// The append-only file of raw file-content bytes.
#[derive(Debug)]
pub struct DataSegment {
    file: File,
    len: u64,
}

impl DataSegment {
    /// Open (creating if absent) the data segment at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (file, len) = open_append_file(path)?;
        Ok(DataSegment { file, len })
    }

    /// Current length of the segment; the next append lands here.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether no bytes have been appended yet.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `bytes` and return the absolute offset they were written at.
    pub fn append(&mut self, bytes: &[u8]) -> io::Result<u64> {
        let offset = self.len;
        self.file.write_all_at(bytes, offset)?;
        self.len += bytes.len() as u64;
        Ok(offset)
    }

    /// Fill `buf` from the segment starting at `offset`.
    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    /// Truncate the segment back to `len`. Used only to undo a data append
    /// whose extent record never made it into the log.
    pub fn rollback_to(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)?;
        self.len = len;
        Ok(())
    }

    /// Push buffered kernel state for the segment to stable storage.
    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }
}

/// One framing step through the metadata log.
#[derive(Debug)]
pub enum Frame {
    /// A record whose checksum verified.
    Valid {
        /// On-disk type tag.
        record_type: u8,
        /// The record payload.
        payload: Vec<u8>,
        /// Offset of the next frame.
        next: u64,
    },
    /// A complete record whose checksum did not match; replay skips it.
    Corrupt {
        /// On-disk type tag as read (possibly itself corrupt).
        record_type: u8,
        /// Offset of the next frame.
        next: u64,
    },
    /// Short header or short payload at the tail; replay stops here.
    Truncated,
}

/// The append-only metadata log.
#[derive(Debug)]
pub struct MetaLog {
    file: File,
    len: u64,
}

impl MetaLog {
    /// Open (creating if absent) the metadata log at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (file, len) = open_append_file(path)?;
        Ok(MetaLog { file, len })
    }

    /// Current length of the log; the next append lands here.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the log holds no records yet.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Frame and append `record`. Failures here are surfaced to the caller,
    /// which must leave (or restore) in-memory state as if the operation
    /// never ran.
    pub fn append(&mut self, record: &Record) -> io::Result<()> {
        let frame = record.to_frame();
        self.file.write_all_at(&frame, self.len)?;
        self.len += frame.len() as u64;
        Ok(())
    }

    /// Read the frame starting at `pos`.
    ///
    /// A short header or short payload yields [`Frame::Truncated`]; a
    /// checksum mismatch yields [`Frame::Corrupt`] with the offset of the
    /// following frame so the caller can continue past it.
    pub fn read_frame(&self, pos: u64) -> io::Result<Frame> {
        if pos + RECORD_HEADER_SIZE as u64 > self.len {
            return Ok(Frame::Truncated);
        }
        let mut header_bytes = [0u8; RECORD_HEADER_SIZE];
        self.file.read_exact_at(&mut header_bytes, pos)?;
        let header = RecordHeader::parse(&header_bytes);

        let payload_start = pos + RECORD_HEADER_SIZE as u64;
        let payload_end = payload_start + header.payload_len as u64;
        if payload_end > self.len {
            return Ok(Frame::Truncated);
        }
        let mut payload = vec![0u8; header.payload_len as usize];
        self.file.read_exact_at(&mut payload, payload_start)?;

        if !header.verify(&payload) {
            return Ok(Frame::Corrupt {
                record_type: header.record_type,
                next: payload_end,
            });
        }
        Ok(Frame::Valid {
            record_type: header.record_type,
            payload,
            next: payload_end,
        })
    }

    /// Push buffered kernel state for the log to stable storage.
    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn data_segment_append_and_read() {
        let dir = TempDir::new().unwrap();
        let mut seg = DataSegment::open(&dir.path().join("data")).unwrap();
        assert!(seg.is_empty());

        let first = seg.append(b"hello ").unwrap();
        let second = seg.append(b"world").unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 6);
        assert_eq!(seg.len(), 11);

        let mut buf = [0u8; 5];
        seg.read_exact_at(&mut buf, second).unwrap();
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn data_segment_rollback() {
        let dir = TempDir::new().unwrap();
        let mut seg = DataSegment::open(&dir.path().join("data")).unwrap();
        seg.append(b"keep").unwrap();
        let mark = seg.len();
        seg.append(b"discard").unwrap();
        seg.rollback_to(mark).unwrap();
        assert_eq!(seg.len(), 4);

        // The discarded bytes are gone from the reopened file too.
        drop(seg);
        let seg = DataSegment::open(&dir.path().join("data")).unwrap();
        assert_eq!(seg.len(), 4);
    }

    #[test]
    fn meta_log_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut log = MetaLog::open(&dir.path().join("meta")).unwrap();
        log.append(&Record::Unlink { id: 1 }).unwrap();
        log.append(&Record::Truncate { id: 2, new_size: 10 }).unwrap();

        let mut pos = 0;
        let mut seen = Vec::new();
        loop {
            match log.read_frame(pos).unwrap() {
                Frame::Valid {
                    record_type,
                    payload,
                    next,
                } => {
                    seen.push(Record::decode(record_type, &payload).unwrap());
                    pos = next;
                }
                Frame::Truncated => break,
                Frame::Corrupt { .. } => panic!("unexpected corruption"),
            }
        }
        assert_eq!(
            seen,
            vec![Record::Unlink { id: 1 }, Record::Truncate { id: 2, new_size: 10 }]
        );
    }

    #[test]
    fn corrupt_record_reports_next_offset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta");
        let mut log = MetaLog::open(&path).unwrap();
        log.append(&Record::Unlink { id: 1 }).unwrap();
        let second_start = log.len();
        log.append(&Record::Unlink { id: 2 }).unwrap();
        drop(log);

        // Flip one payload byte of the second record.
        let mut bytes = std::fs::read(&path).unwrap();
        let target = second_start as usize + RECORD_HEADER_SIZE;
        bytes[target] ^= 0xff;
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&bytes)
            .unwrap();

        let log = MetaLog::open(&path).unwrap();
        match log.read_frame(0).unwrap() {
            Frame::Valid { next, .. } => match log.read_frame(next).unwrap() {
                Frame::Corrupt { next, .. } => {
                    assert!(matches!(log.read_frame(next).unwrap(), Frame::Truncated));
                }
                other => panic!("expected corrupt frame, got {other:?}"),
            },
            other => panic!("expected valid frame, got {other:?}"),
        }
    }

    #[test]
    fn partial_header_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta");
        let mut log = MetaLog::open(&path).unwrap();
        log.append(&Record::Unlink { id: 1 }).unwrap();
        drop(log);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0x03, 0x01]).unwrap();
        drop(file);

        let log = MetaLog::open(&path).unwrap();
        match log.read_frame(0).unwrap() {
            Frame::Valid { next, .. } => {
                assert!(matches!(log.read_frame(next).unwrap(), Frame::Truncated));
            }
            other => panic!("expected valid frame, got {other:?}"),
        }
    }
}
