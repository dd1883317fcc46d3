//! Metadata log record codec.
//!
//! Every mutation of the namespace is captured as one framed record in the
//! metadata log. A record is a 9-byte header followed by its payload:
//!
//! | offset | size | field                                  |
//! |--------|------|----------------------------------------|
//! | 0      | 1    | record type                            |
//! | 1      | 4    | payload length, little-endian u32      |
//! | 5      | 4    | CRC-32 of the payload, little-endian   |
//!
//! The checksum covers the payload only; the type and length bytes are not
//! included. All multi-byte integers in payloads are little-endian.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use thiserror::Error;

use crate::inode::mode_is_symlink;

/// Size of the fixed record header in bytes.
pub const RECORD_HEADER_SIZE: usize = 9;

/// Record type tags as they appear on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Regular file or symlink creation (revives a deleted id).
    Create = 1,
    /// A flushed write: one extent plus the resulting file size.
    Extent = 2,
    /// File size change; shortens the extent list.
    Truncate = 3,
    /// Mark an inode deleted.
    Unlink = 4,
    /// Replace an inode's path.
    Rename = 5,
    /// Directory creation; same payload as `Create`.
    Mkdir = 6,
    /// Upsert one extended attribute.
    SetXattr = 7,
    /// Remove one extended attribute.
    RemoveXattr = 8,
    /// Set access and modification times.
    Times = 9,
}

impl RecordType {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(RecordType::Create),
            2 => Some(RecordType::Extent),
            3 => Some(RecordType::Truncate),
            4 => Some(RecordType::Unlink),
            5 => Some(RecordType::Rename),
            6 => Some(RecordType::Mkdir),
            7 => Some(RecordType::SetXattr),
            8 => Some(RecordType::RemoveXattr),
            9 => Some(RecordType::Times),
            _ => None,
        }
    }
}

/// Payload of a `Create` or `Mkdir` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    /// Inode id.
    pub id: u64,
    /// POSIX mode bits including the file type.
    pub mode: u32,
    /// Initial size (zero for files and directories, target length for
    /// symlinks).
    pub size: u64,
    /// Creation timestamp, seconds since the epoch.
    pub timestamp: u64,
    /// Canonical absolute path.
    pub path: String,
    /// Symlink target; present iff `mode` is a symlink and the record
    /// carried the trailing target suffix.
    pub symlink_target: Option<String>,
}

/// A decoded metadata log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// Regular file or symlink creation.
    Create(NodeRecord),
    /// Directory creation.
    Mkdir(NodeRecord),
    /// A flushed write extent and the file size it produced.
    Extent {
        /// Inode id.
        id: u64,
        /// Offset in the file where the extent begins.
        logical_offset: u64,
        /// Absolute offset of the bytes in the data segment.
        data_offset: u64,
        /// Number of bytes.
        length: u32,
        /// File size after the write that produced this extent.
        new_size: u64,
    },
    /// File size change.
    Truncate {
        /// Inode id.
        id: u64,
        /// Size after the truncate.
        new_size: u64,
    },
    /// Inode deletion.
    Unlink {
        /// Inode id.
        id: u64,
    },
    /// Path replacement.
    Rename {
        /// Inode id.
        id: u64,
        /// The inode's new canonical path.
        new_path: String,
    },
    /// Extended attribute upsert.
    SetXattr {
        /// Inode id.
        id: u64,
        /// Attribute name.
        name: String,
        /// Attribute value.
        value: Vec<u8>,
    },
    /// Extended attribute removal.
    RemoveXattr {
        /// Inode id.
        id: u64,
        /// Attribute name.
        name: String,
    },
    /// Access and modification time update.
    Times {
        /// Inode id.
        id: u64,
        /// Access time, seconds since the epoch.
        atime: i64,
        /// Modification time, seconds since the epoch.
        mtime: i64,
    },
    /// A record whose type tag this version does not know. Skipped on
    /// replay for forward compatibility; never encoded.
    Unknown {
        /// The unrecognised on-disk type tag.
        record_type: u8,
    },
}

/// Failure to decode a record payload whose checksum was valid.
///
/// These are recoverable during replay (the record is skipped with a
/// warning) and would indicate a logic error during live append.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The payload ended before the layout said it would.
    #[error("payload truncated")]
    Truncated,

    /// A size or offset field does not fit a signed 64-bit value. The
    /// on-disk representation is unsigned; negative values are rejected
    /// rather than reinterpreted.
    #[error("size or offset out of range")]
    ValueOutOfRange,

    /// An extent record with zero length.
    #[error("empty extent")]
    EmptyExtent,

    /// A path, attribute name, or symlink target is not valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
}

impl From<std::io::Error> for DecodeError {
    fn from(_: std::io::Error) -> Self {
        DecodeError::Truncated
    }
}

fn read_string(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<String, DecodeError> {
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| DecodeError::InvalidUtf8)
}

fn check_signed(value: u64) -> Result<u64, DecodeError> {
    if value > i64::MAX as u64 {
        return Err(DecodeError::ValueOutOfRange);
    }
    Ok(value)
}

impl Record {
    /// On-disk type tag for this record.
    pub fn record_type(&self) -> u8 {
        match self {
            Record::Create(_) => RecordType::Create as u8,
            Record::Extent { .. } => RecordType::Extent as u8,
            Record::Truncate { .. } => RecordType::Truncate as u8,
            Record::Unlink { .. } => RecordType::Unlink as u8,
            Record::Rename { .. } => RecordType::Rename as u8,
            Record::Mkdir(_) => RecordType::Mkdir as u8,
            Record::SetXattr { .. } => RecordType::SetXattr as u8,
            Record::RemoveXattr { .. } => RecordType::RemoveXattr as u8,
            Record::Times { .. } => RecordType::Times as u8,
            Record::Unknown { record_type } => *record_type,
        }
    }

    /// Serialise the payload (header excluded).
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Record::Create(node) | Record::Mkdir(node) => {
                buf.write_u64::<LittleEndian>(node.id).unwrap();
                buf.write_u32::<LittleEndian>(node.mode).unwrap();
                buf.write_u64::<LittleEndian>(node.size).unwrap();
                buf.write_u64::<LittleEndian>(node.timestamp).unwrap();
                buf.write_u32::<LittleEndian>(node.path.len() as u32).unwrap();
                buf.extend_from_slice(node.path.as_bytes());
                if let Some(target) = &node.symlink_target {
                    buf.write_u32::<LittleEndian>(target.len() as u32).unwrap();
                    buf.extend_from_slice(target.as_bytes());
                }
            }
            Record::Extent {
                id,
                logical_offset,
                data_offset,
                length,
                new_size,
            } => {
                buf.write_u64::<LittleEndian>(*id).unwrap();
                buf.write_u64::<LittleEndian>(*logical_offset).unwrap();
                buf.write_u64::<LittleEndian>(*data_offset).unwrap();
                buf.write_u32::<LittleEndian>(*length).unwrap();
                buf.write_u64::<LittleEndian>(*new_size).unwrap();
            }
            Record::Truncate { id, new_size } => {
                buf.write_u64::<LittleEndian>(*id).unwrap();
                buf.write_u64::<LittleEndian>(*new_size).unwrap();
            }
            Record::Unlink { id } => {
                buf.write_u64::<LittleEndian>(*id).unwrap();
            }
            Record::Rename { id, new_path } => {
                buf.write_u64::<LittleEndian>(*id).unwrap();
                buf.write_u32::<LittleEndian>(new_path.len() as u32).unwrap();
                buf.extend_from_slice(new_path.as_bytes());
            }
            Record::SetXattr { id, name, value } => {
                buf.write_u64::<LittleEndian>(*id).unwrap();
                buf.write_u32::<LittleEndian>(name.len() as u32).unwrap();
                buf.write_u32::<LittleEndian>(value.len() as u32).unwrap();
                buf.extend_from_slice(name.as_bytes());
                buf.extend_from_slice(value);
            }
            Record::RemoveXattr { id, name } => {
                buf.write_u64::<LittleEndian>(*id).unwrap();
                buf.write_u32::<LittleEndian>(name.len() as u32).unwrap();
                buf.extend_from_slice(name.as_bytes());
            }
            Record::Times { id, atime, mtime } => {
                buf.write_u64::<LittleEndian>(*id).unwrap();
                buf.write_i64::<LittleEndian>(*atime).unwrap();
                buf.write_i64::<LittleEndian>(*mtime).unwrap();
            }
            Record::Unknown { .. } => {
                debug_assert!(false, "unknown records are decode-only");
            }
        }
        buf
    }

    /// Serialise the framed record: header plus payload, checksum filled in.
    pub fn to_frame(&self) -> Vec<u8> {
        let payload = self.encode_payload();
        let mut frame = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
        frame.push(self.record_type());
        frame
            .write_u32::<LittleEndian>(payload.len() as u32)
            .unwrap();
        frame
            .write_u32::<LittleEndian>(crc32fast::hash(&payload))
            .unwrap();
        frame.extend_from_slice(&payload);
        frame
    }

    /// Decode a payload whose checksum already verified.
    ///
    /// Unrecognised type tags decode to [`Record::Unknown`] so that replay
    /// can skip them without failing.
    pub fn decode(record_type: u8, payload: &[u8]) -> Result<Record, DecodeError> {
        let kind = match RecordType::from_byte(record_type) {
            Some(kind) => kind,
            None => return Ok(Record::Unknown { record_type }),
        };
        let mut cursor = Cursor::new(payload);
        match kind {
            RecordType::Create | RecordType::Mkdir => {
                let id = cursor.read_u64::<LittleEndian>()?;
                let mode = cursor.read_u32::<LittleEndian>()?;
                let size = check_signed(cursor.read_u64::<LittleEndian>()?)?;
                let timestamp = cursor.read_u64::<LittleEndian>()?;
                let path_len = cursor.read_u32::<LittleEndian>()? as usize;
                let path = read_string(&mut cursor, path_len)?;
                // The target suffix is only present when the original append
                // had a target to store; a symlink record without one (or
                // with a short suffix) is legal and leaves the target unset.
                let mut symlink_target = None;
                if mode_is_symlink(mode) {
                    if let Ok(target_len) = cursor.read_u32::<LittleEndian>() {
                        if let Ok(target) = read_string(&mut cursor, target_len as usize) {
                            symlink_target = Some(target);
                        }
                    }
                }
                let node = NodeRecord {
                    id,
                    mode,
                    size,
                    timestamp,
                    path,
                    symlink_target,
                };
                Ok(match kind {
                    RecordType::Mkdir => Record::Mkdir(node),
                    _ => Record::Create(node),
                })
            }
            RecordType::Extent => {
                let id = cursor.read_u64::<LittleEndian>()?;
                let logical_offset = check_signed(cursor.read_u64::<LittleEndian>()?)?;
                let data_offset = check_signed(cursor.read_u64::<LittleEndian>()?)?;
                let length = cursor.read_u32::<LittleEndian>()?;
                let new_size = check_signed(cursor.read_u64::<LittleEndian>()?)?;
                if length == 0 {
                    return Err(DecodeError::EmptyExtent);
                }
                Ok(Record::Extent {
                    id,
                    logical_offset,
                    data_offset,
                    length,
                    new_size,
                })
            }
            RecordType::Truncate => {
                let id = cursor.read_u64::<LittleEndian>()?;
                let new_size = check_signed(cursor.read_u64::<LittleEndian>()?)?;
                Ok(Record::Truncate { id, new_size })
            }
            RecordType::Unlink => {
                let id = cursor.read_u64::<LittleEndian>()?;
                Ok(Record::Unlink { id })
            }
            RecordType::Rename => {
                let id = cursor.read_u64::<LittleEndian>()?;
                let path_len = cursor.read_u32::<LittleEndian>()? as usize;
                let new_path = read_string(&mut cursor, path_len)?;
                Ok(Record::Rename { id, new_path })
            }
            RecordType::SetXattr => {
                let id = cursor.read_u64::<LittleEndian>()?;
                let name_len = cursor.read_u32::<LittleEndian>()? as usize;
                let value_len = cursor.read_u32::<LittleEndian>()? as usize;
                let name = read_string(&mut cursor, name_len)?;
                let mut value = vec![0u8; value_len];
                cursor.read_exact(&mut value)?;
                Ok(Record::SetXattr { id, name, value })
            }
            RecordType::RemoveXattr => {
                let id = cursor.read_u64::<LittleEndian>()?;
                let name_len = cursor.read_u32::<LittleEndian>()? as usize;
                let name = read_string(&mut cursor, name_len)?;
                Ok(Record::RemoveXattr { id, name })
            }
            RecordType::Times => {
                let id = cursor.read_u64::<LittleEndian>()?;
                let atime = cursor.read_i64::<LittleEndian>()?;
                let mtime = cursor.read_i64::<LittleEndian>()?;
                Ok(Record::Times { id, atime, mtime })
            }
        }
    }
}

/// A parsed record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// On-disk type tag.
    pub record_type: u8,
    /// Payload length in bytes.
    pub payload_len: u32,
    /// Expected CRC-32 of the payload.
    pub checksum: u32,
}

impl RecordHeader {
    /// Parse the fixed 9-byte header.
    pub fn parse(bytes: &[u8; RECORD_HEADER_SIZE]) -> Self {
        let mut cursor = Cursor::new(&bytes[1..]);
        RecordHeader {
            record_type: bytes[0],
            payload_len: cursor.read_u32::<LittleEndian>().unwrap(),
            checksum: cursor.read_u32::<LittleEndian>().unwrap(),
        }
    }

    /// Whether `payload` matches the stored checksum.
    pub fn verify(&self, payload: &[u8]) -> bool {
        crc32fast::hash(payload) == self.checksum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(record: Record) -> Record {
        let frame = record.to_frame();
        let mut header = [0u8; RECORD_HEADER_SIZE];
        header.copy_from_slice(&frame[..RECORD_HEADER_SIZE]);
        let header = RecordHeader::parse(&header);
        let payload = &frame[RECORD_HEADER_SIZE..];
        assert_eq!(payload.len(), header.payload_len as usize);
        assert!(header.verify(payload));
        Record::decode(header.record_type, payload).unwrap()
    }

    #[test]
    fn create_round_trip() {
        let record = Record::Create(NodeRecord {
            id: 7,
            mode: libc::S_IFREG | 0o644,
            size: 0,
            timestamp: 1_700_000_000,
            path: "/dir/file".to_string(),
            symlink_target: None,
        });
        assert_eq!(round_trip(record.clone()), record);
    }

    #[test]
    fn symlink_create_carries_target() {
        let record = Record::Create(NodeRecord {
            id: 9,
            mode: libc::S_IFLNK | 0o777,
            size: 6,
            timestamp: 1_700_000_000,
            path: "/link".to_string(),
            symlink_target: Some("target".to_string()),
        });
        assert_eq!(round_trip(record.clone()), record);
    }

    #[test]
    fn extent_round_trip() {
        let record = Record::Extent {
            id: 3,
            logical_offset: 4096,
            data_offset: 123_456,
            length: 8192,
            new_size: 12_288,
        };
        assert_eq!(round_trip(record.clone()), record);
    }

    #[test]
    fn times_round_trip_negative() {
        let record = Record::Times {
            id: 1,
            atime: -1,
            mtime: 1_700_000_000,
        };
        assert_eq!(round_trip(record.clone()), record);
    }

    #[test]
    fn xattr_round_trip() {
        let record = Record::SetXattr {
            id: 5,
            name: "user.key".to_string(),
            value: b"\x00binary\xff".to_vec(),
        };
        assert_eq!(round_trip(record.clone()), record);
    }

    #[test]
    fn corrupt_payload_fails_verify() {
        let frame = Record::Unlink { id: 42 }.to_frame();
        let mut header = [0u8; RECORD_HEADER_SIZE];
        header.copy_from_slice(&frame[..RECORD_HEADER_SIZE]);
        let header = RecordHeader::parse(&header);
        let mut payload = frame[RECORD_HEADER_SIZE..].to_vec();
        payload[0] ^= 0x01;
        assert!(!header.verify(&payload));
    }

    #[test]
    fn unknown_type_is_representable() {
        let record = Record::decode(200, b"whatever").unwrap();
        assert_eq!(record, Record::Unknown { record_type: 200 });
    }

    #[test]
    fn negative_size_rejected() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u64.to_le_bytes());
        payload.extend_from_slice(&u64::MAX.to_le_bytes());
        assert!(matches!(
            Record::decode(RecordType::Truncate as u8, &payload),
            Err(DecodeError::ValueOutOfRange)
        ));
    }

    #[test]
    fn zero_length_extent_rejected() {
        let record = Record::Extent {
            id: 1,
            logical_offset: 0,
            data_offset: 0,
            length: 1,
            new_size: 1,
        };
        let mut payload = record.encode_payload();
        // The length field sits after three u64s.
        payload[24..28].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            Record::decode(RecordType::Extent as u8, &payload),
            Err(DecodeError::EmptyExtent)
        ));
    }

    #[test]
    fn short_payload_rejected() {
        assert!(matches!(
            Record::decode(RecordType::Extent as u8, &[0u8; 10]),
            Err(DecodeError::Truncated)
        ));
    }
}
