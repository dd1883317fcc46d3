//! Persistence and replay: remount fidelity, crash behavior, corrupt-record
//! tolerance, and xattr/times durability.

use ledgerfs::record::RECORD_HEADER_SIZE;
use ledgerfs::{Engine, EngineOptions, Error, TimeSpec, META_FILENAME};
use std::path::Path;
use tempfile::TempDir;

fn init_logging() {
    env_logger::builder().is_test(true).try_init().ok();
}

/// Byte offsets and type tags of every record frame in the metadata log.
fn log_frames(root: &Path) -> Vec<(usize, u8, usize)> {
    let bytes = std::fs::read(root.join(META_FILENAME)).unwrap();
    let mut frames = Vec::new();
    let mut pos = 0;
    while pos + RECORD_HEADER_SIZE <= bytes.len() {
        let record_type = bytes[pos];
        let len = u32::from_le_bytes(bytes[pos + 1..pos + 5].try_into().unwrap()) as usize;
        frames.push((pos, record_type, len));
        pos += RECORD_HEADER_SIZE + len;
    }
    frames
}

fn flip_payload_byte(root: &Path, frame_start: usize, payload_index: usize) {
    let path = root.join(META_FILENAME);
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[frame_start + RECORD_HEADER_SIZE + payload_index] ^= 0x01;
    std::fs::write(&path, bytes).unwrap();
}

#[test]
fn remount_reproduces_namespace() {
    init_logging();
    let root = TempDir::new().unwrap();

    {
        let fs = Engine::open(root.path()).unwrap();
        fs.mkdir("/etc", 0o755).unwrap();
        fs.mkdir("/etc/app", 0o700).unwrap();
        fs.create("/etc/app/conf", 0o644).unwrap();
        fs.symlink("/etc/app/conf", "/conf").unwrap();
        fs.set_xattr("/etc/app/conf", "user.origin", b"unit-test", 0)
            .unwrap();

        let mut handle = fs.open_file("/etc/app/conf", libc::O_WRONLY, 0).unwrap();
        handle.write(b"key=value\n", 0).unwrap();
        handle.close().unwrap();
    }

    let fs = Engine::open(root.path()).unwrap();

    assert!(fs.stat("/etc").unwrap().is_dir());
    assert!(fs.stat("/etc/app").unwrap().is_dir());
    assert_eq!(fs.stat("/etc/app").unwrap().mode & 0o777, 0o700);

    let conf = fs.stat("/etc/app/conf").unwrap();
    assert_eq!(conf.size, 10);
    let mut buf = [0u8; 16];
    let n = fs.read("/etc/app/conf", &mut buf, 0).unwrap();
    assert_eq!(&buf[..n], b"key=value\n");

    assert_eq!(fs.read_link("/conf").unwrap(), "/etc/app/conf");

    let mut value = [0u8; 16];
    let n = fs
        .get_xattr("/etc/app/conf", "user.origin", Some(&mut value))
        .unwrap();
    assert_eq!(&value[..n], b"unit-test");

    let mut names = Vec::new();
    fs.iterate_children("/etc", |name, info| {
        names.push((name.to_string(), info.is_dir()));
        true
    })
    .unwrap();
    assert_eq!(names, vec![("app".to_string(), true)]);
}

#[test]
fn rename_subtree_persists() {
    init_logging();
    let root = TempDir::new().unwrap();

    {
        let fs = Engine::open(root.path()).unwrap();
        fs.mkdir("/x", 0o755).unwrap();
        fs.mkdir("/x/y", 0o755).unwrap();
        fs.create("/x/y/f", 0o644).unwrap();
        fs.rename("/x", "/z").unwrap();

        assert!(matches!(fs.stat("/x/y/f"), Err(Error::NotFound)));
        assert!(fs.stat("/z/y/f").is_ok());
    }

    let fs = Engine::open(root.path()).unwrap();
    assert!(matches!(fs.stat("/x"), Err(Error::NotFound)));
    assert!(matches!(fs.stat("/x/y/f"), Err(Error::NotFound)));
    assert!(fs.stat("/z").unwrap().is_dir());
    assert!(fs.stat("/z/y").unwrap().is_dir());
    assert!(fs.stat("/z/y/f").is_ok());
}

#[test]
fn crash_discards_buffered_writes() {
    init_logging();
    let root = TempDir::new().unwrap();

    {
        let fs = Engine::open(root.path()).unwrap();
        fs.mkdir("/demo", 0o755).unwrap();
        fs.create("/demo/f", 0o644).unwrap();
        let mut handle = fs.open_file("/demo/f", libc::O_RDWR, 0).unwrap();
        // Stays under the buffer capacity, so nothing reaches the log.
        handle.write(&[0x5a; 8192], 0).unwrap();
        assert_eq!(handle.buffered(), 8192);
        // A crash never flushes: leak the handle so drop cannot either.
        std::mem::forget(handle);
    }

    let fs = Engine::open(root.path()).unwrap();
    assert_eq!(fs.stat("/demo/f").unwrap().size, 0);
    let mut buf = [0u8; 16];
    assert_eq!(fs.read("/demo/f", &mut buf, 0).unwrap(), 0);
}

#[test]
fn corrupt_extent_record_is_skipped() {
    init_logging();
    let root = TempDir::new().unwrap();

    {
        let fs = Engine::open(root.path()).unwrap();
        fs.create("/a", 0o644).unwrap();
        let mut handle = fs.open_file("/a", libc::O_RDWR, 0).unwrap();
        handle.write(b"AAAA", 0).unwrap();
        handle.flush().unwrap();
        handle.write(b"BB", 1).unwrap();
        handle.flush().unwrap();
        handle.close().unwrap();
    }

    // Flip one byte in the middle of the second extent record's payload.
    let extents: Vec<(usize, u8, usize)> = log_frames(root.path())
        .into_iter()
        .filter(|&(_, record_type, _)| record_type == 2)
        .collect();
    assert_eq!(extents.len(), 2);
    flip_payload_byte(root.path(), extents[1].0, extents[1].2 / 2);

    let fs = Engine::open(root.path()).unwrap();
    let info = fs.stat("/a").unwrap();
    assert_eq!(info.size, 4);
    let mut buf = [0u8; 4];
    let n = fs.read("/a", &mut buf, 0).unwrap();
    assert_eq!(n, 4);
    assert_eq!(&buf, b"AAAA");
}

#[test]
fn records_around_a_corrupt_one_still_apply() {
    init_logging();
    let root = TempDir::new().unwrap();

    {
        let fs = Engine::open(root.path()).unwrap();
        fs.create("/a", 0o644).unwrap();
        fs.create("/b", 0o644).unwrap();
        fs.create("/c", 0o644).unwrap();
    }

    // Corrupt the middle create.
    let frames = log_frames(root.path());
    assert_eq!(frames.len(), 3);
    flip_payload_byte(root.path(), frames[1].0, frames[1].2 / 2);

    let fs = Engine::open(root.path()).unwrap();
    assert!(fs.stat("/a").is_ok());
    assert!(matches!(fs.stat("/b"), Err(Error::NotFound)));
    assert!(fs.stat("/c").is_ok());
}

#[test]
fn halt_on_corrupt_record_stops_replay() {
    init_logging();
    let root = TempDir::new().unwrap();

    {
        let fs = Engine::open(root.path()).unwrap();
        fs.create("/a", 0o644).unwrap();
        fs.create("/b", 0o644).unwrap();
    }

    let frames = log_frames(root.path());
    flip_payload_byte(root.path(), frames[0].0, 2);

    // Default: skip and continue.
    {
        let fs = Engine::open(root.path()).unwrap();
        assert!(matches!(fs.stat("/a"), Err(Error::NotFound)));
        assert!(fs.stat("/b").is_ok());
    }

    // Opt-in stop-on-first-failure.
    let options = EngineOptions {
        halt_on_corrupt_record: true,
        ..EngineOptions::default()
    };
    let fs = Engine::open_with_options(root.path(), options).unwrap();
    assert!(matches!(fs.stat("/a"), Err(Error::NotFound)));
    assert!(matches!(fs.stat("/b"), Err(Error::NotFound)));
}

#[test]
fn partially_written_tail_is_tolerated() {
    init_logging();
    let root = TempDir::new().unwrap();

    {
        let fs = Engine::open(root.path()).unwrap();
        fs.create("/f", 0o644).unwrap();
    }

    // Simulate a crash mid-record-append: a header fragment at the tail.
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(root.path().join(META_FILENAME))
        .unwrap();
    file.write_all(&[0x01, 0x40, 0x00]).unwrap();
    drop(file);

    let fs = Engine::open(root.path()).unwrap();
    assert!(fs.stat("/f").is_ok());
}

#[test]
fn xattr_round_trip_and_persistence() {
    init_logging();
    let root = TempDir::new().unwrap();

    {
        let fs = Engine::open(root.path()).unwrap();
        fs.create("/f", 0o644).unwrap();
        fs.set_xattr("/f", "user.k", b"v1", 0).unwrap();

        assert_eq!(fs.get_xattr("/f", "user.k", None).unwrap(), 2);
        let mut buf = [0u8; 4];
        let n = fs.get_xattr("/f", "user.k", Some(&mut buf)).unwrap();
        assert_eq!(&buf[..n], b"v1");

        // "user.k\0" is seven bytes.
        assert_eq!(fs.list_xattr("/f", None).unwrap(), 7);
        let mut names = [0u8; 7];
        fs.list_xattr("/f", Some(&mut names)).unwrap();
        assert_eq!(&names, b"user.k\0");

        fs.remove_xattr("/f", "user.k").unwrap();
        assert!(matches!(
            fs.get_xattr("/f", "user.k", None),
            Err(Error::NoData)
        ));
        assert!(matches!(fs.remove_xattr("/f", "user.k"), Err(Error::NoData)));

        fs.set_xattr("/f", "user.b", b"2", 0).unwrap();
        fs.set_xattr("/f", "user.a", b"1", 0).unwrap();
    }

    let fs = Engine::open(root.path()).unwrap();
    assert!(matches!(
        fs.get_xattr("/f", "user.k", None),
        Err(Error::NoData)
    ));
    // Listing preserves insertion order across replay.
    let mut names = vec![0u8; fs.list_xattr("/f", None).unwrap()];
    fs.list_xattr("/f", Some(&mut names)).unwrap();
    assert_eq!(names, b"user.b\0user.a\0");
}

#[test]
fn times_survive_remount() {
    init_logging();
    let root = TempDir::new().unwrap();

    {
        let fs = Engine::open(root.path()).unwrap();
        fs.create("/f", 0o644).unwrap();
        fs.set_times("/f", TimeSpec::Seconds(1_000_000), TimeSpec::Seconds(2_000_000))
            .unwrap();
    }

    let fs = Engine::open(root.path()).unwrap();
    let info = fs.stat("/f").unwrap();
    assert_eq!(info.atime, 1_000_000);
    assert_eq!(info.mtime, 2_000_000);

    // Omit leaves the stored value alone.
    fs.set_times("/f", TimeSpec::Omit, TimeSpec::Seconds(3_000_000))
        .unwrap();
    let info = fs.stat("/f").unwrap();
    assert_eq!(info.atime, 1_000_000);
    assert_eq!(info.mtime, 3_000_000);
}

#[test]
fn revival_resets_content_across_remount() {
    init_logging();
    let root = TempDir::new().unwrap();

    let original_id;
    {
        let fs = Engine::open(root.path()).unwrap();
        fs.create("/f", 0o644).unwrap();
        original_id = fs.stat("/f").unwrap().id;
        let mut handle = fs.open_file("/f", libc::O_WRONLY, 0).unwrap();
        handle.write(b"old contents", 0).unwrap();
        handle.close().unwrap();

        fs.unlink("/f").unwrap();
        fs.create("/f", 0o600).unwrap();
        assert_eq!(fs.stat("/f").unwrap().id, original_id);
        assert_eq!(fs.stat("/f").unwrap().size, 0);
    }

    let fs = Engine::open(root.path()).unwrap();
    let info = fs.stat("/f").unwrap();
    assert_eq!(info.id, original_id);
    assert_eq!(info.size, 0);
    let mut buf = [0u8; 16];
    assert_eq!(fs.read("/f", &mut buf, 0).unwrap(), 0);
}

#[test]
fn inode_ids_stay_monotonic_across_remount() {
    init_logging();
    let root = TempDir::new().unwrap();

    {
        let fs = Engine::open(root.path()).unwrap();
        fs.create("/a", 0o644).unwrap();
        fs.create("/b", 0o644).unwrap();
        fs.unlink("/b").unwrap();
    }

    let fs = Engine::open(root.path()).unwrap();
    let a = fs.stat("/a").unwrap().id;
    fs.create("/c", 0o644).unwrap();
    let c = fs.stat("/c").unwrap().id;
    // The unlinked inode's id is never reused.
    assert!(c > a + 1);
}

#[test]
fn unlinked_files_stay_gone() {
    init_logging();
    let root = TempDir::new().unwrap();

    {
        let fs = Engine::open(root.path()).unwrap();
        fs.mkdir("/d", 0o755).unwrap();
        fs.create("/d/f", 0o644).unwrap();
        fs.unlink("/d/f").unwrap();
        fs.rmdir("/d").unwrap();
    }

    let fs = Engine::open(root.path()).unwrap();
    assert!(matches!(fs.stat("/d"), Err(Error::NotFound)));
    assert!(matches!(fs.stat("/d/f"), Err(Error::NotFound)));
    let mut seen = 0;
    fs.iterate_children("/", |_, _| {
        seen += 1;
        true
    })
    .unwrap();
    assert_eq!(seen, 0);
}
