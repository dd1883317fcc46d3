//! Inspect command: walk the metadata log and print one line per record.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::warn;

use std::path::PathBuf;
use std::time::Instant;

use ledgerfs::record::Record;
use ledgerfs::segment::{Frame, MetaLog};
use ledgerfs::META_FILENAME;

/// Print the records of a backing directory's metadata log
#[derive(Parser, Debug)]
#[command(about = "Walk a LedgerFS metadata log and print its records")]
pub struct InspectArgs {
    /// Backing directory holding the data and meta files
    pub store: PathBuf,

    /// Print record payload byte counts as well
    #[arg(short, long)]
    pub sizes: bool,
}

fn describe(record: &Record) -> String {
    match record {
        Record::Create(node) => format!(
            "CREATE      id={} mode={:o} path={}{}",
            node.id,
            node.mode,
            node.path,
            node.symlink_target
                .as_deref()
                .map(|t| format!(" -> {t}"))
                .unwrap_or_default()
        ),
        Record::Mkdir(node) => {
            format!("MKDIR       id={} mode={:o} path={}", node.id, node.mode, node.path)
        }
        Record::Extent {
            id,
            logical_offset,
            data_offset,
            length,
            new_size,
        } => format!(
            "EXTENT      id={id} logical={logical_offset} data={data_offset} len={length} size={new_size}"
        ),
        Record::Truncate { id, new_size } => format!("TRUNCATE    id={id} size={new_size}"),
        Record::Unlink { id } => format!("UNLINK      id={id}"),
        Record::Rename { id, new_path } => format!("RENAME      id={id} path={new_path}"),
        Record::SetXattr { id, name, value } => {
            format!("SETXATTR    id={id} name={name} value_len={}", value.len())
        }
        Record::RemoveXattr { id, name } => format!("REMOVEXATTR id={id} name={name}"),
        Record::Times { id, atime, mtime } => {
            format!("TIMES       id={id} atime={atime} mtime={mtime}")
        }
        Record::Unknown { record_type } => format!("UNKNOWN     type={record_type}"),
    }
}

pub fn run(args: InspectArgs) -> Result<()> {
    let meta_path = args.store.join(META_FILENAME);
    if !meta_path.exists() {
        return Err(anyhow!(
            "No metadata log at {} - is '{}' a LedgerFS backing directory?",
            meta_path.display(),
            args.store.display()
        ));
    }
    let log = MetaLog::open(&meta_path)
        .with_context(|| format!("Failed to open {}", meta_path.display()))?;

    let started = Instant::now();
    let mut pos = 0u64;
    let mut records = 0u64;
    let mut corrupt = 0u64;

    loop {
        match log.read_frame(pos)? {
            Frame::Truncated => {
                let trailing = log.len() - pos;
                if trailing > 0 {
                    println!("{pos:>10}  [truncated tail: {trailing} bytes]");
                }
                break;
            }
            Frame::Corrupt { record_type, next } => {
                println!("{pos:>10}  [corrupt record, type {record_type}: bad checksum, skipped]");
                corrupt += 1;
                pos = next;
            }
            Frame::Valid {
                record_type,
                payload,
                next,
            } => {
                match Record::decode(record_type, &payload) {
                    Ok(record) => {
                        if args.sizes {
                            println!("{pos:>10}  {} ({} bytes)", describe(&record), payload.len());
                        } else {
                            println!("{pos:>10}  {}", describe(&record));
                        }
                    }
                    Err(err) => {
                        println!("{pos:>10}  [malformed record, type {record_type}: {err}]");
                        corrupt += 1;
                    }
                }
                records += 1;
                pos = next;
            }
        }
    }

    if corrupt > 0 {
        warn!("{corrupt} records were corrupt or malformed");
    }
    println!(
        "{} records, {} bytes, walked in {:.2?}",
        records,
        log.len(),
        started.elapsed()
    );
    Ok(())
}
