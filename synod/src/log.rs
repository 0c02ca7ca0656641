//! The acceptor's durable log.  One framed record per state change, appended and synced before
//! the acceptor responds.  Replay tolerates a truncated final record, which happens when the
//! process dies mid-append; everything after the last whole record is discarded.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use biometrics::{Collector, Counter};
use buffertk::{stack_pack, Unpackable};
use prototk_derive::Message;

use busywire::{frame_message, read_framed};
use synod_pb::{Error, Proposal};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static APPEND: Counter = Counter::new("synod.log.append");
static REPLAY: Counter = Counter::new("synod.log.replay");
static TRUNCATE: Counter = Counter::new("synod.log.truncate");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&APPEND);
    collector.register_counter(&REPLAY);
    collector.register_counter(&TRUNCATE);
}

///////////////////////////////////////////// LogRecord ////////////////////////////////////////////

/// One durable state change.
#[derive(Clone, Debug, Default, Message, PartialEq, Eq)]
pub enum LogRecord {
    /// Unused; present so the type has a protobuf-compatible default.
    #[prototk(1, message)]
    #[default]
    Nop,
    /// The acceptor promised not to accept proposals below `n_h`.
    #[prototk(2, message)]
    Prepared {
        #[prototk(1, message)]
        n_h: Proposal,
    },
    /// The acceptor accepted value `v_a` under proposal `n_a`.
    #[prototk(3, message)]
    Accepted {
        #[prototk(1, message)]
        n_a: Proposal,
        #[prototk(2, bytes)]
        v_a: Vec<u8>,
    },
    /// The instance was decided with value `v`.
    #[prototk(4, message)]
    Decided {
        #[prototk(1, uint32)]
        instance: u32,
        #[prototk(2, bytes)]
        v: Vec<u8>,
    },
}

/////////////////////////////////////////////// Log ////////////////////////////////////////////////

/// An append-only log of [LogRecord]s.
pub struct Log {
    path: PathBuf,
    file: File,
}

impl Log {
    /// Open the log at `path`, replaying whatever records it holds.  A torn final record is
    /// truncated away.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<(Log, Vec<LogRecord>), Error> {
        let path = path.as_ref().to_path_buf();
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(err.into());
            }
        };
        let mut cursor = std::io::Cursor::new(&data);
        let mut records = Vec::new();
        let mut durable = 0u64;
        loop {
            match read_framed(&mut cursor) {
                Ok(buf) => {
                    let (record, _) = LogRecord::unpack(&buf)?;
                    durable = cursor.position();
                    records.push(record);
                    REPLAY.click();
                }
                Err(_) => {
                    break;
                }
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        if durable < data.len() as u64 {
            TRUNCATE.click();
            file.set_len(durable)?;
        }
        let log = Log { path, file };
        Ok((log, records))
    }

    /// Where this log lives.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and sync it to disk.
    pub fn append(&mut self, record: &LogRecord) -> Result<(), Error> {
        APPEND.click();
        let body = stack_pack(record).to_vec();
        let framed = frame_message(&body);
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&framed)?;
        self.file.sync_data()?;
        Ok(())
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    static TEST_SEQ: AtomicU64 = AtomicU64::new(0);

    fn test_log_path(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "synod-log-{}-{}-{}",
            name,
            std::process::id(),
            TEST_SEQ.fetch_add(1, Ordering::Relaxed),
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn sample_records() -> Vec<LogRecord> {
        vec![
            LogRecord::Prepared {
                n_h: Proposal {
                    number: 1,
                    node: "127.0.0.1:2045".to_string(),
                },
            },
            LogRecord::Accepted {
                n_a: Proposal {
                    number: 1,
                    node: "127.0.0.1:2045".to_string(),
                },
                v_a: b"decree".to_vec(),
            },
            LogRecord::Decided {
                instance: 1,
                v: b"decree".to_vec(),
            },
        ]
    }

    #[test]
    fn replay_round_trip() {
        let path = test_log_path("round-trip");
        let records = sample_records();
        {
            let (mut log, replayed) = Log::open(&path).unwrap();
            assert!(replayed.is_empty());
            for record in records.iter() {
                log.append(record).unwrap();
            }
        }
        let (_log, replayed) = Log::open(&path).unwrap();
        assert_eq!(records, replayed);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let path = test_log_path("torn-tail");
        let records = sample_records();
        {
            let (mut log, _) = Log::open(&path).unwrap();
            for record in records.iter() {
                log.append(record).unwrap();
            }
        }
        // Tear the final record in half.
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 3]).unwrap();
        let (mut log, replayed) = Log::open(&path).unwrap();
        assert_eq!(records[..2].to_vec(), replayed);
        // The log stays appendable after truncation.
        log.append(&records[2]).unwrap();
        let (_log, replayed) = Log::open(&path).unwrap();
        assert_eq!(records, replayed);
        let _ = std::fs::remove_file(&path);
    }
}
