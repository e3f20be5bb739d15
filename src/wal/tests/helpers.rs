use crate::encoding::{self, ByteReader, Decode, Encode, EncodingError};
use crate::wal::{SyncPolicy, Wal, WalData, WalError};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Record shaped like a memtable mutation: `None` marks a tombstone.
#[derive(Debug, Clone, PartialEq)]
pub struct TestRecord {
    pub seq: u64,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl Encode for TestRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.seq.encode_to(buf)?;
        encoding::encode_bytes(&self.key, buf)?;
        self.value.encode_to(buf)
    }
}

impl Decode for TestRecord {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            seq: reader.read_u64()?,
            key: reader.read_bytes()?.to_vec(),
            value: Option::<Vec<u8>>::decode(reader)?,
        })
    }
}

pub fn record(seq: u64, key: &str, value: Option<&str>) -> TestRecord {
    TestRecord {
        seq,
        key: key.as_bytes().to_vec(),
        value: value.map(|v| v.as_bytes().to_vec()),
    }
}

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn open_wal(path: &Path) -> Wal<TestRecord> {
    Wal::open(path, None, SyncPolicy::EveryWrite).unwrap()
}

/// Replay every record from the WAL into a `Vec`.
pub fn collect_iter<T: WalData>(wal: &Wal<T>) -> Result<Vec<T>, WalError> {
    wal.replay_iter()?.collect()
}
