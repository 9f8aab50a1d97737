//! Write-Ahead Log (WAL) implementation
//!
//! Every write batch is appended to the current log before it becomes
//! visible in the memtable. After a crash the log is replayed to rebuild the
//! memtable. The manifest uses the same record framing.
//!
//! Record format:
//! - 4 bytes: CRC32 of (length ‖ payload)
//! - 4 bytes: payload length
//! - N bytes: payload

mod reader;
mod writer;

pub use reader::{LogReader, ReadMode};
pub use writer::LogWriter;

use bytes::{BufMut, Bytes, BytesMut};

/// Size of the checksum + length header
pub const RECORD_HEADER_SIZE: usize = 8;

/// Frame `payload` as a log record
pub fn encode_record(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(RECORD_HEADER_SIZE + payload.len());
    let len = (payload.len() as u32).to_le_bytes();

    buf.put_u32_le(record_checksum(&len, payload));
    buf.put_slice(&len);
    buf.put_slice(payload);
    buf.freeze()
}

pub(crate) fn record_checksum(len: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(len);
    hasher.update(payload);
    hasher.finalize()
}
