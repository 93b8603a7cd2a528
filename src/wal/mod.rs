//! Write-ahead log with block framing.
//!
//! Both the WAL and the manifest use this format. A log file is a sequence
//! of 32 KiB physical blocks; records are framed inside blocks and may span
//! several of them:
//!
//! ```text
//! +----------+---------+--------+----------------+
//! | crc32c   | length  | type   | payload        |
//! | 4 bytes  | 2 bytes | 1 byte | length bytes   |
//! +----------+---------+--------+----------------+
//! ```
//!
//! The checksum covers the type byte and the payload. `type` marks how the
//! payload relates to a logical record: `Full` (whole record), or a
//! `First`/`Middle`.../`Last` fragment chain. A block tail shorter than the
//! 7-byte header is zero-filled and skipped by the reader.
//!
//! A record torn at the end of the log (a crash mid-append) ends replay
//! silently; any corruption before that is skipped with a warning, or
//! escalated when the reader runs in paranoid mode.

mod reader;
mod writer;

pub use reader::LogReader;
pub use writer::LogWriter;

use crc::{Crc, CRC_32_ISCSI};

/// Physical block size.
pub(crate) const BLOCK_SIZE: usize = 32 * 1024;

/// crc (4) + length (2) + type (1)
pub(crate) const HEADER_SIZE: usize = 7;

pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordType {
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

impl RecordType {
    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(RecordType::Full),
            2 => Some(RecordType::First),
            3 => Some(RecordType::Middle),
            4 => Some(RecordType::Last),
            _ => None,
        }
    }
}

/// Checksum of a framed record: type byte then payload.
pub(crate) fn record_crc(t: RecordType, payload: &[u8]) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(&[t as u8]);
    digest.update(payload);
    digest.finalize()
}
