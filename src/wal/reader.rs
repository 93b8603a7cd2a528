use std::fs::File;
use std::io::Read;

use byteorder::ByteOrder;
use byteorder::LittleEndian;

use super::{record_crc, RecordType, BLOCK_SIZE, HEADER_SIZE};
use crate::corruption;
use crate::error::Result;

enum Physical {
    Record(RecordType, Vec<u8>),
    /// Zero-filled block trailer; advance to the next block.
    Trailer,
    /// Clean or torn end of the log.
    Eof,
    /// Checksum/length/type damage mid-file.
    Bad(&'static str),
}

/// Reads framed records back out of a log file.
pub struct LogReader {
    file: File,
    paranoid: bool,
    buffer: Vec<u8>,
    buf_pos: usize,
    eof: bool,
}

impl LogReader {
    /// `paranoid` escalates recoverable framing damage (and torn tails) to
    /// `Corruption` instead of skipping.
    pub fn new(file: File, paranoid: bool) -> Self {
        Self {
            file,
            paranoid,
            buffer: Vec::new(),
            buf_pos: 0,
            eof: false,
        }
    }

    /// Next logical record, or `None` at end of log.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut scratch: Vec<u8> = Vec::new();
        let mut in_fragmented_record = false;

        loop {
            match self.read_physical_record()? {
                Physical::Record(RecordType::Full, data) => {
                    if in_fragmented_record {
                        self.report("partial record without end")?;
                        scratch.clear();
                    }
                    return Ok(Some(data));
                }
                Physical::Record(RecordType::First, data) => {
                    if in_fragmented_record {
                        self.report("partial record without end")?;
                    }
                    scratch = data;
                    in_fragmented_record = true;
                }
                Physical::Record(RecordType::Middle, data) => {
                    if !in_fragmented_record {
                        self.report("missing start of fragmented record")?;
                    } else {
                        scratch.extend_from_slice(&data);
                    }
                }
                Physical::Record(RecordType::Last, data) => {
                    if !in_fragmented_record {
                        self.report("missing start of fragmented record")?;
                    } else {
                        scratch.extend_from_slice(&data);
                        return Ok(Some(scratch));
                    }
                }
                Physical::Trailer => {}
                Physical::Eof => {
                    // A record torn by a crash mid-append ends the log;
                    // everything before it replayed cleanly.
                    if in_fragmented_record {
                        scratch.clear();
                    }
                    return Ok(None);
                }
                Physical::Bad(reason) => {
                    self.report(reason)?;
                    // Drop any fragment in progress and resync.
                    in_fragmented_record = false;
                    scratch.clear();
                }
            }
        }
    }

    fn report(&self, reason: &'static str) -> Result<()> {
        if self.paranoid {
            return Err(corruption!("log record: {reason}"));
        }
        tracing::warn!(reason, "dropping damaged log record");
        Ok(())
    }

    fn read_physical_record(&mut self) -> Result<Physical> {
        loop {
            if self.buffer.len() - self.buf_pos < HEADER_SIZE {
                if self.eof {
                    // Truncated header at the tail, or clean end.
                    return Ok(Physical::Eof);
                }
                self.read_block()?;
                if self.buffer.is_empty() && self.eof {
                    return Ok(Physical::Eof);
                }
                continue;
            }

            let header = &self.buffer[self.buf_pos..self.buf_pos + HEADER_SIZE];
            let expected_crc = LittleEndian::read_u32(&header[0..4]);
            let length = LittleEndian::read_u16(&header[4..6]) as usize;
            let type_byte = header[6];

            if type_byte == 0 && length == 0 && expected_crc == 0 {
                // Zero-filled trailer; skip the rest of this block.
                self.buf_pos = self.buffer.len();
                return Ok(Physical::Trailer);
            }

            if self.buf_pos + HEADER_SIZE + length > self.buffer.len() {
                if self.eof {
                    // Writer crashed mid-record.
                    self.buf_pos = self.buffer.len();
                    return Ok(Physical::Eof);
                }
                self.buf_pos = self.buffer.len();
                return Ok(Physical::Bad("record length past block end"));
            }

            let Some(record_type) = RecordType::from_u8(type_byte) else {
                self.buf_pos = self.buffer.len();
                return Ok(Physical::Bad("unknown record type"));
            };

            let start = self.buf_pos + HEADER_SIZE;
            let payload = &self.buffer[start..start + length];
            if record_crc(record_type, payload) != expected_crc {
                if self.eof && start + length == self.buffer.len() {
                    // A torn write at the very tail of the log.
                    self.buf_pos = self.buffer.len();
                    return Ok(Physical::Eof);
                }
                self.buf_pos = self.buffer.len();
                return Ok(Physical::Bad("checksum mismatch"));
            }

            let data = payload.to_vec();
            self.buf_pos = start + length;
            return Ok(Physical::Record(record_type, data));
        }
    }

    fn read_block(&mut self) -> Result<()> {
        self.buffer.clear();
        self.buffer.resize(BLOCK_SIZE, 0);
        self.buf_pos = 0;

        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = self.file.read(&mut self.buffer[filled..])?;
            if n == 0 {
                self.eof = true;
                break;
            }
            filled += n;
        }
        self.buffer.truncate(filled);
        Ok(())
    }
}
