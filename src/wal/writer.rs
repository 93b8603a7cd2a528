use std::fs::File;
use std::io::{BufWriter, Write};

use byteorder::{LittleEndian, WriteBytesExt};

use super::{record_crc, RecordType, BLOCK_SIZE, HEADER_SIZE};
use crate::error::Result;

/// Appends framed records to a log file.
pub struct LogWriter {
    dest: BufWriter<File>,
    /// Write offset within the current physical block.
    block_offset: usize,
}

impl LogWriter {
    pub fn new(file: File) -> Self {
        Self {
            dest: BufWriter::new(file),
            block_offset: 0,
        }
    }

    /// Resumes appending to an existing log of `len` bytes (manifest and
    /// WAL reuse on reopen).
    pub fn with_offset(file: File, len: u64) -> Self {
        Self {
            dest: BufWriter::new(file),
            block_offset: (len % BLOCK_SIZE as u64) as usize,
        }
    }

    /// Appends one logical record, fragmenting across blocks as needed.
    pub fn add_record(&mut self, data: &[u8]) -> Result<()> {
        let mut remaining = data;
        let mut begin = true;
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                // Too small for a header: zero-fill and open a new block.
                if leftover > 0 {
                    self.dest.write_all(&[0u8; HEADER_SIZE][..leftover])?;
                }
                self.block_offset = 0;
            }

            let available = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_len = remaining.len().min(available);
            let end = fragment_len == remaining.len();

            let record_type = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, true) => RecordType::Last,
                (false, false) => RecordType::Middle,
            };

            self.emit_physical_record(record_type, &remaining[..fragment_len])?;
            remaining = &remaining[fragment_len..];
            begin = false;
            if end {
                return Ok(());
            }
        }
    }

    fn emit_physical_record(&mut self, t: RecordType, payload: &[u8]) -> Result<()> {
        debug_assert!(payload.len() <= 0xffff);
        debug_assert!(self.block_offset + HEADER_SIZE + payload.len() <= BLOCK_SIZE);

        self.dest.write_u32::<LittleEndian>(record_crc(t, payload))?;
        self.dest.write_u16::<LittleEndian>(payload.len() as u16)?;
        self.dest.write_u8(t as u8)?;
        self.dest.write_all(payload)?;

        self.block_offset += HEADER_SIZE + payload.len();
        Ok(())
    }

    /// Pushes buffered bytes to the OS.
    pub fn flush(&mut self) -> Result<()> {
        self.dest.flush()?;
        Ok(())
    }

    /// Flushes and fsyncs.
    pub fn sync(&mut self) -> Result<()> {
        self.dest.flush()?;
        self.dest.get_ref().sync_all()?;
        Ok(())
    }
}
