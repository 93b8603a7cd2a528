//! Table file plumbing: block handles, the footer, and checked block reads.

use std::fs::File;

use crc::{Crc, CRC_32_ISCSI};

use crate::config::CompressionType;
use crate::corruption;
use crate::encoding::{decode_fixed64, get_varint64, put_fixed64, put_varint64};
use crate::error::{Error, Result};

pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// compression tag (1) + crc (4)
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Two maximal varint64 handles, padded, plus the magic number.
pub const FOOTER_SIZE: usize = 2 * MAX_ENCODED_HANDLE + 8;

const MAX_ENCODED_HANDLE: usize = 10 + 10;

/// Identifies emberdb table files.
const TABLE_MAGIC: u64 = 0xe3b0_d81f_56a7_c4d2;

/// Location of a block within the file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        put_varint64(dst, self.offset);
        put_varint64(dst, self.size);
    }

    pub fn encoded(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAX_ENCODED_HANDLE);
        self.encode_to(&mut buf);
        buf
    }

    /// Decodes a handle from the front of `src`, returning it and the bytes
    /// consumed.
    pub fn decode_from(src: &[u8]) -> Result<(Self, usize)> {
        let (offset, n) = get_varint64(src)?;
        let (size, m) = get_varint64(&src[n..])?;
        Ok((Self { offset, size }, n + m))
    }
}

/// Trailing fixed-size footer of every table file.
#[derive(Debug, Clone, Copy, Default)]
pub struct Footer {
    pub metaindex_handle: BlockHandle,
    pub index_handle: BlockHandle,
}

impl Footer {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FOOTER_SIZE);
        self.metaindex_handle.encode_to(&mut buf);
        self.index_handle.encode_to(&mut buf);
        buf.resize(FOOTER_SIZE - 8, 0);
        put_fixed64(&mut buf, TABLE_MAGIC);
        debug_assert_eq!(buf.len(), FOOTER_SIZE);
        buf
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < FOOTER_SIZE {
            return Err(corruption!("footer too short: {} bytes", src.len()));
        }
        let magic = decode_fixed64(&src[FOOTER_SIZE - 8..]);
        if magic != TABLE_MAGIC {
            return Err(corruption!("bad table magic: {magic:#x}"));
        }
        let (metaindex_handle, n) = BlockHandle::decode_from(src)?;
        let (index_handle, _) = BlockHandle::decode_from(&src[n..])?;
        Ok(Self {
            metaindex_handle,
            index_handle,
        })
    }
}

/// Positional read that does not disturb any shared cursor.
pub(crate) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.read_exact_at(buf, offset)?;
        Ok(())
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        let mut done = 0;
        while done < buf.len() {
            let n = file.seek_read(&mut buf[done..], offset + done as u64)?;
            if n == 0 {
                return Err(Error::Io("short read".to_string()));
            }
            done += n;
        }
        Ok(())
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (file, buf, offset);
        Err(Error::NotSupported("positional reads".to_string()))
    }
}

/// Reads a block body, verifies its trailer, and undoes compression.
pub(crate) fn read_block(
    file: &File,
    handle: BlockHandle,
    verify_checksums: bool,
) -> Result<Vec<u8>> {
    let len = handle.size as usize;
    let mut buf = vec![0u8; len + BLOCK_TRAILER_SIZE];
    read_exact_at(file, &mut buf, handle.offset)?;

    let tag = buf[len];
    if verify_checksums {
        let stored = crate::encoding::decode_fixed32(&buf[len + 1..len + 5]);
        let actual = CRC32.checksum(&buf[..len + 1]);
        if stored != actual {
            return Err(corruption!(
                "block checksum mismatch at offset {}",
                handle.offset
            ));
        }
    }

    match CompressionType::from_tag(tag) {
        Some(CompressionType::None) => {
            buf.truncate(len);
            Ok(buf)
        }
        Some(CompressionType::Snappy) => Err(Error::NotSupported(
            "snappy-compressed block (no codec in this build)".to_string(),
        )),
        None => Err(corruption!("unknown block compression tag: {tag}")),
    }
}
