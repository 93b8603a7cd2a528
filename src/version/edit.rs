//! Version edits: the deltas recorded in the manifest.
//!
//! Each edit is a sequence of tagged fields:
//!
//! | tag | field             | payload                                         |
//! |-----|-------------------|-------------------------------------------------|
//! | 1   | comparator name   | varstring                                       |
//! | 2   | log number        | varint64                                        |
//! | 3   | next file number  | varint64                                        |
//! | 4   | last sequence     | varint64                                        |
//! | 5   | compact pointer   | varint32 level ‖ varstring internal key         |
//! | 6   | deleted file      | varint32 level ‖ varint64 number                |
//! | 7   | new file          | varint32 level ‖ varint64 number ‖ varint64 size ‖ varstring smallest ‖ varstring largest |
//! | 9   | previous log      | varint64                                        |

use crate::config::NUM_LEVELS;
use crate::corruption;
use crate::encoding::{
    get_length_prefixed_slice, get_varint32, get_varint64, put_length_prefixed_slice,
    put_varint32, put_varint64,
};
use crate::error::Result;
use crate::key::{InternalKey, SequenceNumber};

const TAG_COMPARATOR: u32 = 1;
const TAG_LOG_NUMBER: u32 = 2;
const TAG_NEXT_FILE_NUMBER: u32 = 3;
const TAG_LAST_SEQUENCE: u32 = 4;
const TAG_COMPACT_POINTER: u32 = 5;
const TAG_DELETED_FILE: u32 = 6;
const TAG_NEW_FILE: u32 = 7;
const TAG_PREV_LOG_NUMBER: u32 = 9;

/// A table file being added to a level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
    pub level: usize,
    pub number: u64,
    pub size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionEdit {
    pub comparator_name: Option<String>,
    pub log_number: Option<u64>,
    pub prev_log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<SequenceNumber>,
    pub compact_pointers: Vec<(usize, InternalKey)>,
    pub deleted_files: Vec<(usize, u64)>,
    pub new_files: Vec<NewFile>,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn set_comparator_name(&mut self, name: &str) {
        self.comparator_name = Some(name.to_string());
    }

    pub fn set_log_number(&mut self, n: u64) {
        self.log_number = Some(n);
    }

    pub fn set_prev_log_number(&mut self, n: u64) {
        self.prev_log_number = Some(n);
    }

    pub fn set_next_file_number(&mut self, n: u64) {
        self.next_file_number = Some(n);
    }

    pub fn set_last_sequence(&mut self, s: SequenceNumber) {
        self.last_sequence = Some(s);
    }

    pub fn set_compact_pointer(&mut self, level: usize, key: InternalKey) {
        self.compact_pointers.push((level, key));
    }

    pub fn delete_file(&mut self, level: usize, number: u64) {
        self.deleted_files.push((level, number));
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_file(
        &mut self,
        level: usize,
        number: u64,
        size: u64,
        smallest: InternalKey,
        largest: InternalKey,
    ) {
        self.new_files.push(NewFile {
            level,
            number,
            size,
            smallest,
            largest,
        });
    }

    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        if let Some(name) = &self.comparator_name {
            put_varint32(dst, TAG_COMPARATOR);
            put_length_prefixed_slice(dst, name.as_bytes());
        }
        if let Some(n) = self.log_number {
            put_varint32(dst, TAG_LOG_NUMBER);
            put_varint64(dst, n);
        }
        if let Some(n) = self.prev_log_number {
            put_varint32(dst, TAG_PREV_LOG_NUMBER);
            put_varint64(dst, n);
        }
        if let Some(n) = self.next_file_number {
            put_varint32(dst, TAG_NEXT_FILE_NUMBER);
            put_varint64(dst, n);
        }
        if let Some(s) = self.last_sequence {
            put_varint32(dst, TAG_LAST_SEQUENCE);
            put_varint64(dst, s);
        }
        for (level, key) in &self.compact_pointers {
            put_varint32(dst, TAG_COMPACT_POINTER);
            put_varint32(dst, *level as u32);
            put_length_prefixed_slice(dst, key.encoded());
        }
        for (level, number) in &self.deleted_files {
            put_varint32(dst, TAG_DELETED_FILE);
            put_varint32(dst, *level as u32);
            put_varint64(dst, *number);
        }
        for f in &self.new_files {
            put_varint32(dst, TAG_NEW_FILE);
            put_varint32(dst, f.level as u32);
            put_varint64(dst, f.number);
            put_varint64(dst, f.size);
            put_length_prefixed_slice(dst, f.smallest.encoded());
            put_length_prefixed_slice(dst, f.largest.encoded());
        }
    }

    pub fn decode_from(src: &[u8]) -> Result<Self> {
        let mut edit = VersionEdit::new();
        let mut input = src;
        while !input.is_empty() {
            let (tag, n) = get_varint32(input)?;
            input = &input[n..];
            match tag {
                TAG_COMPARATOR => {
                    let (name, n) = get_length_prefixed_slice(input)?;
                    input = &input[n..];
                    let name = std::str::from_utf8(name)
                        .map_err(|_| corruption!("comparator name not utf-8"))?;
                    edit.comparator_name = Some(name.to_string());
                }
                TAG_LOG_NUMBER => {
                    let (v, n) = get_varint64(input)?;
                    input = &input[n..];
                    edit.log_number = Some(v);
                }
                TAG_PREV_LOG_NUMBER => {
                    let (v, n) = get_varint64(input)?;
                    input = &input[n..];
                    edit.prev_log_number = Some(v);
                }
                TAG_NEXT_FILE_NUMBER => {
                    let (v, n) = get_varint64(input)?;
                    input = &input[n..];
                    edit.next_file_number = Some(v);
                }
                TAG_LAST_SEQUENCE => {
                    let (v, n) = get_varint64(input)?;
                    input = &input[n..];
                    edit.last_sequence = Some(v);
                }
                TAG_COMPACT_POINTER => {
                    let (level, n) = decode_level(input)?;
                    input = &input[n..];
                    let (key, n) = get_length_prefixed_slice(input)?;
                    input = &input[n..];
                    edit.compact_pointers.push((level, InternalKey::decode_from(key)?));
                }
                TAG_DELETED_FILE => {
                    let (level, n) = decode_level(input)?;
                    input = &input[n..];
                    let (number, n) = get_varint64(input)?;
                    input = &input[n..];
                    edit.deleted_files.push((level, number));
                }
                TAG_NEW_FILE => {
                    let (level, n) = decode_level(input)?;
                    input = &input[n..];
                    let (number, n) = get_varint64(input)?;
                    input = &input[n..];
                    let (size, n) = get_varint64(input)?;
                    input = &input[n..];
                    let (smallest, n) = get_length_prefixed_slice(input)?;
                    input = &input[n..];
                    let smallest = InternalKey::decode_from(smallest)?;
                    let (largest, n) = get_length_prefixed_slice(input)?;
                    input = &input[n..];
                    let largest = InternalKey::decode_from(largest)?;
                    edit.new_files.push(NewFile {
                        level,
                        number,
                        size,
                        smallest,
                        largest,
                    });
                }
                _ => return Err(corruption!("unknown version edit tag: {tag}")),
            }
        }
        Ok(edit)
    }
}

fn decode_level(input: &[u8]) -> Result<(usize, usize)> {
    let (level, n) = get_varint32(input)?;
    if level as usize >= NUM_LEVELS {
        return Err(corruption!("level out of range in version edit: {level}"));
    }
    Ok((level as usize, n))
}
