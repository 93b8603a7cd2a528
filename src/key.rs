//! Internal key encoding.
//!
//! Every entry the engine stores is keyed by an internal key: the user key
//! followed by an 8-byte little-endian trailer packing a 56-bit sequence
//! number (high bits) and an 8-bit value-type tag (low bits). For one user
//! key, a forward scan therefore yields the newest version first.

use crate::corruption;
use crate::encoding::{decode_fixed64, put_fixed64, put_varint32, varint_length};
use crate::error::{Error, Result};

/// 56-bit mutation counter.
pub type SequenceNumber = u64;

/// Largest representable sequence number; leaves the low 8 trailer bits for
/// the type tag.
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

/// Kind of mutation an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValueType {
    Deletion = 0,
    Put = 1,
}

/// Type tag used when building seek targets: the maximal tag, so a seek
/// lands on the newest entry with sequence <= the target.
pub const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Put;

impl ValueType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ValueType::Deletion),
            1 => Some(ValueType::Put),
            _ => None,
        }
    }
}

pub fn pack_sequence_and_type(seq: SequenceNumber, t: ValueType) -> u64 {
    debug_assert!(seq <= MAX_SEQUENCE_NUMBER);
    (seq << 8) | t as u64
}

/// Appends `user_key ‖ trailer(seq, t)` to `dst`.
pub fn append_internal_key(dst: &mut Vec<u8>, user_key: &[u8], seq: SequenceNumber, t: ValueType) {
    dst.extend_from_slice(user_key);
    put_fixed64(dst, pack_sequence_and_type(seq, t));
}

/// Appends the maximal trailer, producing the smallest internal key for the
/// user key `dst` currently holds.
pub fn append_max_trailer(dst: &mut Vec<u8>) {
    put_fixed64(dst, pack_sequence_and_type(MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK));
}

/// User-key portion of an internal key.
pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    debug_assert!(internal_key.len() >= 8);
    &internal_key[..internal_key.len() - 8]
}

/// Raw 64-bit trailer of an internal key.
pub fn sequence_and_type(internal_key: &[u8]) -> u64 {
    debug_assert!(internal_key.len() >= 8);
    decode_fixed64(&internal_key[internal_key.len() - 8..])
}

/// Decoded form of an internal key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedInternalKey {
    pub user_key: Vec<u8>,
    pub sequence: SequenceNumber,
    pub value_type: ValueType,
}

impl ParsedInternalKey {
    pub fn new(user_key: &[u8], sequence: SequenceNumber, value_type: ValueType) -> Self {
        Self {
            user_key: user_key.to_vec(),
            sequence,
            value_type,
        }
    }
}

/// Splits an internal key into its parts. Rejects short keys and unknown
/// type tags.
pub fn parse_internal_key(internal_key: &[u8]) -> Result<ParsedInternalKey> {
    if internal_key.len() < 8 {
        return Err(corruption!("internal key too short: {} bytes", internal_key.len()));
    }
    let trailer = sequence_and_type(internal_key);
    let tag = (trailer & 0xff) as u8;
    let value_type = ValueType::from_tag(tag)
        .ok_or_else(|| corruption!("unknown value type tag: {tag}"))?;
    Ok(ParsedInternalKey {
        user_key: extract_user_key(internal_key).to_vec(),
        sequence: trailer >> 8,
        value_type,
    })
}

/// An owned, encoded internal key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InternalKey {
    encoded: Vec<u8>,
}

impl InternalKey {
    pub fn new(user_key: &[u8], seq: SequenceNumber, t: ValueType) -> Self {
        let mut encoded = Vec::with_capacity(user_key.len() + 8);
        append_internal_key(&mut encoded, user_key, seq, t);
        Self { encoded }
    }

    pub fn decode_from(encoded: &[u8]) -> Result<Self> {
        if encoded.len() < 8 {
            return Err(corruption!("internal key too short: {} bytes", encoded.len()));
        }
        Ok(Self {
            encoded: encoded.to_vec(),
        })
    }

    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.encoded)
    }

    pub fn is_empty(&self) -> bool {
        self.encoded.is_empty()
    }

    pub fn clear(&mut self) {
        self.encoded.clear();
    }
}

/// Seek target for a point lookup: memtable format out front, internal key
/// at the back.
///
/// Layout: `varint32(klen + 8) ‖ user_key ‖ trailer(snapshot, max type)`.
pub struct LookupKey {
    data: Vec<u8>,
    key_start: usize,
}

impl LookupKey {
    pub fn new(user_key: &[u8], snapshot: SequenceNumber) -> Self {
        let internal_len = user_key.len() + 8;
        let mut data = Vec::with_capacity(varint_length(internal_len as u64) + internal_len);
        put_varint32(&mut data, internal_len as u32);
        let key_start = data.len();
        data.extend_from_slice(user_key);
        put_fixed64(
            &mut data,
            pack_sequence_and_type(snapshot, VALUE_TYPE_FOR_SEEK),
        );
        Self { data, key_start }
    }

    /// Key in the memtable entry format (with length prefix).
    pub fn memtable_key(&self) -> &[u8] {
        &self.data
    }

    /// The internal key alone.
    pub fn internal_key(&self) -> &[u8] {
        &self.data[self.key_start..]
    }

    /// The user key alone.
    pub fn user_key(&self) -> &[u8] {
        &self.data[self.key_start..self.data.len() - 8]
    }
}

/// Validates that a sequence number can still be advanced by `count` ops
/// without overflowing the 56-bit space.
pub fn check_sequence_room(last: SequenceNumber, count: u64) -> Result<()> {
    if last > MAX_SEQUENCE_NUMBER - count {
        return Err(Error::InvalidArgument(
            "sequence number space exhausted".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        let mut key = Vec::new();
        append_internal_key(&mut key, b"user", 0x1234_5678, ValueType::Put);
        assert_eq!(extract_user_key(&key), b"user");
        let parsed = parse_internal_key(&key).unwrap();
        assert_eq!(parsed.user_key, b"user");
        assert_eq!(parsed.sequence, 0x1234_5678);
        assert_eq!(parsed.value_type, ValueType::Put);
    }

    #[test]
    fn test_parse_rejects_short_key() {
        assert!(parse_internal_key(b"short").is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_tag() {
        let mut key = b"user".to_vec();
        put_fixed64(&mut key, (42 << 8) | 7);
        let err = parse_internal_key(&key).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_empty_user_key() {
        let mut key = Vec::new();
        append_internal_key(&mut key, b"", 9, ValueType::Deletion);
        assert_eq!(key.len(), 8);
        let parsed = parse_internal_key(&key).unwrap();
        assert_eq!(parsed.user_key, b"");
        assert_eq!(parsed.value_type, ValueType::Deletion);
    }

    #[test]
    fn test_lookup_key_views() {
        let lk = LookupKey::new(b"needle", 77);
        assert_eq!(lk.user_key(), b"needle");
        assert_eq!(extract_user_key(lk.internal_key()), b"needle");
        assert_eq!(sequence_and_type(lk.internal_key()) >> 8, 77);
        // memtable_key = varint length prefix + internal key
        assert!(lk.memtable_key().ends_with(lk.internal_key()));
    }

    #[test]
    fn test_sequence_room() {
        assert!(check_sequence_room(0, 1).is_ok());
        assert!(check_sequence_room(MAX_SEQUENCE_NUMBER - 1, 1).is_ok());
        assert!(check_sequence_room(MAX_SEQUENCE_NUMBER, 1).is_err());
    }
}
