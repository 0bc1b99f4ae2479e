use bytes::{Bytes, BytesMut};

use super::{
    internal_key::{append_internal_key, INTERNAL_KEY_TAIL_SIZE},
    SequenceNumber, VALUE_TYPE_FOR_SEEK,
};
use crate::utils::varint;

/// A key probing the memtable for `user_key` as of snapshot `seq`.
///
/// The format like this:
///
/// | var internal key len | user key | seq, type: fixed64 le |
///
/// The whole buffer is the memtable key the skip list is seeked with; the
/// suffix past the varint is the internal key. The probe's tag uses the
/// largest type, so it sorts at or before the newest version visible at
/// the snapshot.
#[derive(Debug, Clone)]
pub struct LookupKey {
    bytes: Bytes,
    internal_key_offset: usize,
}

impl LookupKey {
    pub fn new(user_key: &[u8], seq: SequenceNumber) -> Self {
        let internal_key_len = user_key.len() + INTERNAL_KEY_TAIL_SIZE;
        let mut buf = BytesMut::with_capacity(5 + internal_key_len);
        let offset = varint::extend_buf(&mut buf, internal_key_len as u64);
        append_internal_key(&mut buf, user_key, seq, VALUE_TYPE_FOR_SEEK);

        Self {
            bytes: buf.freeze(),
            internal_key_offset: offset,
        }
    }

    /// The skip-list seek target.
    pub fn memtable_key(&self) -> &[u8] {
        &self.bytes
    }

    pub fn internal_key(&self) -> &[u8] {
        &self.bytes[self.internal_key_offset..]
    }

    pub fn user_key(&self) -> &[u8] {
        &self.bytes[self.internal_key_offset..self.bytes.len() - INTERNAL_KEY_TAIL_SIZE]
    }
}
