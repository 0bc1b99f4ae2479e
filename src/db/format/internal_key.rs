use bytes::{BufMut, Bytes, BytesMut};

use super::{pack_sequence_and_type, unpack_sequence_and_type, SequenceNumber, ValueType};

/// Trailing fixed64 holding the packed (sequence, type) tag.
pub const INTERNAL_KEY_TAIL_SIZE: usize = 8;

/// Appends `user_key || fixed64_le(seq << 8 | type)` to `buf`.
pub fn append_internal_key(
    buf: &mut impl BufMut,
    user_key: &[u8],
    seq: SequenceNumber,
    value_type: ValueType,
) {
    buf.put(user_key);
    buf.put_u64_le(pack_sequence_and_type(seq, value_type));
}

pub(crate) fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    debug_assert!(internal_key.len() >= INTERNAL_KEY_TAIL_SIZE);
    &internal_key[..internal_key.len() - INTERNAL_KEY_TAIL_SIZE]
}

pub(crate) fn extract_tag(internal_key: &[u8]) -> u64 {
    debug_assert!(internal_key.len() >= INTERNAL_KEY_TAIL_SIZE);
    let tail: [u8; INTERNAL_KEY_TAIL_SIZE] = internal_key
        [internal_key.len() - INTERNAL_KEY_TAIL_SIZE..]
        .try_into()
        .expect("internal key tail");
    u64::from_le_bytes(tail)
}

/// An owned internal key.
///
/// The format like this:
///
/// | user key | seq, type: fixed64 le |
#[derive(Debug, Clone)]
pub struct InternalKey {
    bytes: Bytes,
}

impl InternalKey {
    pub fn new(user_key: &[u8], seq: SequenceNumber, value_type: ValueType) -> Self {
        let mut buf = BytesMut::with_capacity(user_key.len() + INTERNAL_KEY_TAIL_SIZE);
        append_internal_key(&mut buf, user_key, seq, value_type);
        Self {
            bytes: buf.freeze(),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        self.bytes.as_ref()
    }

    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.bytes)
    }

    pub fn parse(&self) -> ParsedInternalKey {
        let user_key = self
            .bytes
            .slice(..self.bytes.len() - INTERNAL_KEY_TAIL_SIZE);
        let (seq, value_type) = unpack_sequence_and_type(extract_tag(&self.bytes));
        ParsedInternalKey {
            user_key,
            seq,
            value_type,
        }
    }
}

pub struct ParsedInternalKey {
    pub user_key: Bytes,
    pub seq: SequenceNumber,
    pub value_type: ValueType,
}

impl ParsedInternalKey {
    pub fn encode(&self) -> InternalKey {
        InternalKey::new(&self.user_key, self.seq, self.value_type)
    }
}
