pub mod internal_key;
pub mod lookup_key;

use crate::{
    comparator::Comparator,
    db::format::internal_key::{extract_tag, extract_user_key},
    utils::varint,
};

pub type SequenceNumber = u64;

/// Sequence numbers share a fixed64 with the value type: 56 bits of
/// sequence above 8 bits of type.
pub const MAX_SEQUENCE: SequenceNumber = (1 << 56) - 1;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Tombstone. Masks every older version of the same user key; the
    /// record carries no value bytes.
    Deletion = 0,

    /// Live value.
    Value = 1,
}

/// The type a lookup probe carries. `Value` is the largest type, so with
/// tags ordered descending the probe sorts at or before every version of
/// the key visible at its snapshot.
pub(crate) const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Value;

pub(crate) fn pack_sequence_and_type(seq: SequenceNumber, value_type: ValueType) -> u64 {
    debug_assert!(seq <= MAX_SEQUENCE);
    (seq << 8) | value_type as u64
}

pub(crate) fn unpack_sequence_and_type(tag: u64) -> (SequenceNumber, ValueType) {
    let value_type = match (tag & 0xFF) as u8 {
        0 => ValueType::Deletion,
        1 => ValueType::Value,
        t => unreachable!("invalid value type byte {t}"),
    };
    (tag >> 8, value_type)
}

/// Orders internal keys: user key ascending under the user comparator,
/// then packed (sequence, type) tag descending so the newest version of a
/// key comes first.
#[derive(Debug, Clone, Copy)]
pub struct InternalKeyComparator<C> {
    user: C,
}

impl<C> InternalKeyComparator<C> {
    pub fn new(user: C) -> Self {
        Self { user }
    }

    pub fn user_comparator(&self) -> &C {
        &self.user
    }
}

impl<C: Comparator> Comparator for InternalKeyComparator<C> {
    fn compare(&self, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        let ord = self
            .user
            .compare(extract_user_key(a), extract_user_key(b));
        if ord.is_ne() {
            return ord;
        }
        extract_tag(b).cmp(&extract_tag(a))
    }

    fn name(&self) -> &str {
        "siltdb.InternalKeyComparator"
    }
}

/// Orders memtable records. Each side is a length-prefixed internal key
/// (with the record's value bytes possibly trailing); the prefix is
/// stripped and the internal keys compared.
#[derive(Debug, Clone, Copy)]
pub struct MemtableKeyComparator<C> {
    internal: InternalKeyComparator<C>,
}

impl<C> MemtableKeyComparator<C> {
    pub fn new(user: C) -> Self {
        Self {
            internal: InternalKeyComparator::new(user),
        }
    }

    pub fn user_comparator(&self) -> &C {
        self.internal.user_comparator()
    }
}

impl<C: Comparator> Comparator for MemtableKeyComparator<C> {
    fn compare(&self, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        let a = internal_key_slice(a);
        let b = internal_key_slice(b);
        self.internal.compare(a, b)
    }

    fn name(&self) -> &str {
        "siltdb.MemtableKeyComparator"
    }
}

fn internal_key_slice(record: &[u8]) -> &[u8] {
    let (len, consumed) = varint::decode_u32(record).expect("record length prefix");
    &record[consumed..consumed + len as usize]
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::{
        internal_key::append_internal_key, pack_sequence_and_type, unpack_sequence_and_type,
        InternalKeyComparator, MemtableKeyComparator, SequenceNumber, ValueType, MAX_SEQUENCE,
    };
    use crate::{comparator::BytewiseComparator, comparator::Comparator, utils::varint};

    #[test]
    fn pack_round_trip() {
        let cases = [
            (0, ValueType::Deletion),
            (1, ValueType::Value),
            (100, ValueType::Value),
            (MAX_SEQUENCE, ValueType::Deletion),
        ];
        for (seq, ty) in cases {
            let tag = pack_sequence_and_type(seq, ty);
            let (got_seq, got_ty) = unpack_sequence_and_type(tag);
            assert_eq!(got_seq, seq);
            assert_eq!(got_ty, ty);
        }
    }

    fn ik(user_key: &[u8], seq: SequenceNumber, ty: ValueType) -> BytesMut {
        let mut buf = BytesMut::new();
        append_internal_key(&mut buf, user_key, seq, ty);
        buf
    }

    #[test]
    fn internal_key_order() {
        let cmp = InternalKeyComparator::new(BytewiseComparator);

        // User key ascending.
        assert!(cmp
            .compare(&ik(b"a", 5, ValueType::Value), &ik(b"b", 5, ValueType::Value))
            .is_lt());

        // Same user key: higher sequence sorts first.
        assert!(cmp
            .compare(&ik(b"a", 9, ValueType::Value), &ik(b"a", 5, ValueType::Value))
            .is_lt());

        // Same user key and sequence: Value sorts before Deletion.
        assert!(cmp
            .compare(&ik(b"a", 5, ValueType::Value), &ik(b"a", 5, ValueType::Deletion))
            .is_lt());

        assert!(cmp
            .compare(&ik(b"a", 5, ValueType::Value), &ik(b"a", 5, ValueType::Value))
            .is_eq());
    }

    #[test]
    fn memtable_key_order_ignores_trailing_value() {
        let cmp = MemtableKeyComparator::new(BytewiseComparator);

        let record = |user_key: &[u8], seq, value: &[u8]| {
            let mut buf = BytesMut::new();
            varint::extend_buf(&mut buf, (user_key.len() + 8) as u64);
            append_internal_key(&mut buf, user_key, seq, ValueType::Value);
            varint::extend_buf(&mut buf, value.len() as u64);
            buf.extend_from_slice(value);
            buf
        };

        let a = record(b"apple", 3, b"a much longer value than the other");
        let b = record(b"apple", 2, b"x");
        assert!(cmp.compare(&a, &b).is_lt());
        assert!(cmp.compare(&b, &a).is_gt());

        let c = record(b"banana", 1, b"");
        assert!(cmp.compare(&a, &c).is_lt());
    }
}
