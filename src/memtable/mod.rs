mod skip_list;

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    comparator::{BytewiseComparator, Comparator},
    db::format::{
        internal_key::{append_internal_key, extract_tag, extract_user_key, INTERNAL_KEY_TAIL_SIZE},
        lookup_key::LookupKey,
        unpack_sequence_and_type, MemtableKeyComparator, SequenceNumber, ValueType,
    },
    memtable::skip_list::{Iter as SkipListIter, RecordRef, SkipList},
    utils::{arena::Arena, iterator::Iterator, varint},
};

/// Outcome of a lookup that found a record for the probed user key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetValue {
    /// Newest version visible at the snapshot is a live value.
    Value(Bytes),

    /// Newest version visible at the snapshot is a tombstone; the caller
    /// must not fall through to older storage layers.
    Deleted,
}

/// In-memory table of versioned records, newest version of each key
/// first. Cheap to clone; every clone shares the same table, and the
/// backing memory is released when the last clone drops.
///
/// `add` requires external serialization: one writer at a time. Readers
/// (`get`, iterators) may run concurrently with the writer and observe a
/// monotonically growing prefix of the added records.
pub struct MemTable<C: Comparator = BytewiseComparator> {
    inner: Arc<MemTableInner<C>>,
}

struct MemTableInner<C: Comparator> {
    arena: Arc<Arena>,
    table: SkipList<MemtableKeyComparator<C>>,
}

impl<C: Comparator> Clone for MemTable<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl MemTable {
    pub fn new() -> Self {
        Self::with_comparator(BytewiseComparator)
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Comparator> MemTable<C> {
    /// The comparator is fixed for the lifetime of the table.
    pub fn with_comparator(cmp: C) -> Self {
        let arena = Arc::new(Arena::new());
        Self {
            inner: Arc::new(MemTableInner {
                arena: arena.clone(),
                table: SkipList::new(MemtableKeyComparator::new(cmp), arena),
            }),
        }
    }

    /// Appends a record for `user_key` at `seq`. `value` is ignored by
    /// readers when `value_type` is `Deletion` and is conventionally
    /// empty then. Earlier versions of the key are kept; `get` picks the
    /// newest one visible at its snapshot.
    ///
    /// Record layout in the arena:
    ///
    /// | var internal key len | user key | seq, type | var value len | value |
    pub fn add(
        &self,
        seq: SequenceNumber,
        value_type: ValueType,
        user_key: &[u8],
        value: &[u8],
    ) {
        let internal_key_len = user_key.len() + INTERNAL_KEY_TAIL_SIZE;
        let encoded_len = varint::varint_length(internal_key_len as u64)
            + internal_key_len
            + varint::varint_length(value.len() as u64)
            + value.len();

        let ptr = self.inner.arena.allocate(encoded_len);
        let mut buf = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), encoded_len) };
        varint::extend_buf(&mut buf, internal_key_len as u64);
        append_internal_key(&mut buf, user_key, seq, value_type);
        varint::extend_buf(&mut buf, value.len() as u64);
        buf.put(value);
        debug_assert!(buf.is_empty());

        self.inner.table.insert(RecordRef::new(ptr, encoded_len));
    }

    /// Looks up the newest version of the key visible at the lookup
    /// key's snapshot. `None` means this table has nothing to say and the
    /// caller should consult the next storage layer.
    pub fn get(&self, key: &LookupKey) -> Option<GetValue> {
        let mut iter = self.inner.table.iter();
        iter.seek(key.memtable_key());
        if !iter.is_valid() {
            return None;
        }

        // The seek can only overshoot onto a different user key; check
        // the entry is actually ours before trusting its tag.
        let record = iter.key();
        let (ik_len, consumed) = varint::decode_u32(record).expect("record length prefix");
        let internal_key = &record[consumed..consumed + ik_len as usize];

        let user_cmp = self.inner.table.comparator().user_comparator();
        if user_cmp
            .compare(extract_user_key(internal_key), key.user_key())
            .is_ne()
        {
            return None;
        }

        let (_, value_type) = unpack_sequence_and_type(extract_tag(internal_key));
        match value_type {
            ValueType::Value => {
                let rest = &record[consumed + ik_len as usize..];
                let (value_len, value_off) =
                    varint::decode_u32(rest).expect("record value length");
                let value = &rest[value_off..value_off + value_len as usize];
                Some(GetValue::Value(Bytes::copy_from_slice(value)))
            }
            ValueType::Deletion => Some(GetValue::Deleted),
        }
    }

    /// Forward iterator over internal keys in sorted order. Holds a
    /// borrow of the table, so the table outlives it by construction.
    pub fn iter(&self) -> MemTableIter<'_, C> {
        MemTableIter {
            iter: self.inner.table.iter(),
        }
    }

    /// Bytes held by the arena on behalf of this table. Safe to call
    /// while a writer is active.
    pub fn approximate_memory_usage(&self) -> usize {
        self.inner.arena.memory_usage()
    }
}

/// Iterates the table's records, exposing the decoded internal key and
/// value of each.
pub struct MemTableIter<'a, C: Comparator> {
    iter: SkipListIter<'a, MemtableKeyComparator<C>>,
}

impl<C: Comparator> MemTableIter<'_, C> {
    fn record_parts(&self) -> (&[u8], &[u8]) {
        let record = self.iter.key();
        let (ik_len, consumed) = varint::decode_u32(record).expect("record length prefix");
        let internal_key = &record[consumed..consumed + ik_len as usize];
        let rest = &record[consumed + ik_len as usize..];
        (internal_key, rest)
    }
}

impl<C: Comparator> Iterator for MemTableIter<'_, C> {
    fn is_valid(&self) -> bool {
        self.iter.is_valid()
    }

    fn seek_to_first(&mut self) {
        self.iter.seek_to_first();
    }

    fn seek_to_last(&mut self) {
        self.iter.seek_to_last();
    }

    /// `key` is an internal key; it is re-wrapped into the length-prefixed
    /// form the skip list stores.
    fn seek(&mut self, key: impl AsRef<[u8]>) {
        let target = key.as_ref();
        let mut scratch = BytesMut::with_capacity(5 + target.len());
        varint::extend_buf(&mut scratch, target.len() as u64);
        scratch.put(target);
        self.iter.seek(&scratch);
    }

    fn next(&mut self) {
        self.iter.next();
    }

    fn prev(&mut self) {
        self.iter.prev();
    }

    /// The current entry's internal key.
    fn key(&self) -> &[u8] {
        self.record_parts().0
    }

    fn value(&self) -> &[u8] {
        let (_, rest) = self.record_parts();
        let (value_len, value_off) = varint::decode_u32(rest).expect("record value length");
        &rest[value_off..value_off + value_len as usize]
    }
}
