use bytes::{Buf, BufMut, BytesMut};

use crate::{
    comparator::Comparator,
    db::format::{SequenceNumber, ValueType},
    error::{CorruptionError, Result},
    memtable::MemTable,
    utils::varint,
};

/// Fixed64 le sequence followed by fixed32 le record count.
const HEADER_SIZE: usize = 12;

/// Ordered stream of updates applied to a memtable as one unit.
///
/// The wire format like this:
///
/// | seq: fixed64 le | count: fixed32 le | record*  |
///
/// record := tag: u8 (1 = put, 0 = delete) | var key [| var value]
///
/// Within a batch, later records win: they are replayed in order with
/// ascending sequence numbers.
pub struct WriteBatch {
    rep: BytesMut,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        Self {
            rep: BytesMut::zeroed(HEADER_SIZE),
        }
    }

    /// Adopts a foreign byte buffer. Corrupt contents surface during
    /// iteration, not here.
    pub fn from_contents(contents: &[u8]) -> Self {
        Self {
            rep: BytesMut::from(contents),
        }
    }

    pub fn contents(&self) -> &[u8] {
        &self.rep
    }

    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(HEADER_SIZE, 0);
    }

    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    pub fn count(&self) -> u32 {
        (&self.rep[8..HEADER_SIZE]).get_u32_le()
    }

    fn set_count(&mut self, count: u32) {
        self.rep[8..HEADER_SIZE].copy_from_slice(&count.to_le_bytes());
    }

    pub fn sequence(&self) -> SequenceNumber {
        (&self.rep[..8]).get_u64_le()
    }

    pub fn set_sequence(&mut self, seq: SequenceNumber) {
        self.rep[..8].copy_from_slice(&seq.to_le_bytes());
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.put_u8(ValueType::Value as u8);
        put_length_prefixed(&mut self.rep, key);
        put_length_prefixed(&mut self.rep, value);
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.put_u8(ValueType::Deletion as u8);
        put_length_prefixed(&mut self.rep, key);
    }

    /// Concatenates `other`'s records onto this batch and sums the counts.
    pub fn append(&mut self, other: &WriteBatch) {
        assert!(other.rep.len() >= HEADER_SIZE);
        self.set_count(self.count() + other.count());
        self.rep.extend_from_slice(&other.rep[HEADER_SIZE..]);
    }

    /// Record stream in batch order. The first corruption ends the
    /// stream; a record-count mismatch is reported after the last record.
    pub fn iter(&self) -> BatchIter<'_> {
        if self.rep.len() < HEADER_SIZE {
            BatchIter {
                input: &[],
                expected: 0,
                found: 0,
                state: IterState::TooSmall,
            }
        } else {
            BatchIter {
                input: &self.rep[HEADER_SIZE..],
                expected: self.count(),
                found: 0,
                state: IterState::Running,
            }
        }
    }

    /// Replays the batch into `mem`, assigning `sequence() + i` to the
    /// i-th record.
    pub fn insert_into<C: Comparator>(&self, mem: &MemTable<C>) -> Result<()> {
        let mut seq = self.sequence();
        for op in self.iter() {
            match op? {
                BatchOp::Put { key, value } => mem.add(seq, ValueType::Value, key, value),
                BatchOp::Delete { key } => mem.add(seq, ValueType::Deletion, key, &[]),
            }
            seq += 1;
        }
        Ok(())
    }
}

fn put_length_prefixed(rep: &mut BytesMut, data: &[u8]) {
    varint::extend_buf(rep, data.len() as u64);
    rep.extend_from_slice(data);
}

#[derive(Debug, PartialEq, Eq)]
pub enum BatchOp<'a> {
    Put { key: &'a [u8], value: &'a [u8] },
    Delete { key: &'a [u8] },
}

enum IterState {
    TooSmall,
    Running,
    Done,
}

pub struct BatchIter<'a> {
    input: &'a [u8],
    expected: u32,
    found: u32,
    state: IterState,
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = Result<BatchOp<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.state {
            IterState::Done => return None,
            IterState::TooSmall => {
                self.state = IterState::Done;
                return Some(Err(CorruptionError::BatchTooSmall.into()));
            }
            IterState::Running => {}
        }

        if self.input.is_empty() {
            self.state = IterState::Done;
            if self.found != self.expected {
                return Some(Err(CorruptionError::WrongCount.into()));
            }
            return None;
        }

        let tag = self.input[0];
        self.input = &self.input[1..];

        let op = if tag == ValueType::Value as u8 {
            let decoded = varint::get_length_prefixed_slice(self.input).and_then(|(key, rest)| {
                varint::get_length_prefixed_slice(rest).map(|(value, rest)| (key, value, rest))
            });
            match decoded {
                Ok((key, value, rest)) => {
                    self.input = rest;
                    BatchOp::Put { key, value }
                }
                Err(_) => {
                    self.state = IterState::Done;
                    return Some(Err(CorruptionError::BadPut.into()));
                }
            }
        } else if tag == ValueType::Deletion as u8 {
            match varint::get_length_prefixed_slice(self.input) {
                Ok((key, rest)) => {
                    self.input = rest;
                    BatchOp::Delete { key }
                }
                Err(_) => {
                    self.state = IterState::Done;
                    return Some(Err(CorruptionError::BadDelete.into()));
                }
            }
        } else {
            self.state = IterState::Done;
            return Some(Err(CorruptionError::UnknownTag.into()));
        };

        self.found += 1;
        Some(Ok(op))
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::{BatchOp, WriteBatch, HEADER_SIZE};
    use crate::{
        error::{CorruptionError, Error},
        memtable::{GetValue, MemTable},
        db::format::lookup_key::LookupKey,
    };

    fn ops(batch: &WriteBatch) -> Vec<(u8, Vec<u8>, Vec<u8>)> {
        batch
            .iter()
            .map(|op| match op.unwrap() {
                BatchOp::Put { key, value } => (1, key.to_vec(), value.to_vec()),
                BatchOp::Delete { key } => (0, key.to_vec(), Vec::new()),
            })
            .collect_vec()
    }

    fn expect_corruption(batch: &WriteBatch, expected: CorruptionError) {
        let last = batch.iter().last().expect("stream should end in an error");
        match last {
            Err(Error::Corruption(kind)) => assert_eq!(kind, expected),
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn empty_batch() {
        let batch = WriteBatch::new();
        assert_eq!(batch.count(), 0);
        assert_eq!(batch.sequence(), 0);
        assert_eq!(batch.approximate_size(), HEADER_SIZE);
        assert_eq!(batch.iter().count(), 0);
    }

    #[test]
    fn records_keep_order() {
        let mut batch = WriteBatch::new();
        batch.put(b"k1", b"v1");
        batch.delete(b"k1");
        batch.put(b"k2", b"v2");

        assert_eq!(batch.count(), 3);
        assert_eq!(
            ops(&batch),
            vec![
                (1, b"k1".to_vec(), b"v1".to_vec()),
                (0, b"k1".to_vec(), Vec::new()),
                (1, b"k2".to_vec(), b"v2".to_vec()),
            ]
        );
    }

    #[test]
    fn contents_round_trip() {
        let mut batch = WriteBatch::new();
        batch.set_sequence(42);
        batch.put(b"key", b"value");
        batch.delete(b"gone");

        let copy = WriteBatch::from_contents(batch.contents());
        assert_eq!(copy.sequence(), 42);
        assert_eq!(copy.count(), 2);
        assert_eq!(ops(&copy), ops(&batch));
    }

    #[test]
    fn clear_resets_to_empty() {
        let mut batch = WriteBatch::new();
        batch.set_sequence(9);
        batch.put(b"k", b"v");
        batch.clear();

        assert_eq!(batch.count(), 0);
        assert_eq!(batch.sequence(), 0);
        assert_eq!(batch.approximate_size(), HEADER_SIZE);
    }

    #[test]
    fn append_concatenates_records() {
        let mut left = WriteBatch::new();
        left.put(b"a", b"1");
        let mut right = WriteBatch::new();
        right.delete(b"b");
        right.put(b"c", b"3");

        left.append(&right);
        assert_eq!(left.count(), 3);
        assert_eq!(
            ops(&left),
            vec![
                (1, b"a".to_vec(), b"1".to_vec()),
                (0, b"b".to_vec(), Vec::new()),
                (1, b"c".to_vec(), b"3".to_vec()),
            ]
        );

        // Appending an empty batch changes nothing.
        left.append(&WriteBatch::new());
        assert_eq!(left.count(), 3);
    }

    #[test]
    fn insert_into_assigns_ascending_sequences() {
        let mut batch = WriteBatch::new();
        batch.set_sequence(10);
        batch.put(b"k", b"v1");
        batch.delete(b"k");
        batch.put(b"k", b"v2");
        batch.put(b"k", b"v3");

        let mem = MemTable::new();
        batch.insert_into(&mem).unwrap();

        let get = |snap| mem.get(&LookupKey::new(b"k", snap));
        assert_eq!(get(13), Some(GetValue::Value("v3".into())));
        assert_eq!(get(12), Some(GetValue::Value("v2".into())));
        assert_eq!(get(11), Some(GetValue::Deleted));
        assert_eq!(get(10), Some(GetValue::Value("v1".into())));
        assert_eq!(get(9), None);
    }

    #[test]
    fn too_small_batch() {
        let batch = WriteBatch::from_contents(&[0_u8; 5]);
        expect_corruption(&batch, CorruptionError::BatchTooSmall);
    }

    #[test]
    fn truncated_put() {
        let mut batch = WriteBatch::new();
        batch.put(b"key", b"a-long-enough-value");
        let cut = batch.contents().len() - 6;
        let broken = WriteBatch::from_contents(&batch.contents()[..cut]);
        expect_corruption(&broken, CorruptionError::BadPut);
    }

    #[test]
    fn truncated_delete() {
        let mut batch = WriteBatch::new();
        batch.delete(b"key");
        let cut = batch.contents().len() - 2;
        let broken = WriteBatch::from_contents(&batch.contents()[..cut]);
        expect_corruption(&broken, CorruptionError::BadDelete);
    }

    #[test]
    fn unknown_tag() {
        let mut contents = WriteBatch::new().contents().to_vec();
        contents[8..12].copy_from_slice(&1_u32.to_le_bytes());
        contents.push(7); // no such tag
        let broken = WriteBatch::from_contents(&contents);
        expect_corruption(&broken, CorruptionError::UnknownTag);
    }

    #[test]
    fn wrong_count() {
        let mut batch = WriteBatch::new();
        batch.put(b"k", b"v");
        let mut contents = batch.contents().to_vec();
        contents[8..12].copy_from_slice(&5_u32.to_le_bytes());
        let broken = WriteBatch::from_contents(&contents);

        // The record itself still decodes; the mismatch ends the stream.
        let collected = broken.iter().collect_vec();
        assert_eq!(collected.len(), 2);
        assert!(collected[0].is_ok());
        expect_corruption(&broken, CorruptionError::WrongCount);
    }

    #[test]
    fn corruption_stops_replay() {
        let mut batch = WriteBatch::new();
        batch.set_sequence(1);
        batch.put(b"good", b"v");
        let mut contents = batch.contents().to_vec();
        contents[8..12].copy_from_slice(&2_u32.to_le_bytes());
        let broken = WriteBatch::from_contents(&contents);

        let mem = MemTable::new();
        assert!(broken.insert_into(&mem).is_err());
        // The record before the corruption did land.
        assert_eq!(
            mem.get(&LookupKey::new(b"good", 10)),
            Some(GetValue::Value("v".into()))
        );
    }
}
