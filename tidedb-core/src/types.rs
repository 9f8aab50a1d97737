//! Core types for TideDB: sequence numbers, internal keys and comparators

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Monotonically increasing write-order identifier
pub type SequenceNumber = u64;

/// Largest sequence number that fits in an internal key trailer
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

/// Size of the (sequence, type) trailer appended to every user key
pub const TRAILER_SIZE: usize = 8;

/// Kind of a versioned entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ValueType {
    /// Tombstone
    Deletion = 0,
    /// Live value
    Value = 1,
}

impl ValueType {
    /// Decode from the low byte of a trailer
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ValueType::Deletion),
            1 => Some(ValueType::Value),
            _ => None,
        }
    }
}

/// Type used when building seek keys; sorts first among entries with the same sequence
pub const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Value;

/// Pack a sequence number and value type into a trailer
pub fn pack_sequence_and_type(sequence: SequenceNumber, value_type: ValueType) -> u64 {
    debug_assert!(sequence <= MAX_SEQUENCE_NUMBER);
    (sequence << 8) | value_type as u64
}

/// Append the internal key encoding of `(user_key, sequence, value_type)` to `buf`
pub fn append_internal_key(
    buf: &mut Vec<u8>,
    user_key: &[u8],
    sequence: SequenceNumber,
    value_type: ValueType,
) {
    buf.extend_from_slice(user_key);
    buf.extend_from_slice(&pack_sequence_and_type(sequence, value_type).to_le_bytes());
}

/// Return the user key portion of an encoded internal key
pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    debug_assert!(internal_key.len() >= TRAILER_SIZE);
    &internal_key[..internal_key.len() - TRAILER_SIZE]
}

fn extract_trailer(internal_key: &[u8]) -> u64 {
    let start = internal_key.len() - TRAILER_SIZE;
    let mut raw = [0u8; TRAILER_SIZE];
    raw.copy_from_slice(&internal_key[start..]);
    u64::from_le_bytes(raw)
}

/// Borrowed, decoded view of an internal key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    pub user_key: &'a [u8],
    pub sequence: SequenceNumber,
    pub value_type: ValueType,
}

/// Decode an internal key, returning `None` if it is malformed
pub fn parse_internal_key(internal_key: &[u8]) -> Option<ParsedInternalKey<'_>> {
    if internal_key.len() < TRAILER_SIZE {
        return None;
    }
    let trailer = extract_trailer(internal_key);
    let value_type = ValueType::from_u8((trailer & 0xff) as u8)?;
    Some(ParsedInternalKey {
        user_key: extract_user_key(internal_key),
        sequence: trailer >> 8,
        value_type,
    })
}

/// Owned internal key
#[derive(Clone, PartialEq, Eq, Default)]
pub struct InternalKey {
    rep: Vec<u8>,
}

impl InternalKey {
    /// Build an internal key from its parts
    pub fn new(user_key: &[u8], sequence: SequenceNumber, value_type: ValueType) -> Self {
        let mut rep = Vec::with_capacity(user_key.len() + TRAILER_SIZE);
        append_internal_key(&mut rep, user_key, sequence, value_type);
        Self { rep }
    }

    /// Encoded bytes
    pub fn encode(&self) -> &[u8] {
        &self.rep
    }

    /// User key portion
    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.rep)
    }

    /// True if no key has been set
    pub fn is_empty(&self) -> bool {
        self.rep.is_empty()
    }
}

impl fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match parse_internal_key(&self.rep) {
            Some(parsed) => write!(
                f,
                "'{}' @ {} : {:?}",
                String::from_utf8_lossy(parsed.user_key),
                parsed.sequence,
                parsed.value_type
            ),
            None => write!(f, "(bad){:?}", self.rep),
        }
    }
}

/// Key used for point lookups: the user key tagged with the snapshot sequence
pub struct LookupKey {
    rep: Vec<u8>,
}

impl LookupKey {
    /// Build a lookup key that finds the newest version visible at `sequence`
    pub fn new(user_key: &[u8], sequence: SequenceNumber) -> Self {
        let mut rep = Vec::with_capacity(user_key.len() + TRAILER_SIZE);
        append_internal_key(&mut rep, user_key, sequence, VALUE_TYPE_FOR_SEEK);
        Self { rep }
    }

    /// Full internal key
    pub fn internal_key(&self) -> &[u8] {
        &self.rep
    }

    /// User key portion
    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.rep)
    }
}

/// Total order over user keys
pub trait Comparator: Send + Sync {
    /// Three-way comparison
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Name persisted in the manifest; reopening with a different name fails
    fn name(&self) -> &str;
}

/// Byte-lexicographic ordering
#[derive(Debug, Default, Clone, Copy)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn name(&self) -> &str {
        "tidedb.BytewiseComparator"
    }
}

/// Orders internal keys: user key ascending, then sequence and type descending
#[derive(Clone)]
pub struct InternalKeyComparator {
    user: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
    pub fn new(user: Arc<dyn Comparator>) -> Self {
        Self { user }
    }

    /// Underlying user comparator
    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.user
    }

    /// Compare two encoded internal keys
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self.user.compare(extract_user_key(a), extract_user_key(b)) {
            Ordering::Equal => extract_trailer(b).cmp(&extract_trailer(a)),
            ord => ord,
        }
    }

    /// Compare only the user-key portions
    pub fn compare_user(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.user.compare(a, b)
    }
}

impl fmt::Debug for InternalKeyComparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InternalKeyComparator({})", self.user.name())
    }
}
