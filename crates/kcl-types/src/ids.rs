use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a shard within a stream. Opaque beyond string equality and
/// ordering: the service assigns shard ids and we never construct them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(pub String);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ShardId {
    fn from(s: String) -> Self {
        ShardId(s)
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        ShardId(s.to_string())
    }
}

/// Identifies a consumer process within a consumer group. By convention
/// often derived as `host:pid:uuid`, but the type itself is opaque.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerId(pub String);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConsumerId {
    fn from(s: String) -> Self {
        ConsumerId(s)
    }
}

impl From<&str> for ConsumerId {
    fn from(s: &str) -> Self {
        ConsumerId(s.to_string())
    }
}

/// A Kinesis sequence number: a non-negative decimal integer, rendered as a
/// string because it can exceed 128 bits. Sequence numbers within a shard
/// are totally ordered; since the service never emits a number with
/// leading zeros, comparing by length first and then lexicographically
/// reproduces numeric order without a bignum dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceNumber(pub String);

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SequenceNumber {
    fn from(s: String) -> Self {
        SequenceNumber(s)
    }
}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SequenceNumber {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_compare_by_length_then_value() {
        let short = SequenceNumber("9".into());
        let long = SequenceNumber("10".into());
        assert!(short < long, "shorter decimal string must sort first");

        let a = SequenceNumber("49546002296000000000000001".into());
        let b = SequenceNumber("49546002297000000000000001".into());
        assert!(a < b);
    }

    #[test]
    fn equal_sequence_numbers_are_equal() {
        let a = SequenceNumber("42".into());
        let b = SequenceNumber("42".into());
        assert_eq!(a.cmp(&b), std::cmp::Ordering::Equal);
    }
}
