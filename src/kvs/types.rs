//! Domain newtypes for the KVS engine: content-addressed references, the
//! root reference string, and commit names (spec.md §4.5).

use crate::error::BrokerError;
use nutype::nutype;
use std::fmt;
use std::str::FromStr;

/// Length in hex characters of a blake3-256 digest, the fixed shape every
/// valid reference must have.
const REFERENCE_HEX_LEN: usize = 64;

/// Hex-encoded digest of a blob's canonical serialization. Two distinct
/// values can never share a reference (spec.md §3). Fixed-length (blake3's
/// 64 hex characters) so a decoder can reject malformed-shape hashes
/// outright (spec.md §6) rather than accepting any non-empty hex string.
#[nutype(
    validate(predicate = |s: &str| s.len() == REFERENCE_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into, AsRef)
)]
pub struct Reference(String);

/// Name attached to a pending commit, for idempotence-by-name (spec.md §4.5).
#[nutype(
    validate(len_char_min = 1),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into, AsRef)
)]
pub struct CommitName(String);

/// `(sequence, hash)` identifying the current global directory. The hash is
/// itself a [`Reference`] to the directory blob for that sequence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RootRef {
    /// Monotonically increasing at the treeroot; non-root ranks may lag.
    pub seq: u64,
    /// Reference to the directory blob for this sequence.
    pub hash: Reference,
}

impl RootRef {
    /// The genesis root: sequence 0, pointing at the empty directory's reference.
    #[must_use]
    pub fn genesis(empty_directory_ref: Reference) -> Self {
        Self {
            seq: 0,
            hash: empty_directory_ref,
        }
    }
}

impl fmt::Display for RootRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.seq, self.hash)
    }
}

impl FromStr for RootRef {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (seq, hash) = s
            .split_once('.')
            .ok_or_else(|| BrokerError::ProtocolError(format!("malformed root reference: {s}")))?;
        let seq: u64 = seq
            .parse()
            .map_err(|_| BrokerError::ProtocolError(format!("malformed root reference sequence: {s}")))?;
        let hash = Reference::try_new(hash.to_string())
            .map_err(|_| BrokerError::ProtocolError(format!("malformed root reference hash: {s}")))?;
        Ok(Self { seq, hash })
    }
}
