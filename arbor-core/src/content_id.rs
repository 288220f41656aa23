//! Content identifier (CIDv1) for storage-agnostic block identity.
//!
//! `ContentId` wraps a CIDv1 from the multiformats ecosystem. The multicodec
//! value names the encoding of the referenced block (all AMT blocks are
//! [`DAG_CBOR`]); the multihash is always SHA2-256.
//!
//! ## String form
//!
//! The canonical string representation is **base32-lower** (multibase),
//! producing the familiar `bafy...` prefixes. This is what appears in logs
//! and APIs.
//!
//! ## Binary form
//!
//! The compact binary form is the standard CID binary encoding
//! (varint version + varint codec + multihash bytes), used inside
//! persisted records.

use crate::error::{Error, Result};
use cid::Cid;
use multihash::Multihash;
use sha2::Digest;
use std::fmt;
use std::str::FromStr;

/// Multicodec for DAG-CBOR encoded blocks (standard multicodec table).
pub const DAG_CBOR: u64 = 0x71;

/// SHA2-256 multihash code (standard).
const SHA2_256: u64 = 0x12;

/// Content identifier wrapping CIDv1 (multiformats).
///
/// The canonical identity for every immutable block: equal bytes under the
/// same codec always produce the same `ContentId`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentId(Cid);

impl ContentId {
    /// Create a new `ContentId` by hashing `bytes` with SHA2-256 and
    /// tagging with the multicodec `codec`.
    pub fn new(codec: u64, bytes: &[u8]) -> Self {
        let digest = sha2::Sha256::digest(bytes);
        // SHA2-256 produces 32 bytes, MH_SIZE=64 — wrap always succeeds.
        let mh = Multihash::<64>::wrap(SHA2_256, &digest)
            .expect("SHA2-256 digest fits in Multihash<64>");
        Self(Cid::new_v1(codec, mh))
    }

    /// Borrow the inner `Cid`.
    pub fn as_cid(&self) -> &Cid {
        &self.0
    }

    /// The multicodec value stored in this CID.
    pub fn codec(&self) -> u64 {
        self.0.codec()
    }

    /// Serialize to the standard CID binary form.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes()
    }

    /// Parse from CID binary bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let cid = Cid::try_from(bytes).map_err(|e| Error::invalid_id(format!("{e}")))?;
        Ok(Self(cid))
    }

    /// Re-hash `bytes` and check that the result matches this CID's
    /// multihash digest.
    ///
    /// Use this when accepting blocks from untrusted sources.
    pub fn verify(&self, bytes: &[u8]) -> bool {
        let mh = self.0.hash();
        if mh.code() != SHA2_256 {
            // We only support SHA2-256 verification.
            return false;
        }
        let digest = sha2::Sha256::digest(bytes);
        mh.digest() == digest.as_slice()
    }

    /// The hex-encoded multihash digest (without the code/length prefix).
    ///
    /// Useful for filesystem layouts where the path includes the digest.
    pub fn digest_hex(&self) -> String {
        hex::encode(self.0.hash().digest())
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // CIDv1 Display uses base32-lower by default.
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self.0)
    }
}

impl FromStr for ContentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let cid = Cid::try_from(s).map_err(|e| Error::invalid_id(format!("{e}")))?;
        Ok(Self(cid))
    }
}

impl PartialOrd for ContentId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ContentId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_bytes().cmp(&other.to_bytes())
    }
}

// Serde: human-readable formats get the base32 string, binary formats get
// the raw CID bytes.

impl serde::Serialize for ContentId {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            serializer.serialize_bytes(&self.to_bytes())
        }
    }
}

impl<'de> serde::Deserialize<'de> for ContentId {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            ContentId::from_str(&s).map_err(serde::de::Error::custom)
        } else {
            let bytes = serde_bytes_visit(deserializer)?;
            ContentId::from_bytes(&bytes).map_err(serde::de::Error::custom)
        }
    }
}

/// Accept either a CBOR byte string or an array of integers as bytes.
fn serde_bytes_visit<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<u8>, D::Error> {
    struct BytesVisitor;

    impl<'de> serde::de::Visitor<'de> for BytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("CID bytes")
        }

        fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> std::result::Result<Self::Value, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: serde::de::Error>(
            self,
            v: Vec<u8>,
        ) -> std::result::Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_seq<A: serde::de::SeqAccess<'de>>(
            self,
            mut seq: A,
        ) -> std::result::Result<Self::Value, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(b) = seq.next_element::<u8>()? {
                out.push(b);
            }
            Ok(out)
        }
    }

    deserializer.deserialize_bytes(BytesVisitor)
}
