//! Persisted wire format: canonical CBOR tuples and bitmap layout.
//!
//! A node is the 3-tuple `(bitmap, links, values)`; the root record is the
//! 3-tuple `(height, count, node)`. Exactly one of `links`/`values` is
//! non-empty, the other encodes as an empty array. Entries appear in
//! ascending slot order, one per set bitmap bit, so equal logical contents
//! always serialize to byte-identical blocks.
//!
//! The serde impls are written by hand as fixed-arity tuples rather than
//! derived, so arity and element types are enforced at decode time.

use crate::error::{AmtError, Result};
use arbor_core::ContentId;
use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_bytes::ByteBuf;
use std::fmt;

// ---------------------------------------------------------------------------
// Bitmap helpers
// ---------------------------------------------------------------------------

/// Bytes needed for a `W = 2^bit_width` slot bitmap.
pub(crate) fn bitmap_len(bit_width: u32) -> usize {
    ((1usize << bit_width) + 7) / 8
}

/// Whether bit `slot` is set.
pub(crate) fn get_bit(bitmap: &[u8], slot: usize) -> bool {
    bitmap[slot / 8] & (1 << (slot % 8)) != 0
}

/// Set bit `slot`.
pub(crate) fn set_bit(bitmap: &mut [u8], slot: usize) {
    bitmap[slot / 8] |= 1 << (slot % 8);
}

/// Validate a decoded bitmap: exact length, and no bits at slots >= W.
pub(crate) fn check_bitmap(bitmap: &[u8], bit_width: u32) -> Result<()> {
    let expected = bitmap_len(bit_width);
    if bitmap.len() != expected {
        return Err(AmtError::invalid_shape(format!(
            "expected bitmap to be {expected} bytes long, found {} bytes",
            bitmap.len()
        )));
    }
    let width = 1usize << bit_width;
    let rem = width % 8;
    if rem == 0 {
        return Ok(());
    }
    let unset = 8 - rem as u32;
    let last = bitmap[bitmap.len() - 1];
    if last & !(0xffu8 >> unset) != 0 {
        return Err(AmtError::invalid_shape(format!(
            "expected top {unset} bits of bitmap to be unset (width {width}): {last:#010b}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Persisted node: `(bitmap, links, values)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Node {
    pub bitmap: Vec<u8>,
    pub links: Vec<ContentId>,
    pub values: Vec<Vec<u8>>,
}

impl Node {
    /// An all-empty node (zero bitmap of the right length, no entries).
    pub fn empty(bit_width: u32) -> Self {
        Self {
            bitmap: vec![0; bitmap_len(bit_width)],
            links: Vec::new(),
            values: Vec::new(),
        }
    }
}

/// Persisted root record: `(height, count, node)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Root {
    pub height: u64,
    pub count: u64,
    pub node: Node,
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(3)?;
        tup.serialize_element(&serde_bytes::Bytes::new(&self.bitmap))?;
        tup.serialize_element(&self.links)?;
        let values: Vec<&serde_bytes::Bytes> = self
            .values
            .iter()
            .map(|v| serde_bytes::Bytes::new(v))
            .collect();
        tup.serialize_element(&values)?;
        tup.end()
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct NodeVisitor;

        impl<'de> Visitor<'de> for NodeVisitor {
            type Value = Node;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a (bitmap, links, values) tuple")
            }

            fn visit_seq<A: SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let bitmap: ByteBuf = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let links: Vec<ContentId> = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let values: Vec<ByteBuf> = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                Ok(Node {
                    bitmap: bitmap.into_vec(),
                    links,
                    values: values.into_iter().map(ByteBuf::into_vec).collect(),
                })
            }
        }

        deserializer.deserialize_tuple(3, NodeVisitor)
    }
}

impl Serialize for Root {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(3)?;
        tup.serialize_element(&self.height)?;
        tup.serialize_element(&self.count)?;
        tup.serialize_element(&self.node)?;
        tup.end()
    }
}

impl<'de> Deserialize<'de> for Root {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct RootVisitor;

        impl<'de> Visitor<'de> for RootVisitor {
            type Value = Root;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a (height, count, node) tuple")
            }

            fn visit_seq<A: SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let height: u64 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let count: u64 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let node: Node = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                Ok(Root {
                    height,
                    count,
                    node,
                })
            }
        }

        deserializer.deserialize_tuple(3, RootVisitor)
    }
}
