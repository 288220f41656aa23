//! Canonical CBOR encode/decode helpers.
//!
//! Every persisted record in this workspace is CBOR with definite-length
//! encoding, so equal logical content always yields byte-identical blocks
//! and therefore equal content ids. These helpers wrap `serde_cbor` with
//! the crate error type and add typed store convenience functions.

use crate::content_id::ContentId;
use crate::error::Result;
use crate::store::{BlockRead, BlockWrite};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serialize a value to canonical CBOR bytes.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_cbor::to_vec(value)?)
}

/// Deserialize a value from CBOR bytes.
pub fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_cbor::from_slice(bytes)?)
}

/// Fetch the block named by `id` and decode it as `T`.
pub async fn get_cbor<T, S>(store: &S, id: &ContentId) -> Result<T>
where
    T: DeserializeOwned,
    S: BlockRead + ?Sized,
{
    let bytes = store.get_block(id).await?;
    from_slice(&bytes)
}

/// Encode `value` as CBOR and store it under `codec`, returning its id.
pub async fn put_cbor<T, S>(store: &S, codec: u64, value: &T) -> Result<ContentId>
where
    T: Serialize + Sync,
    S: BlockWrite + ?Sized,
{
    let bytes = to_vec(value)?;
    store.put_block(codec, &bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_id::DAG_CBOR;
    use crate::store::MemoryBlockstore;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record(u64, #[serde(with = "serde_bytes")] Vec<u8>);

    #[test]
    fn test_encoding_is_deterministic() {
        let a = to_vec(&Record(7, b"payload".to_vec())).unwrap();
        let b = to_vec(&Record(7, b"payload".to_vec())).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result: Result<Record> = from_slice(&[0xff, 0xff, 0xff]);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_store_roundtrip() {
        let store = MemoryBlockstore::new();
        let record = Record(42, b"hello".to_vec());

        let id = put_cbor(&store, DAG_CBOR, &record).await.unwrap();
        assert_eq!(id.codec(), DAG_CBOR);

        let loaded: Record = get_cbor(&store, &id).await.unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn test_equal_records_share_a_block() {
        let store = MemoryBlockstore::new();
        let id1 = put_cbor(&store, DAG_CBOR, &Record(1, vec![])).await.unwrap();
        let id2 = put_cbor(&store, DAG_CBOR, &Record(1, vec![])).await.unwrap();

        assert_eq!(id1, id2);
        assert_eq!(store.len(), 1);
    }
}
