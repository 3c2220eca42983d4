use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::tenant::TenantId;

/// A stored passage of a tenant's knowledge base. `index` is dense and
/// 0-based per tenant; chunks are append-only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub tenant_id: TenantId,
    pub index: u64,
    pub text: String,
    pub embedding: Vec<f32>,
    pub source_ref: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Little-endian f32 encoding used for the `kb_chunk.embedding` column.
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|value| value.to_le_bytes()).collect()
}

pub fn decode_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|raw| f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::{decode_embedding, encode_embedding};

    #[test]
    fn embedding_blob_is_little_endian() {
        let bytes = encode_embedding(&[1.0]);
        assert_eq!(bytes, vec![0x00, 0x00, 0x80, 0x3f]);
        assert_eq!(decode_embedding(&bytes), Some(vec![1.0]));
    }

    #[test]
    fn truncated_blob_is_rejected() {
        assert_eq!(decode_embedding(&[0x00, 0x00, 0x80]), None);
    }
}
