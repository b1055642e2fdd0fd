use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PolicyChunk {
    pub id: u64,
    pub policy_id: u64,
    pub chunk_index: i32,
    pub content: String,
    /// JSON array of floats.
    #[serde(skip_serializing)]
    pub embedding: String,
    pub section_title: Option<String>,
    pub page_number: Option<i32>,
}

impl PolicyChunk {
    /// Stored vector, or an empty one when the column does not hold a JSON array.
    pub fn vector(&self) -> Vec<f32> {
        serde_json::from_str(&self.embedding).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_embedding_decodes_empty() {
        let mut chunk = PolicyChunk {
            id: 1,
            policy_id: 1,
            chunk_index: 0,
            content: "Annual leave".to_string(),
            embedding: "[0.6, 0.8]".to_string(),
            section_title: None,
            page_number: Some(1),
        };
        assert_eq!(chunk.vector(), vec![0.6, 0.8]);
        chunk.embedding = "not-json".to_string();
        assert!(chunk.vector().is_empty());
    }
}
