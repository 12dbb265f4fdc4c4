//! Embedding vectors
//!
//! An embedding is tagged with the model that produced it. Two embeddings are
//! only comparable when both the model and the dimension agree; anything else
//! is rejected rather than coerced into a number.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A fixed-dimension vector produced by a named model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    /// Identifier of the embedding model
    pub model: String,
    /// Vector components
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(model: impl Into<String>, values: Vec<f32>) -> Self {
        Self {
            model: model.into(),
            values,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.values.len()
    }

    /// Check that `other` can be compared against this embedding
    pub fn ensure_compatible(&self, other: &Embedding) -> Result<()> {
        if self.model != other.model || self.values.len() != other.values.len() {
            return Err(Error::DimensionMismatch {
                expected: self.values.len(),
                actual: other.values.len(),
                expected_model: self.model.clone(),
                actual_model: other.model.clone(),
            });
        }
        Ok(())
    }

    /// Cosine similarity in `[-1, 1]`
    ///
    /// Zero-magnitude vectors have similarity 0.
    pub fn cosine_similarity(&self, other: &Embedding) -> Result<f32> {
        self.ensure_compatible(other)?;
        Ok(cosine_similarity(&self.values, &other.values))
    }

    /// Encode as little-endian f32 bytes for BLOB storage
    pub fn to_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    /// Decode from little-endian f32 bytes
    pub fn from_bytes(model: impl Into<String>, bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            return Err(Error::Other(format!(
                "Embedding blob length {} is not a multiple of 4",
                bytes.len()
            )));
        }
        let values = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Ok(Self::new(model, values))
    }
}

/// Raw cosine similarity between equal-length slices
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 { 0.0 } else { dot / denom }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = Embedding::new("m", vec![1.0, 2.0, 3.0]);
        let similarity = a.cosine_similarity(&a.clone()).unwrap();
        assert!((similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = Embedding::new("m", vec![1.0, 0.0]);
        let b = Embedding::new("m", vec![0.0, 1.0]);
        assert!(a.cosine_similarity(&b).unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_zero_vector_similarity() {
        let a = Embedding::new("m", vec![0.0, 0.0]);
        let b = Embedding::new("m", vec![1.0, 1.0]);
        assert_eq!(a.cosine_similarity(&b).unwrap(), 0.0);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let a = Embedding::new("m", vec![1.0, 0.0]);
        let b = Embedding::new("m", vec![1.0, 0.0, 0.0]);
        let err = a.cosine_similarity(&b).unwrap_err();
        assert_eq!(err.code(), "E101");
    }

    #[test]
    fn test_model_mismatch_rejected() {
        let a = Embedding::new("small", vec![1.0, 0.0]);
        let b = Embedding::new("large", vec![1.0, 0.0]);
        assert!(matches!(
            a.cosine_similarity(&b),
            Err(Error::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_blob_encoding() {
        let embedding = Embedding::new("m", vec![0.5, -1.25, 3.0]);
        let bytes = embedding.to_bytes();
        assert_eq!(bytes.len(), 12);
        assert_eq!(Embedding::from_bytes("m", &bytes).unwrap(), embedding);
        assert!(Embedding::from_bytes("m", &bytes[..5]).is_err());
    }
}
