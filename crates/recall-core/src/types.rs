use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of values in every face embedding.
pub const EMBEDDING_DIM: usize = 128;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("expected {dim}-dim embedding, got {0}", dim = EMBEDDING_DIM)]
    WrongLength(usize),
    #[error("embedding value at index {index} is not finite ({value})")]
    NonFinite { index: usize, value: f64 },
}

/// Face embedding: exactly [`EMBEDDING_DIM`] finite values.
///
/// The only ways to obtain one are [`Embedding::from_values`] and serde
/// deserialization, both of which validate. There is no mutable access to
/// the values afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct Embedding {
    values: Vec<f64>,
}

impl Embedding {
    /// Validate and wrap raw generator output.
    pub fn from_values(values: Vec<f64>) -> Result<Self, EmbeddingError> {
        validate(&values)?;
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f64 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    /// Little-endian byte encoding used by on-disk stores.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Inverse of [`to_le_bytes`](Self::to_le_bytes); validates the result.
    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, EmbeddingError> {
        if bytes.len() % 8 != 0 {
            return Err(EmbeddingError::WrongLength(bytes.len() / 8));
        }
        let values = bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(chunk);
                f64::from_le_bytes(buf)
            })
            .collect();
        Self::from_values(values)
    }
}

impl TryFrom<Vec<f64>> for Embedding {
    type Error = EmbeddingError;

    fn try_from(values: Vec<f64>) -> Result<Self, Self::Error> {
        Self::from_values(values)
    }
}

impl From<Embedding> for Vec<f64> {
    fn from(embedding: Embedding) -> Self {
        embedding.values
    }
}

/// Check the embedding invariants without taking ownership.
pub fn validate(values: &[f64]) -> Result<(), EmbeddingError> {
    if values.len() != EMBEDDING_DIM {
        return Err(EmbeddingError::WrongLength(values.len()));
    }
    match values.iter().position(|v| !v.is_finite()) {
        Some(index) => Err(EmbeddingError::NonFinite {
            index,
            value: values[index],
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
pub(crate) fn test_embedding(fill: f64) -> Embedding {
    Embedding::from_values(vec![fill; EMBEDDING_DIM]).unwrap()
}

/// Embedding whose first component is `offset` and the rest zero, so the
/// Euclidean distance between two of them is `|a - b|`.
#[cfg(test)]
pub(crate) fn test_embedding_at(offset: f64) -> Embedding {
    let mut values = vec![0.0; EMBEDDING_DIM];
    values[0] = offset;
    Embedding::from_values(values).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_values_accepts_valid() {
        let e = Embedding::from_values(vec![0.25; EMBEDDING_DIM]).unwrap();
        assert_eq!(e.values().len(), EMBEDDING_DIM);
    }

    #[test]
    fn test_rejects_wrong_length() {
        let err = Embedding::from_values(vec![0.0; 127]).unwrap_err();
        assert_eq!(err, EmbeddingError::WrongLength(127));
        assert_eq!(err.to_string(), "expected 128-dim embedding, got 127");
    }

    #[test]
    fn test_rejects_nan() {
        let mut values = vec![0.0; EMBEDDING_DIM];
        values[42] = f64::NAN;
        match Embedding::from_values(values).unwrap_err() {
            EmbeddingError::NonFinite { index, .. } => assert_eq!(index, 42),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_infinity() {
        let mut values = vec![0.0; EMBEDDING_DIM];
        values[0] = f64::INFINITY;
        assert!(Embedding::from_values(values).is_err());
    }

    #[test]
    fn test_deserialize_validates() {
        let short = serde_json::to_string(&vec![0.1f64; 127]).unwrap();
        assert!(serde_json::from_str::<Embedding>(&short).is_err());

        let ok = serde_json::to_string(&vec![0.1f64; EMBEDDING_DIM]).unwrap();
        let e: Embedding = serde_json::from_str(&ok).unwrap();
        assert_eq!(serde_json::to_string(&e).unwrap(), ok);
    }

    #[test]
    fn test_le_bytes_round_trip() {
        let e = test_embedding_at(0.75);
        let bytes = e.to_le_bytes();
        assert_eq!(bytes.len(), EMBEDDING_DIM * 8);
        assert_eq!(Embedding::from_le_bytes(&bytes).unwrap(), e);
        assert!(Embedding::from_le_bytes(&bytes[..bytes.len() - 8]).is_err());
    }

    #[test]
    fn test_euclidean_distance() {
        let a = test_embedding_at(0.0);
        let b = test_embedding_at(0.3);
        assert!((a.euclidean_distance(&b) - 0.3).abs() < 1e-12);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }
}
