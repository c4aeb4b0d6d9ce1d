//! Embedding comparison contract and the built-in Euclidean comparator.

use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Tolerance used when a caller does not supply one.
pub const DEFAULT_TOLERANCE: f64 = 0.6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ComparisonError {
    #[error("tolerance must be in (0, 1], got {0}")]
    InvalidTolerance(f64),
    #[error("comparator returned invalid distance {0}")]
    InvalidDistance(f64),
    #[error("comparator unavailable: {0}")]
    Unavailable(String),
    #[error("comparator timed out")]
    TimedOut,
    #[error("malformed comparator output: {0}")]
    Malformed(String),
}

/// Maximum distance (exclusive) at which two embeddings count as the same face.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Tolerance(f64);

impl Tolerance {
    pub fn new(value: f64) -> Result<Self, ComparisonError> {
        if value.is_finite() && value > 0.0 && value <= 1.0 {
            Ok(Self(value))
        } else {
            Err(ComparisonError::InvalidTolerance(value))
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl Default for Tolerance {
    fn default() -> Self {
        Self(DEFAULT_TOLERANCE)
    }
}

impl TryFrom<f64> for Tolerance {
    type Error = ComparisonError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Tolerance> for f64 {
    fn from(t: Tolerance) -> Self {
        t.0
    }
}

/// Outcome of comparing two embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub distance: f64,
    /// `1 - distance`, clamped to [0, 1].
    pub similarity: f64,
    /// `distance < tolerance`.
    pub matched: bool,
}

impl Comparison {
    /// Derive similarity and match flag from a raw distance.
    ///
    /// Rejects negative and non-finite distances so that a broken comparator
    /// can never be mistaken for a close match.
    pub fn from_distance(distance: f64, tolerance: Tolerance) -> Result<Self, ComparisonError> {
        if !distance.is_finite() || distance < 0.0 {
            return Err(ComparisonError::InvalidDistance(distance));
        }
        Ok(Self {
            distance,
            similarity: similarity_from_distance(distance),
            matched: distance < tolerance.value(),
        })
    }
}

/// Similarity score for a distance: `1 - d` on [0, 1], `0` beyond.
pub fn similarity_from_distance(distance: f64) -> f64 {
    (1.0 - distance).clamp(0.0, 1.0)
}

/// Strategy for comparing two embeddings.
///
/// Implementations must be pure: the same inputs always yield the same
/// result, and nothing is cached or persisted between calls. Infrastructure
/// trouble is reported as `Err`, never as a non-matching `Comparison`.
pub trait Comparator: Send + Sync {
    fn compare(
        &self,
        a: &Embedding,
        b: &Embedding,
        tolerance: Tolerance,
    ) -> Result<Comparison, ComparisonError>;
}

impl<T: Comparator + ?Sized> Comparator for Arc<T> {
    fn compare(
        &self,
        a: &Embedding,
        b: &Embedding,
        tolerance: Tolerance,
    ) -> Result<Comparison, ComparisonError> {
        (**self).compare(a, b, tolerance)
    }
}

/// In-process comparator using Euclidean distance, the metric of 128-d
/// dlib-style face encodings.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanComparator;

impl Comparator for EuclideanComparator {
    fn compare(
        &self,
        a: &Embedding,
        b: &Embedding,
        tolerance: Tolerance,
    ) -> Result<Comparison, ComparisonError> {
        Comparison::from_distance(a.euclidean_distance(b), tolerance)
    }
}
