//! Best-match search of a probe embedding over one account's identities.

use crate::comparator::{Comparator, Comparison, ComparisonError, Tolerance};
use crate::identity::IdentityRecord;
use crate::types::Embedding;
use serde::Serialize;

/// Default acceptance floor on the similarity score.
pub const DEFAULT_ACCEPTANCE_FLOOR: f64 = 0.5;

/// The single threshold that decides a match.
///
/// A candidate is accepted only when its similarity strictly exceeds
/// `floor`. The comparator is called with tolerance `1 - floor`, so its
/// `matched` flag agrees with the acceptance decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchPolicy {
    floor: f64,
}

impl MatchPolicy {
    pub fn new(floor: f64) -> Result<Self, ComparisonError> {
        // tolerance = 1 - floor must land in (0, 1]
        Tolerance::new(1.0 - floor)?;
        Ok(Self { floor })
    }

    pub fn floor(&self) -> f64 {
        self.floor
    }

    pub fn tolerance(&self) -> Tolerance {
        Tolerance::new(1.0 - self.floor).unwrap_or_default()
    }
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            floor: DEFAULT_ACCEPTANCE_FLOOR,
        }
    }
}

/// Result of one best-match search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchOutcome {
    /// Index of the winning candidate, if any scored above the floor.
    pub candidate: Option<usize>,
    /// Similarity of the winner, or of the closest rejected candidate.
    pub similarity: f64,
    /// Distance of the winner, or of the closest rejected candidate.
    pub distance: Option<f64>,
    pub matched: bool,
    /// Candidates that produced a comparison.
    pub compared: usize,
    /// Candidates skipped because the comparator failed.
    pub skipped: usize,
}

/// Runs the one-to-many search for a [`MatchPolicy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Resolver {
    policy: MatchPolicy,
}

impl Resolver {
    pub fn new(policy: MatchPolicy) -> Self {
        Self { policy }
    }

    /// Compare `probe` against every candidate of `account_id` and keep the
    /// global best.
    ///
    /// Always visits every candidate. Ties keep the earliest candidate
    /// because only a strictly greater score replaces the running best.
    /// A comparator failure skips that candidate and the search continues.
    /// Inactive records and records owned by another account are never
    /// compared and never win.
    pub fn resolve(
        &self,
        account_id: &str,
        probe: &Embedding,
        candidates: &[IdentityRecord],
        comparator: &dyn Comparator,
    ) -> MatchOutcome {
        let tolerance = self.policy.tolerance();
        let mut best_score = self.policy.floor;
        let mut best: Option<(usize, Comparison)> = None;
        let mut closest: Option<Comparison> = None;
        let mut compared = 0;
        let mut skipped = 0;

        for (i, candidate) in candidates.iter().enumerate() {
            if !candidate.active || candidate.account_id != account_id {
                tracing::warn!(
                    candidate = %candidate.id,
                    account = account_id,
                    "ineligible candidate ignored"
                );
                continue;
            }
            let comparison = match comparator.compare(probe, &candidate.embedding, tolerance) {
                Ok(c) => c,
                Err(err) => {
                    tracing::warn!(
                        candidate = %candidate.id,
                        error = %err,
                        "comparison failed; skipping candidate"
                    );
                    skipped += 1;
                    continue;
                }
            };
            compared += 1;

            tracing::debug!(
                candidate = %candidate.id,
                name = %candidate.name,
                similarity = comparison.similarity,
                distance = comparison.distance,
                "compared candidate"
            );

            if closest.map_or(true, |c| comparison.similarity > c.similarity) {
                closest = Some(comparison);
            }
            if comparison.similarity > best_score {
                best_score = comparison.similarity;
                best = Some((i, comparison));
            }
        }

        match best {
            Some((idx, c)) => MatchOutcome {
                candidate: Some(idx),
                similarity: c.similarity,
                distance: Some(c.distance),
                matched: true,
                compared,
                skipped,
            },
            None => MatchOutcome {
                candidate: None,
                similarity: closest.map_or(0.0, |c| c.similarity),
                distance: closest.map(|c| c.distance),
                matched: false,
                compared,
                skipped,
            },
        }
    }
}
