//! Embedding comparator backed by an external helper process.

use crate::manifest::HelperCommand;
use crate::process::{run_helper, BridgeError};
use crate::scratch::ScratchRoot;
use recall_core::{Comparator, Comparison, ComparisonError, Embedding, Tolerance};
use serde::Deserialize;
use std::ffi::OsStr;
use std::time::Duration;

/// What the comparator helper prints on stdout.
#[derive(Debug, Deserialize)]
struct ComparatorReply {
    distance: Option<f64>,
    #[serde(default)]
    is_match: Option<bool>,
}

/// Runs the comparator helper once per pair of embeddings.
///
/// Only the helper's distance is used; similarity and the match flag are
/// derived locally so they follow the same rule as the built-in comparator.
#[derive(Debug, Clone)]
pub struct ProcessComparator {
    command: HelperCommand,
    scratch: ScratchRoot,
    timeout: Duration,
}

impl ProcessComparator {
    pub fn new(command: HelperCommand, scratch: ScratchRoot, timeout: Duration) -> Self {
        Self {
            command,
            scratch,
            timeout,
        }
    }

    fn run(
        &self,
        a: &Embedding,
        b: &Embedding,
        tolerance: Tolerance,
    ) -> Result<ComparatorReply, BridgeError> {
        let scope = self.scratch.scope("compare")?;
        let a_path = scope.write("a.json", &encode(a)?)?;
        let b_path = scope.write("b.json", &encode(b)?)?;
        let tolerance_arg = tolerance.value().to_string();
        let stdout = run_helper(
            &self.command,
            &[a_path.as_os_str(), b_path.as_os_str(), OsStr::new(&tolerance_arg)],
            &scope,
            self.timeout,
        )?;
        serde_json::from_slice(&stdout)
            .map_err(|e| BridgeError::Output(format!("comparator reply is not valid JSON: {e}")))
    }
}

fn encode(embedding: &Embedding) -> Result<Vec<u8>, BridgeError> {
    serde_json::to_vec(embedding).map_err(|e| BridgeError::Output(e.to_string()))
}

impl Comparator for ProcessComparator {
    fn compare(
        &self,
        a: &Embedding,
        b: &Embedding,
        tolerance: Tolerance,
    ) -> Result<Comparison, ComparisonError> {
        let reply = self.run(a, b, tolerance).map_err(|err| {
            tracing::warn!(program = %self.command.program, error = %err, "comparator call failed");
            match err {
                BridgeError::TimedOut { .. } => ComparisonError::TimedOut,
                BridgeError::Output(msg) => ComparisonError::Malformed(msg),
                BridgeError::OutputTooLarge => ComparisonError::Malformed(err.to_string()),
                other => ComparisonError::Unavailable(other.to_string()),
            }
        })?;

        let distance = reply
            .distance
            .ok_or_else(|| ComparisonError::Malformed("reply has no distance".into()))?;
        let comparison = Comparison::from_distance(distance, tolerance)?;
        if let Some(helper_match) = reply.is_match {
            if helper_match != comparison.matched {
                tracing::debug!(
                    distance,
                    helper_match,
                    "helper match flag disagrees with tolerance; using local decision"
                );
            }
        }
        Ok(comparison)
    }
}
