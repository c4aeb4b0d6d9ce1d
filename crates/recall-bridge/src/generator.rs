//! Embedding generator backed by an external helper process.

use crate::manifest::HelperCommand;
use crate::process::{run_helper, BridgeError};
use crate::scratch::ScratchRoot;
use recall_core::{Embedding, EmbeddingGenerator, Generated, ImageInput};
use serde::Deserialize;
use std::time::Duration;

/// What the generator helper prints on stdout.
#[derive(Debug, Deserialize)]
struct GeneratorReply {
    face_embedding: Option<Vec<f64>>,
}

/// Runs the generator helper once per image.
///
/// Every failure (unreadable or non-image input, spawn error, timeout,
/// non-zero exit, malformed or invalid output) is logged and reported as
/// [`Generated::NoFace`].
#[derive(Debug, Clone)]
pub struct ProcessGenerator {
    command: HelperCommand,
    scratch: ScratchRoot,
    timeout: Duration,
}

impl ProcessGenerator {
    pub fn new(command: HelperCommand, scratch: ScratchRoot, timeout: Duration) -> Self {
        Self {
            command,
            scratch,
            timeout,
        }
    }

    /// Generation with the failure cause preserved, for diagnostics.
    pub fn try_generate(&self, image: &ImageInput) -> Result<Generated, BridgeError> {
        let bytes = image
            .load()
            .map_err(|e| BridgeError::Input(e.to_string()))?;
        let format = image::guess_format(&bytes)
            .map_err(|_| BridgeError::Input("data is not a recognized image format".into()))?;
        let ext = format.extensions_str().first().copied().unwrap_or("img");

        let scope = self.scratch.scope("embed")?;
        let image_path = scope.write(&format!("face.{ext}"), &bytes)?;
        let stdout = run_helper(&self.command, &[&image_path], &scope, self.timeout)?;
        parse_reply(&stdout)
    }
}

impl EmbeddingGenerator for ProcessGenerator {
    fn generate(&self, image: &ImageInput) -> Generated {
        match self.try_generate(image) {
            Ok(generated) => generated,
            Err(err) => {
                tracing::warn!(
                    program = %self.command.program,
                    error = %err,
                    "embedding generation failed; reporting no face"
                );
                Generated::NoFace
            }
        }
    }
}

fn parse_reply(stdout: &[u8]) -> Result<Generated, BridgeError> {
    let reply: GeneratorReply = serde_json::from_slice(stdout)
        .map_err(|e| BridgeError::Output(format!("generator reply is not valid JSON: {e}")))?;
    let Some(values) = reply.face_embedding else {
        return Ok(Generated::NoFace);
    };
    let embedding =
        Embedding::from_values(values).map_err(|e| BridgeError::Output(e.to_string()))?;
    Ok(Generated::Face(embedding))
}
