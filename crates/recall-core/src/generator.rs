//! Embedding generation contract.

use crate::types::Embedding;
use base64::{engine::general_purpose, Engine as _};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

const DATA_URL_PREFIX: &str = "data:image/";

#[derive(Error, Debug)]
pub enum ImageInputError {
    #[error("image is required")]
    Empty,
    #[error("malformed data URL: {0}")]
    MalformedDataUrl(String),
    #[error("failed to read image {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// An image submitted for enrollment or lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageInput {
    /// Encoded image bytes (JPEG, PNG, ...).
    Bytes(Vec<u8>),
    /// Path to an encoded image on disk.
    Path(PathBuf),
}

impl ImageInput {
    /// Interpret a caller string as either a `data:image/...;base64,` URL or a path.
    pub fn parse(raw: &str) -> Result<Self, ImageInputError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ImageInputError::Empty);
        }
        if !raw.starts_with(DATA_URL_PREFIX) {
            return Ok(Self::Path(PathBuf::from(raw)));
        }

        let (header, payload) = raw
            .split_once(',')
            .ok_or_else(|| ImageInputError::MalformedDataUrl("missing ',' separator".into()))?;
        if !header.ends_with(";base64") {
            return Err(ImageInputError::MalformedDataUrl(
                "only base64 data URLs are supported".into(),
            ));
        }
        let bytes = general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|e| ImageInputError::MalformedDataUrl(e.to_string()))?;
        if bytes.is_empty() {
            return Err(ImageInputError::Empty);
        }
        Ok(Self::Bytes(bytes))
    }

    /// Read the encoded image into memory.
    pub fn load(&self) -> Result<Vec<u8>, ImageInputError> {
        match self {
            Self::Bytes(bytes) => Ok(bytes.clone()),
            Self::Path(path) => std::fs::read(path).map_err(|source| ImageInputError::Read {
                path: path.clone(),
                source,
            }),
        }
    }

    /// Stable reference to the source image, stored with the identity.
    pub fn reference(&self) -> String {
        match self {
            Self::Bytes(bytes) => sha256_reference(bytes),
            Self::Path(path) => path.display().to_string(),
        }
    }
}

/// `sha256:<hex>` digest of `bytes`.
pub fn sha256_reference(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// What a generator produced for one image.
#[derive(Debug, Clone, PartialEq)]
pub enum Generated {
    Face(Embedding),
    /// No usable face. Also covers generator infrastructure failures, which
    /// are logged by the implementation and then reported as this sentinel.
    NoFace,
}

impl Generated {
    pub fn into_embedding(self) -> Option<Embedding> {
        match self {
            Generated::Face(e) => Some(e),
            Generated::NoFace => None,
        }
    }
}

/// Turns one image into one embedding.
///
/// Called exactly once per submitted image; results are never cached.
pub trait EmbeddingGenerator: Send + Sync {
    fn generate(&self, image: &ImageInput) -> Generated;
}

impl<T: EmbeddingGenerator + ?Sized> EmbeddingGenerator for Arc<T> {
    fn generate(&self, image: &ImageInput) -> Generated {
        (**self).generate(image)
    }
}
