//! Helper manifest.
//!
//! Names the external programs that generate and compare embeddings. A
//! default manifest is embedded at compile time from
//! `contrib/helpers/default.toml`; deployments point `RECALL_HELPERS` at
//! their own file to override it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_MANIFEST: &str = include_str!("../../../contrib/helpers/default.toml");

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read helper manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid helper manifest {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("helper manifest {origin}: {table}.program is empty")]
    EmptyProgram { origin: String, table: &'static str },
}

/// One external program plus the leading arguments passed before the
/// per-call file arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Top-level manifest structure.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HelperManifest {
    pub generator: HelperCommand,
    /// Only needed when the comparator runs out of process.
    #[serde(default)]
    pub comparator: Option<HelperCommand>,
}

impl HelperManifest {
    /// The manifest compiled into the binary.
    pub fn embedded() -> Result<Self, ManifestError> {
        Self::parse(DEFAULT_MANIFEST, "<embedded>")
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let src = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&src, &path.display().to_string())
    }

    /// `path` if given, otherwise the embedded default.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ManifestError> {
        match path {
            Some(p) => Self::load(p),
            None => Self::embedded(),
        }
    }

    fn parse(src: &str, origin: &str) -> Result<Self, ManifestError> {
        let manifest: Self = toml::from_str(src).map_err(|source| ManifestError::Parse {
            origin: origin.to_string(),
            source,
        })?;
        if manifest.generator.program.trim().is_empty() {
            return Err(ManifestError::EmptyProgram {
                origin: origin.to_string(),
                table: "generator",
            });
        }
        if let Some(c) = &manifest.comparator {
            if c.program.trim().is_empty() {
                return Err(ManifestError::EmptyProgram {
                    origin: origin.to_string(),
                    table: "comparator",
                });
            }
        }
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_manifest_parses() {
        let m = HelperManifest::embedded().unwrap();
        assert!(!m.generator.program.is_empty());
        assert!(m.comparator.is_some());
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("helpers.toml");
        std::fs::write(
            &path,
            "[generator]\nprogram = \"/opt/embed\"\nargs = [\"--cpu\"]\n",
        )
        .unwrap();
        let m = HelperManifest::resolve(Some(&path)).unwrap();
        assert_eq!(m.generator.program, "/opt/embed");
        assert_eq!(m.generator.args, ["--cpu"]);
        assert!(m.comparator.is_none());
    }

    #[test]
    fn test_rejects_empty_program() {
        let err = HelperManifest::parse("[generator]\nprogram = \" \"\n", "test").unwrap_err();
        assert!(matches!(err, ManifestError::EmptyProgram { table: "generator", .. }));
    }

    #[test]
    fn test_missing_file() {
        let err = HelperManifest::load(Path::new("/nonexistent/recall/helpers.toml")).unwrap_err();
        assert!(matches!(err, ManifestError::Read { .. }));
    }
}
