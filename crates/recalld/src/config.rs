use recall_core::resolver::DEFAULT_ACCEPTANCE_FLOOR;
use std::path::PathBuf;
use std::time::Duration;

/// Where embedding comparisons run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparatorKind {
    /// In-process Euclidean distance.
    Builtin,
    /// The `[comparator]` program from the helper manifest.
    Helper,
}

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Helper manifest overriding the embedded default.
    pub helpers_path: Option<PathBuf>,
    /// Root for per-call scratch directories.
    pub scratch_dir: PathBuf,
    /// Similarity a candidate must strictly exceed to be accepted.
    pub acceptance_floor: f64,
    /// Deadline for a single generator or comparator call.
    pub call_timeout_secs: u64,
    /// Number of engine worker threads.
    pub workers: usize,
    pub comparator: ComparatorKind,
    /// Passphrase for sealing embeddings at rest. Never logged.
    pub store_key: Option<String>,
}

impl Config {
    /// Load configuration from `RECALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("recall");

        let db_path = var("RECALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("identities.db"));

        let scratch_dir = var("RECALL_SCRATCH_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                var("XDG_RUNTIME_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(std::env::temp_dir)
                    .join("recall")
            });

        let comparator = match var("RECALL_COMPARATOR").as_deref() {
            None | Some("builtin") => ComparatorKind::Builtin,
            Some("helper") => ComparatorKind::Helper,
            Some(other) => {
                tracing::warn!(value = other, "unknown RECALL_COMPARATOR; using builtin");
                ComparatorKind::Builtin
            }
        };

        Self {
            db_path,
            helpers_path: var("RECALL_HELPERS").map(PathBuf::from),
            scratch_dir,
            acceptance_floor: parsed(&var, "RECALL_ACCEPTANCE_FLOOR", DEFAULT_ACCEPTANCE_FLOOR),
            call_timeout_secs: parsed(&var, "RECALL_CALL_TIMEOUT_SECS", 15u64).max(1),
            workers: parsed(&var, "RECALL_WORKERS", 2usize).max(1),
            comparator,
            store_key: var("RECALL_STORE_KEY").filter(|k| !k.is_empty()),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    var(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let c = config(&[("HOME", "/home/ada")]);
        assert_eq!(c.db_path, PathBuf::from("/home/ada/.local/share/recall/identities.db"));
        assert_eq!(c.acceptance_floor, 0.5);
        assert_eq!(c.call_timeout(), Duration::from_secs(15));
        assert_eq!(c.workers, 2);
        assert_eq!(c.comparator, ComparatorKind::Builtin);
        assert!(c.helpers_path.is_none());
        assert!(c.store_key.is_none());
    }

    #[test]
    fn test_overrides() {
        let c = config(&[
            ("XDG_DATA_HOME", "/data"),
            ("XDG_RUNTIME_DIR", "/run/user/1000"),
            ("RECALL_ACCEPTANCE_FLOOR", "0.55"),
            ("RECALL_CALL_TIMEOUT_SECS", "30"),
            ("RECALL_WORKERS", "4"),
            ("RECALL_COMPARATOR", "helper"),
            ("RECALL_HELPERS", "/etc/recall/helpers.toml"),
            ("RECALL_STORE_KEY", "hunter2"),
        ]);
        assert_eq!(c.db_path, PathBuf::from("/data/recall/identities.db"));
        assert_eq!(c.scratch_dir, PathBuf::from("/run/user/1000/recall"));
        assert_eq!(c.acceptance_floor, 0.55);
        assert_eq!(c.call_timeout_secs, 30);
        assert_eq!(c.workers, 4);
        assert_eq!(c.comparator, ComparatorKind::Helper);
        assert_eq!(c.helpers_path, Some(PathBuf::from("/etc/recall/helpers.toml")));
        assert_eq!(c.store_key.as_deref(), Some("hunter2"));
    }

    #[test]
    fn test_garbage_falls_back() {
        let c = config(&[
            ("RECALL_WORKERS", "0"),
            ("RECALL_CALL_TIMEOUT_SECS", "0"),
            ("RECALL_ACCEPTANCE_FLOOR", "high"),
            ("RECALL_COMPARATOR", "gpu"),
            ("RECALL_STORE_KEY", ""),
        ]);
        assert_eq!(c.workers, 1);
        assert_eq!(c.call_timeout(), Duration::from_secs(1));
        assert_eq!(c.acceptance_floor, 0.5);
        assert_eq!(c.comparator, ComparatorKind::Builtin);
        assert!(c.store_key.is_none());
    }
}
