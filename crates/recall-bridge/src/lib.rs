//! recall-bridge - out-of-process embedding generation and comparison.
//!
//! Face analysis runs in helper programs named by a TOML manifest. Each call
//! hands its inputs over through a private scratch directory and reads a JSON
//! reply from the helper's stdout, under a deadline.

pub mod comparator;
pub mod generator;
pub mod manifest;
pub mod process;
pub mod scratch;

pub use comparator::ProcessComparator;
pub use generator::ProcessGenerator;
pub use manifest::{HelperCommand, HelperManifest, ManifestError};
pub use process::BridgeError;
pub use scratch::{CallScope, ScratchRoot};
