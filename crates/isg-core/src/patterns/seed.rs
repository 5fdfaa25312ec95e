//! Built-in seed corpus.

use super::models::{PatternError, PatternLibraryFile};

const SEED_YAML: &str = include_str!("seed.yaml");

/// Parse the shipped pattern library.
pub fn seed_library() -> Result<PatternLibraryFile, PatternError> {
    Ok(serde_yaml::from_str(SEED_YAML)?)
}
