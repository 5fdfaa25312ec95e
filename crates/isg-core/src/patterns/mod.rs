//! Pattern knowledge base: curated fix templates, anti-patterns and
//! error-code mappings, with effectiveness counters updated by the gate.

mod library;
pub mod models;
mod seed;

pub use library::PatternLibrary;
pub use models::{
    AntiPattern, AntiPatternMatch, ErrorMapping, FixTemplate, OutcomeEvent, PatternCategory,
    PatternEntry, PatternError, PatternLibraryFile, PatternStats, Severity,
};
pub use seed::seed_library;
