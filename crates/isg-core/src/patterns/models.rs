//! Pattern catalogue types.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::embedder::EmbedError;
use crate::graph::CandidateId;

/// Errors raised by the pattern knowledge base.
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("Unknown pattern: {0}")]
    UnknownPattern(String),

    /// Rendering a template failed.
    #[error("Template error: {0}")]
    Template(String),

    #[error("Failed to parse pattern library: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to read pattern library: {0}")]
    Io(#[from] std::io::Error),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbedError),

    /// Malformed library content (duplicate ids, bad templates).
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Closed taxonomy of fix categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PatternCategory {
    AsyncSync,
    Ownership,
    ErrorHandling,
    GenericBounds,
    Concurrency,
    Lifetimes,
}

impl fmt::Display for PatternCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

const PLACEHOLDER_PATTERN: &str = r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}";

fn placeholder_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(PLACEHOLDER_PATTERN).ok()).as_ref()
}

/// Parameterised diff skeleton with `{{param}}` placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixTemplate {
    #[serde(default)]
    pub params: Vec<String>,
    pub skeleton: String,
}

impl FixTemplate {
    pub fn placeholders(&self) -> BTreeSet<String> {
        let Some(re) = placeholder_regex() else {
            return BTreeSet::new();
        };
        re.captures_iter(&self.skeleton)
            .map(|c| c[1].to_string())
            .collect()
    }

    /// Placeholders and declared parameters must match exactly.
    pub fn validate(&self, pattern_id: &str) -> Result<(), ConfigError> {
        let declared: BTreeSet<String> = self.params.iter().cloned().collect();
        if declared.len() != self.params.len() {
            return Err(ConfigError::Invalid(format!(
                "pattern {pattern_id}: duplicate template parameter"
            )));
        }
        let used = self.placeholders();
        if declared != used {
            let missing: Vec<_> = used.difference(&declared).cloned().collect();
            let unused: Vec<_> = declared.difference(&used).cloned().collect();
            return Err(ConfigError::Invalid(format!(
                "pattern {pattern_id}: template placeholders {missing:?} undeclared, parameters {unused:?} unused"
            )));
        }
        Ok(())
    }

    pub fn render(&self, params: &HashMap<String, String>) -> Result<String, PatternError> {
        if let Some(missing) = self.params.iter().find(|p| !params.contains_key(*p)) {
            return Err(PatternError::Template(format!("missing parameter {missing}")));
        }
        let Some(re) = placeholder_regex() else {
            return Err(PatternError::Template("placeholder pattern unavailable".to_string()));
        };
        Ok(re
            .replace_all(&self.skeleton, |c: &regex::Captures<'_>| {
                params.get(&c[1]).cloned().unwrap_or_default()
            })
            .into_owned())
    }
}

/// Rolling effectiveness counters of one pattern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternStats {
    #[serde(default)]
    pub pattern_id: String,
    pub times_suggested: u64,
    pub times_accepted: u64,
    pub success_rate: f32,
    pub avg_confidence: f32,
}

impl PatternStats {
    /// Fold one outcome into the aggregates.
    pub(crate) fn apply(&mut self, accepted: bool, confidence: f32, alpha: f32) {
        let first = self.times_suggested == 0;
        self.times_suggested += 1;
        if accepted {
            self.times_accepted += 1;
        }
        self.success_rate = self.times_accepted as f32 / self.times_suggested as f32;
        let confidence = confidence.clamp(0.0, 1.0);
        self.avg_confidence = if first {
            confidence
        } else {
            alpha * confidence + (1.0 - alpha) * self.avg_confidence
        };
    }
}

/// A curated fix pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternEntry {
    pub id: String,
    pub category: PatternCategory,
    pub description: String,
    pub template: FixTemplate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Effectiveness counters; the seed value is the starting point.
    #[serde(default)]
    pub stats: PatternStats,
}

/// Known-bad shape, matched by distance to its centroid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntiPattern {
    pub id: String,
    pub category: PatternCategory,
    pub description: String,
    /// Code samples; their mean embedding is the centroid when none is given.
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub centroid: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntiPatternMatch {
    pub id: String,
    pub category: PatternCategory,
    pub distance: f32,
    pub severity: Severity,
}

/// Compiler error code to fix patterns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMapping {
    pub code: String,
    pub category: PatternCategory,
    #[serde(default)]
    pub patterns: Vec<String>,
}

/// Append-only effectiveness event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeEvent {
    pub seq: u64,
    pub pattern_id: String,
    pub accepted: bool,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<CandidateId>,
    pub recorded_at: DateTime<Utc>,
}

/// On-disk shape of a pattern library.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternLibraryFile {
    #[serde(default)]
    pub patterns: Vec<PatternEntry>,
    #[serde(default)]
    pub anti_patterns: Vec<AntiPattern>,
    #[serde(default)]
    pub error_mappings: Vec<ErrorMapping>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(params: &[&str], skeleton: &str) -> FixTemplate {
        FixTemplate {
            params: params.iter().map(|s| s.to_string()).collect(),
            skeleton: skeleton.to_string(),
        }
    }

    #[test]
    fn test_template_validation() {
        assert!(template(&["ty"], "impl Send for {{ty}} {}").validate("p").is_ok());
        assert!(template(&["ty"], "impl Send for {{other}} {}").validate("p").is_err());
        assert!(template(&["ty", "ty"], "{{ty}}").validate("p").is_err());
        assert!(template(&["ty", "unused"], "{{ty}}").validate("p").is_err());
    }

    #[test]
    fn test_template_render() {
        let t = template(&["name", "ty"], "let {{name}}: {{ ty }} = Default::default();");
        let mut params = HashMap::new();
        params.insert("name".to_string(), "x".to_string());
        params.insert("ty".to_string(), "u32".to_string());
        assert_eq!(t.render(&params).unwrap(), "let x: u32 = Default::default();");

        params.remove("ty");
        assert!(matches!(t.render(&params), Err(PatternError::Template(_))));
    }

    #[test]
    fn test_stats_apply() {
        let mut stats = PatternStats {
            pattern_id: "p1".to_string(),
            times_suggested: 10,
            times_accepted: 9,
            success_rate: 0.9,
            avg_confidence: 0.8,
        };
        stats.apply(true, 1.0, 0.2);
        assert_eq!(stats.times_suggested, 11);
        assert_eq!(stats.times_accepted, 10);
        assert!((stats.success_rate - 10.0 / 11.0).abs() < 1e-6);
        assert!((stats.avg_confidence - 0.84).abs() < 1e-6);

        let mut fresh = PatternStats::default();
        fresh.apply(false, 0.4, 0.2);
        assert_eq!(fresh.success_rate, 0.0);
        assert!((fresh.avg_confidence - 0.4).abs() < 1e-6);
    }
}
