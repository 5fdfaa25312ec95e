//! Vector-indexed pattern catalogue with effectiveness tracking.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::models::{
    AntiPattern, AntiPatternMatch, ErrorMapping, OutcomeEvent, PatternCategory, PatternEntry,
    PatternError, PatternLibraryFile, PatternStats, Severity,
};
use super::seed;
use crate::config::{ConfigError, PatternConfig};
use crate::embedder::Embedder;
use crate::graph::vector::{cosine_distance, MAX_DISTANCE};
use crate::graph::CandidateId;

/// Mutable side of the library: counters plus the event log they fold.
#[derive(Debug, Default)]
struct Effectiveness {
    stats: HashMap<String, PatternStats>,
    events: Vec<OutcomeEvent>,
}

/// The pattern knowledge base.
///
/// Entries, anti-patterns and error mappings are immutable after load.
/// Only effectiveness counters change, under one mutex, so concurrent
/// `record_outcome` calls never lose an update.
#[derive(Debug)]
pub struct PatternLibrary {
    entries: Vec<PatternEntry>,
    index: HashMap<String, usize>,
    anti_patterns: Vec<AntiPattern>,
    error_map: HashMap<String, ErrorMapping>,
    high_threshold: f32,
    medium_threshold: f32,
    alpha: f32,
    effectiveness: Mutex<Effectiveness>,
}

impl PatternLibrary {
    /// Load the library named by the configuration, or the built-in seed.
    pub async fn from_config(config: &PatternConfig, embedder: &dyn Embedder) -> Result<Self, PatternError> {
        let file = match &config.library_path {
            Some(path) => Self::read_file(path)?,
            None => seed::seed_library()?,
        };
        Self::load(file, embedder, config).await
    }

    pub fn read_file(path: &Path) -> Result<PatternLibraryFile, PatternError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Validate a library and embed whatever lacks a vector.
    pub async fn load(
        mut file: PatternLibraryFile,
        embedder: &dyn Embedder,
        config: &PatternConfig,
    ) -> Result<Self, PatternError> {
        let mut seen = HashSet::new();
        for entry in &file.patterns {
            if !seen.insert(entry.id.clone()) {
                return Err(ConfigError::Invalid(format!("duplicate pattern id {}", entry.id)).into());
            }
            entry.template.validate(&entry.id)?;
        }
        for mapping in &file.error_mappings {
            if let Some(missing) = mapping.patterns.iter().find(|p| !seen.contains(*p)) {
                return Err(ConfigError::Invalid(format!(
                    "error mapping {} names unknown pattern {missing}",
                    mapping.code
                ))
                .into());
            }
        }

        let missing: Vec<usize> = (0..file.patterns.len())
            .filter(|i| file.patterns[*i].embedding.is_none())
            .collect();
        if !missing.is_empty() {
            let texts: Vec<String> = missing
                .iter()
                .map(|i| {
                    let p = &file.patterns[*i];
                    format!("{}: {}", p.category, p.description)
                })
                .collect();
            let vectors = embedder.embed(&texts).await?;
            for (i, vector) in missing.into_iter().zip(vectors) {
                file.patterns[i].embedding = Some(vector);
            }
        }

        for anti in &mut file.anti_patterns {
            if anti.centroid.is_some() {
                continue;
            }
            let mut samples = anti.examples.clone();
            if samples.is_empty() {
                samples.push(anti.description.clone());
            }
            let vectors = embedder.embed(&samples).await?;
            anti.centroid = centroid(&vectors);
        }

        let mut stats = HashMap::new();
        for entry in &mut file.patterns {
            entry.stats.pattern_id = entry.id.clone();
            stats.insert(entry.id.clone(), entry.stats.clone());
        }

        let index = file
            .patterns
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id.clone(), i))
            .collect();
        let error_map = file
            .error_mappings
            .into_iter()
            .map(|m| (m.code.clone(), m))
            .collect();

        info!(
            patterns = file.patterns.len(),
            anti_patterns = file.anti_patterns.len(),
            "Loaded pattern library"
        );

        Ok(Self {
            entries: file.patterns,
            index,
            anti_patterns: file.anti_patterns,
            error_map,
            high_threshold: config.high_severity_threshold,
            medium_threshold: config.medium_severity_threshold,
            alpha: config.confidence_alpha,
            effectiveness: Mutex::new(Effectiveness {
                stats,
                events: Vec::new(),
            }),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Entry with its current counters.
    pub fn get(&self, id: &str) -> Option<PatternEntry> {
        let entry = self.entries.get(*self.index.get(id)?)?;
        Some(self.with_stats(entry))
    }

    fn with_stats(&self, entry: &PatternEntry) -> PatternEntry {
        let mut entry = entry.clone();
        if let Some(stats) = self.effectiveness.lock().stats.get(&entry.id) {
            entry.stats = stats.clone();
        }
        entry
    }

    /// The `k` patterns closest to `query`, ordered by (distance, id).
    pub fn nearest_patterns(&self, query: &[f32], k: usize) -> Vec<(PatternEntry, f32)> {
        let mut hits: Vec<(&PatternEntry, f32)> = self
            .entries
            .iter()
            .filter_map(|p| p.embedding.as_ref().map(|e| (p, cosine_distance(query, e))))
            .collect();
        hits.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        hits.truncate(k);
        hits.into_iter().map(|(p, d)| (self.with_stats(p), d)).collect()
    }

    /// Distance to the nearest anti-pattern centroid (2.0 when none exist).
    pub fn anti_pattern_score(&self, code_vec: &[f32]) -> f32 {
        self.nearest_anti_pattern(code_vec)
            .map_or(MAX_DISTANCE, |m| m.distance)
    }

    pub fn nearest_anti_pattern(&self, code_vec: &[f32]) -> Option<AntiPatternMatch> {
        self.anti_patterns
            .iter()
            .filter_map(|a| a.centroid.as_ref().map(|c| (a, cosine_distance(code_vec, c))))
            .min_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.0.id.cmp(&b.0.id))
            })
            .map(|(a, distance)| AntiPatternMatch {
                id: a.id.clone(),
                category: a.category,
                distance,
                severity: self.classify_severity(distance),
            })
    }

    /// High below the high threshold, Medium below the medium one, else Low.
    pub fn classify_severity(&self, distance: f32) -> Severity {
        if distance < self.high_threshold {
            Severity::High
        } else if distance < self.medium_threshold {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    /// Patterns mapped to a compiler error code such as `E0277`.
    pub fn patterns_for_error(&self, code: &str) -> Vec<PatternEntry> {
        self.error_map
            .get(code)
            .map(|m| m.patterns.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn category_for_error(&self, code: &str) -> Option<PatternCategory> {
        self.error_map.get(code).map(|m| m.category)
    }

    /// Record one gate decision for a pattern.
    pub fn record_outcome(&self, pattern_id: &str, accepted: bool, confidence: f32) -> Result<OutcomeEvent, PatternError> {
        self.record_outcome_for(pattern_id, accepted, confidence, None)
    }

    pub(crate) fn record_outcome_for(
        &self,
        pattern_id: &str,
        accepted: bool,
        confidence: f32,
        candidate: Option<CandidateId>,
    ) -> Result<OutcomeEvent, PatternError> {
        if !self.contains(pattern_id) {
            return Err(PatternError::UnknownPattern(pattern_id.to_string()));
        }

        let mut eff = self.effectiveness.lock();
        let seq = eff.events.last().map_or(0, |e| e.seq + 1);
        let event = OutcomeEvent {
            seq,
            pattern_id: pattern_id.to_string(),
            accepted,
            confidence: confidence.clamp(0.0, 1.0),
            candidate,
            recorded_at: Utc::now(),
        };
        eff.events.push(event.clone());
        let alpha = self.alpha;
        eff.stats
            .entry(pattern_id.to_string())
            .or_insert_with(|| PatternStats {
                pattern_id: pattern_id.to_string(),
                ..Default::default()
            })
            .apply(accepted, confidence, alpha);

        debug!(pattern = pattern_id, accepted, seq, "Recorded pattern outcome");
        Ok(event)
    }

    pub fn stats(&self, pattern_id: &str) -> Option<PatternStats> {
        self.effectiveness.lock().stats.get(pattern_id).cloned()
    }

    /// Counters of every pattern, ordered by id.
    pub fn all_stats(&self) -> Vec<PatternStats> {
        let mut stats: Vec<PatternStats> = self.effectiveness.lock().stats.values().cloned().collect();
        stats.sort_by(|a, b| a.pattern_id.cmp(&b.pattern_id));
        stats
    }

    /// Every recorded event for a pattern, oldest first.
    pub fn outcome_history(&self, pattern_id: &str) -> Vec<OutcomeEvent> {
        self.effectiveness
            .lock()
            .events
            .iter()
            .filter(|e| e.pattern_id == pattern_id)
            .cloned()
            .collect()
    }

    /// Replace counters and log with persisted values.
    pub fn restore(&self, stats: Vec<PatternStats>, mut events: Vec<OutcomeEvent>) {
        events.sort_by_key(|e| e.seq);
        let mut eff = self.effectiveness.lock();
        for s in stats {
            if self.contains(&s.pattern_id) {
                eff.stats.insert(s.pattern_id.clone(), s);
            }
        }
        eff.events = events;
    }
}

fn centroid(vectors: &[Vec<f32>]) -> Option<Vec<f32>> {
    let first = vectors.first()?;
    let mut sum = vec![0.0f32; first.len()];
    let dim = sum.len();
    for v in vectors.iter().filter(|v| v.len() == dim) {
        for (s, x) in sum.iter_mut().zip(v) {
            *s += x;
        }
    }
    let n = vectors.len() as f32;
    Some(sum.into_iter().map(|s| s / n).collect())
}
