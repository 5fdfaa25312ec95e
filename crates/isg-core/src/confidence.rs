//! Confidence scoring for candidate diffs.
//!
//! The score is advisory input to the safety gate, never a gate by itself.

use serde::{Deserialize, Serialize};

pub const COVERAGE_WEIGHT: f32 = 0.35;
pub const AGREEMENT_WEIGHT: f32 = 0.25;
pub const CONSISTENCY_WEIGHT: f32 = 0.25;
pub const STATIC_PRECHECK_WEIGHT: f32 = 0.15;

/// Weighted sum of the four signals, every input and the result clamped to `[0, 1]`.
pub fn score(coverage: f32, agreement: f32, consistency: f32, static_precheck: f32) -> f32 {
    // Summed in f64 so that all-ones lands exactly on 1.0.
    let total = f64::from(COVERAGE_WEIGHT) * f64::from(unit(coverage))
        + f64::from(AGREEMENT_WEIGHT) * f64::from(unit(agreement))
        + f64::from(CONSISTENCY_WEIGHT) * f64::from(unit(consistency))
        + f64::from(STATIC_PRECHECK_WEIGHT) * f64::from(unit(static_precheck));
    unit(total as f32)
}

/// NaN counts as zero.
fn unit(x: f32) -> f32 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}

/// The signals behind a score, kept on the report for inspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInputs {
    /// Fraction of blast-radius nodes present in the retrieved context.
    pub coverage: f32,
    /// Fraction of sibling proposals converging on the same edit.
    pub agreement: f32,
    /// `1 − min(diagnostics / norm, 1)` after the diagnostics phase.
    pub consistency: f32,
    /// 1 when the diagnostics and build phases both passed.
    pub static_precheck: f32,
}

impl ConfidenceInputs {
    pub fn score(&self) -> f32 {
        score(self.coverage, self.agreement, self.consistency, self.static_precheck)
    }
}

/// `1 − min(count / norm, 1)`.
pub fn consistency(diagnostics: usize, norm: usize) -> f32 {
    if norm == 0 {
        return if diagnostics == 0 { 1.0 } else { 0.0 };
    }
    1.0 - (diagnostics as f32 / norm as f32).min(1.0)
}

/// Fraction of `required` found in `present`; 1 when nothing is required.
pub fn coverage<T: PartialEq>(required: &[T], present: &[T]) -> f32 {
    if required.is_empty() {
        return 1.0;
    }
    let hit = required.iter().filter(|r| present.contains(r)).count();
    hit as f32 / required.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_extremes() {
        assert_eq!(score(1.0, 1.0, 1.0, 1.0), 1.0);
        assert_eq!(score(0.0, 0.0, 0.0, 0.0), 0.0);
        assert!((score(1.0, 0.0, 0.0, 0.0) - 0.35).abs() < 1e-6);
        assert!((score(0.0, 0.0, 0.0, 1.0) - 0.15).abs() < 1e-6);
    }

    #[test]
    fn test_score_clamps_inputs() {
        assert_eq!(score(5.0, 2.0, 9.0, 3.0), 1.0);
        assert_eq!(score(-1.0, -1.0, -1.0, -1.0), 0.0);
        assert_eq!(score(f32::NAN, 0.0, 0.0, 0.0), 0.0);
    }

    #[test]
    fn test_consistency_and_coverage() {
        assert_eq!(consistency(0, 10), 1.0);
        assert!((consistency(3, 10) - 0.7).abs() < 1e-6);
        assert_eq!(consistency(25, 10), 0.0);
        assert_eq!(coverage::<u8>(&[], &[1]), 1.0);
        assert_eq!(coverage(&[1, 2, 3, 4], &[2, 4, 9]), 0.5);
    }
}
