use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::GateError;
use super::state::GateState;
use crate::graph::{CandidateId, FutureAction, NodeKey};
use crate::validator::ValidationReport;

/// A candidate diff from an external reasoner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSubmission {
    pub target_keys: Vec<NodeKey>,
    /// Code applied to every target without a per-row edit.
    #[serde(default)]
    pub future_code: String,
    pub future_action: FutureAction,
    #[serde(default)]
    pub patterns_used: Vec<String>,
    /// Per-row code, overriding `future_code`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edits: Vec<RowEdit>,
    /// Proposals generated together share a group; used for agreement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Keys the reasoner was given; coverage falls back to a fresh retrieval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_keys: Option<Vec<NodeKey>>,
    /// The failed candidate this one replaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refines: Option<CandidateId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowEdit {
    pub key: NodeKey,
    pub code: String,
}

impl CandidateSubmission {
    pub fn new(target_keys: Vec<NodeKey>, future_action: FutureAction, future_code: impl Into<String>) -> Self {
        Self {
            target_keys,
            future_code: future_code.into(),
            future_action,
            patterns_used: Vec::new(),
            edits: Vec::new(),
            group: None,
            context_keys: None,
            refines: None,
            summary: None,
        }
    }

    /// Edit a single row.
    pub fn edit(key: impl Into<NodeKey>, code: impl Into<String>) -> Self {
        Self::new(vec![key.into()], FutureAction::Edit, code)
    }

    pub fn with_patterns(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.patterns_used = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_row_edit(mut self, key: impl Into<NodeKey>, code: impl Into<String>) -> Self {
        self.edits.push(RowEdit {
            key: key.into(),
            code: code.into(),
        });
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_context(mut self, keys: Vec<NodeKey>) -> Self {
        self.context_keys = Some(keys);
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Shape checks that need no store access.
    pub fn check(&self) -> Result<(), GateError> {
        if self.target_keys.is_empty() {
            return Err(GateError::InvalidSubmission("no target keys".to_string()));
        }
        if self.future_action == FutureAction::None {
            return Err(GateError::InvalidSubmission("future_action must not be none".to_string()));
        }
        let mut seen = BTreeSet::new();
        if let Some(dup) = self.target_keys.iter().find(|k| !seen.insert(*k)) {
            return Err(GateError::InvalidSubmission(format!("{dup} is targeted twice")));
        }
        if let Some(stray) = self.edits.iter().find(|e| !seen.contains(&e.key)) {
            return Err(GateError::InvalidSubmission(format!(
                "edit for {} which is not a target",
                stray.key
            )));
        }
        Ok(())
    }

    /// The code staged for `key`.
    pub fn code_for(&self, key: &NodeKey) -> &str {
        if self.future_action == FutureAction::Delete {
            return "";
        }
        self.edits
            .iter()
            .rev()
            .find(|e| &e.key == key)
            .map_or(self.future_code.as_str(), |e| e.code.as_str())
    }

    pub(crate) fn entries(&self) -> Vec<(NodeKey, FutureAction, String)> {
        self.target_keys
            .iter()
            .map(|key| (key.clone(), self.future_action, self.code_for(key).to_string()))
            .collect()
    }

    /// All staged code, in target order.
    pub fn combined_code(&self) -> String {
        self.target_keys
            .iter()
            .map(|k| self.code_for(k))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Identity of the edit itself, independent of metadata.
    pub fn fingerprint(&self) -> String {
        let mut keys: Vec<&NodeKey> = self.target_keys.iter().collect();
        keys.sort();
        let mut hasher = Sha256::new();
        hasher.update(self.future_action.as_str().as_bytes());
        for key in keys {
            hasher.update([0u8]);
            hasher.update(key.as_str().as_bytes());
            hasher.update([0u8]);
            hasher.update(self.code_for(key).trim().as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Summary recorded on the committed version.
    pub fn describe(&self, id: CandidateId) -> String {
        if let Some(summary) = &self.summary {
            return summary.clone();
        }
        let keys: Vec<&str> = self.target_keys.iter().map(NodeKey::as_str).collect();
        format!("{} {} ({id})", self.future_action.as_str(), keys.join(", "))
    }
}

/// External approval signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    #[serde(alias = "Approve")]
    Approve,
    #[serde(alias = "Reject")]
    Reject,
}

/// One state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub state: GateState,
    pub at: DateTime<Utc>,
}

/// Everything the gate knows about one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub id: CandidateId,
    pub state: GateState,
    pub submission: CandidateSubmission,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<ValidationReport>,
    /// Version created by the commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_version: Option<u64>,
    pub history: Vec<StateChange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CandidateRecord {
    pub(crate) fn new(id: CandidateId, submission: CandidateSubmission) -> Self {
        let now = Utc::now();
        Self {
            id,
            state: GateState::Proposed,
            submission,
            report: None,
            committed_version: None,
            history: vec![StateChange {
                state: GateState::Proposed,
                at: now,
            }],
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn set_state(&mut self, state: GateState) {
        let now = Utc::now();
        self.state = state;
        self.history.push(StateChange { state, at: now });
        self.updated_at = now;
    }

    pub fn confidence(&self) -> Option<f32> {
        self.report.as_ref().and_then(|r| r.confidence)
    }
}
