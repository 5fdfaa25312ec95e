use std::fmt;

use serde::{Deserialize, Serialize};

use crate::validator::Phase;

/// Where a candidate is in the safety gate.
///
/// Candidates move forward through validation:
/// Proposed → Validating → DiagnosticsOk → BuildOk → TestsOk → AwaitingApproval
///
/// and end in Committed or RolledBack. Failed is reachable from any
/// validation step and only exits to RolledBack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    /// Submitted, futures not yet written
    #[default]
    Proposed,
    /// Futures staged, validation queued or running
    Validating,
    DiagnosticsOk,
    BuildOk,
    TestsOk,
    /// Validated and scored; nothing written to `current_code` yet
    AwaitingApproval,
    Committed,
    RolledBack,
    Failed,
}

impl GateState {
    /// Whether `self → to` is a legal transition.
    pub fn can_transition_to(&self, to: GateState) -> bool {
        use GateState::*;
        matches!(
            (self, to),
            (Proposed, Validating)
                | (Validating, DiagnosticsOk)
                | (DiagnosticsOk, BuildOk)
                | (BuildOk, TestsOk)
                | (TestsOk, AwaitingApproval)
                | (AwaitingApproval, Committed)
                | (AwaitingApproval, RolledBack)
                | (Validating | DiagnosticsOk | BuildOk | TestsOk, Failed)
                | (Failed, RolledBack)
        )
    }

    /// State reached when a validator phase passes.
    pub fn after(phase: Phase) -> GateState {
        match phase {
            Phase::Diagnostics => GateState::DiagnosticsOk,
            Phase::Build => GateState::BuildOk,
            Phase::Tests => GateState::TestsOk,
        }
    }

    /// Committed and RolledBack admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, GateState::Committed | GateState::RolledBack)
    }

    /// Validation is queued or in flight.
    pub fn is_validating(&self) -> bool {
        matches!(
            self,
            GateState::Validating | GateState::DiagnosticsOk | GateState::BuildOk | GateState::TestsOk
        )
    }

    /// Validation has finished, one way or the other.
    pub fn is_settled(&self) -> bool {
        matches!(self, GateState::AwaitingApproval | GateState::Failed) || self.is_terminal()
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            GateState::Proposed => "Proposed",
            GateState::Validating => "Validating",
            GateState::DiagnosticsOk => "DiagnosticsOk",
            GateState::BuildOk => "BuildOk",
            GateState::TestsOk => "TestsOk",
            GateState::AwaitingApproval => "AwaitingApproval",
            GateState::Committed => "Committed",
            GateState::RolledBack => "RolledBack",
            GateState::Failed => "Failed",
        }
    }
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}
