//! Safety gate and apply orchestrator.
//!
//! The gate takes a candidate diff, stages it as the `future` of its rows,
//! drives it through the validator, scores it and waits for an external
//! decision. It is the only component that can flip rows from future to
//! current or create a graph version.

mod candidate;
mod error;
mod orchestrator;
mod state;

pub use candidate::{CandidateRecord, CandidateSubmission, Decision, RowEdit, StateChange};
pub use error::GateError;
pub use orchestrator::SafetyGate;
pub use state::GateState;
