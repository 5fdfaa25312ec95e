pub mod confidence;
pub mod config;
pub mod embedder;
pub mod engine;
pub mod gate;
pub mod graph;
pub mod ingest;
pub mod patterns;
pub mod retrieval;
pub mod validator;

pub use config::{Config, ConfigError};
pub use embedder::{Embedder, HashEmbedder};
pub use engine::{ContextEngine, EngineBuilder, EngineError, IndexReport};
pub use gate::{CandidateSubmission, Decision, GateError, GateState, SafetyGate};
pub use graph::{GraphStore, NodeKey, StoreError};
pub use patterns::PatternLibrary;
pub use retrieval::{HybridRetriever, QueryRequest, Shortlist, TokenBudget};
pub use validator::{ValidationReport, Validator};
