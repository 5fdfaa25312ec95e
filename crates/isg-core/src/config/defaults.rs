//! Default values for isg configuration.
//!
//! All hardcoded defaults are centralized here for easy maintenance.

// ============================================================================
// Store Defaults
// ============================================================================

/// Default data directory.
pub const DEFAULT_DATA_DIR: &str = ".isg";

/// Default database directory name inside the data directory.
pub const DEFAULT_DB_DIR: &str = "graph.db";

/// SurrealDB namespace.
pub const DB_NAMESPACE: &str = "isg";

/// SurrealDB database name.
pub const DB_NAME: &str = "graph";

// ============================================================================
// Retrieval Defaults
// ============================================================================

/// Maximum number of items in a shortlist.
pub const DEFAULT_MAX_ITEMS: usize = 50;

/// Maximum nodes kept per traversal hop.
pub const DEFAULT_MAX_PER_HOP: usize = 30;

/// Number of hops in the bounded traversal.
pub const DEFAULT_MAX_HOPS: u8 = 2;

/// Nearest neighbours requested from the vector index.
pub const DEFAULT_VECTOR_K: usize = 50;

/// Nearest patterns consulted for pattern relevance.
pub const DEFAULT_PATTERN_K: usize = 3;

/// Weight of the level priority term.
pub const DEFAULT_WEIGHT_LEVEL: f32 = 0.30;

/// Weight of the graph distance term.
pub const DEFAULT_WEIGHT_GRAPH: f32 = 0.30;

/// Weight of the vector distance term.
pub const DEFAULT_WEIGHT_VECTOR: f32 = 0.30;

/// Weight of the pattern relevance term.
pub const DEFAULT_WEIGHT_PATTERN: f32 = 0.10;

/// Token budget used when a caller does not give one.
pub const DEFAULT_TOKEN_BUDGET: usize = 8_000;

/// Characters per token for budget estimation.
pub const DEFAULT_CHARS_PER_TOKEN: usize = 4;

// ============================================================================
// Pattern Defaults
// ============================================================================

/// Anti-pattern distance below which a match is High severity.
pub const DEFAULT_HIGH_SEVERITY_THRESHOLD: f32 = 0.20;

/// Anti-pattern distance below which a match is Medium severity.
pub const DEFAULT_MEDIUM_SEVERITY_THRESHOLD: f32 = 0.35;

/// Smoothing factor of the rolling average confidence.
pub const DEFAULT_CONFIDENCE_ALPHA: f32 = 0.2;

// ============================================================================
// Validator Defaults
// ============================================================================

/// Cargo binary used by the toolchain.
pub const DEFAULT_CARGO_BIN: &str = "cargo";

/// Diagnostics phase budget (ms). The phase runs `cargo check --all-targets`
/// on a fresh mirror of the tree, so workspace crates are always rechecked.
pub const DEFAULT_DIAGNOSTICS_TIMEOUT_MS: u64 = 30_000;

/// Build phase budget with a warm cache (ms).
pub const DEFAULT_BUILD_TIMEOUT_MS: u64 = 3_000;

/// Test phase budget (ms).
pub const DEFAULT_TEST_TIMEOUT_MS: u64 = 60_000;

/// Diagnostic count at which consistency bottoms out at zero.
pub const DEFAULT_DIAGNOSTIC_NORM: usize = 10;

// ============================================================================
// Gate Defaults
// ============================================================================

/// Concurrent validation tasks.
pub const DEFAULT_WORKERS: usize = 8;

// ============================================================================
// Embedding Defaults
// ============================================================================

/// Default embedding provider.
pub const DEFAULT_EMBED_PROVIDER: &str = "fastembed";

/// Dimension of the hashing embedder (matches BGE-Small).
pub const DEFAULT_EMBED_DIMENSION: usize = 384;

/// Default model for OpenAI-compatible embedding endpoints.
pub const DEFAULT_HTTP_EMBED_MODEL: &str = "text-embedding-3-small";

/// Default OpenAI-compatible base URL.
pub const DEFAULT_HTTP_EMBED_URL: &str = "https://api.openai.com/v1";

// ============================================================================
// Logging Defaults
// ============================================================================

/// Default tracing filter.
pub const DEFAULT_LOG_FILTER: &str = "info,isg_core=debug";
