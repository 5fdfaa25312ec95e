//! Cargo-backed validation tools.
//!
//! Every call mirrors the working tree into a scratch directory, writes the
//! overlaid files on top and runs cargo there. The real target directory is
//! shared so dependency artifacts stay warm.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use ignore::WalkBuilder;
use serde::Deserialize;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::debug;

use super::overlay::Overlay;
use super::report::{DiagnosticLevel, RawDiagnostic};
use super::tools::{BuildOutcome, BuildRunner, DiagnosticsChecker, TestOutcome, TestRunner, TestTarget, ValidationError};
use crate::config::ValidatorConfig;

#[derive(Debug, Clone)]
pub struct CargoToolchain {
    cargo_bin: String,
    target_dir: PathBuf,
}

impl CargoToolchain {
    pub fn new(config: &ValidatorConfig) -> Self {
        Self {
            cargo_bin: config.cargo_bin.clone(),
            target_dir: config.workspace_root.join("target"),
        }
    }

    async fn materialize(&self, overlay: &Overlay) -> Result<TempDir, ValidationError> {
        if let Some((key, _)) = overlay.detached().first() {
            return Err(ValidationError::Tool {
                tool: "overlay".to_string(),
                message: format!("{key} has no source location to write to"),
            });
        }
        let root = overlay.root().to_path_buf();
        let files: Vec<(String, String)> = overlay
            .files()
            .map(|(path, content)| (path.to_string(), content.to_string()))
            .collect();
        tokio::task::spawn_blocking(move || mirror(&root, &files))
            .await
            .map_err(|e| ValidationError::Tool {
                tool: "overlay".to_string(),
                message: e.to_string(),
            })?
    }

    async fn cargo(&self, dir: &Path, args: &[&str]) -> Result<Output, ValidationError> {
        debug!(dir = %dir.display(), ?args, "Running cargo");
        Command::new(&self.cargo_bin)
            .args(args)
            .current_dir(dir)
            .env("CARGO_TARGET_DIR", &self.target_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ValidationError::Spawn {
                program: self.cargo_bin.clone(),
                source,
            })
    }
}

#[async_trait]
impl DiagnosticsChecker for CargoToolchain {
    async fn diagnostics(&self, overlay: &Overlay) -> Result<Vec<RawDiagnostic>, ValidationError> {
        let scratch = self.materialize(overlay).await?;
        let output = self
            .cargo(scratch.path(), &["check", "--all-targets", "--message-format=json"])
            .await?;
        let diagnostics = parse_messages(&String::from_utf8_lossy(&output.stdout));
        if !output.status.success() && !diagnostics.iter().any(|d| d.level == DiagnosticLevel::Error) {
            return Err(tool_failure("cargo check", &output));
        }
        Ok(diagnostics)
    }
}

#[async_trait]
impl BuildRunner for CargoToolchain {
    async fn build(&self, overlay: &Overlay) -> Result<BuildOutcome, ValidationError> {
        let scratch = self.materialize(overlay).await?;
        let output = self
            .cargo(scratch.path(), &["test", "--no-run", "--message-format=json"])
            .await?;
        let diagnostics = parse_messages(&String::from_utf8_lossy(&output.stdout));
        if !output.status.success() && !diagnostics.iter().any(|d| d.level == DiagnosticLevel::Error) {
            return Err(tool_failure("cargo test --no-run", &output));
        }
        Ok(BuildOutcome {
            success: output.status.success(),
            diagnostics,
        })
    }
}

#[async_trait]
impl TestRunner for CargoToolchain {
    async fn run_tests(&self, overlay: &Overlay, tests: &[TestTarget]) -> Result<TestOutcome, ValidationError> {
        if tests.is_empty() {
            return Ok(TestOutcome {
                passed: true,
                failures: Vec::new(),
            });
        }
        let scratch = self.materialize(overlay).await?;
        let mut args = vec!["test", "--"];
        args.extend(tests.iter().map(|t| t.name.as_str()));
        let output = self.cargo(scratch.path(), &args).await?;
        Ok(TestOutcome {
            passed: output.status.success(),
            failures: parse_failures(&String::from_utf8_lossy(&output.stdout)),
        })
    }
}

fn tool_failure(tool: &str, output: &Output) -> ValidationError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
    ValidationError::Tool {
        tool: tool.to_string(),
        message: tail.into_iter().rev().collect::<Vec<_>>().join("\n"),
    }
}

/// Copy the working tree (minus ignored files, `.git` and `target`) into a scratch dir.
fn mirror(root: &Path, files: &[(String, String)]) -> Result<TempDir, ValidationError> {
    let scratch = tempfile::Builder::new().prefix("isg-overlay-").tempdir()?;

    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(true)
        .filter_entry(|e| e.file_name() != "target" && e.file_name() != ".git")
        .build();
    for entry in walker.flatten() {
        let path = entry.path();
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        let dest = scratch.path().join(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(path, &dest)?;
    }

    for (rel, content) in files {
        let dest = scratch.path().join(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&dest, content)?;
    }
    Ok(scratch)
}

// ============================================================================
// Cargo JSON messages
// ============================================================================

#[derive(Deserialize)]
struct CargoMessage {
    reason: String,
    message: Option<CompilerMessage>,
}

#[derive(Deserialize)]
struct CompilerMessage {
    message: String,
    level: String,
    code: Option<ErrorCode>,
    #[serde(default)]
    spans: Vec<CompilerSpan>,
}

#[derive(Deserialize)]
struct ErrorCode {
    code: String,
}

#[derive(Deserialize)]
struct CompilerSpan {
    file_name: String,
    line_start: usize,
    is_primary: bool,
}

/// Compiler messages from `--message-format=json` output.
fn parse_messages(stdout: &str) -> Vec<RawDiagnostic> {
    stdout
        .lines()
        .filter_map(|line| serde_json::from_str::<CargoMessage>(line).ok())
        .filter(|m| m.reason == "compiler-message")
        .filter_map(|m| m.message)
        .filter_map(|m| {
            let level = DiagnosticLevel::from_rustc(&m.level);
            // Summary lines ("aborting due to ...", "N warnings emitted") carry no spans.
            if m.spans.is_empty()
                && (level != DiagnosticLevel::Error || m.message.starts_with("aborting due to"))
            {
                return None;
            }
            let primary = m.spans.iter().find(|s| s.is_primary).or_else(|| m.spans.first());
            Some(RawDiagnostic {
                level,
                message: m.message,
                code: m.code.map(|c| c.code),
                file: primary.map(|s| s.file_name.clone()),
                line: primary.map(|s| s.line_start),
            })
        })
        .collect()
}

/// Names from libtest's `test <name> ... FAILED` lines.
fn parse_failures(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.strip_prefix("test "))
        .filter_map(|rest| rest.strip_suffix(" ... FAILED"))
        .map(str::to_string)
        .collect()
}
