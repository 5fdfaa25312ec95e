//! In-memory overlay of candidate text on top of the working tree.
//!
//! Each staged future replaces the line span of its node (or is appended to
//! the file named by its key, for creates). The overlay remembers where every
//! edit landed so tool output on post-edit lines can be traced back to an
//! original line or to the edited node.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::tools::ValidationError;
use crate::graph::{FileRewrite, FutureAction, LineEdit, NodeKey};

/// Where a future goes in its file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditLocation {
    /// Replace lines `start_line..=end_line`, which must currently read `expected`.
    Span {
        file: String,
        start_line: usize,
        end_line: usize,
        expected: String,
    },
    /// Append to the end of the file (created when missing).
    Append { file: String },
}

impl EditLocation {
    pub fn file(&self) -> &str {
        match self {
            EditLocation::Span { file, .. } | EditLocation::Append { file } => file,
        }
    }
}

/// One future to overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayEdit {
    pub key: NodeKey,
    pub action: FutureAction,
    pub code: String,
    /// `None` when the node has no known source location.
    pub location: Option<EditLocation>,
}

/// What a post-edit line corresponds to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOrigin {
    Original(usize),
    Edited(NodeKey),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct OverlayFile {
    content: String,
    edits: Vec<LineEdit>,
}

/// Candidate view of the files touched by one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overlay {
    root: PathBuf,
    files: BTreeMap<String, OverlayFile>,
    detached: Vec<(NodeKey, String)>,
}

impl Overlay {
    /// Read the touched files under `root` and apply `edits`.
    pub async fn load(root: &Path, edits: Vec<OverlayEdit>) -> Result<Self, ValidationError> {
        let mut sources = BTreeMap::new();
        for edit in &edits {
            let Some(location) = &edit.location else {
                continue;
            };
            let file = location.file();
            if sources.contains_key(file) {
                continue;
            }
            let path = root.join(file);
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e)
                    if e.kind() == std::io::ErrorKind::NotFound
                        && matches!(location, EditLocation::Append { .. }) =>
                {
                    String::new()
                }
                Err(e) => return Err(e.into()),
            };
            sources.insert(file.to_string(), content);
        }
        Self::apply(root, &sources, edits)
    }

    /// Apply `edits` to in-memory `sources` (relative path to content).
    pub fn apply(
        root: &Path,
        sources: &BTreeMap<String, String>,
        edits: Vec<OverlayEdit>,
    ) -> Result<Self, ValidationError> {
        let mut by_file: BTreeMap<String, Vec<OverlayEdit>> = BTreeMap::new();
        let mut detached = Vec::new();
        for edit in edits {
            match &edit.location {
                Some(location) => by_file.entry(location.file().to_string()).or_default().push(edit),
                None => detached.push((edit.key.clone(), edit.code.clone())),
            }
        }

        let mut files = BTreeMap::new();
        for (file, mut edits) in by_file {
            let original = sources.get(&file).map(String::as_str).unwrap_or_default();
            edits.sort_by_key(|e| match &e.location {
                Some(EditLocation::Span { start_line, .. }) => *start_line,
                _ => usize::MAX,
            });
            files.insert(file.clone(), apply_file(&file, original, edits)?);
        }

        Ok(Self {
            root: root.to_path_buf(),
            files,
            detached,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Post-edit content of every touched file.
    pub fn files(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files
            .iter()
            .map(|(path, file)| (path.as_str(), file.content.as_str()))
    }

    pub fn content(&self, file: &str) -> Option<&str> {
        self.files.get(file).map(|f| f.content.as_str())
    }

    /// Every touched file with the line ranges the edits replaced.
    pub fn rewrites(&self) -> Vec<FileRewrite> {
        self.files
            .iter()
            .map(|(path, file)| FileRewrite {
                file: path.clone(),
                content: file.content.clone(),
                edits: file.edits.clone(),
            })
            .collect()
    }

    /// Futures whose node has no source location.
    pub fn detached(&self) -> &[(NodeKey, String)] {
        &self.detached
    }

    /// Map a post-edit line back to the original file or an edited node.
    pub fn origin(&self, file: &str, line: usize) -> LineOrigin {
        let Some(overlay) = self.files.get(file) else {
            return LineOrigin::Original(line);
        };
        let mut offset: isize = 0;
        for edit in &overlay.edits {
            if line < edit.new_start {
                break;
            }
            if line <= edit.new_end {
                return LineOrigin::Edited(edit.key.clone());
            }
            offset += edit.growth();
        }
        LineOrigin::Original((line as isize - offset).max(1) as usize)
    }
}

fn overlay_error(message: String) -> ValidationError {
    ValidationError::Tool {
        tool: "overlay".to_string(),
        message,
    }
}

fn apply_file(file: &str, original: &str, edits: Vec<OverlayEdit>) -> Result<OverlayFile, ValidationError> {
    let lines: Vec<&str> = original.lines().collect();
    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    let mut applied = Vec::with_capacity(edits.len());
    let mut cursor = 0usize;

    for edit in &edits {
        let (start, end) = match &edit.location {
            Some(EditLocation::Span {
                start_line,
                end_line,
                expected,
                ..
            }) => {
                if *start_line == 0 || *end_line < *start_line || *end_line > lines.len() {
                    return Err(overlay_error(format!(
                        "{} points at lines {start_line}-{end_line} outside {file}",
                        edit.key
                    )));
                }
                if start_line - 1 < cursor {
                    return Err(overlay_error(format!("{} overlaps another edit in {file}", edit.key)));
                }
                if lines[start_line - 1..*end_line].join("\n") != *expected {
                    return Err(overlay_error(format!(
                        "{} changed on disk since it was indexed",
                        edit.key
                    )));
                }
                (*start_line, *end_line)
            }
            _ => (lines.len() + 1, lines.len()),
        };

        out.extend_from_slice(&lines[cursor..start - 1]);
        let new_start = out.len() + 1;
        if edit.action != FutureAction::Delete {
            out.extend(edit.code.lines());
        }
        applied.push(LineEdit {
            key: edit.key.clone(),
            old_start: start,
            old_end: end,
            new_start,
            new_end: out.len(),
        });
        cursor = end;
    }
    out.extend_from_slice(&lines[cursor.min(lines.len())..]);

    let mut content = out.join("\n");
    if original.is_empty() || original.ends_with('\n') {
        content.push('\n');
    }
    Ok(OverlayFile {
        content,
        edits: applied,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: &str = "fn a() {\n    1\n}\n\nfn b() {}\n\nfn c() {}\n";

    fn span(key: &str, start: usize, end: usize, expected: &str, code: &str) -> OverlayEdit {
        OverlayEdit {
            key: NodeKey::from(key),
            action: FutureAction::Edit,
            code: code.to_string(),
            location: Some(EditLocation::Span {
                file: "src/lib.rs".to_string(),
                start_line: start,
                end_line: end,
                expected: expected.to_string(),
            }),
        }
    }

    fn sources() -> BTreeMap<String, String> {
        BTreeMap::from([("src/lib.rs".to_string(), SRC.to_string())])
    }

    #[test]
    fn test_edit_and_line_mapping() {
        let edits = vec![span("a", 1, 3, "fn a() {\n    1\n}", "fn a() {\n    let x = 1;\n    x + 1\n}")];
        let overlay = Overlay::apply(Path::new("."), &sources(), edits).unwrap();

        let content = overlay.content("src/lib.rs").unwrap();
        assert!(content.starts_with("fn a() {\n    let x = 1;"));
        assert!(content.ends_with("fn c() {}\n"));

        assert_eq!(overlay.origin("src/lib.rs", 2), LineOrigin::Edited(NodeKey::from("a")));
        // `fn b` moved from line 5 to line 6.
        assert_eq!(overlay.origin("src/lib.rs", 6), LineOrigin::Original(5));
        assert_eq!(overlay.origin("src/other.rs", 9), LineOrigin::Original(9));

        let rewrites = overlay.rewrites();
        assert_eq!(rewrites.len(), 1);
        assert_eq!(rewrites[0].content, content);
        assert_eq!((rewrites[0].edits[0].old_end, rewrites[0].edits[0].new_end), (3, 4));
    }

    #[test]
    fn test_delete_and_append() {
        let mut delete = span("b", 5, 5, "fn b() {}", "");
        delete.action = FutureAction::Delete;
        let create = OverlayEdit {
            key: NodeKey::from("src/lib.rs::d"),
            action: FutureAction::Create,
            code: "fn d() {}".to_string(),
            location: Some(EditLocation::Append {
                file: "src/lib.rs".to_string(),
            }),
        };
        let overlay = Overlay::apply(Path::new("."), &sources(), vec![create, delete]).unwrap();

        let content = overlay.content("src/lib.rs").unwrap();
        assert!(!content.contains("fn b()"));
        assert!(content.ends_with("fn c() {}\nfn d() {}\n"));
        // `fn c` moved up from line 7.
        assert_eq!(overlay.origin("src/lib.rs", 6), LineOrigin::Original(7));
        assert_eq!(overlay.origin("src/lib.rs", 7), LineOrigin::Edited(NodeKey::from("src/lib.rs::d")));
    }

    #[test]
    fn test_stale_and_overlapping_edits_fail() {
        let stale = vec![span("b", 5, 5, "fn b() { old }", "fn b() {}")];
        assert!(Overlay::apply(Path::new("."), &sources(), stale).is_err());

        let overlapping = vec![
            span("a", 1, 3, "fn a() {\n    1\n}", "fn a() {}"),
            span("a2", 2, 2, "    1", "    2"),
        ];
        assert!(Overlay::apply(Path::new("."), &sources(), overlapping).is_err());
    }

    #[test]
    fn test_detached_edits_are_kept_aside() {
        let edit = OverlayEdit {
            key: NodeKey::from("x"),
            action: FutureAction::Edit,
            code: "fn x() {}".to_string(),
            location: None,
        };
        let overlay = Overlay::apply(Path::new("."), &sources(), vec![edit]).unwrap();
        assert_eq!(overlay.detached().len(), 1);
        assert_eq!(overlay.files().count(), 0);
    }

    #[tokio::test]
    async fn test_load_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), SRC).unwrap();

        let edits = vec![span("b", 5, 5, "fn b() {}", "fn b() { a(); }")];
        let overlay = Overlay::load(dir.path(), edits).await.unwrap();
        assert!(overlay.content("src/lib.rs").unwrap().contains("fn b() { a(); }"));

        let missing = vec![OverlayEdit {
            key: NodeKey::from("src/new.rs::n"),
            action: FutureAction::Create,
            code: "fn n() {}".to_string(),
            location: Some(EditLocation::Append {
                file: "src/new.rs".to_string(),
            }),
        }];
        let overlay = Overlay::load(dir.path(), missing).await.unwrap();
        assert_eq!(overlay.content("src/new.rs"), Some("fn n() {}\n"));
    }
}
