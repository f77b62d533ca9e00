//! Unified diff parse, validate, preview, and apply.
//!
//! Apply is all-or-nothing across every file in the diff: each file's
//! full post-diff content is planned first, and nothing touches disk
//! until every hunk in every file has dry-applied cleanly. Hunk headers
//! are declared in original-file coordinates; application walks a
//! mutating buffer with a cumulative line offset.

use std::path::{Path, PathBuf};

use crate::error::{CoreError, CoreResult};
use crate::validator::{Issue, Severity, ValidationReport, Validator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOp {
    Keep,
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiffLine {
    pub op: DiffOp,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<DiffLine>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileDiff {
    /// `None` for `--- /dev/null` (file creation).
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub hunks: Vec<Hunk>,
    /// Set by a `\ No newline at end of file` marker after an added line.
    pub new_missing_final_newline: bool,
}

impl FileDiff {
    pub fn is_creation(&self) -> bool {
        self.old_path.is_none()
    }

    /// The path this diff ultimately targets.
    pub fn target_path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or("")
    }
}

// ---------------------------------------------------------------------------
// Parse
// ---------------------------------------------------------------------------

/// Strip `a/` / `b/` prefixes; `/dev/null` becomes `None`.
fn extract_path(line: &str) -> Option<String> {
    let raw = line.split_whitespace().nth(1)?;
    if raw == "/dev/null" {
        return None;
    }
    let stripped = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    Some(stripped.to_string())
}

fn parse_hunk_header(line: &str) -> Option<(usize, usize, usize, usize)> {
    // @@ -old_start[,old_count] +new_start[,new_count] @@
    let body = line.strip_prefix("@@")?;
    let end = body.find("@@")?;
    let mut parts = body[..end].split_whitespace();

    let old = parts.next()?.strip_prefix('-')?;
    let new = parts.next()?.strip_prefix('+')?;

    let parse_pair = |s: &str| -> Option<(usize, usize)> {
        match s.split_once(',') {
            Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
            None => Some((s.parse().ok()?, 1)), // missing count defaults to 1
        }
    };
    let (old_start, old_count) = parse_pair(old)?;
    let (new_start, new_count) = parse_pair(new)?;
    Some((old_start, old_count, new_start, new_count))
}

/// Parse a unified diff that may span multiple files.
pub fn parse_diff(diff_text: &str) -> CoreResult<Vec<FileDiff>> {
    let mut file_diffs: Vec<FileDiff> = Vec::new();
    let mut current: Option<FileDiff> = None;

    let mut lines = diff_text.lines().peekable();
    while let Some(line) = lines.next() {
        if line.starts_with("--- ") {
            if let Some(done) = current.take() {
                file_diffs.push(done);
            }
            let old_path = extract_path(line);
            let new_path = match lines.peek() {
                Some(next) if next.starts_with("+++ ") => {
                    let next = lines.next().unwrap_or_default();
                    extract_path(next)
                }
                _ => old_path.clone(),
            };
            current = Some(FileDiff {
                old_path,
                new_path,
                hunks: vec![],
                new_missing_final_newline: false,
            });
        } else if line.starts_with("@@") {
            if let Some(file) = current.as_mut() {
                let Some((old_start, old_count, new_start, new_count)) = parse_hunk_header(line)
                else {
                    return Err(CoreError::InvalidInput(format!(
                        "malformed hunk header: {line}"
                    )));
                };
                file.hunks.push(Hunk {
                    old_start,
                    old_count,
                    new_start,
                    new_count,
                    lines: vec![],
                });
            }
        } else if line.starts_with('\\') {
            // "\ No newline at end of file"
            if let Some(file) = current.as_mut() {
                let after_add = file
                    .hunks
                    .last()
                    .and_then(|h| h.lines.last())
                    .map(|l| l.op == DiffOp::Add)
                    .unwrap_or(false);
                if after_add {
                    file.new_missing_final_newline = true;
                }
            }
        } else if let Some(file) = current.as_mut() {
            let Some(hunk) = file.hunks.last_mut() else { continue };
            let (op, content) = match line.chars().next() {
                Some('+') => (DiffOp::Add, &line[1..]),
                Some('-') => (DiffOp::Remove, &line[1..]),
                Some(' ') => (DiffOp::Keep, &line[1..]),
                // Some emitters drop the space prefix on blank context
                // lines.
                None => (DiffOp::Keep, ""),
                _ => continue,
            };
            hunk.lines.push(DiffLine {
                op,
                content: content.to_string(),
            });
        }
    }
    if let Some(done) = current.take() {
        file_diffs.push(done);
    }

    if file_diffs.is_empty() {
        return Err(CoreError::InvalidInput("no valid diff found".into()));
    }
    Ok(file_diffs)
}

// ---------------------------------------------------------------------------
// Generate
// ---------------------------------------------------------------------------

/// Produce a standard unified diff turning `old` into `new`.
pub fn generate_diff(old: &str, new: &str, file_path: &str) -> String {
    similar::TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{file_path}"), &format!("b/{file_path}"))
        .to_string()
}

// ---------------------------------------------------------------------------
// Hunk application
// ---------------------------------------------------------------------------

fn split_lines(content: &str) -> (Vec<String>, bool) {
    if content.is_empty() {
        return (vec![], true);
    }
    let trailing = content.ends_with('\n');
    let body = if trailing {
        &content[..content.len() - 1]
    } else {
        content
    };
    (body.split('\n').map(str::to_string).collect(), trailing)
}

fn join_lines(lines: &[String], trailing_newline: bool) -> String {
    let mut out = lines.join("\n");
    if trailing_newline && !lines.is_empty() {
        out.push('\n');
    }
    out
}

/// Apply every hunk of one file diff against `original`, returning the
/// new content. Pure; does not touch the filesystem.
fn apply_file_diff(original: &str, file_diff: &FileDiff) -> CoreResult<String> {
    let file = file_diff.target_path();
    let (mut lines, had_trailing) = split_lines(original);
    let mut offset: i64 = 0;

    for hunk in &file_diff.hunks {
        let consumed: Vec<&DiffLine> = hunk
            .lines
            .iter()
            .filter(|l| l.op != DiffOp::Add)
            .collect();
        if consumed.len() != hunk.old_count {
            return Err(CoreError::InvalidInput(format!(
                "{file}: hunk at line {} declares {} old lines but lists {}",
                hunk.old_start,
                hunk.old_count,
                consumed.len()
            )));
        }

        // Hunk coordinates reference the original file; prior hunks
        // shifted the buffer by `offset`.
        let base = if hunk.old_start == 0 {
            0i64
        } else {
            hunk.old_start as i64 - 1
        };
        let start = base + offset;
        if start < 0 || start as usize > lines.len() {
            return Err(CoreError::Conflict(format!(
                "{file}: hunk start line {} is outside the file ({} lines)",
                hunk.old_start,
                lines.len()
            )));
        }
        let start = start as usize;
        if start + hunk.old_count > lines.len() {
            return Err(CoreError::Conflict(format!(
                "{file}: hunk at line {} extends past end of file ({} lines)",
                hunk.old_start,
                lines.len()
            )));
        }

        // The kept/removed lines must still match the buffer.
        for (i, expected) in consumed.iter().enumerate() {
            if lines[start + i] != expected.content {
                return Err(CoreError::Conflict(format!(
                    "{file}: context mismatch at line {} (expected {:?}, found {:?})",
                    hunk.old_start + i,
                    expected.content,
                    lines[start + i]
                )));
            }
        }

        let replacement: Vec<String> = hunk
            .lines
            .iter()
            .filter(|l| l.op != DiffOp::Remove)
            .map(|l| l.content.clone())
            .collect();
        let inserted = replacement.len() as i64;
        lines.splice(start..start + hunk.old_count, replacement);
        offset += inserted - hunk.old_count as i64;
    }

    let trailing = if file_diff.new_missing_final_newline {
        false
    } else if file_diff.is_creation() {
        true
    } else {
        had_trailing
    };
    Ok(join_lines(&lines, trailing))
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PreviewEntry {
    pub file: String,
    pub hunks: usize,
    pub additions: usize,
    pub deletions: usize,
    pub context_lines: usize,
    pub creates_file: bool,
}

#[derive(Debug, Clone)]
pub struct FileValidation {
    pub file: String,
    pub issues: Vec<Issue>,
    /// Deep-validation report, when the validator ran.
    pub report: Option<ValidationReport>,
}

#[derive(Debug, Clone)]
pub struct DiffValidation {
    pub valid: bool,
    pub files: Vec<FileValidation>,
}

#[derive(Debug, Clone)]
pub struct AppliedFile {
    pub file: String,
    pub hunks_applied: usize,
    pub created: bool,
}

struct FilePlan {
    abs_path: PathBuf,
    rel_path: String,
    new_content: String,
    hunks: usize,
    creation: bool,
}

pub struct DiffEngine {
    workspace_root: PathBuf,
    validator: Option<Validator>,
}

impl DiffEngine {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        Self {
            validator: Some(Validator::new(&workspace_root)),
            workspace_root,
        }
    }

    pub fn without_validator(mut self) -> Self {
        self.validator = None;
        self
    }

    fn resolve(&self, rel: &str) -> PathBuf {
        let p = Path::new(rel);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.workspace_root.join(p)
        }
    }

    /// Dry-run report of per-file change counts.
    pub fn preview(&self, diff_text: &str) -> CoreResult<Vec<PreviewEntry>> {
        let file_diffs = parse_diff(diff_text)?;
        Ok(file_diffs
            .iter()
            .map(|fd| {
                let mut entry = PreviewEntry {
                    file: fd.target_path().to_string(),
                    hunks: fd.hunks.len(),
                    additions: 0,
                    deletions: 0,
                    context_lines: 0,
                    creates_file: fd.is_creation(),
                };
                for hunk in &fd.hunks {
                    for line in &hunk.lines {
                        match line.op {
                            DiffOp::Add => entry.additions += 1,
                            DiffOp::Remove => entry.deletions += 1,
                            DiffOp::Keep => entry.context_lines += 1,
                        }
                    }
                }
                entry
            })
            .collect())
    }

    /// Validate the diff without touching disk. Structural problems
    /// (missing target, out-of-range hunk, context drift) surface as
    /// error-severity issues scoped to the offending file; with `deep`
    /// the planned post-diff content is also syntax-checked and linted.
    pub fn validate(&self, diff_text: &str, deep: bool) -> CoreResult<DiffValidation> {
        let file_diffs = parse_diff(diff_text)?;
        let mut files: Vec<FileValidation> = Vec::new();
        let mut valid = true;

        for fd in &file_diffs {
            let rel = fd.target_path().to_string();
            let mut entry = FileValidation {
                file: rel.clone(),
                issues: vec![],
                report: None,
            };

            match self.plan_file(fd) {
                Ok(plan) => {
                    if deep {
                        if let Some(validator) = &self.validator {
                            let report = validator.validate_file(&plan.rel_path, &plan.new_content);
                            if !report.valid {
                                valid = false;
                            }
                            entry.issues.extend(report.issues.clone());
                            entry.report = Some(report);
                        }
                    }
                }
                Err(err) => {
                    valid = false;
                    entry.issues.push(Issue {
                        severity: Severity::Error,
                        line: fd.hunks.first().map(|h| h.old_start).unwrap_or(0),
                        column: None,
                        message: err.to_string(),
                        rule: Some(err.category().to_string()),
                    });
                }
            }
            files.push(entry);
        }

        Ok(DiffValidation { valid, files })
    }

    fn plan_file(&self, fd: &FileDiff) -> CoreResult<FilePlan> {
        let rel = fd.target_path().to_string();
        if rel.is_empty() {
            return Err(CoreError::InvalidInput("diff with no target path".into()));
        }
        let abs = self.resolve(&rel);

        let original = if fd.is_creation() {
            // Creation never mkdir-s its way to the target.
            let parent_ok = abs.parent().map(|p| p.exists()).unwrap_or(false);
            if !parent_ok {
                return Err(CoreError::InvalidInput(format!(
                    "{rel}: parent directory does not exist"
                )));
            }
            String::new()
        } else {
            if !abs.exists() {
                return Err(CoreError::NotFound(format!("file does not exist: {rel}")));
            }
            std::fs::read_to_string(&abs)
                .map_err(|e| CoreError::Internal(format!("{rel}: {e}")))?
        };

        for hunk in &fd.hunks {
            if !fd.is_creation() && hunk.old_start < 1 {
                return Err(CoreError::InvalidInput(format!(
                    "{rel}: hunk start line {} is invalid",
                    hunk.old_start
                )));
            }
            if hunk.new_start < 1 && hunk.new_count > 0 {
                return Err(CoreError::InvalidInput(format!(
                    "{rel}: hunk new start line {} is invalid",
                    hunk.new_start
                )));
            }
        }

        let new_content = apply_file_diff(&original, fd)?;
        Ok(FilePlan {
            abs_path: abs,
            rel_path: rel,
            new_content,
            hunks: fd.hunks.len(),
            creation: fd.is_creation(),
        })
    }

    /// Apply a (possibly multi-file) diff. If any hunk in any file fails
    /// to dry-apply, no file is modified.
    pub fn apply(&self, diff_text: &str) -> CoreResult<Vec<AppliedFile>> {
        let file_diffs = parse_diff(diff_text)?;

        // Phase 1: plan everything; the first failure aborts with zero
        // side effects.
        let mut plans: Vec<FilePlan> = Vec::with_capacity(file_diffs.len());
        for fd in &file_diffs {
            plans.push(self.plan_file(fd)?);
        }

        // Phase 2: write. Temp-file-plus-rename keeps a crash from
        // leaving a half-written file.
        let mut applied: Vec<AppliedFile> = Vec::with_capacity(plans.len());
        for plan in plans {
            let tmp = plan.abs_path.with_extension("cg-apply.tmp");
            std::fs::write(&tmp, &plan.new_content)
                .map_err(|e| CoreError::Internal(format!("{}: {e}", plan.rel_path)))?;
            std::fs::rename(&tmp, &plan.abs_path)
                .map_err(|e| CoreError::Internal(format!("{}: {e}", plan.rel_path)))?;
            applied.push(AppliedFile {
                file: plan.rel_path,
                hunks_applied: plan.hunks,
                created: plan.creation,
            });
        }
        Ok(applied)
    }
}
