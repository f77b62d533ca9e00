//! Best-effort pre-apply validation.
//!
//! Syntax is checked in-process with tree-sitter. Type-checkers and
//! linters are external tools discovered on PATH (discovery cached);
//! when a tool is absent the corresponding result field stays `None`
//! ("not run") and never contributes to the pass/fail decision. Only
//! error-severity issues make a file invalid.

use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{CoreError, CoreResult};
use crate::lang::{self, Language};

/// Deadline for one external tool invocation.
const TOOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for tool discovery (`<tool> --version`).
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize)]
pub struct Issue {
    pub severity: Severity,
    pub line: usize,
    pub column: Option<usize>,
    pub message: String,
    pub rule: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub file_path: String,
    pub valid: bool,
    pub syntax_valid: bool,
    /// `None` when no type-checker ran.
    pub type_check_passed: Option<bool>,
    /// `None` when no linter ran.
    pub linter_passed: Option<bool>,
    pub issues: Vec<Issue>,
}

pub struct Validator {
    workspace_root: PathBuf,
    tool_cache: Mutex<HashMap<&'static str, bool>>,
}

impl Validator {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            tool_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Validate proposed content for `file_path` (workspace-relative).
    pub fn validate_file(&self, file_path: &str, content: &str) -> ValidationReport {
        let extension = Path::new(file_path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        let language = Language::from_extension(&extension);

        let mut issues: Vec<Issue> = Vec::new();

        // 1. In-process syntax check.
        let syntax_valid = match language.and_then(|l| lang::syntax_errors(l, content)) {
            Some(errors) if !errors.is_empty() => {
                for e in &errors {
                    issues.push(Issue {
                        severity: Severity::Error,
                        line: e.line,
                        column: Some(e.column),
                        message: format!("Syntax error: {}", e.message),
                        rule: Some("syntax".to_string()),
                    });
                }
                false
            }
            // No driver for this language counts as "not checked, not
            // failed".
            _ => true,
        };

        // 2. External type check.
        let type_check_passed = match language {
            Some(Language::Python) => self.check_types_python(content, &mut issues),
            Some(Language::TypeScript) => self.check_types_typescript(content, &extension, &mut issues),
            _ => None,
        };

        // 3. External linter.
        let linter_passed = match language {
            Some(Language::Python) => self.lint_python(content, &mut issues),
            Some(Language::JavaScript) | Some(Language::TypeScript) => {
                self.lint_javascript(content, &extension, &mut issues)
            }
            _ => None,
        };

        let valid = !issues.iter().any(|i| i.severity == Severity::Error);

        ValidationReport {
            file_path: file_path.to_string(),
            valid,
            syntax_valid,
            type_check_passed,
            linter_passed,
            issues,
        }
    }

    /// Cached PATH discovery: one `<tool> --version` probe per process.
    fn tool_available(&self, tool: &'static str) -> bool {
        if let Some(&known) = self.tool_cache.lock().unwrap_or_else(|e| e.into_inner()).get(tool) {
            return known;
        }
        let available = run_with_deadline(
            Command::new(tool).arg("--version"),
            None,
            DISCOVERY_TIMEOUT,
        )
        .is_ok();
        self.tool_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tool, available);
        available
    }

    fn run_on_temp_file(
        &self,
        tool: &'static str,
        args: &[&str],
        content: &str,
        suffix: &str,
    ) -> CoreResult<ToolOutput> {
        let file = tempfile::Builder::new()
            .suffix(suffix)
            .tempfile()
            .map_err(|e| CoreError::Internal(format!("temp file: {e}")))?;
        std::fs::write(file.path(), content)?;

        let mut cmd = Command::new(tool);
        cmd.args(args)
            .arg(file.path())
            .current_dir(&self.workspace_root);
        run_with_deadline(&mut cmd, None, TOOL_TIMEOUT)
    }

    fn check_types_python(&self, content: &str, issues: &mut Vec<Issue>) -> Option<bool> {
        if !self.tool_available("mypy") {
            return None;
        }
        let output = match self.run_on_temp_file("mypy", &["--no-error-summary"], content, ".py") {
            Ok(o) => o,
            Err(err) => {
                tracing::warn!(%err, "mypy run failed; treating as not run");
                return None;
            }
        };

        // mypy lines: `file.py:12:5: error: message`
        for line in output.stdout.lines() {
            if !line.contains("error:") {
                continue;
            }
            let mut parts = line.splitn(4, ':');
            let _file = parts.next();
            let line_no = parts.next().and_then(|p| p.trim().parse::<usize>().ok());
            let (column, rest) = match parts.next() {
                Some(p) => match p.trim().parse::<usize>() {
                    Ok(col) => (Some(col), parts.next().unwrap_or("").to_string()),
                    Err(_) => (None, format!("{p}{}", parts.next().unwrap_or(""))),
                },
                None => (None, String::new()),
            };
            if let Some(line_no) = line_no {
                issues.push(Issue {
                    severity: Severity::Error,
                    line: line_no,
                    column,
                    message: rest.trim().trim_start_matches("error:").trim().to_string(),
                    rule: Some("mypy".to_string()),
                });
            }
        }
        Some(output.status_success)
    }

    fn check_types_typescript(
        &self,
        content: &str,
        extension: &str,
        issues: &mut Vec<Issue>,
    ) -> Option<bool> {
        if !self.tool_available("tsc") {
            return None;
        }
        let suffix = format!(".{extension}");
        let output = match self.run_on_temp_file("tsc", &["--noEmit"], content, &suffix) {
            Ok(o) => o,
            Err(err) => {
                tracing::warn!(%err, "tsc run failed; treating as not run");
                return None;
            }
        };

        // tsc lines: `file.ts(12,5): error TS2322: message`
        for line in output.stdout.lines() {
            let Some(idx) = line.find("): error TS") else { continue };
            let loc = &line[..idx];
            let message = line[idx + 2..].trim().to_string();
            let coords = loc.rsplit('(').next().unwrap_or("");
            let mut nums = coords.split(',');
            let line_no = nums.next().and_then(|n| n.trim().parse::<usize>().ok());
            let column = nums.next().and_then(|n| n.trim().parse::<usize>().ok());
            if let Some(line_no) = line_no {
                issues.push(Issue {
                    severity: Severity::Error,
                    line: line_no,
                    column,
                    message,
                    rule: Some("typescript".to_string()),
                });
            }
        }
        Some(output.status_success)
    }

    fn lint_python(&self, content: &str, issues: &mut Vec<Issue>) -> Option<bool> {
        if !self.tool_available("flake8") {
            return None;
        }
        let output = match self.run_on_temp_file("flake8", &["--format=default"], content, ".py") {
            Ok(o) => o,
            Err(err) => {
                tracing::warn!(%err, "flake8 run failed; treating as not run");
                return None;
            }
        };

        // flake8 lines: `file.py:3:1: E302 expected 2 blank lines`
        for line in output.stdout.lines() {
            let parts: Vec<&str> = line.splitn(4, ':').collect();
            if parts.len() < 4 {
                continue;
            }
            let Some(line_no) = parts[1].trim().parse::<usize>().ok() else { continue };
            let column = parts[2].trim().parse::<usize>().ok();
            let mut code_and_msg = parts[3].trim().splitn(2, ' ');
            let rule = code_and_msg.next().unwrap_or("").to_string();
            let message = code_and_msg.next().unwrap_or(parts[3].trim()).to_string();
            let severity = if rule.starts_with('E') || rule.starts_with('F') {
                Severity::Error
            } else {
                Severity::Warning
            };
            issues.push(Issue {
                severity,
                line: line_no,
                column,
                message,
                rule: Some(rule),
            });
        }
        Some(output.status_success)
    }

    fn lint_javascript(
        &self,
        content: &str,
        extension: &str,
        issues: &mut Vec<Issue>,
    ) -> Option<bool> {
        if !self.tool_available("eslint") {
            return None;
        }
        let suffix = format!(".{extension}");
        let output = match self.run_on_temp_file("eslint", &["--format=json"], content, &suffix) {
            Ok(o) => o,
            Err(err) => {
                tracing::warn!(%err, "eslint run failed; treating as not run");
                return None;
            }
        };

        #[derive(serde::Deserialize)]
        struct EslintFile {
            #[serde(default)]
            messages: Vec<EslintMessage>,
        }
        #[derive(serde::Deserialize)]
        struct EslintMessage {
            #[serde(default)]
            severity: u8,
            #[serde(default)]
            line: usize,
            column: Option<usize>,
            #[serde(default)]
            message: String,
            #[serde(rename = "ruleId")]
            rule_id: Option<String>,
        }

        if let Ok(files) = serde_json::from_str::<Vec<EslintFile>>(&output.stdout) {
            for file in files {
                for msg in file.messages {
                    issues.push(Issue {
                        severity: if msg.severity >= 2 { Severity::Error } else { Severity::Warning },
                        line: msg.line.max(1),
                        column: msg.column,
                        message: msg.message,
                        rule: msg.rule_id,
                    });
                }
            }
        }
        Some(output.status_success)
    }
}

struct ToolOutput {
    stdout: String,
    status_success: bool,
}

/// Run a subprocess with a hard deadline: poll `try_wait`, kill on
/// expiry. Expiry surfaces as [`CoreError::Transient`] so the caller can
/// degrade instead of hanging the pipeline.
fn run_with_deadline(
    cmd: &mut Command,
    stdin_data: Option<&[u8]>,
    deadline: Duration,
) -> CoreResult<ToolOutput> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::null());
    cmd.stdin(if stdin_data.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => CoreError::Unavailable(format!("tool not on PATH: {e}")),
        _ => CoreError::Internal(e.to_string()),
    })?;

    if let (Some(data), Some(mut stdin)) = (stdin_data, child.stdin.take()) {
        let _ = stdin.write_all(data);
    }

    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let mut stdout = String::new();
                if let Some(mut pipe) = child.stdout.take() {
                    use std::io::Read;
                    let _ = pipe.read_to_string(&mut stdout);
                }
                return Ok(ToolOutput {
                    stdout,
                    status_success: status.success(),
                });
            }
            Ok(None) => {
                if started.elapsed() > deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(CoreError::Transient(format!(
                        "external tool exceeded {}s deadline",
                        deadline.as_secs()
                    )));
                }
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(e) => return Err(CoreError::Internal(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> (tempfile::TempDir, Validator) {
        let tmp = tempfile::tempdir().unwrap();
        let v = Validator::new(tmp.path());
        (tmp, v)
    }

    #[test]
    fn clean_python_passes_syntax() {
        let (_tmp, v) = validator();
        let report = v.validate_file("ok.py", "def f():\n    return 1\n");
        assert!(report.syntax_valid);
        // External tools may or may not exist on the host; the syntax
        // verdict alone must not fail a clean file.
        assert!(report
            .issues
            .iter()
            .all(|i| i.rule.as_deref() != Some("syntax")));
    }

    #[test]
    fn broken_python_reports_an_error_issue_with_location() {
        let (_tmp, v) = validator();
        let report = v.validate_file("bad.py", "def broken(:\n    pass\n");
        assert!(!report.syntax_valid);
        assert!(!report.valid);
        let issue = report
            .issues
            .iter()
            .find(|i| i.rule.as_deref() == Some("syntax"))
            .expect("syntax issue");
        assert_eq!(issue.severity, Severity::Error);
        assert!(issue.line >= 1);
        assert!(issue.column.is_some());
    }

    #[test]
    fn unknown_language_is_not_checked_and_not_failed() {
        let (_tmp, v) = validator();
        let report = v.validate_file("data.txt", "anything at all");
        assert!(report.valid);
        assert!(report.syntax_valid);
        assert!(report.type_check_passed.is_none());
        assert!(report.linter_passed.is_none());
    }

    #[test]
    fn absent_tools_leave_fields_not_run() {
        let (_tmp, v) = validator();
        // Rust has no external checker wired up at all.
        let report = v.validate_file("lib.rs", "pub fn f() -> u32 { 1 }\n");
        assert!(report.valid);
        assert!(report.type_check_passed.is_none());
        assert!(report.linter_passed.is_none());
    }

    #[test]
    fn tool_discovery_is_cached() {
        let (_tmp, v) = validator();
        assert!(!v.tool_available("definitely-not-a-real-tool-name"));
        // Second call answers from the cache.
        assert!(!v.tool_available("definitely-not-a-real-tool-name"));
        assert_eq!(
            v.tool_cache.lock().unwrap().get("definitely-not-a-real-tool-name"),
            Some(&false)
        );
    }
}
