use ignore::overrides::{Override, OverrideBuilder};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};

use crate::error::{CoreError, CoreResult};
use crate::lang::Language;

/// Build/dependency directories that are never worth indexing, plus the
/// tool's own state directory.
const DENY_DIR_NAMES: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "dist",
    "build",
    "coverage",
    "__pycache__",
    ".venv",
    "venv",
    ".next",
    ".nuxt",
    ".pytest_cache",
    ".mypy_cache",
    ".ruff_cache",
    "out",
];

fn default_overrides(
    workspace_root: &Path,
    state_dir_name: &str,
    exclude_dir_names: &[String],
) -> CoreResult<Override> {
    let mut ob = OverrideBuilder::new(workspace_root);

    // Override globs follow ripgrep `-g` semantics: `!` excludes.

    // Lockfiles and generated artifacts.
    for pat in ["**/*.lock", "**/package-lock.json", "**/*.min.js", "**/*.map"] {
        ob.add(&format!("!{pat}"))
            .map_err(|e| CoreError::InvalidInput(e.to_string()))?;
    }

    // For directories, exclude both the directory entry and its
    // descendants, otherwise walkers may still descend into it.
    let mut dirs: Vec<&str> = DENY_DIR_NAMES.to_vec();
    dirs.push(state_dir_name);
    for d in dirs {
        ob.add(&format!("!**/{d}"))
            .map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        ob.add(&format!("!**/{d}/**"))
            .map_err(|e| CoreError::InvalidInput(e.to_string()))?;
    }

    for d in exclude_dir_names {
        let d = d.trim().trim_matches('/');
        if d.is_empty() {
            continue;
        }
        ob.add(&format!("!**/{d}"))
            .map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        ob.add(&format!("!**/{d}/**"))
            .map_err(|e| CoreError::InvalidInput(e.to_string()))?;
    }

    ob.build().map_err(|e| CoreError::InvalidInput(e.to_string()))
}

/// One indexable source file.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub rel_path: PathBuf,
    pub abs_path: PathBuf,
    pub extension: String,
    pub size: u64,
    pub language: Language,
}

impl FileEntry {
    /// Workspace-relative path with `/` separators: the canonical key
    /// used by the vector store and code graph.
    pub fn rel_key(&self) -> String {
        self.rel_path.to_string_lossy().replace('\\', "/")
    }
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub workspace_root: PathBuf,
    pub max_file_bytes: u64,
    pub exclude_dir_names: Vec<String>,
    pub state_dir_name: String,
}

impl ScanOptions {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            max_file_bytes: crate::config::ABSOLUTE_MAX_FILE_BYTES,
            exclude_dir_names: vec![],
            state_dir_name: ".codegrounds".to_string(),
        }
    }

    pub fn from_config(workspace_root: impl Into<PathBuf>, config: &crate::config::Config) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            max_file_bytes: config.max_file_bytes(),
            exclude_dir_names: config.scan.exclude_dir_names.clone(),
            state_dir_name: config.state_dir.clone(),
        }
    }
}

/// Walk the workspace and yield every indexable file, sorted by relative
/// path. Hidden entries, `.gitignore` matches, the denylist, oversized
/// files, and unsupported extensions are skipped. Unreadable entries are
/// logged and skipped; a scan never aborts on a single bad file.
pub fn scan_workspace(opts: &ScanOptions) -> CoreResult<Vec<FileEntry>> {
    std::fs::metadata(&opts.workspace_root).map_err(|_| {
        CoreError::NotFound(format!(
            "workspace root does not exist: {}",
            opts.workspace_root.display()
        ))
    })?;

    let overrides = default_overrides(
        &opts.workspace_root,
        &opts.state_dir_name,
        &opts.exclude_dir_names,
    )?;
    let walker = WalkBuilder::new(&opts.workspace_root)
        .standard_filters(true) // .gitignore, .ignore, hidden, etc.
        .follow_links(false)
        .overrides(overrides)
        .build();

    let mut entries = Vec::new();
    for item in walker {
        let dent = match item {
            Ok(d) => d,
            Err(err) => {
                tracing::warn!(%err, "skipping unreadable entry");
                continue;
            }
        };

        if !dent.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }

        let abs_path = dent.into_path();
        if let Some(entry) = classify(&opts.workspace_root, &abs_path, opts.max_file_bytes) {
            entries.push(entry);
        }
    }

    entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(entries)
}

/// Apply the scanner's per-file filters to a single path. Used by the
/// incremental indexer so watcher events honor the same rules as a full
/// scan.
pub fn classify(workspace_root: &Path, abs_path: &Path, max_file_bytes: u64) -> Option<FileEntry> {
    let extension = abs_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    let language = Language::from_extension(&extension)?;

    let size = match std::fs::metadata(abs_path) {
        Ok(m) => m.len(),
        Err(err) => {
            tracing::warn!(path = %abs_path.display(), %err, "skipping unreadable file");
            return None;
        }
    };
    if size == 0 || size > max_file_bytes {
        return None;
    }

    let rel_path = abs_path.strip_prefix(workspace_root).ok()?.to_path_buf();
    Some(FileEntry {
        rel_path,
        abs_path: abs_path.to_path_buf(),
        extension,
        size,
        language,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn scan_skips_denylist_hidden_and_unsupported() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "src/app.py", "print('hi')\n");
        write(tmp.path(), "src/util.rs", "fn x() {}\n");
        write(tmp.path(), "notes.txt", "not code\n");
        write(tmp.path(), "node_modules/lib/index.js", "x\n");
        write(tmp.path(), ".hidden/secret.py", "x\n");
        write(tmp.path(), ".codegrounds/vector_index.json", "{}\n");

        let entries = scan_workspace(&ScanOptions::new(tmp.path())).unwrap();
        let keys: Vec<String> = entries.iter().map(|e| e.rel_key()).collect();
        assert_eq!(keys, vec!["src/app.py", "src/util.rs"]);
        assert_eq!(entries[0].language, Language::Python);
    }

    #[test]
    fn scan_skips_empty_and_oversized_files() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "empty.py", "");
        write(tmp.path(), "big.py", &"x".repeat(64));
        write(tmp.path(), "ok.py", "pass\n");

        let mut opts = ScanOptions::new(tmp.path());
        opts.max_file_bytes = 32;
        let entries = scan_workspace(&opts).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].rel_key(), "ok.py");
    }

    #[test]
    fn missing_root_is_not_found() {
        let err = scan_workspace(&ScanOptions::new("/definitely/not/here")).unwrap_err();
        assert_eq!(err.category(), "not_found");
    }
}
