//! Language support: extension mapping plus tree-sitter drivers.
//!
//! A driver contributes three things to the pipeline:
//!  1. Symbol outlines (classes/functions/methods with line ranges) for
//!     AST-aware chunking.
//!  2. Imports, call sites, and inheritance pairs for the code graph.
//!  3. A syntax check for pre-apply validation.
//!
//! Languages without a driver still index through the line-window
//! fallback; they simply get no symbol metadata.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;
use tree_sitter::{Language as Grammar, Node, Parser, Query, QueryCursor, StreamingIterator};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Rust,
    TypeScript,
    JavaScript,
    Java,
    Go,
    C,
    Cpp,
    Ruby,
    Php,
    Swift,
    Kotlin,
}

impl Language {
    /// Map a lowercase file extension (no dot) to a language.
    pub fn from_extension(ext: &str) -> Option<Self> {
        Some(match ext {
            "py" => Self::Python,
            "rs" => Self::Rust,
            "ts" | "tsx" => Self::TypeScript,
            "js" | "jsx" => Self::JavaScript,
            "java" => Self::Java,
            "go" => Self::Go,
            "c" | "h" => Self::C,
            "cpp" | "cc" | "hpp" => Self::Cpp,
            "rb" => Self::Ruby,
            "php" => Self::Php,
            "swift" => Self::Swift,
            "kt" => Self::Kotlin,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Rust => "rust",
            Self::TypeScript => "typescript",
            Self::JavaScript => "javascript",
            Self::Java => "java",
            Self::Go => "go",
            Self::C => "c",
            Self::Cpp => "cpp",
            Self::Ruby => "ruby",
            Self::Php => "php",
            Self::Swift => "swift",
            Self::Kotlin => "kotlin",
        }
    }

    /// Whether an AST driver exists for this language.
    pub fn has_driver(&self) -> bool {
        driver_for(*self).is_some()
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Class,
    Function,
    Method,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Class => "class",
            Self::Function => "function",
            Self::Method => "method",
        }
    }
}

/// One named declaration. Lines are 1-based inclusive.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub start_line: u32,
    pub end_line: u32,
    /// Enclosing class, when the symbol is nested inside one.
    pub parent: Option<String>,
}

/// A bare-name call site inside some function body.
#[derive(Debug, Clone)]
pub struct CallSite {
    /// Name of the enclosing function, when the call is inside one.
    pub caller: Option<String>,
    pub callee: String,
    pub line: u32,
}

/// Full syntactic outline of one source file.
#[derive(Debug, Clone, Default)]
pub struct SourceOutline {
    pub symbols: Vec<Symbol>,
    /// 1-based line numbers covered by import statements.
    pub import_lines: Vec<u32>,
    /// Import statement texts (one per statement, trimmed).
    pub imports: Vec<String>,
    /// `(class, base)` pairs.
    pub inherits: Vec<(String, String)>,
    pub calls: Vec<CallSite>,
}

#[derive(Debug, Clone)]
pub struct SyntaxError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Drivers
// ---------------------------------------------------------------------------

struct Driver {
    grammar: fn() -> Grammar,
    /// Patterns capturing `@name` and `@def` for function-like symbols.
    function_query: &'static str,
    /// Patterns capturing `@name` and `@def` for class-like symbols.
    class_query: &'static str,
    /// Patterns capturing whole import statements as `@imp`.
    import_query: &'static str,
    /// Patterns capturing bare-identifier callees as `@callee`.
    call_query: &'static str,
    /// Patterns capturing `@name` / `@base` inheritance pairs; may be empty.
    inherit_query: &'static str,
    /// Node kinds that delimit an enclosing function body (caller lookup).
    function_node_kinds: &'static [&'static str],
}

fn python_grammar() -> Grammar {
    tree_sitter_python::LANGUAGE.into()
}

fn rust_grammar() -> Grammar {
    tree_sitter_rust::LANGUAGE.into()
}

fn typescript_grammar() -> Grammar {
    tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()
}

static PYTHON_DRIVER: Driver = Driver {
    grammar: python_grammar,
    function_query: r#"(function_definition name: (identifier) @name) @def"#,
    class_query: r#"(class_definition name: (identifier) @name) @def"#,
    import_query: r#"[(import_statement) (import_from_statement)] @imp"#,
    call_query: r#"(call function: (identifier) @callee)"#,
    inherit_query: r#"(class_definition name: (identifier) @name superclasses: (argument_list (identifier) @base))"#,
    function_node_kinds: &["function_definition"],
};

static RUST_DRIVER: Driver = Driver {
    grammar: rust_grammar,
    function_query: r#"(function_item name: (identifier) @name) @def"#,
    class_query: r#"[(struct_item name: (type_identifier) @name) (enum_item name: (type_identifier) @name) (trait_item name: (type_identifier) @name)] @def"#,
    import_query: r#"(use_declaration) @imp"#,
    call_query: r#"(call_expression function: (identifier) @callee)"#,
    inherit_query: "",
    function_node_kinds: &["function_item"],
};

static TYPESCRIPT_DRIVER: Driver = Driver {
    grammar: typescript_grammar,
    function_query: "(function_declaration name: (identifier) @name) @def\n(method_definition name: (property_identifier) @name) @def",
    class_query: r#"(class_declaration name: (type_identifier) @name) @def"#,
    import_query: r#"(import_statement) @imp"#,
    call_query: r#"(call_expression function: (identifier) @callee)"#,
    inherit_query: "",
    function_node_kinds: &["function_declaration", "method_definition", "arrow_function"],
};

fn driver_for(language: Language) -> Option<&'static Driver> {
    match language {
        Language::Python => Some(&PYTHON_DRIVER),
        Language::Rust => Some(&RUST_DRIVER),
        Language::TypeScript | Language::JavaScript => Some(&TYPESCRIPT_DRIVER),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Query plumbing
// ---------------------------------------------------------------------------

/// Compiled queries are cached per language; compiling on every file would
/// dominate chunking time.
struct CompiledDriver {
    grammar: Grammar,
    function_query: Query,
    class_query: Query,
    import_query: Query,
    call_query: Query,
    inherit_query: Option<Query>,
    function_node_kinds: &'static [&'static str],
}

fn compiled_for(language: Language) -> Option<&'static CompiledDriver> {
    static CACHE: OnceLock<HashMap<&'static str, CompiledDriver>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| {
        let mut map = HashMap::new();
        for (key, lang) in [
            ("python", Language::Python),
            ("rust", Language::Rust),
            ("typescript", Language::TypeScript),
        ] {
            if let Some(compiled) = compile_driver(lang) {
                map.insert(key, compiled);
            }
        }
        map
    });
    let key = match language {
        Language::Python => "python",
        Language::Rust => "rust",
        Language::TypeScript | Language::JavaScript => "typescript",
        _ => return None,
    };
    cache.get(key)
}

fn compile_driver(language: Language) -> Option<CompiledDriver> {
    let driver = driver_for(language)?;
    let grammar = (driver.grammar)();
    let compile = |src: &str| Query::new(&grammar, src).ok();
    Some(CompiledDriver {
        function_query: compile(driver.function_query)?,
        class_query: compile(driver.class_query)?,
        import_query: compile(driver.import_query)?,
        call_query: compile(driver.call_query)?,
        inherit_query: if driver.inherit_query.is_empty() {
            None
        } else {
            compile(driver.inherit_query)
        },
        grammar,
        function_node_kinds: driver.function_node_kinds,
    })
}

fn node_text<'a>(source: &'a [u8], node: Node) -> &'a str {
    std::str::from_utf8(&source[node.start_byte()..node.end_byte()]).unwrap_or("")
}

/// Collect `(name, def)` symbol pairs for a query whose captures are
/// `@name` and `@def`.
fn run_symbol_query(
    query: &Query,
    root: Node,
    source: &[u8],
    kind: SymbolKind,
    out: &mut Vec<Symbol>,
) {
    let mut cursor = QueryCursor::new();
    let mut matches = cursor.matches(query, root, source);
    while let Some(m) = matches.next() {
        let mut name_node: Option<Node> = None;
        let mut def_node: Option<Node> = None;
        for cap in m.captures {
            match query.capture_names()[cap.index as usize] {
                "name" => name_node = Some(cap.node),
                "def" => def_node = Some(cap.node),
                _ => {}
            }
        }
        let Some(name_node) = name_node else { continue };
        let def_node = def_node.unwrap_or(name_node);
        let name = node_text(source, name_node).trim().to_string();
        if name.is_empty() {
            continue;
        }
        out.push(Symbol {
            name,
            kind,
            start_line: def_node.start_position().row as u32 + 1,
            end_line: def_node.end_position().row as u32 + 1,
            parent: None,
        });
    }
}

fn run_capture_nodes<'t>(query: &Query, root: Node<'t>, source: &[u8], cap: &str) -> Vec<Node<'t>> {
    let mut cursor = QueryCursor::new();
    let mut out = Vec::new();
    let mut matches = cursor.matches(query, root, source);
    while let Some(m) = matches.next() {
        for c in m.captures {
            if query.capture_names()[c.index as usize] == cap {
                out.push(c.node);
            }
        }
    }
    out
}

/// Walk up from a call node to the nearest enclosing function and return
/// its declared name, if any.
fn enclosing_function_name(
    mut node: Node,
    source: &[u8],
    function_node_kinds: &[&str],
) -> Option<String> {
    while let Some(parent) = node.parent() {
        if function_node_kinds.contains(&parent.kind()) {
            let name = parent
                .child_by_field_name("name")
                .map(|n| node_text(source, n).trim().to_string());
            if let Some(name) = name {
                if !name.is_empty() {
                    return Some(name);
                }
            }
        }
        node = parent;
    }
    None
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Extract the syntactic outline of one file.
///
/// Errors with [`CoreError::Parse`] when the grammar rejects the source or
/// the language has no driver; callers fall back to line-window chunking.
pub fn outline(language: Language, file: &str, source: &str) -> CoreResult<SourceOutline> {
    let driver = compiled_for(language)
        .ok_or_else(|| CoreError::parse(file, 0, format!("no syntax driver for {language}")))?;

    let mut parser = Parser::new();
    parser
        .set_language(&driver.grammar)
        .map_err(|e| CoreError::Internal(format!("grammar init failed: {e}")))?;

    let tree = parser
        .parse(source, None)
        .ok_or_else(|| CoreError::parse(file, 0, "parser produced no tree"))?;
    let root = tree.root_node();
    let bytes = source.as_bytes();

    let mut symbols: Vec<Symbol> = Vec::new();
    run_symbol_query(&driver.class_query, root, bytes, SymbolKind::Class, &mut symbols);
    run_symbol_query(&driver.function_query, root, bytes, SymbolKind::Function, &mut symbols);

    // Parent assignment by range containment: a function lying strictly
    // inside a class body is that class's method.
    let classes: Vec<(String, u32, u32)> = symbols
        .iter()
        .filter(|s| s.kind == SymbolKind::Class)
        .map(|s| (s.name.clone(), s.start_line, s.end_line))
        .collect();
    for sym in symbols.iter_mut().filter(|s| s.kind != SymbolKind::Class) {
        let enclosing = classes
            .iter()
            .filter(|(_, start, end)| *start < sym.start_line && sym.end_line <= *end)
            .min_by_key(|(_, start, end)| end - start);
        if let Some((class_name, _, _)) = enclosing {
            sym.parent = Some(class_name.clone());
            sym.kind = SymbolKind::Method;
        }
    }

    symbols.sort_by(|a, b| a.start_line.cmp(&b.start_line).then_with(|| a.name.cmp(&b.name)));

    let mut import_lines: Vec<u32> = Vec::new();
    let mut imports: Vec<String> = Vec::new();
    for node in run_capture_nodes(&driver.import_query, root, bytes, "imp") {
        let start = node.start_position().row as u32 + 1;
        let end = node.end_position().row as u32 + 1;
        import_lines.extend(start..=end);
        imports.push(node_text(bytes, node).trim().to_string());
    }
    import_lines.sort_unstable();
    import_lines.dedup();

    let mut calls: Vec<CallSite> = Vec::new();
    for node in run_capture_nodes(&driver.call_query, root, bytes, "callee") {
        let callee = node_text(bytes, node).trim().to_string();
        if callee.is_empty() {
            continue;
        }
        calls.push(CallSite {
            caller: enclosing_function_name(node, bytes, driver.function_node_kinds),
            callee,
            line: node.start_position().row as u32 + 1,
        });
    }

    let mut inherits: Vec<(String, String)> = Vec::new();
    if let Some(query) = &driver.inherit_query {
        let mut cursor = QueryCursor::new();
        let mut matches = cursor.matches(query, root, bytes);
        while let Some(m) = matches.next() {
            let mut class_name = None;
            let mut base = None;
            for c in m.captures {
                match query.capture_names()[c.index as usize] {
                    "name" => class_name = Some(node_text(bytes, c.node).to_string()),
                    "base" => base = Some(node_text(bytes, c.node).to_string()),
                    _ => {}
                }
            }
            if let (Some(class_name), Some(base)) = (class_name, base) {
                inherits.push((class_name, base));
            }
        }
    }

    Ok(SourceOutline {
        symbols,
        import_lines,
        imports,
        inherits,
        calls,
    })
}

/// Syntax-check `source`. Returns `None` when the language has no driver
/// (check not run), `Some(vec![])` when the file parses cleanly.
pub fn syntax_errors(language: Language, source: &str) -> Option<Vec<SyntaxError>> {
    let driver = compiled_for(language)?;

    let mut parser = Parser::new();
    if parser.set_language(&driver.grammar).is_err() {
        return None;
    }
    let Some(tree) = parser.parse(source, None) else {
        return Some(vec![SyntaxError {
            line: 1,
            column: 1,
            message: "parser produced no tree".to_string(),
        }]);
    };

    let mut errors = Vec::new();
    collect_error_nodes(tree.root_node(), &mut errors);
    Some(errors)
}

fn collect_error_nodes(node: Node, out: &mut Vec<SyntaxError>) {
    if !node.has_error() {
        return;
    }
    if node.is_error() || node.is_missing() {
        let pos = node.start_position();
        out.push(SyntaxError {
            line: pos.row + 1,
            column: pos.column + 1,
            message: if node.is_missing() {
                format!("missing {}", node.kind())
            } else {
                "syntax error".to_string()
            },
        });
        return;
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_error_nodes(child, out);
    }
}
