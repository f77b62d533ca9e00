//! Session memory: durable structured facts extracted from conversation
//! exchanges, plus conversation summaries and a file-change journal.
//!
//! Single-file relational store. Facts are append-only; duplicates (by
//! `content` within a session) are skipped on save.

use regex::Regex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use crate::error::{CoreError, CoreResult};
use crate::llm::{Message, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactKind {
    FileCreated,
    FunctionAdded,
    ClassAdded,
    ErrorFixed,
    DecisionMade,
}

impl FactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileCreated => "file_created",
            Self::FunctionAdded => "function_added",
            Self::ClassAdded => "class_added",
            Self::ErrorFixed => "error_fixed",
            Self::DecisionMade => "decision_made",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "file_created" => Self::FileCreated,
            "function_added" => Self::FunctionAdded,
            "class_added" => Self::ClassAdded,
            "error_fixed" => Self::ErrorFixed,
            "decision_made" => Self::DecisionMade,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Fact {
    pub kind: FactKind,
    pub content: String,
    pub metadata: serde_json::Value,
    /// ISO-8601; set by the store on save.
    pub timestamp: Option<String>,
}

impl Fact {
    fn new(kind: FactKind, content: String, metadata: serde_json::Value) -> Self {
        Self {
            kind,
            content,
            metadata,
            timestamp: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileChange {
    pub file_path: String,
    pub change_type: String,
    pub timestamp: String,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct FactsStore {
    conn: Mutex<Connection>,
}

impl FactsStore {
    pub fn open(db_path: &Path) -> CoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                session_id TEXT PRIMARY KEY,
                summary TEXT,
                timestamp TEXT
            );
            CREATE TABLE IF NOT EXISTS facts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                fact_type TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT,
                timestamp TEXT
            );
            CREATE TABLE IF NOT EXISTS file_changes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                file_path TEXT NOT NULL,
                change_type TEXT NOT NULL,
                timestamp TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_facts_session ON facts(session_id);
            CREATE INDEX IF NOT EXISTS idx_file_changes_session ON file_changes(session_id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> CoreResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CoreError::Internal("facts store lock poisoned".into()))
    }

    /// Append facts, skipping any whose `content` already exists for the
    /// session. Returns the number actually inserted.
    pub fn save_facts(&self, session_id: &str, facts: &[Fact]) -> CoreResult<usize> {
        let conn = self.lock()?;
        let now = chrono::Utc::now().to_rfc3339();
        let mut inserted = 0usize;
        for fact in facts {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM facts WHERE session_id = ?1 AND content = ?2)",
                params![session_id, fact.content],
                |row| row.get(0),
            )?;
            if exists {
                continue;
            }
            conn.execute(
                "INSERT INTO facts (session_id, fact_type, content, metadata, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    session_id,
                    fact.kind.as_str(),
                    fact.content,
                    fact.metadata.to_string(),
                    now
                ],
            )?;
            inserted += 1;
        }
        Ok(inserted)
    }

    /// Facts for a session ordered newest-first, optionally filtered by a
    /// content substring.
    pub fn facts(&self, session_id: &str, query: Option<&str>) -> CoreResult<Vec<Fact>> {
        let conn = self.lock()?;
        let mut rows: Vec<Fact> = Vec::new();

        let mut push_row = |fact_type: String,
                            content: String,
                            metadata: Option<String>,
                            timestamp: Option<String>| {
            let Some(kind) = FactKind::from_str(&fact_type) else {
                return;
            };
            rows.push(Fact {
                kind,
                content,
                metadata: metadata
                    .and_then(|m| serde_json::from_str(&m).ok())
                    .unwrap_or(serde_json::Value::Null),
                timestamp,
            });
        };

        if let Some(query) = query {
            let pattern = format!("%{query}%");
            let mut stmt = conn.prepare(
                "SELECT fact_type, content, metadata, timestamp FROM facts
                 WHERE session_id = ?1 AND content LIKE ?2
                 ORDER BY id DESC",
            )?;
            let mapped = stmt.query_map(params![session_id, pattern], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            for row in mapped {
                let (t, c, m, ts) = row?;
                push_row(t, c, m, ts);
            }
        } else {
            let mut stmt = conn.prepare(
                "SELECT fact_type, content, metadata, timestamp FROM facts
                 WHERE session_id = ?1
                 ORDER BY id DESC
                 LIMIT 50",
            )?;
            let mapped = stmt.query_map(params![session_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            for row in mapped {
                let (t, c, m, ts) = row?;
                push_row(t, c, m, ts);
            }
        }
        Ok(rows)
    }

    /// Facts whose content shares a word with `user_message`, ranked by
    /// recency; used by the context assembler.
    pub fn relevant_facts(
        &self,
        session_id: &str,
        user_message: &str,
        limit: usize,
    ) -> CoreResult<Vec<Fact>> {
        let recent = self.facts(session_id, None)?;
        let query_words: Vec<String> = user_message
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| w.len() >= 3)
            .map(str::to_string)
            .collect();

        let mut matching: Vec<Fact> = Vec::new();
        let mut rest: Vec<Fact> = Vec::new();
        for fact in recent {
            let content = fact.content.to_lowercase();
            if query_words.iter().any(|w| content.contains(w.as_str())) {
                matching.push(fact);
            } else {
                rest.push(fact);
            }
        }
        matching.extend(rest);
        matching.truncate(limit);
        Ok(matching)
    }

    pub fn save_conversation_summary(&self, session_id: &str, summary: &str) -> CoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO conversations (session_id, summary, timestamp)
             VALUES (?1, ?2, ?3)",
            params![session_id, summary, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn conversation_summary(&self, session_id: &str) -> CoreResult<Option<String>> {
        let conn = self.lock()?;
        let summary = conn
            .query_row(
                "SELECT summary FROM conversations WHERE session_id = ?1",
                params![session_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .map(|s| s.unwrap_or_default())
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(summary)
    }

    pub fn record_file_change(
        &self,
        session_id: &str,
        file_path: &str,
        change_type: &str,
    ) -> CoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO file_changes (session_id, file_path, change_type, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, file_path, change_type, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn file_changes(&self, session_id: &str) -> CoreResult<Vec<FileChange>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT file_path, change_type, timestamp FROM file_changes
             WHERE session_id = ?1 ORDER BY id DESC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok(FileChange {
                file_path: row.get(0)?,
                change_type: row.get(1)?,
                timestamp: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

/// Render facts for context injection.
pub fn format_facts(facts: &[Fact]) -> String {
    if facts.is_empty() {
        return String::new();
    }
    let mut lines = vec!["[Key Facts from Previous Conversations]:".to_string()];
    for fact in facts {
        lines.push(format!("- {}", fact.content));
    }
    lines.join("\n")
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

struct FactPatterns {
    file: Regex,
    function: Regex,
    class: Regex,
    error: Regex,
    decision: Regex,
}

fn patterns() -> &'static FactPatterns {
    static PATTERNS: OnceLock<FactPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| FactPatterns {
        file: Regex::new(r"(?i)(?:created|added|modified|wrote)\s+(?:file|files)?\s*:?\s*([^\s,]+\.\w+)")
            .expect("static regex"),
        function: Regex::new(r"(?i)(?:added|created|implemented)\s+(?:function|method)\s+(\w+)")
            .expect("static regex"),
        class: Regex::new(r"(?i)(?:added|created|implemented)\s+class\s+(\w+)").expect("static regex"),
        error: Regex::new(r"(?i)(?:fixed|resolved|solved)\s+(?:error|bug|issue)\s*:?\s*(.+)")
            .expect("static regex"),
        decision: Regex::new(r"(?i)(?:decided|chose|selected)\s+(.+)").expect("static regex"),
    })
}

fn truncated(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Extract structured facts from a conversation. Only assistant messages
/// are mined; they describe the actions actually taken.
pub fn extract_facts(messages: &[Message]) -> Vec<Fact> {
    let mut facts: Vec<Fact> = Vec::new();
    for msg in messages {
        if msg.role != Role::Assistant {
            continue;
        }
        facts.extend(extract_from_text(&msg.content));
    }
    facts
}

fn extract_from_text(content: &str) -> Vec<Fact> {
    let p = patterns();
    let mut facts = Vec::new();

    for cap in p.file.captures_iter(content) {
        let path = cap[1].to_string();
        facts.push(Fact::new(
            FactKind::FileCreated,
            format!("File created: {path}"),
            serde_json::json!({ "file_path": path }),
        ));
    }
    for cap in p.function.captures_iter(content) {
        let name = cap[1].to_string();
        facts.push(Fact::new(
            FactKind::FunctionAdded,
            format!("Function added: {name}"),
            serde_json::json!({ "function_name": name }),
        ));
    }
    for cap in p.class.captures_iter(content) {
        let name = cap[1].to_string();
        facts.push(Fact::new(
            FactKind::ClassAdded,
            format!("Class added: {name}"),
            serde_json::json!({ "class_name": name }),
        ));
    }
    for cap in p.error.captures_iter(content) {
        let desc = cap[1].to_string();
        facts.push(Fact::new(
            FactKind::ErrorFixed,
            format!("Error fixed: {}", truncated(&desc, 100)),
            serde_json::json!({ "error_description": truncated(&desc, 200) }),
        ));
    }
    if let Some(cap) = p.decision.captures(content) {
        let decision = truncated(&cap[1], 200);
        facts.push(Fact::new(
            FactKind::DecisionMade,
            format!("Decision: {decision}"),
            serde_json::json!({ "decision": decision }),
        ));
    }

    facts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FactsStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = FactsStore::open(&tmp.path().join("memory.db")).unwrap();
        (tmp, store)
    }

    #[test]
    fn extraction_matches_action_patterns() {
        let messages = vec![
            Message::user("please add auth"),
            Message::assistant(
                "I created file: auth.py and implemented function verify_token. \
                 Also fixed bug: token expiry was ignored. We decided JWT for sessions.",
            ),
        ];
        let facts = extract_facts(&messages);

        assert!(facts
            .iter()
            .any(|f| f.kind == FactKind::FileCreated && f.content.contains("auth.py")));
        assert!(facts
            .iter()
            .any(|f| f.kind == FactKind::FunctionAdded && f.content.contains("verify_token")));
        assert!(facts
            .iter()
            .any(|f| f.kind == FactKind::ErrorFixed && f.content.contains("token expiry")));
        assert!(facts.iter().any(|f| f.kind == FactKind::DecisionMade));
    }

    #[test]
    fn user_messages_are_not_mined() {
        let messages = vec![Message::user("I created file: fake.py")];
        assert!(extract_facts(&messages).is_empty());
    }

    #[test]
    fn duplicate_content_is_skipped_on_save() {
        let (_tmp, store) = store();
        let fact = Fact::new(
            FactKind::FileCreated,
            "File created: a.py".into(),
            serde_json::json!({}),
        );
        assert_eq!(store.save_facts("s1", &[fact.clone()]).unwrap(), 1);
        assert_eq!(store.save_facts("s1", &[fact.clone()]).unwrap(), 0);
        // Same content in another session is independent.
        assert_eq!(store.save_facts("s2", &[fact]).unwrap(), 1);

        let facts = store.facts("s1", None).unwrap();
        assert_eq!(facts.len(), 1);
    }

    #[test]
    fn facts_return_newest_first_with_substring_filter() {
        let (_tmp, store) = store();
        for i in 0..3 {
            store
                .save_facts(
                    "s1",
                    &[Fact::new(
                        FactKind::FunctionAdded,
                        format!("Function added: handler_{i}"),
                        serde_json::json!({}),
                    )],
                )
                .unwrap();
        }

        let all = store.facts("s1", None).unwrap();
        assert_eq!(all[0].content, "Function added: handler_2");

        let filtered = store.facts("s1", Some("handler_1")).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].kind, FactKind::FunctionAdded);
    }

    #[test]
    fn relevant_facts_rank_word_matches_before_recency() {
        let (_tmp, store) = store();
        store
            .save_facts(
                "s1",
                &[
                    Fact::new(
                        FactKind::FileCreated,
                        "File created: billing.py".into(),
                        serde_json::json!({}),
                    ),
                    Fact::new(
                        FactKind::FileCreated,
                        "File created: parser.py".into(),
                        serde_json::json!({}),
                    ),
                ],
            )
            .unwrap();

        let relevant = store
            .relevant_facts("s1", "update the billing module", 10)
            .unwrap();
        assert_eq!(relevant[0].content, "File created: billing.py");
    }

    #[test]
    fn conversation_summary_upserts_by_session() {
        let (_tmp, store) = store();
        assert!(store.conversation_summary("s1").unwrap().is_none());
        store.save_conversation_summary("s1", "first").unwrap();
        store.save_conversation_summary("s1", "second").unwrap();
        assert_eq!(store.conversation_summary("s1").unwrap().unwrap(), "second");
    }

    #[test]
    fn file_change_journal_is_recency_ordered() {
        let (_tmp, store) = store();
        store.record_file_change("s1", "a.py", "create").unwrap();
        store.record_file_change("s1", "a.py", "modify").unwrap();
        let changes = store.file_changes("s1").unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].change_type, "modify");
    }
}
