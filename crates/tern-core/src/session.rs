//! Session persistence with the active-pointer index.
//!
//! Each conversation is a JSONL file under the sessions directory: a
//! metadata header line, then one line per message. `active.json` maps a
//! stable base key (`channel:chat_id`) to the current active key
//! (`base#yyyymmddHHMMSS`); `/new` mints a fresh active key and the old
//! file stays readable. Keys that already carry a `#` suffix address an
//! exact session file and bypass the index entirely (the web channel
//! pins sessions this way to avoid races).
//!
//! All file and index writes go through temp-file-then-rename so a crash
//! never leaves a partially written file; the worst case is that the
//! previously active session stays current.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Local, Utc};
use tracing::{debug, warn};

use tern_types::{Result, Session, TernError};

/// Summary of a stored session, as returned by
/// [`list_sessions`](SessionStore::list_sessions).
#[derive(Debug, Clone)]
pub struct SessionSummary {
    /// Session key recorded in the metadata header.
    pub key: String,
    /// Creation time from the header.
    pub created_at: Option<String>,
    /// Last-update time from the header.
    pub updated_at: Option<String>,
    /// Backing file.
    pub path: PathBuf,
}

/// Manages conversation sessions on disk.
pub struct SessionStore {
    sessions_dir: PathBuf,
    index_path: PathBuf,
    active: Mutex<HashMap<String, String>>,
    cache: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    /// Create a store rooted at `sessions_dir`, loading the active index.
    pub fn new(sessions_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&sessions_dir).map_err(TernError::Io)?;
        let index_path = sessions_dir.join("active.json");
        let active = load_index(&index_path);
        Ok(Self {
            sessions_dir,
            index_path,
            active: Mutex::new(active),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// The directory session files live in.
    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    /// Get the current session for a key, creating one when none exists.
    ///
    /// Base keys resolve through the active index (adopting a legacy
    /// base-key file when present); keys with a `#` suffix load their
    /// exact file.
    pub fn get_or_create(&self, key: &str) -> Session {
        if key.contains('#') {
            if let Some(cached) = self.cache.lock().unwrap().get(key).cloned() {
                return cached;
            }
            let session = self.load(key).unwrap_or_else(|| Session::new(key));
            self.cache
                .lock()
                .unwrap()
                .insert(key.to_string(), session.clone());
            return session;
        }

        let active_key = self.active.lock().unwrap().get(key).cloned();
        if let Some(active_key) = active_key {
            if let Some(cached) = self.cache.lock().unwrap().get(&active_key).cloned() {
                return cached;
            }
            let session = self
                .load(&active_key)
                .unwrap_or_else(|| Session::new(&active_key));
            self.cache
                .lock()
                .unwrap()
                .insert(active_key, session.clone());
            return session;
        }

        // Legacy layout: a file named after the bare base key.
        if let Some(legacy) = self.load(key) {
            self.set_active(key, key);
            self.cache
                .lock()
                .unwrap()
                .insert(key.to_string(), legacy.clone());
            return legacy;
        }

        let new_key = self.mint_key(key);
        let session = Session::new(&new_key);
        self.set_active(key, &new_key);
        self.cache
            .lock()
            .unwrap()
            .insert(new_key, session.clone());
        session
    }

    /// Mint and activate a fresh session for a base key.
    ///
    /// The new key's timestamp suffix is strictly greater than the
    /// previous active key's, even within the same second.
    pub fn start_new(&self, base_key: &str) -> Session {
        let new_key = self.mint_key(base_key);
        let session = Session::new(&new_key);
        self.set_active(base_key, &new_key);
        self.cache
            .lock()
            .unwrap()
            .insert(new_key, session.clone());
        session
    }

    /// Persist a session: metadata header plus one line per message,
    /// written atomically. Updates the in-memory cache.
    pub fn save(&self, session: &Session) -> Result<()> {
        let path = self.session_path(&session.key);

        let header = serde_json::json!({
            "_type": "metadata",
            "key": session.key,
            "created_at": session.created_at.to_rfc3339(),
            "updated_at": session.updated_at.to_rfc3339(),
            "metadata": session.metadata,
        });
        let mut content = serde_json::to_string(&header)?;
        content.push('\n');
        for msg in &session.messages {
            content.push_str(&serde_json::to_string(msg)?);
            content.push('\n');
        }

        write_atomic(&path, &content)?;
        self.cache
            .lock()
            .unwrap()
            .insert(session.key.clone(), session.clone());
        debug!(key = %session.key, messages = session.messages.len(), "saved session");
        Ok(())
    }

    /// Delete a session file; clears the active pointer when it pointed
    /// at the deleted key. Returns whether a file was removed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        self.cache.lock().unwrap().remove(key);

        let base_to_clear = {
            let active = self.active.lock().unwrap();
            active
                .iter()
                .find(|(_, v)| v.as_str() == key)
                .map(|(k, _)| k.clone())
        };
        if let Some(base) = base_to_clear {
            self.active.lock().unwrap().remove(&base);
            self.persist_index();
        }

        let path = self.session_path(key);
        if path.exists() {
            std::fs::remove_file(&path).map_err(TernError::Io)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// All stored sessions, newest update first.
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut sessions = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.sessions_dir) else {
            return sessions;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Some(first_line) = content.lines().next() else {
                continue;
            };
            let Ok(header) = serde_json::from_str::<serde_json::Value>(first_line) else {
                continue;
            };
            if header.get("_type").and_then(|v| v.as_str()) != Some("metadata") {
                continue;
            }
            sessions.push(SessionSummary {
                key: header
                    .get("key")
                    .and_then(|v| v.as_str())
                    .unwrap_or_else(|| {
                        path.file_stem().and_then(|s| s.to_str()).unwrap_or("")
                    })
                    .to_string(),
                created_at: header
                    .get("created_at")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                updated_at: header
                    .get("updated_at")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                path,
            });
        }
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }

    /// Active key currently mapped to a base key.
    pub fn active_key(&self, base_key: &str) -> Option<String> {
        self.active.lock().unwrap().get(base_key).cloned()
    }

    /// Drop a session from the in-memory cache (next access reloads).
    pub fn invalidate(&self, key: &str) {
        self.cache.lock().unwrap().remove(key);
    }

    // ── Internals ────────────────────────────────────────────────────

    fn load(&self, key: &str) -> Option<Session> {
        let path = self.session_path(key);
        let content = std::fs::read_to_string(&path).ok()?;
        let mut lines = content.lines();

        let header: serde_json::Value = match lines.next().map(serde_json::from_str) {
            Some(Ok(v)) => v,
            _ => {
                warn!(key, "session file has no valid metadata header");
                return None;
            }
        };

        let created_at = header
            .get("created_at")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<DateTime<Utc>>().ok())
            .unwrap_or_else(Utc::now);
        let updated_at = header
            .get("updated_at")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<DateTime<Utc>>().ok())
            .unwrap_or_else(Utc::now);
        let metadata: HashMap<String, serde_json::Value> = header
            .get("metadata")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let mut messages = Vec::new();
        for line in lines {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<serde_json::Value>(trimmed) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!(key, error = %e, "skipping malformed session line"),
            }
        }

        debug!(key, messages = messages.len(), "loaded session from disk");
        Some(Session {
            key: key.to_string(),
            messages,
            created_at,
            updated_at,
            metadata,
        })
    }

    fn mint_key(&self, base_key: &str) -> String {
        let mut stamp: u64 = Local::now()
            .format("%Y%m%d%H%M%S")
            .to_string()
            .parse()
            .unwrap_or(0);
        let previous = self.active.lock().unwrap().get(base_key).cloned();
        if let Some(prev) = previous {
            if let Some(prev_stamp) = prev
                .rsplit_once('#')
                .and_then(|(_, s)| s.parse::<u64>().ok())
            {
                if stamp <= prev_stamp {
                    stamp = prev_stamp + 1;
                }
            }
        }
        format!("{base_key}#{stamp}")
    }

    fn set_active(&self, base_key: &str, session_key: &str) {
        self.active
            .lock()
            .unwrap()
            .insert(base_key.to_string(), session_key.to_string());
        self.persist_index();
    }

    fn persist_index(&self) {
        let snapshot = self.active.lock().unwrap().clone();
        let content = match serde_json::to_string_pretty(&snapshot) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to serialize session index");
                return;
            }
        };
        if let Err(e) = write_atomic(&self.index_path, &content) {
            warn!(error = %e, "failed to save session index");
        }
    }

    fn session_path(&self, key: &str) -> PathBuf {
        self.sessions_dir.join(format!("{}.jsonl", safe_filename(key)))
    }
}

/// Escape a session key into a safe filename.
///
/// `:` becomes `_`; path separators and other risky characters are
/// replaced; the `#` timestamp separator is preserved.
pub fn safe_filename(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            ':' | '/' | '\\' | '\0' | '<' | '>' | '"' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content).map_err(TernError::Io)?;
    std::fs::rename(&tmp, path).map_err(TernError::Io)
}

fn load_index(path: &Path) -> HashMap<String, String> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    match serde_json::from_str::<HashMap<String, String>>(&content) {
        Ok(index) => index,
        Err(e) => {
            warn!(error = %e, "failed to parse session index, starting fresh");
            HashMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (SessionStore, TempDir) {
        let dir = TempDir::new().unwrap();
        (SessionStore::new(dir.path().to_path_buf()).unwrap(), dir)
    }

    #[test]
    fn get_or_create_mints_timestamped_key() {
        let (s, _dir) = store();
        let session = s.get_or_create("feishu:123");
        assert!(session.key.starts_with("feishu:123#"));
        assert_eq!(s.active_key("feishu:123").unwrap(), session.key);
    }

    #[test]
    fn get_or_create_returns_same_active_session() {
        let (s, _dir) = store();
        let first = s.get_or_create("cli:direct");
        let second = s.get_or_create("cli:direct");
        assert_eq!(first.key, second.key);
    }

    #[test]
    fn save_and_reload_roundtrip_preserves_messages_and_metadata() {
        let (s, _dir) = store();
        let mut session = s.get_or_create("web:chat1");
        session.add_message("user", "hello world", None);
        let mut extras = HashMap::new();
        extras.insert("media".to_string(), serde_json::json!(["/tmp/a.png"]));
        session.add_message("assistant", "hi there", Some(extras));
        session
            .metadata
            .insert("llm_session".into(), serde_json::json!({"pending_reset": true}));
        s.save(&session).unwrap();

        s.invalidate(&session.key);
        let loaded = s.get_or_create("web:chat1");
        assert_eq!(loaded.key, session.key);
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[0]["content"], "hello world");
        assert_eq!(loaded.messages[1]["media"], serde_json::json!(["/tmp/a.png"]));
        assert_eq!(
            loaded.metadata["llm_session"]["pending_reset"],
            serde_json::json!(true)
        );
    }

    #[test]
    fn start_new_mints_strictly_greater_key() {
        let (s, _dir) = store();
        let first = s.get_or_create("web:chat");
        s.save(&first).unwrap();

        let second = s.start_new("web:chat");
        assert_ne!(first.key, second.key);
        let stamp = |k: &str| {
            k.rsplit_once('#')
                .unwrap()
                .1
                .parse::<u64>()
                .unwrap()
        };
        assert!(stamp(&second.key) > stamp(&first.key));

        // Back-to-back within the same second still increases.
        let third = s.start_new("web:chat");
        assert!(stamp(&third.key) > stamp(&second.key));

        // Previous file remains readable.
        assert!(s.sessions_dir().join(format!("{}.jsonl", safe_filename(&first.key))).exists());
    }

    #[test]
    fn pinned_hash_key_bypasses_index() {
        let (s, _dir) = store();
        let pinned = "web:chat:default#20260101120000";
        let mut session = s.get_or_create(pinned);
        assert_eq!(session.key, pinned);
        session.add_message("user", "pinned", None);
        s.save(&session).unwrap();

        // The index has no entry for the pinned key's base.
        assert!(s.active_key("web:chat:default").is_none());

        s.invalidate(pinned);
        let reloaded = s.get_or_create(pinned);
        assert_eq!(reloaded.messages.len(), 1);
    }

    #[test]
    fn legacy_base_key_file_is_adopted() {
        let (s, dir) = store();
        // A pre-index file named after the bare base key.
        let legacy_path = dir.path().join(format!("{}.jsonl", safe_filename("cli:old")));
        let header = serde_json::json!({
            "_type": "metadata",
            "key": "cli:old",
            "created_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-01-01T00:00:00Z",
            "metadata": {},
        });
        std::fs::write(
            &legacy_path,
            format!(
                "{}\n{}\n",
                header,
                serde_json::json!({"role": "user", "content": "old msg", "timestamp": "2025-01-01T00:00:00Z"})
            ),
        )
        .unwrap();

        let session = s.get_or_create("cli:old");
        assert_eq!(session.key, "cli:old");
        assert_eq!(session.messages.len(), 1);
        assert_eq!(s.active_key("cli:old").unwrap(), "cli:old");
    }

    #[test]
    fn delete_removes_file_and_pointer() {
        let (s, _dir) = store();
        let session = s.get_or_create("web:gone");
        s.save(&session).unwrap();
        assert!(s.delete(&session.key).unwrap());
        assert!(s.active_key("web:gone").is_none());
        assert!(!s.delete(&session.key).unwrap());
    }

    #[test]
    fn malformed_lines_are_skipped_on_load() {
        let (s, dir) = store();
        let key = "web:broken#20260101000000";
        let path = dir.path().join(format!("{}.jsonl", safe_filename(key)));
        let header = serde_json::json!({
            "_type": "metadata", "key": key,
            "created_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-01-01T00:00:00Z",
            "metadata": {},
        });
        std::fs::write(
            &path,
            format!(
                "{}\n{{not json\n{}\n",
                header,
                serde_json::json!({"role": "user", "content": "ok", "timestamp": "2025-01-01T00:00:00Z"})
            ),
        )
        .unwrap();

        let session = s.get_or_create(key);
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0]["content"], "ok");
    }

    #[test]
    fn index_survives_restart() {
        let dir = TempDir::new().unwrap();
        let key = {
            let s = SessionStore::new(dir.path().to_path_buf()).unwrap();
            let session = s.get_or_create("feishu:persist");
            s.save(&session).unwrap();
            session.key
        };
        let s2 = SessionStore::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(s2.active_key("feishu:persist").unwrap(), key);
        assert_eq!(s2.get_or_create("feishu:persist").key, key);
    }

    #[test]
    fn list_sessions_returns_headers_newest_first() {
        let (s, _dir) = store();
        let mut a = s.start_new("web:a");
        a.add_message("user", "x", None);
        s.save(&a).unwrap();
        let mut b = s.start_new("web:b");
        b.add_message("user", "y", None);
        s.save(&b).unwrap();

        let listed = s.list_sessions();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|l| l.key == a.key));
        assert!(listed.iter().any(|l| l.key == b.key));
        // Newest first.
        assert!(listed[0].updated_at >= listed[1].updated_at);
    }

    #[test]
    fn safe_filename_escapes_separators() {
        assert_eq!(safe_filename("web:chat/1"), "web_chat_1");
        assert_eq!(
            safe_filename("web:chat:default#20260101"),
            "web_chat_default#20260101"
        );
    }
}
