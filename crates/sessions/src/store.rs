//! The session store — per-session history, locks, and eviction.
//!
//! Two async locks exist per session, kept in maps separate from the
//! entries:
//! - the **loop lock**, held by the runner for the whole turn;
//! - the **history lock**, a finer lock covering history mutation inside
//!   the invoker and compaction.
//!
//! Eviction runs on request entry: idle-beyond-TTL sessions are deleted,
//! then the LRU oldest are dropped past the session cap.  A session whose
//! lock is held is never evicted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;

use cadence_domain::message::{Message, Role, ToolCall, Usage};

use crate::browser;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session entry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One session's state.  Value-typed; locks live outside.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub session_id: String,
    pub history: Vec<Message>,
    pub last_access: Instant,
    /// Working directory selected by the client (`select_cwd`).  Stored,
    /// never interpreted by the runtime.
    pub cwd: Option<String>,
    pub title: Option<String>,
    pub user_ref: Option<String>,
    // Aggregate counters across turns.
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
}

impl SessionEntry {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            history: Vec::new(),
            last_access: Instant::now(),
            cwd: None,
            title: None,
            user_ref: None,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            total_cost: 0.0,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionStore {
    entries: RwLock<HashMap<String, SessionEntry>>,
    loop_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    history_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    ttl: Duration,
    max_sessions: usize,
}

impl SessionStore {
    pub fn new(ttl: Duration, max_sessions: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            loop_locks: Mutex::new(HashMap::new()),
            history_locks: Mutex::new(HashMap::new()),
            ttl,
            max_sessions,
        }
    }

    /// Resolve a session id, creating the entry if needed.  `None` mints a
    /// fresh id.  Touches `last_access`.
    pub fn get_or_create(&self, session_id: Option<&str>) -> String {
        let sid = session_id
            .map(str::to_string)
            .unwrap_or_else(|| format!("session_{}", &uuid::Uuid::new_v4().simple().to_string()[..16]));

        let mut entries = self.entries.write();
        entries
            .entry(sid.clone())
            .and_modify(|e| e.last_access = Instant::now())
            .or_insert_with(|| SessionEntry::new(&sid));
        sid
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.entries.read().contains_key(session_id)
    }

    /// Snapshot of a session's history (empty if unknown).
    pub fn history(&self, session_id: &str) -> Vec<Message> {
        self.entries
            .read()
            .get(session_id)
            .map(|e| e.history.clone())
            .unwrap_or_default()
    }

    /// Snapshot of the full entry.
    pub fn entry(&self, session_id: &str) -> Option<SessionEntry> {
        self.entries.read().get(session_id).cloned()
    }

    pub fn touch(&self, session_id: &str) {
        if let Some(e) = self.entries.write().get_mut(session_id) {
            e.last_access = Instant::now();
        }
    }

    pub fn set_cwd(&self, session_id: &str, cwd: Option<String>) {
        if let Some(e) = self.entries.write().get_mut(session_id) {
            e.cwd = cwd;
        }
    }

    pub fn set_title(&self, session_id: &str, title: String) {
        if let Some(e) = self.entries.write().get_mut(session_id) {
            e.title = Some(title);
        }
    }

    pub fn set_user_ref(&self, session_id: &str, user_ref: String) {
        if let Some(e) = self.entries.write().get_mut(session_id) {
            e.user_ref = Some(user_ref);
        }
    }

    /// Accumulate turn usage and cost onto the session counters.
    pub fn record_usage(&self, session_id: &str, usage: &Usage, cost: f64) {
        if let Some(e) = self.entries.write().get_mut(session_id) {
            e.input_tokens += usage.input_tokens;
            e.output_tokens += usage.output_tokens;
            e.total_tokens += usage.total_tokens;
            e.total_cost += cost;
        }
    }

    // ── Locks ─────────────────────────────────────────────────────

    /// The turn-scoped loop lock for a session.
    pub fn loop_lock(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        Self::lock_for(&self.loop_locks, session_id)
    }

    /// The finer history-mutation lock for a session.
    pub fn history_lock(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        Self::lock_for(&self.history_locks, session_id)
    }

    fn lock_for(
        map: &Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
        session_id: &str,
    ) -> Arc<AsyncMutex<()>> {
        map.lock()
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn is_locked(&self, session_id: &str) -> bool {
        let held = |map: &Mutex<HashMap<String, Arc<AsyncMutex<()>>>>| {
            map.lock()
                .get(session_id)
                .map(|l| l.try_lock().is_err())
                .unwrap_or(false)
        };
        held(&self.loop_locks) || held(&self.history_locks)
    }

    // ── History mutation ──────────────────────────────────────────

    /// Record a plain assistant turn: user messages then the assistant
    /// response.  The new assistant message keeps `provider_raw` verbatim;
    /// prior assistants are demoted to canonical form (their signatures
    /// are never replayed).
    pub fn append_assistant(&self, session_id: &str, user_msgs: &[Message], assistant: Message) {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(session_id) else {
            return;
        };
        demote_prior_assistants(&mut entry.history);
        entry.history.extend(user_msgs.iter().cloned());
        entry.history.push(assistant);
        entry.last_access = Instant::now();
    }

    /// Record a tool interaction: user messages, the assistant message
    /// carrying `tool_calls` (and `provider_raw`), then the tool results.
    /// Stale browser page snapshots are invalidated when the batch carries
    /// a fresh one.
    pub fn append_tool_interaction(
        &self,
        session_id: &str,
        user_msgs: &[Message],
        assistant: Message,
        tool_results: &[Message],
    ) {
        let has_new_page = tool_results.iter().any(|tr| {
            tr.tool_name
                .as_deref()
                .is_some_and(browser::is_browser_page_tool)
                && browser::is_browser_page_content(&tr.content)
        });

        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(session_id) else {
            return;
        };
        demote_prior_assistants(&mut entry.history);
        entry.history.extend(user_msgs.iter().cloned());
        entry.history.push(assistant);
        entry.history.extend(tool_results.iter().cloned());
        entry.last_access = Instant::now();

        if has_new_page {
            let n = browser::invalidate_stale_snapshots(&mut entry.history);
            if n > 0 {
                tracing::info!(session_id, replaced = n, "invalidated stale page snapshots");
            }
        }
    }

    /// Append extra tool calls and results to an existing interaction
    /// (chained follow-ups have no originating LLM message).
    pub fn append_chained_interaction(
        &self,
        session_id: &str,
        calls: &[ToolCall],
        tool_results: &[Message],
    ) {
        let assistant = Message::assistant_with_calls("", calls.to_vec());
        self.append_tool_interaction(session_id, &[], assistant, tool_results);
    }

    /// Replace the content of the tool result matching `tool_call_id`.
    /// Exactly one message changes; order is preserved.  Returns whether a
    /// match was found.
    pub fn replace_tool_result(
        &self,
        session_id: &str,
        tool_call_id: &str,
        output: &str,
        tool_name: Option<&str>,
    ) -> bool {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(session_id) else {
            return false;
        };
        for msg in entry.history.iter_mut() {
            if msg.role == Role::Tool && msg.tool_call_id.as_deref() == Some(tool_call_id) {
                msg.content = output.to_string();
                if let Some(name) = tool_name {
                    msg.tool_name = Some(name.to_string());
                }
                return true;
            }
        }
        false
    }

    /// Overwrite a session's history (compaction writes back through this).
    pub fn set_history(&self, session_id: &str, history: Vec<Message>) {
        if let Some(e) = self.entries.write().get_mut(session_id) {
            e.history = history;
            e.last_access = Instant::now();
        }
    }

    // ── Eviction ──────────────────────────────────────────────────

    /// Delete idle-beyond-TTL sessions, then LRU-evict past the cap.
    /// Locked sessions are never evicted.  Returns the evicted session
    /// ids so the caller can drop any per-session state it keeps
    /// elsewhere (pending approvals, chain cursors, TODO plans).
    pub fn evict(&self) -> Vec<String> {
        let now = Instant::now();

        let mut evicted: Vec<String> = {
            let entries = self.entries.read();
            entries
                .iter()
                .filter(|(sid, e)| {
                    now.duration_since(e.last_access) > self.ttl && !self.is_locked(sid)
                })
                .map(|(sid, _)| sid.clone())
                .collect()
        };
        for sid in &evicted {
            self.remove(sid);
        }
        if !evicted.is_empty() {
            tracing::info!(count = evicted.len(), "evicted expired session(s)");
        }

        let over = self.entries.read().len().saturating_sub(self.max_sessions);
        if over > 0 {
            let mut candidates: Vec<(String, Instant)> = {
                let entries = self.entries.read();
                entries
                    .iter()
                    .filter(|(sid, _)| !self.is_locked(sid))
                    .map(|(sid, e)| (sid.clone(), e.last_access))
                    .collect()
            };
            candidates.sort_by_key(|(_, t)| *t);
            let mut lru_evicted = 0;
            for (sid, _) in candidates.into_iter().take(over) {
                self.remove(&sid);
                evicted.push(sid);
                lru_evicted += 1;
            }
            if lru_evicted > 0 {
                tracing::info!(count = lru_evicted, "evicted session(s) over cap");
            }
        }

        evicted
    }

    fn remove(&self, session_id: &str) {
        self.entries.write().remove(session_id);
        self.loop_locks.lock().remove(session_id);
        self.history_locks.lock().remove(session_id);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    #[cfg(test)]
    fn backdate(&self, session_id: &str, by: Duration) {
        if let Some(e) = self.entries.write().get_mut(session_id) {
            e.last_access = Instant::now() - by;
        }
    }
}

/// Strip `provider_raw` from every assistant message.  Called before a new
/// assistant turn lands so only the most recent one replays raw metadata.
fn demote_prior_assistants(history: &mut [Message]) {
    for msg in history.iter_mut() {
        if msg.role == Role::Assistant {
            msg.provider_raw = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::new(Duration::from_secs(3_600), 100)
    }

    #[test]
    fn get_or_create_mints_and_reuses() {
        let store = store();
        let sid = store.get_or_create(None);
        assert!(sid.starts_with("session_"));
        assert!(store.exists(&sid));

        let same = store.get_or_create(Some(&sid));
        assert_eq!(same, sid);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn append_assistant_orders_history() {
        let store = store();
        let sid = store.get_or_create(Some("s1"));
        store.append_assistant(&sid, &[Message::user("Hi")], Message::assistant("Hello!"));

        let history = store.history(&sid);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].content, "Hello!");
    }

    #[test]
    fn only_latest_assistant_keeps_provider_raw() {
        let store = store();
        let sid = store.get_or_create(Some("s1"));

        let mut first = Message::assistant("one");
        first.provider_raw = Some(serde_json::json!({"sig": 1}));
        store.append_assistant(&sid, &[Message::user("a")], first);

        let mut second = Message::assistant("two");
        second.provider_raw = Some(serde_json::json!({"sig": 2}));
        store.append_assistant(&sid, &[Message::user("b")], second);

        let history = store.history(&sid);
        assert!(history[1].provider_raw.is_none(), "prior assistant demoted");
        assert_eq!(
            history[3].provider_raw,
            Some(serde_json::json!({"sig": 2}))
        );
    }

    #[test]
    fn replace_tool_result_changes_exactly_one() {
        let store = store();
        let sid = store.get_or_create(Some("s1"));
        let calls = vec![
            ToolCall {
                id: "c1".into(),
                name: "browser_navigate".into(),
                args: serde_json::json!({"url": "https://x"}),
            },
            ToolCall {
                id: "c2".into(),
                name: "bash".into(),
                args: serde_json::json!({}),
            },
        ];
        store.append_tool_interaction(
            &sid,
            &[Message::user("go")],
            Message::assistant_with_calls("", calls),
            &[
                Message::tool_result("c1", "browser_navigate", "{\"url\":\"https://x\"}"),
                Message::tool_result("c2", "bash", "done"),
            ],
        );

        let before = store.history(&sid);
        assert!(store.replace_tool_result(&sid, "c1", "Page: \"X\" URL: https://x", None));
        let after = store.history(&sid);

        assert_eq!(before.len(), after.len(), "no reorder, no insertion");
        let changed: Vec<usize> = before
            .iter()
            .zip(after.iter())
            .enumerate()
            .filter(|(_, (b, a))| b != a)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(changed.len(), 1);
        assert!(after[changed[0]].content.starts_with("Page:"));

        assert!(!store.replace_tool_result(&sid, "missing", "x", None));
    }

    #[test]
    fn ttl_eviction_skips_locked_sessions() {
        let store = SessionStore::new(Duration::from_millis(10), 100);
        let idle = store.get_or_create(Some("idle"));
        let locked = store.get_or_create(Some("locked"));
        store.backdate(&idle, Duration::from_secs(60));
        store.backdate(&locked, Duration::from_secs(60));

        let lock = store.loop_lock(&locked);
        let _guard = lock.try_lock().unwrap();

        let evicted = store.evict();
        assert_eq!(evicted, vec!["idle".to_string()]);
        assert!(!store.exists(&idle));
        assert!(store.exists(&locked), "locked session survives TTL");
    }

    #[test]
    fn lru_eviction_drops_oldest_unlocked() {
        let store = SessionStore::new(Duration::from_secs(3_600), 2);
        let oldest = store.get_or_create(Some("oldest"));
        let middle = store.get_or_create(Some("middle"));
        let newest = store.get_or_create(Some("newest"));
        store.backdate(&oldest, Duration::from_secs(30));
        store.backdate(&middle, Duration::from_secs(20));

        let evicted = store.evict();
        assert_eq!(evicted, vec!["oldest".to_string()]);
        assert!(!store.exists(&oldest));
        assert!(store.exists(&middle));
        assert!(store.exists(&newest));
    }

    #[test]
    fn tool_interaction_invalidates_stale_snapshots() {
        let store = store();
        let sid = store.get_or_create(Some("s1"));
        let page = |url: &str| format!("Page: \"T\" URL: {url}\n[Interactive Elements]\n...");

        let nav = |id: &str, url: &str| {
            (
                vec![ToolCall {
                    id: id.into(),
                    name: "browser_navigate".into(),
                    args: serde_json::json!({"url": url}),
                }],
                vec![Message::tool_result(id, "browser_navigate", page(url))],
            )
        };

        let (calls, results) = nav("c1", "https://a");
        store.append_tool_interaction(
            &sid,
            &[Message::user("a")],
            Message::assistant_with_calls("", calls),
            &results,
        );
        let (calls, results) = nav("c2", "https://b");
        store.append_tool_interaction(
            &sid,
            &[],
            Message::assistant_with_calls("", calls),
            &results,
        );

        let history = store.history(&sid);
        let first_snapshot = history
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("c1"))
            .unwrap();
        assert!(first_snapshot
            .content
            .starts_with("[Stale page snapshot replaced]"));
        let latest = history
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("c2"))
            .unwrap();
        assert!(latest.content.starts_with("Page:"));
    }

    #[test]
    fn usage_accumulates() {
        let store = store();
        let sid = store.get_or_create(Some("s1"));
        let usage = Usage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
            ..Default::default()
        };
        store.record_usage(&sid, &usage, 0.01);
        store.record_usage(&sid, &usage, 0.02);

        let entry = store.entry(&sid).unwrap();
        assert_eq!(entry.total_tokens, 30);
        assert!((entry.total_cost - 0.03).abs() < 1e-9);
    }
}
