use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::connection::Invoker;

pub const CONVERSATION_LOAD_METHOD: &str = "conversationLoad";

/// One message as the protocol service reports it. Only `cid` and `sentDate`
/// are interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    pub cid: String,
    #[serde(default)]
    pub sent_date: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Interaction {
    pub fn new(cid: impl Into<String>) -> Self {
        Self {
            cid: cid.into(),
            sent_date: 0,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum LoadOutcome {
    /// Another fetch for this conversation is still running.
    InFlight,
    /// Nothing older is left to fetch.
    Exhausted,
    Loaded { count: usize },
    /// The fetch failed; the conversation is now considered exhausted.
    Failed,
    /// The cursor was reset while the fetch was running.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorSnapshot {
    pub conversation_id: String,
    pub ref_cid: Option<String>,
    pub fetch_in_flight: bool,
    pub exhausted: bool,
    pub loaded: usize,
}

#[derive(Default)]
struct ConversationCursor {
    // Newest first by (sent_date, cid), whatever order pages arrive in.
    messages: Vec<Interaction>,
    cids: HashSet<String>,
    fetch: Option<u64>,
    exhausted: bool,
}

impl ConversationCursor {
    fn seeded(known: Vec<Interaction>) -> Self {
        let mut cursor = Self::default();
        cursor.merge(known);
        cursor.exhausted = cursor.messages.is_empty();
        cursor
    }

    fn oldest_cid(&self) -> Option<String> {
        self.messages.last().map(|message| message.cid.clone())
    }

    /// Adds unseen messages and returns how many there were.
    fn merge(&mut self, page: Vec<Interaction>) -> usize {
        let before = self.messages.len();
        for message in page {
            if self.cids.insert(message.cid.clone()) {
                self.messages.push(message);
            }
        }
        let added = self.messages.len() - before;
        if added > 0 {
            self.messages
                .sort_by(|a, b| (b.sent_date, &b.cid).cmp(&(a.sent_date, &a.cid)));
        }
        added
    }

    fn snapshot(&self, conversation_id: &str) -> CursorSnapshot {
        CursorSnapshot {
            conversation_id: conversation_id.to_string(),
            ref_cid: self.oldest_cid(),
            fetch_in_flight: self.fetch.is_some(),
            exhausted: self.exhausted,
            loaded: self.messages.len(),
        }
    }
}

/// Serves backward history loads, one fetch at a time per conversation.
pub struct PaginationEngine {
    invoker: Arc<dyn Invoker>,
    page_size: u32,
    cursors: Mutex<HashMap<String, ConversationCursor>>,
    next_fetch: AtomicU64,
}

impl PaginationEngine {
    pub fn new(invoker: Arc<dyn Invoker>, page_size: u32) -> Self {
        Self {
            invoker,
            page_size: page_size.max(1),
            cursors: Mutex::new(HashMap::new()),
            next_fetch: AtomicU64::new(1),
        }
    }

    fn cursors(&self) -> MutexGuard<'_, HashMap<String, ConversationCursor>> {
        self.cursors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start tracking a conversation with the messages the caller already shows.
    /// A conversation opened with nothing is exhausted from the start.
    pub fn open(&self, conversation_id: &str, known: Vec<Interaction>) -> CursorSnapshot {
        let mut cursors = self.cursors();
        if let Some(cursor) = cursors.get_mut(conversation_id) {
            cursor.merge(known);
            return cursor.snapshot(conversation_id);
        }

        let cursor = ConversationCursor::seeded(known);
        let snapshot = cursor.snapshot(conversation_id);
        cursors.insert(conversation_id.to_string(), cursor);
        snapshot
    }

    /// Merge messages that arrived live. Never clears exhaustion.
    pub fn record(&self, conversation_id: &str, fresh: Vec<Interaction>) -> usize {
        let mut cursors = self.cursors();
        if let Some(cursor) = cursors.get_mut(conversation_id) {
            return cursor.merge(fresh);
        }

        let cursor = ConversationCursor::seeded(fresh);
        let added = cursor.messages.len();
        cursors.insert(conversation_id.to_string(), cursor);
        added
    }

    pub fn snapshot(&self, conversation_id: &str) -> Option<CursorSnapshot> {
        self.cursors()
            .get(conversation_id)
            .map(|cursor| cursor.snapshot(conversation_id))
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<Interaction> {
        self.cursors()
            .get(conversation_id)
            .map(|cursor| cursor.messages.clone())
            .unwrap_or_default()
    }

    /// Drop all cursors, as when the session ends. In-flight fetches become stale.
    pub fn reset(&self) {
        self.cursors().clear();
    }

    pub async fn load_more(&self, conversation_id: &str) -> LoadOutcome {
        let (token, ref_cid) = {
            let mut cursors = self.cursors();
            let cursor = cursors
                .entry(conversation_id.to_string())
                .or_insert_with(|| ConversationCursor::seeded(Vec::new()));

            if cursor.fetch.is_some() {
                return LoadOutcome::InFlight;
            }
            if cursor.exhausted {
                return LoadOutcome::Exhausted;
            }

            let token = self.next_fetch.fetch_add(1, Ordering::Relaxed);
            cursor.fetch = Some(token);
            (token, cursor.oldest_cid())
        };

        let mut guard = FetchGuard {
            engine: self,
            conversation_id,
            token,
            armed: true,
        };

        let params = json!({
            "options": {
                "conversationPk": conversation_id,
                "refCid": ref_cid,
                "amount": self.page_size,
            }
        });
        let result = self
            .invoker
            .invoke(CONVERSATION_LOAD_METHOD, params)
            .await;
        guard.armed = false;

        let mut cursors = self.cursors();
        let Some(cursor) = cursors
            .get_mut(conversation_id)
            .filter(|cursor| cursor.fetch == Some(token))
        else {
            return LoadOutcome::Superseded;
        };
        cursor.fetch = None;

        let page = match result {
            Ok(value) => parse_page(&value),
            Err(error) => {
                tracing::warn!(conversation_id, %error, "history fetch failed; marking exhausted");
                cursor.exhausted = true;
                return LoadOutcome::Failed;
            }
        };

        let fetched = page.len();
        let added = cursor.merge(page);
        if fetched < self.page_size as usize || added == 0 {
            cursor.exhausted = true;
        }
        tracing::debug!(
            conversation_id,
            fetched,
            added,
            exhausted = cursor.exhausted,
            "history page loaded"
        );

        if added == 0 {
            LoadOutcome::Exhausted
        } else {
            LoadOutcome::Loaded { count: added }
        }
    }
}

/// Releases the in-flight slot if a `load_more` future is dropped mid-fetch.
struct FetchGuard<'a> {
    engine: &'a PaginationEngine,
    conversation_id: &'a str,
    token: u64,
    armed: bool,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(cursor) = self.engine.cursors().get_mut(self.conversation_id) {
            if cursor.fetch == Some(self.token) {
                cursor.fetch = None;
            }
        }
    }
}

fn parse_page(value: &Value) -> Vec<Interaction> {
    value
        .get("interactions")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value::<Interaction>(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}
