//! Merges the fetched backlog and live channel events into one ordered,
//! duplicate-free log.
//!
//! Ordering is arrival order: history first, then live events as the channel
//! delivers them. Nothing is re-sorted by timestamp. Identity is the message
//! id; the first copy of an id wins and later copies are dropped, which
//! absorbs the overlap between a history fetch and a freshly opened channel.

use std::collections::HashSet;

use super::events::{Message, MessageId, MessageKind};

/// Result of offering an event to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Id already present (or previously deleted); nothing changed.
    Duplicate,
    /// System notice, kept out of the log but retained for this session.
    Notice,
}

#[derive(Debug, Default)]
pub struct MessageLog {
    entries: Vec<Message>,
    ids: HashSet<MessageId>,
    /// Ids removed during this session. A stale history copy must not bring
    /// them back.
    deleted: HashSet<MessageId>,
    notices: Vec<Message>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    /// Transient system notices seen during this session, oldest first.
    pub fn notices(&self) -> &[Message] {
        &self.notices
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    /// Append a live event unless its id is already known.
    pub fn insert(&mut self, message: Message) -> InsertOutcome {
        if message.kind == MessageKind::System {
            self.notices.push(message);
            return InsertOutcome::Notice;
        }
        if self.ids.contains(&message.id) || self.deleted.contains(&message.id) {
            return InsertOutcome::Duplicate;
        }
        self.ids.insert(message.id);
        self.entries.push(message);
        InsertOutcome::Inserted
    }

    /// Remove by id. Unknown ids are ignored; returns whether anything was
    /// removed.
    pub fn remove(&mut self, id: &MessageId) -> bool {
        self.deleted.insert(*id);
        if !self.ids.remove(id) {
            return false;
        }
        self.entries.retain(|m| m.id != *id);
        true
    }

    /// Fold a history fetch into the log.
    ///
    /// Each new entry lands right after the nearest earlier history entry the
    /// log already holds, or at the front when there is none. A first fetch
    /// therefore goes ahead of live entries, and a refetch after a reconnect
    /// fills the gap where it happened. Returns the number of entries added.
    pub fn merge_history(&mut self, history: Vec<Message>) -> usize {
        let mut anchor = 0;
        let mut added = 0;
        for message in history {
            if message.kind == MessageKind::System || self.deleted.contains(&message.id) {
                continue;
            }
            if self.ids.contains(&message.id) {
                if let Some(pos) = self.entries.iter().position(|m| m.id == message.id) {
                    anchor = pos + 1;
                }
                continue;
            }
            self.ids.insert(message.id);
            self.entries.insert(anchor, message);
            anchor += 1;
            added += 1;
        }
        added
    }

    /// Replace the log with a fresh fetch (manual reload without a channel).
    /// The server is authoritative, so local tombstones are dropped too.
    pub fn replace_with_history(&mut self, history: Vec<Message>) {
        self.entries.clear();
        self.ids.clear();
        self.deleted.clear();
        self.merge_history(history);
    }
}
