use serde::Serialize;
use uuid::Uuid;

use super::SlotId;
use super::search::Searchable;
use crate::error::ChatError;
use crate::session::{Message, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Mirrors a stored message.
    Committed,
    /// Optimistic copy of a user send that has not been confirmed yet.
    Echo,
    /// Local failure line; never persisted.
    Notice,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub slot: SlotId,
    pub role: Role,
    pub content: String,
    pub kind: EntryKind,
}

struct PlacedNotice {
    /// Number of committed entries preceding the notice when it was raised.
    after: usize,
    entry: Entry,
}

/// Display-side list of conversation entries.
///
/// Committed entries are always a mirror of the store; echoes and notices
/// live only here.
#[derive(Default)]
pub struct Transcript {
    committed: Vec<Entry>,
    echoes: Vec<Entry>,
    notices: Vec<PlacedNotice>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn echo(&mut self, content: impl Into<String>) -> SlotId {
        let slot = Uuid::new_v4();
        self.echoes.push(Entry { slot, role: Role::User, content: content.into(), kind: EntryKind::Echo });
        slot
    }

    pub fn discard_echo(&mut self, slot: SlotId) {
        self.echoes.retain(|e| e.slot != slot);
    }

    /// Replaces committed entries with `messages` and drops pending echoes.
    pub fn sync(&mut self, messages: &[Message]) {
        self.committed = messages
            .iter()
            .map(|m| Entry { slot: m.id, role: m.role, content: m.content.clone(), kind: EntryKind::Committed })
            .collect();
        self.echoes.clear();
    }

    pub fn push_notice(&mut self, error: &ChatError) -> SlotId {
        let slot = Uuid::new_v4();
        self.notices.push(PlacedNotice {
            after: self.committed.len(),
            entry: Entry { slot, role: Role::System, content: error.notice(), kind: EntryKind::Notice },
        });
        slot
    }

    /// Entries in display order: committed messages with notices at the
    /// position they were raised, then pending echoes.
    pub fn entries(&self) -> Vec<&Entry> {
        let mut out = Vec::with_capacity(self.committed.len() + self.echoes.len() + self.notices.len());
        let mut notices = self.notices.iter().peekable();
        for (i, entry) in self.committed.iter().enumerate() {
            while let Some(n) = notices.next_if(|n| n.after <= i) {
                out.push(&n.entry);
            }
            out.push(entry);
        }
        out.extend(notices.map(|n| &n.entry));
        out.extend(self.echoes.iter());
        out
    }

    pub fn len(&self) -> usize {
        self.committed.len() + self.echoes.len() + self.notices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.committed.clear();
        self.echoes.clear();
        self.notices.clear();
    }
}

impl Searchable for Entry {
    fn slot(&self) -> SlotId {
        self.slot
    }

    fn raw_text(&self) -> &str {
        &self.content
    }
}

impl Searchable for &Entry {
    fn slot(&self) -> SlotId {
        self.slot
    }

    fn raw_text(&self) -> &str {
        &self.content
    }
}
