use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use super::SlotId;
use super::format::{Span, plain};
use crate::session::{Message, MessageView};

/// Case-insensitive literal matcher for one query.
pub struct SearchOverlay {
    pattern: Regex,
}

impl SearchOverlay {
    /// `None` for an empty or whitespace-only query.
    pub fn new(query: &str) -> Option<Self> {
        if query.trim().is_empty() {
            return None;
        }
        let pattern = RegexBuilder::new(&regex::escape(query))
            .case_insensitive(true)
            .build()
            .ok()?;
        Some(Self { pattern })
    }

    pub fn highlight(&self, text: &str) -> Vec<Span> {
        let mut spans = Vec::new();
        let mut last = 0;
        for m in self.pattern.find_iter(text) {
            if m.start() > last {
                spans.push(Span::Text(text[last..m.start()].to_owned()));
            }
            spans.push(Span::Highlight(m.as_str().to_owned()));
            last = m.end();
        }
        if last < text.len() {
            spans.push(Span::Text(text[last..].to_owned()));
        }
        spans
    }
}

pub fn highlight_query(text: &str, query: &str) -> Vec<Span> {
    match SearchOverlay::new(query) {
        Some(overlay) => overlay.highlight(text),
        None => plain(text),
    }
}

/// Anything the transcript can search by its raw content.
pub trait Searchable {
    fn slot(&self) -> SlotId;
    fn raw_text(&self) -> &str;
}

impl Searchable for Message {
    fn slot(&self) -> SlotId { self.id }
    fn raw_text(&self) -> &str { &self.content }
}

impl Searchable for MessageView {
    fn slot(&self) -> SlotId { self.message.id }
    fn raw_text(&self) -> &str { &self.message.content }
}

/// First item, in display order, whose raw text contains `query` ignoring case.
pub fn find_first_match<'a, T: Searchable>(messages: &'a [T], query: &str) -> Option<&'a T> {
    if query.trim().is_empty() {
        return None;
    }
    let needle = query.to_lowercase();
    messages.iter().find(|m| m.raw_text().to_lowercase().contains(&needle))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "slot", rename_all = "snake_case")]
pub enum ScrollSignal {
    /// Bring this slot into the centre of the visible region.
    Center(SlotId),
    Clear,
}

#[derive(Debug, Clone, Default)]
pub struct SearchState {
    query: String,
    focused: Option<SlotId>,
}

impl SearchState {
    pub fn update<T: Searchable>(&mut self, query: &str, messages: &[T]) -> ScrollSignal {
        self.query = query.to_owned();
        self.focused = find_first_match(messages, query).map(Searchable::slot);
        match self.focused {
            Some(slot) => ScrollSignal::Center(slot),
            None => ScrollSignal::Clear,
        }
    }

    /// The active query, if it is not blank.
    pub fn query(&self) -> Option<&str> {
        Some(self.query.as_str()).filter(|q| !q.trim().is_empty())
    }

    pub fn focused(&self) -> Option<SlotId> {
        self.focused
    }

    pub fn close(&mut self) -> ScrollSignal {
        self.query.clear();
        self.focused = None;
        ScrollSignal::Clear
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;
    use chrono::Utc;
    use uuid::Uuid;

    fn msg(content: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            session_id: Uuid::nil(),
            role: Role::User,
            content: content.into(),
            model_id: None,
            token_count: None,
            response_time_ms: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn highlight_marks_case_insensitive_matches() {
        assert_eq!(
            highlight_query("Hello World", "world"),
            vec![Span::Text("Hello ".into()), Span::Highlight("World".into())]
        );
        assert_eq!(
            highlight_query("aXa xa", "xA"),
            vec![
                Span::Text("a".into()),
                Span::Highlight("Xa".into()),
                Span::Text(" ".into()),
                Span::Highlight("xa".into()),
            ]
        );
    }

    #[test]
    fn blank_query_leaves_text_unchanged() {
        assert_eq!(highlight_query("Hello World", ""), vec![Span::Text("Hello World".into())]);
        assert_eq!(highlight_query("Hello World", "   "), vec![Span::Text("Hello World".into())]);
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        assert_eq!(
            highlight_query("cost is $5.00 (approx)", "$5.00 ("),
            vec![
                Span::Text("cost is ".into()),
                Span::Highlight("$5.00 (".into()),
                Span::Text("approx)".into()),
            ]
        );
        assert_eq!(highlight_query("a.c", "."), vec![Span::Text("a".into()), Span::Highlight(".".into()), Span::Text("c".into())]);
    }

    #[test]
    fn first_match_in_display_order() {
        let messages = vec![msg("nothing here"), msg("Rust is fun"), msg("more rust")];
        let hit = find_first_match(&messages, "RUST").unwrap();
        assert_eq!(hit.id, messages[1].id);
        assert!(find_first_match(&messages, "python").is_none());
        assert!(find_first_match(&messages, " ").is_none());
    }

    #[test]
    fn search_state_signals_center_or_clear() {
        let messages = vec![msg("alpha"), msg("beta")];
        let mut state = SearchState::default();
        assert_eq!(state.update("BET", &messages), ScrollSignal::Center(messages[1].id));
        assert_eq!(state.focused(), Some(messages[1].id));
        assert_eq!(state.query(), Some("BET"));

        assert_eq!(state.update("gamma", &messages), ScrollSignal::Clear);
        assert_eq!(state.focused(), None);

        state.update("alpha", &messages);
        assert_eq!(state.close(), ScrollSignal::Clear);
        assert_eq!(state.query(), None);
    }
}
