//! Display-side state: progressive reveal, block formatting, search and the
//! transcript that ties them together. Nothing here touches persistence.

use uuid::Uuid;

pub mod format;
pub mod reveal;
pub mod search;
pub mod transcript;

/// Identifies one displayed entry. Committed entries reuse their message id.
pub type SlotId = Uuid;

pub use format::{Block, RenderedBlock, Span, format_blocks, parse_blocks};
pub use reveal::{RevealEngine, RevealTick};
pub use search::{ScrollSignal, SearchState, Searchable, find_first_match, highlight_query};
pub use transcript::{Entry, EntryKind, Transcript};
