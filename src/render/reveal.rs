use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::SlotId;

/// One step of a reveal: the prefix now visible in `slot`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealTick {
    pub slot: SlotId,
    pub displayed: String,
    pub done: bool,
}

struct SlotState {
    run: u64,
    displayed: String,
    full: String,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Slots {
    next_run: u64,
    by_slot: HashMap<SlotId, SlotState>,
}

/// Display-only projection of progressively revealed text, keyed by slot.
///
/// Each slot has at most one live run. Starting a new run for a slot cancels
/// the previous one, and a run only writes while it is still the slot's
/// current run, so two runs never interleave their ticks.
#[derive(Clone)]
pub struct RevealEngine {
    delay: Duration,
    slots: Arc<Mutex<Slots>>,
    ticks: mpsc::UnboundedSender<RevealTick>,
}

impl RevealEngine {
    pub fn new(delay: Duration) -> (Self, mpsc::UnboundedReceiver<RevealTick>) {
        let (ticks, rx) = mpsc::unbounded_channel();
        (Self { delay, slots: Arc::default(), ticks }, rx)
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resets `slot` to an empty prefix and reveals `full_text` one character per tick.
    /// Must be called from within a Tokio runtime.
    pub fn start_reveal(&self, slot: SlotId, full_text: impl Into<String>) {
        let full = full_text.into();
        let cancel = CancellationToken::new();
        let run = {
            let mut slots = self.lock();
            slots.next_run += 1;
            let run = slots.next_run;
            let prior = slots.by_slot.insert(
                slot,
                SlotState { run, displayed: String::new(), full: full.clone(), cancel: cancel.clone() },
            );
            if let Some(prior) = prior {
                prior.cancel.cancel();
            }
            run
        };
        trace!(%slot, run, chars = full.chars().count(), "reveal started");

        let engine = self.clone();
        tokio::spawn(async move {
            let ends = full.char_indices().map(|(i, c)| i + c.len_utf8());
            for end in ends {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(engine.delay) => {}
                }
                let mut slots = engine.lock();
                let Some(state) = slots.by_slot.get_mut(&slot).filter(|s| s.run == run) else {
                    return;
                };
                state.displayed.clear();
                state.displayed.push_str(&full[..end]);
                // sent under the lock so a restart cannot slip in between
                let tick = RevealTick { slot, displayed: state.displayed.clone(), done: end == full.len() };
                if engine.ticks.send(tick).is_err() {
                    trace!(%slot, run, "reveal receiver dropped");
                    return;
                }
            }
        });
    }

    pub fn displayed(&self, slot: SlotId) -> Option<String> {
        self.lock().by_slot.get(&slot).map(|s| s.displayed.clone())
    }

    pub fn is_revealing(&self, slot: SlotId) -> bool {
        self.lock()
            .by_slot
            .get(&slot)
            .is_some_and(|s| s.displayed.len() < s.full.len())
    }

    /// Jumps `slot` to its full text and stops its run.
    pub fn finish(&self, slot: SlotId) {
        let mut slots = self.lock();
        if let Some(state) = slots.by_slot.get_mut(&slot) {
            state.cancel.cancel();
            state.displayed = state.full.clone();
        }
    }

    /// Stops and forgets `slot`.
    pub fn cancel(&self, slot: SlotId) {
        if let Some(state) = self.lock().by_slot.remove(&slot) {
            state.cancel.cancel();
        }
    }

    /// Stops and forgets every slot, as when a new chat starts.
    pub fn clear(&self) {
        for (_, state) in self.lock().by_slot.drain() {
            state.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn collect_until_done(rx: &mut mpsc::UnboundedReceiver<RevealTick>, slot: SlotId) -> Vec<RevealTick> {
        let mut ticks = Vec::new();
        while let Some(t) = rx.recv().await {
            let done = t.slot == slot && t.done;
            ticks.push(t);
            if done {
                break;
            }
        }
        ticks
    }

    #[tokio::test(start_paused = true)]
    async fn reveals_one_character_per_tick() {
        let (engine, mut rx) = RevealEngine::new(Duration::from_millis(5));
        let slot = Uuid::new_v4();
        engine.start_reveal(slot, "abc");
        assert_eq!(engine.displayed(slot).as_deref(), Some(""));
        assert!(engine.is_revealing(slot));

        let ticks = collect_until_done(&mut rx, slot).await;
        let shown: Vec<&str> = ticks.iter().map(|t| t.displayed.as_str()).collect();
        assert_eq!(shown, ["a", "ab", "abc"]);
        assert_eq!(ticks.iter().filter(|t| t.done).count(), 1);
        assert_eq!(engine.displayed(slot).as_deref(), Some("abc"));
        assert!(!engine.is_revealing(slot));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_discards_pending_ticks() {
        let (engine, mut rx) = RevealEngine::new(Duration::from_millis(5));
        let slot = Uuid::new_v4();
        engine.start_reveal(slot, "abc");
        let first = rx.recv().await.unwrap();
        assert_eq!(first.displayed, "a");

        engine.start_reveal(slot, "xy");
        assert_eq!(engine.displayed(slot).as_deref(), Some(""));
        let ticks = collect_until_done(&mut rx, slot).await;
        let shown: Vec<&str> = ticks.iter().map(|t| t.displayed.as_str()).collect();
        assert_eq!(shown, ["x", "xy"]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(engine.displayed(slot).as_deref(), Some("xy"));
    }

    #[tokio::test(start_paused = true)]
    async fn slots_progress_independently() {
        let (engine, mut rx) = RevealEngine::new(Duration::from_millis(5));
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        engine.start_reveal(a, "hello");
        engine.start_reveal(b, "héy");

        let mut per_slot: HashMap<SlotId, Vec<String>> = HashMap::new();
        let mut finished = 0;
        while finished < 2 {
            let t = rx.recv().await.unwrap();
            if t.done {
                finished += 1;
            }
            per_slot.entry(t.slot).or_default().push(t.displayed);
        }
        assert_eq!(per_slot[&a], ["h", "he", "hel", "hell", "hello"]);
        assert_eq!(per_slot[&b], ["h", "hé", "héy"]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_text_is_immediately_complete() {
        let (engine, mut rx) = RevealEngine::new(Duration::from_millis(5));
        let slot = Uuid::new_v4();
        engine.start_reveal(slot, "");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(engine.displayed(slot).as_deref(), Some(""));
        assert!(!engine.is_revealing(slot));
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_once_nobody_listens() {
        let (engine, rx) = RevealEngine::new(Duration::from_millis(5));
        drop(rx);
        let slot = Uuid::new_v4();
        engine.start_reveal(slot, "abcdef");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.displayed(slot).as_deref(), Some("a"));
        assert!(engine.is_revealing(slot));
    }

    #[tokio::test(start_paused = true)]
    async fn finish_and_cancel_stop_the_run() {
        let (engine, mut rx) = RevealEngine::new(Duration::from_millis(5));
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        engine.start_reveal(a, "long text");
        engine.start_reveal(b, "other");
        engine.finish(a);
        engine.cancel(b);
        assert_eq!(engine.displayed(a).as_deref(), Some("long text"));
        assert!(engine.displayed(b).is_none());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        engine.clear();
        assert!(engine.displayed(a).is_none());
    }
}
