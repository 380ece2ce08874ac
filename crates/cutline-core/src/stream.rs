//! Streamed assistant text: buffering, render throttling, segmentation.
//!
//! Parsing and sanitizing markdown on every token is wasted work, so
//! renders are throttled: at most one per interval, with a single deferred
//! render scheduled when deltas arrive early. A segment is force-flushed
//! when a tool invocation starts, so a tool card never lands between two
//! halves of one text bubble. On finalize, a non-empty authoritative text
//! from the server replaces whatever accumulated locally; turns that
//! produced nothing are elided rather than rendered blank.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::events::UiEvent;

pub struct StreamRenderer {
    interval: Duration,
    buf: String,
    open: bool,
    last_render: Option<Instant>,
    deferred: Option<CancellationToken>,
    /// Wakes the runtime when a deferred render is due.
    due_tx: mpsc::UnboundedSender<()>,
}

impl StreamRenderer {
    pub fn new(interval: Duration, due_tx: mpsc::UnboundedSender<()>) -> Self {
        Self {
            interval,
            buf: String::new(),
            open: false,
            last_render: None,
            deferred: None,
            due_tx,
        }
    }

    /// Opens the assistant message for a new turn (`assistant.start`).
    pub fn begin(&mut self) -> UiEvent {
        self.cancel_deferred();
        self.buf.clear();
        self.open = true;
        self.last_render = None;
        UiEvent::AssistantStarted { placeholder: true }
    }

    /// Appends a delta and renders now if due, otherwise schedules a single
    /// deferred render for the remaining wait.
    pub fn append_delta(&mut self, delta: &str) -> Vec<UiEvent> {
        let mut events = Vec::new();
        if !self.open {
            // Deltas without a preceding start (segment reopened after a
            // tool card): open without the placeholder hint.
            self.open = true;
            self.buf.clear();
            self.last_render = None;
            events.push(UiEvent::AssistantStarted { placeholder: false });
        }
        self.buf.push_str(delta);

        let due = self
            .last_render
            .is_none_or(|last| last.elapsed() >= self.interval);
        if due {
            events.push(self.render_now());
        } else if self.deferred.is_none() {
            let elapsed = self.last_render.map_or(Duration::ZERO, |l| l.elapsed());
            self.schedule_deferred(self.interval.saturating_sub(elapsed));
        }
        events
    }

    /// Fires the deferred render (runtime inbox callback).
    pub fn on_render_due(&mut self) -> Option<UiEvent> {
        self.deferred = None;
        if !self.open {
            return None;
        }
        Some(self.render_now())
    }

    /// Seals the current segment before a tool card (`assistant.flush`).
    ///
    /// A segment that never received a token is discarded outright — the
    /// placeholder alone is not content.
    pub fn flush_segment(&mut self) -> Option<UiEvent> {
        self.cancel_deferred();
        if !self.open {
            return None;
        }
        self.open = false;
        let text = self.buf.trim().to_string();
        self.buf.clear();
        self.last_render = None;
        if text.is_empty() {
            Some(UiEvent::SegmentDiscarded)
        } else {
            Some(UiEvent::SegmentSealed { text })
        }
    }

    /// Ends the turn (`assistant.end` / `error`). Non-empty authoritative
    /// text replaces the local buffer; an empty result elides the message.
    pub fn finalize(&mut self, authoritative: &str) -> UiEvent {
        self.cancel_deferred();
        let authoritative = authoritative.trim();
        let local = self.buf.trim();
        let text = if authoritative.is_empty() { local } else { authoritative };
        let event = if text.is_empty() {
            UiEvent::AssistantCompleted { text: None }
        } else {
            UiEvent::AssistantCompleted { text: Some(text.to_string()) }
        };
        self.buf.clear();
        self.open = false;
        self.last_render = None;
        event
    }

    /// Whether a segment is currently open (a bubble exists client-side).
    pub fn is_open(&self) -> bool {
        self.open
    }

    fn render_now(&mut self) -> UiEvent {
        self.last_render = Some(Instant::now());
        UiEvent::AssistantRender { text: self.buf.clone() }
    }

    fn schedule_deferred(&mut self, wait: Duration) {
        let token = CancellationToken::new();
        let guard = token.clone();
        let due_tx = self.due_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = guard.cancelled() => {}
                () = tokio::time::sleep(wait) => {
                    let _ = due_tx.send(());
                }
            }
        });
        self.deferred = Some(token);
    }

    fn cancel_deferred(&mut self) {
        if let Some(token) = self.deferred.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(80);

    fn renderer() -> (StreamRenderer, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StreamRenderer::new(INTERVAL, tx), rx)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_delta_renders_immediately() {
        let (mut r, _rx) = renderer();
        r.begin();
        let events = r.append_delta("Hel");
        assert_eq!(events, vec![UiEvent::AssistantRender { text: "Hel".to_string() }]);
    }

    #[tokio::test(start_paused = true)]
    async fn early_deltas_coalesce_into_one_deferred_render() {
        let (mut r, mut rx) = renderer();
        r.begin();
        r.append_delta("a");

        // Two quick deltas: neither renders, only one deferred scheduled.
        assert!(r.append_delta("b").is_empty());
        assert!(r.append_delta("c").is_empty());
        settle().await;
        assert!(rx.try_recv().is_err());

        tokio::time::advance(INTERVAL).await;
        settle().await;
        rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err(), "more than one deferred render");

        let rendered = r.on_render_due().unwrap();
        assert_eq!(rendered, UiEvent::AssistantRender { text: "abc".to_string() });
    }

    #[tokio::test(start_paused = true)]
    async fn delta_after_interval_renders_without_deferral() {
        let (mut r, _rx) = renderer();
        r.begin();
        r.append_delta("a");
        tokio::time::advance(INTERVAL).await;
        let events = r.append_delta("b");
        assert_eq!(events, vec![UiEvent::AssistantRender { text: "ab".to_string() }]);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_seals_text_and_discards_empty_segments() {
        let (mut r, _rx) = renderer();
        r.begin();
        r.append_delta("intro text ");
        assert_eq!(
            r.flush_segment(),
            Some(UiEvent::SegmentSealed { text: "intro text".to_string() })
        );

        // Placeholder-only segment: discard, don't seal.
        r.begin();
        assert_eq!(r.flush_segment(), Some(UiEvent::SegmentDiscarded));

        // Nothing open: nothing to flush.
        assert_eq!(r.flush_segment(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn delta_after_flush_reopens_without_placeholder() {
        let (mut r, _rx) = renderer();
        r.begin();
        r.append_delta("before tool");
        r.flush_segment();

        let events = r.append_delta("after tool");
        assert_eq!(
            events,
            vec![
                UiEvent::AssistantStarted { placeholder: false },
                UiEvent::AssistantRender { text: "after tool".to_string() },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn authoritative_text_replaces_the_buffer() {
        let (mut r, _rx) = renderer();
        r.begin();
        r.append_delta("partial stre");
        let done = r.finalize("the full corrected answer");
        assert_eq!(
            done,
            UiEvent::AssistantCompleted { text: Some("the full corrected answer".to_string()) }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn empty_turns_are_elided() {
        let (mut r, _rx) = renderer();
        r.begin();
        assert_eq!(r.finalize(""), UiEvent::AssistantCompleted { text: None });

        // No open segment and no authoritative text: still elided.
        assert_eq!(r.finalize("  "), UiEvent::AssistantCompleted { text: None });
    }

    #[tokio::test(start_paused = true)]
    async fn finalize_falls_back_to_local_buffer() {
        let (mut r, _rx) = renderer();
        r.begin();
        r.append_delta("streamed answer");
        assert_eq!(
            r.finalize(""),
            UiEvent::AssistantCompleted { text: Some("streamed answer".to_string()) }
        );
    }
}
