//! Tool-invocation tracking with synthetic progress fallback.
//!
//! The server reports real progress for some tools and nothing for others.
//! Every call starts in Synthetic mode: after a grace period (so calls that
//! finish almost immediately never flash a bar) an estimator ticks progress
//! toward a cap strictly below 1, derived from an expected duration per
//! tool. The first reported value flips the call to Reported mode for good
//! and kills the estimator — real progress always wins once observed.
//!
//! All mutation happens on the runtime task. Ticker tasks only push the
//! call id into the runtime's inbox; the runtime calls [`ToolCallTracker::on_tick`].

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ToolUiConfig;
use crate::events::{ProgressMode, ToolCallState, ToolCallView};

/// Synthetic progress for a running call: linear in elapsed time, stalling
/// at `cap` once the call is overdue (the bar visibly stops short of done,
/// signaling that work is still ongoing).
pub fn synthetic_progress(elapsed: Duration, estimate: Duration, cap: f64) -> f64 {
    let estimate_ms = estimate.as_millis().max(1) as f64;
    let raw = elapsed.as_millis() as f64 / estimate_ms;
    raw.clamp(0.0, cap)
}

struct ToolCall {
    view: ToolCallView,
    started: Instant,
    estimate: Duration,
    ticker: Option<CancellationToken>,
}

/// Per-session table of tool invocations.
///
/// Entries live until the session is cleared; terminal calls stay around so
/// history and summaries remain addressable by id.
pub struct ToolCallTracker {
    config: ToolUiConfig,
    calls: HashMap<String, ToolCall>,
    tick_tx: mpsc::UnboundedSender<String>,
}

impl ToolCallTracker {
    /// `tick_tx` feeds the runtime inbox: each send carries the id of a
    /// call whose synthetic estimate is due for recomputation.
    pub fn new(config: ToolUiConfig, tick_tx: mpsc::UnboundedSender<String>) -> Self {
        Self { config, calls: HashMap::new(), tick_tx }
    }

    /// Handles `tool.start`. Idempotent: a repeated start for a known id
    /// never restarts the clock or the estimator.
    pub fn on_start(
        &mut self,
        id: &str,
        server: &str,
        name: &str,
        args: Value,
    ) -> Option<ToolCallView> {
        if let Some(call) = self.calls.get(id) {
            return Some(call.view.clone());
        }

        let estimate = self.config.estimate_for(server, name);
        let ticker = self.spawn_ticker(id);
        let call = ToolCall {
            view: ToolCallView {
                id: id.to_string(),
                server: server.to_string(),
                name: name.to_string(),
                args,
                state: ToolCallState::Running,
                progress: 0.0,
                mode: ProgressMode::Synthetic,
                message: String::new(),
                summary: None,
            },
            started: Instant::now(),
            estimate,
            ticker: Some(ticker),
        };
        let view = call.view.clone();
        self.calls.insert(id.to_string(), call);
        Some(view)
    }

    /// Handles `tool.progress`: flips the call to Reported mode (once,
    /// permanently) and applies the patch. Values are clamped to [0, 1] and
    /// never allowed to regress while the call is running.
    pub fn on_progress(
        &mut self,
        id: &str,
        server: &str,
        name: &str,
        progress: Option<f64>,
        message: Option<String>,
    ) -> Option<ToolCallView> {
        if !self.calls.contains_key(id) {
            // Progress for a start we never saw: create the call directly
            // in Reported mode, no estimator.
            let call = ToolCall {
                view: ToolCallView {
                    id: id.to_string(),
                    server: server.to_string(),
                    name: name.to_string(),
                    args: Value::Null,
                    state: ToolCallState::Running,
                    progress: 0.0,
                    mode: ProgressMode::Reported,
                    message: String::new(),
                    summary: None,
                },
                started: Instant::now(),
                estimate: self.config.estimate_for(server, name),
                ticker: None,
            };
            self.calls.insert(id.to_string(), call);
        }

        let call = self.calls.get_mut(id)?;
        if call.view.state.is_terminal() {
            return None;
        }

        if call.view.mode == ProgressMode::Synthetic {
            call.view.mode = ProgressMode::Reported;
            if let Some(token) = call.ticker.take() {
                token.cancel();
            }
        }

        if let Some(p) = progress {
            call.view.progress = call.view.progress.max(p.clamp(0.0, 1.0));
        }
        if let Some(m) = message {
            call.view.message = m;
        }
        Some(call.view.clone())
    }

    /// Handles `tool.end`: terminal state, estimator gone, displayed
    /// progress snapped to 0 (terminal cards show no bar).
    pub fn on_end(
        &mut self,
        id: &str,
        is_error: bool,
        summary: Option<Value>,
    ) -> Option<ToolCallView> {
        let call = self.calls.get_mut(id)?;
        if let Some(token) = call.ticker.take() {
            token.cancel();
        }
        call.view.state = if is_error { ToolCallState::Error } else { ToolCallState::Success };
        call.view.progress = 0.0;
        if summary.is_some() {
            call.view.summary = summary;
        }
        Some(call.view.clone())
    }

    /// Recomputes the synthetic estimate for one call. Stale ticks (call
    /// ended, or switched to Reported) produce nothing.
    pub fn on_tick(&mut self, id: &str) -> Option<ToolCallView> {
        let cap = self.config.effective_cap();
        let call = self.calls.get_mut(id)?;
        if call.view.state != ToolCallState::Running || call.view.mode != ProgressMode::Synthetic {
            return None;
        }
        let estimated = synthetic_progress(call.started.elapsed(), call.estimate, cap);
        call.view.progress = call.view.progress.max(estimated);
        Some(call.view.clone())
    }

    /// Drops every call and stops all estimators (session cleared/switch).
    pub fn clear(&mut self) {
        for call in self.calls.values_mut() {
            if let Some(token) = call.ticker.take() {
                token.cancel();
            }
        }
        self.calls.clear();
    }

    pub fn get(&self, id: &str) -> Option<&ToolCallView> {
        self.calls.get(id).map(|c| &c.view)
    }

    fn spawn_ticker(&self, id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let guard = token.clone();
        let tick_tx = self.tick_tx.clone();
        let id = id.to_string();
        let delay = Duration::from_millis(self.config.activation_delay_ms);
        let tick = Duration::from_millis(self.config.tick_ms.max(30));

        tokio::spawn(async move {
            tokio::select! {
                () = guard.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            let mut ticker = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    () = guard.cancelled() => return,
                    _ = ticker.tick() => {
                        if tick_tx.send(id.clone()).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        token
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn tracker() -> (ToolCallTracker, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ToolCallTracker::new(ToolUiConfig::default(), tx), rx)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn synthetic_progress_stalls_at_the_cap() {
        let (mut tracker, _rx) = tracker();
        tracker.on_start("t1", "media", "understand_clips", json!({}));

        // At the 8000 ms default estimate the bar must sit at the cap,
        // never at 100%.
        tokio::time::advance(Duration::from_millis(8000)).await;
        let view = tracker.on_tick("t1").unwrap();
        assert!(view.progress <= 0.99);

        tokio::time::advance(Duration::from_millis(60_000)).await;
        let view = tracker.on_tick("t1").unwrap();
        assert!((view.progress - 0.99).abs() < f64::EPSILON);
        assert!(view.progress < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn estimator_waits_out_the_grace_period() {
        let (mut tracker, mut rx) = tracker();
        tracker.on_start("t1", "", "filter_clips", json!({}));
        settle().await;

        tokio::time::advance(Duration::from_millis(1999)).await;
        settle().await;
        assert!(rx.try_recv().is_err(), "tick before the grace period elapsed");

        tokio::time::advance(Duration::from_millis(2)).await;
        settle().await;
        assert_eq!(rx.try_recv().unwrap(), "t1");
    }

    #[tokio::test(start_paused = true)]
    async fn reported_progress_permanently_disables_synthetic_ticks() {
        let (mut tracker, _rx) = tracker();
        tracker.on_start("t1", "media", "render_video", json!({}));

        let view = tracker
            .on_progress("t1", "media", "render_video", Some(0.4), None)
            .unwrap();
        assert_eq!(view.mode, ProgressMode::Reported);
        assert!((view.progress - 0.4).abs() < f64::EPSILON);

        // A late synthetic tick must be a no-op, no matter how much time
        // passes.
        tokio::time::advance(Duration::from_millis(30_000)).await;
        assert!(tracker.on_tick("t1").is_none());
        assert!((tracker.get("t1").unwrap().progress - 0.4).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn reported_progress_is_clamped_and_monotone() {
        let (mut tracker, _rx) = tracker();
        tracker.on_start("t1", "", "generate_voiceover", json!({}));

        tracker.on_progress("t1", "", "generate_voiceover", Some(0.9), None);
        // Regressions are ignored; overshoot is clamped.
        let view = tracker
            .on_progress("t1", "", "generate_voiceover", Some(0.4), None)
            .unwrap();
        assert!((view.progress - 0.9).abs() < f64::EPSILON);

        let view = tracker
            .on_progress("t1", "", "generate_voiceover", Some(1.7), None)
            .unwrap();
        assert!((view.progress - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn patch_retains_message_when_absent() {
        let (mut tracker, _rx) = tracker();
        tracker.on_start("t1", "", "load_media", json!({"path": "clip.mp4"}));

        tracker.on_progress("t1", "", "load_media", Some(0.2), Some("demuxing".to_string()));
        let view = tracker.on_progress("t1", "", "load_media", Some(0.3), None).unwrap();
        assert_eq!(view.message, "demuxing");
        // Args from the start event survive progress patches.
        assert_eq!(view.args, json!({"path": "clip.mp4"}));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_start_does_not_restart_the_clock() {
        let (mut tracker, _rx) = tracker();
        tracker.on_start("t1", "", "filter_clips", json!({}));

        tokio::time::advance(Duration::from_millis(4000)).await;
        let before = tracker.on_tick("t1").unwrap().progress;

        tracker.on_start("t1", "", "filter_clips", json!({}));
        let after = tracker.on_tick("t1").unwrap().progress;
        assert!(after >= before, "restart reset the estimator clock");
    }

    #[tokio::test(start_paused = true)]
    async fn end_snaps_progress_to_zero() {
        let (mut tracker, _rx) = tracker();
        tracker.on_start("t1", "", "render_video", json!({}));
        tracker.on_progress("t1", "", "render_video", Some(0.8), None);

        let view = tracker.on_end("t1", false, Some(json!({"ok": true}))).unwrap();
        assert_eq!(view.state, ToolCallState::Success);
        assert!(view.progress.abs() < f64::EPSILON);
        assert_eq!(view.summary, Some(json!({"ok": true})));

        // Terminal calls ignore further progress.
        assert!(tracker.on_progress("t1", "", "render_video", Some(0.5), None).is_none());
        assert!(tracker.on_tick("t1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn progress_without_start_creates_a_reported_call() {
        let (mut tracker, _rx) = tracker();
        let view = tracker
            .on_progress("orphan", "media", "render_video", Some(0.5), None)
            .unwrap();
        assert_eq!(view.mode, ProgressMode::Reported);
        assert_eq!(view.state, ToolCallState::Running);
    }
}
