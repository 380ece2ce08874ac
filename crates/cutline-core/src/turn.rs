//! Turn lifecycle control.
//!
//! The controller is a reducer: commands and server events mutate state and
//! return effects for the runtime to execute. It performs no I/O itself,
//! which makes the ordering rules (interrupt before send, one interrupt at
//! a time, uploads block composing) directly testable.
//!
//! State machine: Idle → (send) → Streaming → (assistant.end) → Idle,
//! with Streaming → (interrupt) → Canceling → (assistant.end) → Idle.
//! The turn only ever ends on a server event; interruption is a request,
//! not a local transition to Idle.

use serde_json::Value;

use cutline_types::ClientMessage;

use crate::events::UiEvent;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Streaming,
    Canceling,
}

/// Where a send originated. Enter composes the interrupt-then-send
/// shortcut mid-stream; the button acts as a plain interrupt there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendSource {
    Enter,
    Button,
}

/// Effects returned by the controller for the runtime to execute, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEffect {
    /// Enqueue a message on the persistent channel. The channel preserves
    /// send order, which is what makes interrupt-then-send correct: the
    /// server observes the cancel request before the new message.
    SendWs(ClientMessage),
    /// Issue the turn-cancel request (fire-and-forget HTTP; the outcome
    /// comes back via `on_cancel_failed` or the server's finalize event).
    RequestCancel,
    /// Surface an event to the consumer.
    Ui(UiEvent),
}

pub struct TurnController {
    state: TurnState,
    uploading: bool,
}

impl TurnController {
    pub fn new() -> Self {
        Self { state: TurnState::Idle, uploading: false }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn is_uploading(&self) -> bool {
        self.uploading
    }

    fn composer_state(&self) -> UiEvent {
        UiEvent::ComposerState {
            streaming: self.state != TurnState::Idle,
            canceling: self.state == TurnState::Canceling,
            uploading: self.uploading,
        }
    }

    /// Handles a send request from the composer.
    pub fn send_prompt(
        &mut self,
        session: &mut Session,
        text: &str,
        source: SendSource,
        service_config: Option<Value>,
    ) -> Vec<TurnEffect> {
        let text = text.trim();

        if self.state != TurnState::Idle {
            return self.send_while_streaming(session, text, source, service_config);
        }

        // Idle path: uploads must finish before a message can go out.
        if self.uploading {
            return vec![TurnEffect::Ui(UiEvent::Notice {
                message: "Media is still uploading; wait for it to finish before sending."
                    .to_string(),
                retry_after: None,
            })];
        }
        if text.is_empty() {
            return Vec::new();
        }

        self.commit_and_send(session, text, service_config)
    }

    fn send_while_streaming(
        &mut self,
        session: &mut Session,
        text: &str,
        source: SendSource,
        service_config: Option<Value>,
    ) -> Vec<TurnEffect> {
        match source {
            // Enter with no text: guard against accidental interrupts.
            SendSource::Enter if text.is_empty() => Vec::new(),
            SendSource::Enter => {
                if self.state == TurnState::Canceling {
                    // One interrupt at a time.
                    return Vec::new();
                }
                if self.uploading {
                    // Interrupt the old reply, but hold the new message
                    // until the upload finishes.
                    let mut effects = vec![TurnEffect::Ui(UiEvent::Notice {
                        message: "Media is uploading; interrupted the current reply. \
                                  Send again once the upload finishes."
                            .to_string(),
                        retry_after: None,
                    })];
                    effects.extend(self.interrupt());
                    return effects;
                }

                // Interrupt-then-send: commit locally for responsiveness,
                // request the cancel, then enqueue the new message. The
                // cancel request precedes the send so the server tears the
                // old turn down before starting the new one.
                let attachments = session.take_pending();
                let attachment_ids: Vec<String> =
                    attachments.iter().map(|m| m.id.clone()).collect();

                self.state = TurnState::Canceling;
                vec![
                    TurnEffect::Ui(UiEvent::UserCommitted {
                        text: text.to_string(),
                        attachments,
                    }),
                    TurnEffect::Ui(UiEvent::PendingChanged { pending: Vec::new() }),
                    TurnEffect::Ui(self.composer_state()),
                    TurnEffect::RequestCancel,
                    TurnEffect::SendWs(ClientMessage::ChatSend {
                        text: text.to_string(),
                        attachment_ids,
                        lang: session.lang.clone(),
                        service_config,
                    }),
                ]
            }
            SendSource::Button => self.interrupt(),
        }
    }

    fn commit_and_send(
        &mut self,
        session: &mut Session,
        text: &str,
        service_config: Option<Value>,
    ) -> Vec<TurnEffect> {
        let attachments = session.take_pending();
        let attachment_ids: Vec<String> = attachments.iter().map(|m| m.id.clone()).collect();
        vec![
            TurnEffect::Ui(UiEvent::UserCommitted { text: text.to_string(), attachments }),
            TurnEffect::Ui(UiEvent::PendingChanged { pending: Vec::new() }),
            TurnEffect::SendWs(ClientMessage::ChatSend {
                text: text.to_string(),
                attachment_ids,
                lang: session.lang.clone(),
                service_config,
            }),
        ]
    }

    /// Requests interruption of the in-flight turn.
    pub fn interrupt(&mut self) -> Vec<TurnEffect> {
        if self.state != TurnState::Streaming {
            // Nothing to interrupt, or one is already in flight.
            return Vec::new();
        }
        self.state = TurnState::Canceling;
        vec![TurnEffect::Ui(self.composer_state()), TurnEffect::RequestCancel]
    }

    /// The cancel request itself failed at the transport level. The turn
    /// keeps streaming; only the canceling indicator is reverted.
    pub fn on_cancel_failed(&mut self, message: &str) -> Vec<TurnEffect> {
        if self.state == TurnState::Canceling {
            self.state = TurnState::Streaming;
        }
        vec![
            TurnEffect::Ui(UiEvent::Notice {
                message: format!("Interrupt failed: {message}"),
                retry_after: None,
            }),
            TurnEffect::Ui(self.composer_state()),
        ]
    }

    /// `assistant.start` from the server.
    pub fn on_assistant_start(&mut self) -> Vec<TurnEffect> {
        self.state = TurnState::Streaming;
        vec![TurnEffect::Ui(self.composer_state())]
    }

    /// The server finalized the turn (`assistant.end`, `error`,
    /// `chat.cleared`).
    pub fn on_turn_finished(&mut self) -> Vec<TurnEffect> {
        self.state = TurnState::Idle;
        vec![TurnEffect::Ui(self.composer_state())]
    }

    /// Upload batch started or finished.
    pub fn set_uploading(&mut self, uploading: bool) -> Vec<TurnEffect> {
        self.uploading = uploading;
        vec![TurnEffect::Ui(self.composer_state())]
    }
}

impl Default for TurnController {
    fn default() -> Self {
        Self::new()
    }
}
