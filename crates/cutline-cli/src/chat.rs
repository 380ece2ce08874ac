//! Plain line-based chat front end.
//!
//! Renders the engine's event stream to stdout: sealed segments and final
//! answers as lines, running tool calls and upload progress on a rewriting
//! status line. Commands start with ':'; anything else is sent as a prompt.

use std::io::Write;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};

use cutline_core::client::{ChatClient, clear_session_ref, save_session_ref};
use cutline_core::config::Config;
use cutline_core::connection::ConnectionState;
use cutline_core::events::{ToolCallState, UiEvent};
use cutline_core::turn::SendSource;
use cutline_types::HistoryItem;

enum Outcome {
    Quit,
    Restart,
}

pub async fn run(config: Config, mut stored: Option<String>) -> Result<()> {
    loop {
        let client = ChatClient::start(config.clone(), stored.take()).await?;
        save_session_ref(&client.session_id);
        tracing::info!(session_id = %client.session_id, "session started");
        println!("session {}", client.session_id);

        match drive(client).await? {
            Outcome::Quit => return Ok(()),
            // Session gone or explicitly abandoned: acquire a fresh one.
            Outcome::Restart => {
                println!("(starting a new session)");
            }
        }
    }
}

async fn drive(mut client: ChatClient) -> Result<Outcome> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            // Ctrl+C interrupts the in-flight turn instead of quitting.
            _ = tokio::signal::ctrl_c() => client.handle.interrupt(),

            line = lines.next_line() => {
                match line? {
                    None => {
                        client.handle.shutdown();
                        return Ok(Outcome::Quit);
                    }
                    Some(line) => {
                        if let Some(outcome) = handle_line(&client, &line) {
                            client.handle.shutdown();
                            return Ok(outcome);
                        }
                    }
                }
            }
            ev = client.events.recv() => {
                match ev {
                    None => return Ok(Outcome::Quit),
                    Some(ev) => {
                        if let Some(outcome) = render_event(&ev) {
                            return Ok(outcome);
                        }
                    }
                }
            }
        }
    }
}

/// Returns Some when the session loop must end (quit or session switch).
fn handle_line(client: &ChatClient, line: &str) -> Option<Outcome> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some(rest) = line.strip_prefix(':') {
        let (cmd, args) = rest.split_once(' ').unwrap_or((rest, ""));
        match cmd {
            "q" | "quit" => return Some(Outcome::Quit),
            "new" => {
                clear_session_ref();
                return Some(Outcome::Restart);
            }
            "stop" => client.handle.interrupt(),
            "upload" => {
                let paths = crate::cli::parse_upload_paths(args);
                if paths.is_empty() {
                    println!("usage: :upload <file> [file ...]");
                } else {
                    client.handle.upload_files(paths);
                }
            }
            "delete" => {
                if args.is_empty() {
                    println!("usage: :delete <media-id>");
                } else {
                    client.handle.delete_pending(args.trim());
                }
            }
            "lang" => {
                if args.is_empty() {
                    println!("usage: :lang <en|zh>");
                } else {
                    client.handle.set_lang(args.trim());
                }
            }
            "pipeline" => {
                if args.is_empty() {
                    println!("usage: :pipeline <template-id>");
                } else {
                    client.handle.pipeline_start(args.trim());
                }
            }
            other => println!("unknown command :{other}"),
        }
        return None;
    }

    client.handle.send_prompt(line, SendSource::Enter);
    None
}

/// Renders one event. Returns Some when the session loop must end.
fn render_event(ev: &UiEvent) -> Option<Outcome> {
    match ev {
        UiEvent::SessionReady { snapshot } => {
            for item in &snapshot.history {
                match item {
                    HistoryItem::User { content, attachments } => {
                        if attachments.is_empty() {
                            println!("you> {content}");
                        } else {
                            println!("you> {content} [{} attachment(s)]", attachments.len());
                        }
                    }
                    HistoryItem::Assistant { content } => println!("assistant> {content}"),
                    HistoryItem::Tool { name, state, .. } => {
                        println!("[tool {name}: {state}]");
                    }
                }
            }
        }
        UiEvent::Connection { state } => match state {
            ConnectionState::Connected => println!("(connected)"),
            ConnectionState::Disconnected => println!("(connection lost, retrying...)"),
            ConnectionState::Connecting | ConnectionState::ClosingByUser => {}
        },
        UiEvent::SessionLost => return Some(Outcome::Restart),
        UiEvent::UserCommitted { text, attachments } => {
            if attachments.is_empty() {
                println!("you> {text}");
            } else {
                println!("you> {text} [{} attachment(s)]", attachments.len());
            }
        }
        UiEvent::PendingChanged { pending } => {
            if pending.is_empty() {
                println!("(no pending attachments)");
            } else {
                let names: Vec<&str> =
                    pending.iter().map(|m| m.name.as_str()).collect();
                println!("pending: {}", names.join(", "));
            }
        }
        UiEvent::AssistantStarted { placeholder } => {
            if *placeholder {
                status_line("assistant is working...");
            }
        }
        UiEvent::AssistantRender { text } => {
            status_line(&format!("assistant> {}", tail(text, 60)));
        }
        UiEvent::SegmentSealed { text } => {
            clear_status_line();
            println!("assistant> {text}");
        }
        UiEvent::SegmentDiscarded => clear_status_line(),
        UiEvent::AssistantCompleted { text } => {
            clear_status_line();
            if let Some(text) = text {
                println!("assistant> {text}");
            }
        }
        UiEvent::ToolCallUpdated { call } => match call.state {
            ToolCallState::Running => {
                let pct = (call.progress * 100.0).floor().min(99.0);
                status_line(&format!("[tool {} {pct:.0}% {}]", call.name, call.message));
            }
            ToolCallState::Success => {
                clear_status_line();
                println!("[tool {}: done]", call.name);
            }
            ToolCallState::Error => {
                clear_status_line();
                println!("[tool {}: failed]", call.name);
            }
        },
        UiEvent::UploadProgress { fraction, file_index, file_count, file_name } => {
            let pct = (fraction * 100.0).round();
            status_line(&format!("uploading {file_index}/{file_count} {file_name} {pct:.0}%"));
        }
        UiEvent::UploadIdle => clear_status_line(),
        UiEvent::Notice { message, retry_after } => {
            clear_status_line();
            match retry_after {
                Some(secs) => println!("! {message} (retry after {secs}s)"),
                None => println!("! {message}"),
            }
        }
        UiEvent::ComposerState { .. } => {}
        UiEvent::ChatCleared => {
            clear_status_line();
            println!("(conversation cleared)");
        }
        UiEvent::Pipeline { event } => {
            println!("[pipeline] {}", serde_json::to_string(event).unwrap_or_default());
        }
    }
    None
}

/// Last `n` characters of a streaming buffer, newlines flattened.
fn tail(text: &str, n: usize) -> String {
    let flat: String = text.chars().map(|c| if c == '\n' { ' ' } else { c }).collect();
    let count = flat.chars().count();
    if count <= n {
        flat
    } else {
        flat.chars().skip(count - n).collect()
    }
}

fn status_line(text: &str) {
    print!("\r\x1b[2K{text}");
    let _ = std::io::stdout().flush();
}

fn clear_status_line() {
    print!("\r\x1b[2K");
    let _ = std::io::stdout().flush();
}
