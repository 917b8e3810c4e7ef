//! Line-oriented chat front end: stdin commands in, transcript lines out.

use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::{identity_store, session_store, ChatArgs, HistoryArgs};
use crate::core::config::orchestrator::ConfigOrchestrator;
use crate::core::config::{Endpoints, SessionSettings};
use crate::core::credentials::CredentialCache;
use crate::core::identity::{resolve_auth_token, resolve_user_id, IdentityStore};
use crate::core::message::{ClientKey, MessageOrigin};
use crate::core::runtime::SessionRuntime;
use crate::core::session::{ChatSession, SessionAction, SessionSnapshot};
use crate::transport::conventional::ConventionalTransport;
use crate::transport::ledger::LedgerTransport;
use crate::transport::memory_ledger::MemoryLedger;
use crate::transport::{Transport, TransportSet};

const OFFLINE_CONFIRMATION_DELAY: Duration = Duration::from_millis(800);

pub(crate) fn build_transports(
    client: reqwest::Client,
    endpoints: &Endpoints,
    settings: &SessionSettings,
    store: Arc<dyn IdentityStore>,
    offline: bool,
) -> TransportSet {
    let conventional: Arc<dyn Transport> = Arc::new(ConventionalTransport::new(
        client.clone(),
        endpoints,
        settings,
        resolve_auth_token(store.as_ref()),
    ));
    let ledger: Arc<dyn Transport> = if offline {
        Arc::new(MemoryLedger::new(
            OFFLINE_CONFIRMATION_DELAY,
            settings.ledger_confirmation_timeout,
        ))
    } else {
        Arc::new(LedgerTransport::new(
            client,
            endpoints,
            settings,
            store,
            Arc::new(CredentialCache::new()),
        ))
    };
    TransportSet::new(conventional, ledger)
}

pub async fn run_chat(config: &ConfigOrchestrator, args: ChatArgs) -> Result<(), Box<dyn Error>> {
    let loaded = config.load_with_cache()?;
    let mut settings = loaded.session_settings();
    match args.mode {
        Some(mode) => settings.default_mode = mode,
        None if args.offline => settings.default_mode = MessageOrigin::LedgerBacked,
        None => {}
    }

    let store = session_store(&loaded, &args);
    let client = reqwest::Client::builder()
        .timeout(settings.request_timeout)
        .build()?;
    let transports = build_transports(
        client,
        &loaded.endpoints(),
        &settings,
        Arc::clone(&store),
        args.offline,
    );

    let user_id = resolve_user_id(store.as_ref());
    if user_id.is_err() {
        eprintln!("⚠️  No identity found. Run: sparkchat login <user-id> (or pass --user)");
    }

    let session = ChatSession::new(args.conversation.clone(), args.partner.clone(), settings);
    let handle = SessionRuntime::spawn(session, transports, user_id);

    let mut snapshots = handle.snapshots();
    let renderer = tokio::spawn(async move {
        let mut transcript = TranscriptRenderer::default();
        loop {
            let snapshot = snapshots.borrow_and_update().clone();
            for line in transcript.render(&snapshot) {
                println!("{line}");
            }
            if snapshots.changed().await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let input = match parse_repl_line(&line) {
            Ok(input) => input,
            Err(message) => {
                eprintln!("⚠️  {message}");
                continue;
            }
        };
        let action = match input {
            ReplInput::Empty => continue,
            ReplInput::Quit => break,
            ReplInput::Message(body) => SessionAction::SubmitMessage { body },
            ReplInput::SwitchMode => SessionAction::RequestModeSwitch,
            ReplInput::ConfirmSwitch => SessionAction::ConfirmModeSwitch,
            ReplInput::CancelSwitch => SessionAction::CancelModeSwitch,
            ReplInput::React { index, emoji } => SessionAction::AddReaction { index, emoji },
            ReplInput::ListFailed => {
                for line in failed_send_lines(&handle.snapshot()) {
                    println!("{line}");
                }
                continue;
            }
            ReplInput::Retry(index) => match failed_key(&handle.snapshot(), index) {
                Some(client_key) => SessionAction::RetryFailedSend { client_key },
                None => continue,
            },
            ReplInput::Dismiss(index) => match failed_key(&handle.snapshot(), index) {
                Some(client_key) => SessionAction::DismissFailedSend { client_key },
                None => continue,
            },
        };
        if !handle.dispatch(action) {
            break;
        }
    }

    handle.close().await;
    let _ = renderer.await;
    Ok(())
}

pub async fn print_history(
    config: &ConfigOrchestrator,
    args: HistoryArgs,
) -> Result<(), Box<dyn Error>> {
    let loaded = config.load_with_cache()?;
    let settings = loaded.session_settings();
    let mode = args.mode.unwrap_or(settings.default_mode);
    let store = identity_store(&loaded, None, false);
    let me = resolve_user_id(store.as_ref()).ok();
    let client = reqwest::Client::builder()
        .timeout(settings.request_timeout)
        .build()?;
    let transports = build_transports(client, &loaded.endpoints(), &settings, store, false);

    let history = transports
        .for_mode(mode)
        .fetch_history(&args.conversation)
        .await?;
    if history.is_empty() {
        println!("(no messages)");
    }
    for (index, message) in history.iter().enumerate() {
        let who = if me.as_deref() == Some(message.sender_id.as_str()) {
            "me"
        } else {
            message.sender_id.as_str()
        };
        println!(
            "[{}] {} {}: {}",
            index + 1,
            message.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
            who,
            message.body
        );
    }
    Ok(())
}

fn failed_key(snapshot: &SessionSnapshot, index: usize) -> Option<ClientKey> {
    let key = snapshot
        .failed_sends
        .get(index)
        .map(|failed| failed.client_key.clone());
    if key.is_none() {
        eprintln!("⚠️  No failed message #{}", index + 1);
    }
    key
}

/// One parsed line of chat input. Indexes are zero-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplInput {
    Empty,
    Message(String),
    SwitchMode,
    ConfirmSwitch,
    CancelSwitch,
    React { index: usize, emoji: String },
    ListFailed,
    Retry(usize),
    Dismiss(usize),
    Quit,
}

fn parse_position(raw: Option<&str>, usage: &str) -> Result<usize, String> {
    raw.and_then(|value| value.parse::<usize>().ok())
        .filter(|position| *position >= 1)
        .map(|position| position - 1)
        .ok_or_else(|| format!("Usage: {usage}"))
}

pub fn parse_repl_line(line: &str) -> Result<ReplInput, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(ReplInput::Empty);
    }
    let Some(command) = trimmed.strip_prefix('/') else {
        return Ok(ReplInput::Message(trimmed.to_string()));
    };

    let mut parts = command.split_whitespace();
    let name = parts.next().unwrap_or_default().to_ascii_lowercase();
    match name.as_str() {
        "mode" => Ok(ReplInput::SwitchMode),
        "yes" | "y" => Ok(ReplInput::ConfirmSwitch),
        "no" | "n" => Ok(ReplInput::CancelSwitch),
        "react" => {
            let index = parse_position(parts.next(), "/react <n> <emoji>")?;
            let emoji = parts.collect::<Vec<_>>().join(" ");
            if emoji.is_empty() {
                return Err("Usage: /react <n> <emoji>".to_string());
            }
            Ok(ReplInput::React { index, emoji })
        }
        "failed" => Ok(ReplInput::ListFailed),
        "retry" => parse_position(parts.next(), "/retry <n>").map(ReplInput::Retry),
        "dismiss" => parse_position(parts.next(), "/dismiss <n>").map(ReplInput::Dismiss),
        "quit" | "exit" | "q" => Ok(ReplInput::Quit),
        // `//text` sends a message that starts with a slash.
        _ if command.starts_with('/') => Ok(ReplInput::Message(command.to_string())),
        other => Err(format!("Unknown command: /{other}")),
    }
}

fn failed_send_lines(snapshot: &SessionSnapshot) -> Vec<String> {
    if snapshot.failed_sends.is_empty() {
        return vec!["· no failed messages".to_string()];
    }
    snapshot
        .failed_sends
        .iter()
        .enumerate()
        .map(|(index, failed)| {
            let state = if failed.unconfirmed {
                "unconfirmed"
            } else {
                "not sent"
            };
            format!(
                "· failed #{} ({state}): {} ({})",
                index + 1,
                failed.body,
                failed.error
            )
        })
        .collect()
}

type PrintedKey = (String, i64, String);

/// Turns successive snapshots into transcript lines, printing each change once.
#[derive(Debug, Default)]
pub struct TranscriptRenderer {
    generation: Option<u64>,
    printed: HashMap<PrintedKey, Vec<(String, u32)>>,
    ready: bool,
    typing: bool,
    online: Option<bool>,
    live: bool,
    identity_missing: bool,
    load_error: Option<String>,
    failed: usize,
    prompt: Option<MessageOrigin>,
    notice: Option<String>,
}

impl TranscriptRenderer {
    pub fn render(&mut self, snapshot: &SessionSnapshot) -> Vec<String> {
        let mut lines = Vec::new();

        if self.generation != Some(snapshot.generation) {
            if self.generation.is_some() && snapshot.state != "closed" {
                lines.push(format!("── switched to {} mode ──", snapshot.mode));
            }
            self.generation = Some(snapshot.generation);
            self.printed.clear();
            self.ready = false;
            self.failed = 0;
        }

        if snapshot.identity_missing && !self.identity_missing {
            lines.push("· you are not logged in; nothing will load".to_string());
        }
        self.identity_missing = snapshot.identity_missing;

        let ready = snapshot.state == "ready";
        if ready && !self.ready {
            lines.push(format!(
                "· {} ready ({} mode)",
                snapshot.conversation_id, snapshot.mode
            ));
        }
        self.ready = ready;

        for (index, message) in snapshot.messages.iter().enumerate() {
            if message.pending {
                continue;
            }
            let key = (
                message.sender_id.clone(),
                message.timestamp.timestamp_millis(),
                message.body.clone(),
            );
            let reactions = message.reactions.clone();
            match self.printed.get(&key) {
                None => {
                    let who = if message.is_me {
                        "me"
                    } else {
                        message.sender_id.as_str()
                    };
                    let mut line = format!(
                        "[{}] {} {}: {}",
                        index + 1,
                        message.timestamp.with_timezone(&Local).format("%H:%M"),
                        who,
                        message.body
                    );
                    if message.unconfirmed {
                        line.push_str("  (unconfirmed)");
                    }
                    if !reactions.is_empty() {
                        line.push_str(&format!("  {}", format_reactions(&reactions)));
                    }
                    lines.push(line);
                    self.printed.insert(key, reactions);
                }
                Some(previous) if *previous != reactions => {
                    lines.push(format!(
                        "   [{}] reactions: {}",
                        index + 1,
                        format_reactions(&reactions)
                    ));
                    self.printed.insert(key, reactions);
                }
                Some(_) => {}
            }
        }

        if snapshot.partner_typing != self.typing {
            if snapshot.partner_typing {
                lines.push("· typing…".to_string());
            }
            self.typing = snapshot.partner_typing;
        }

        if snapshot.partner_online != self.online {
            if let Some(online) = snapshot.partner_online {
                let status = if online { "online" } else { "offline" };
                lines.push(format!("· your match is {status}"));
            }
            self.online = snapshot.partner_online;
        }

        if snapshot.live_connected != self.live {
            lines.push(if snapshot.live_connected {
                "· live updates on".to_string()
            } else {
                "· live updates off; polling".to_string()
            });
            self.live = snapshot.live_connected;
        }

        if snapshot.load_error != self.load_error {
            if let Some(error) = &snapshot.load_error {
                lines.push(format!("⚠️  could not load messages: {error}"));
            }
            self.load_error = snapshot.load_error.clone();
        }

        if snapshot.failed_sends.len() > self.failed {
            for (index, failed) in snapshot.failed_sends.iter().enumerate().skip(self.failed) {
                lines.push(format!(
                    "⚠️  message #{} not delivered: {} (/retry {} or /dismiss {})",
                    index + 1,
                    failed.error,
                    index + 1,
                    index + 1
                ));
            }
        }
        self.failed = snapshot.failed_sends.len();

        if snapshot.mode_switch_prompt != self.prompt {
            if let Some(target) = snapshot.mode_switch_prompt {
                lines.push(format!(
                    "? switch to {target} mode? This clears the conversation view. /yes or /no"
                ));
            }
            self.prompt = snapshot.mode_switch_prompt;
        }

        if snapshot.notice != self.notice {
            if let Some(notice) = &snapshot.notice {
                lines.push(format!("⚠️  {notice}"));
            }
            self.notice = snapshot.notice.clone();
        }

        lines
    }
}

fn format_reactions(reactions: &[(String, u32)]) -> String {
    reactions
        .iter()
        .map(|(emoji, count)| format!("{emoji}×{count}"))
        .collect::<Vec<_>>()
        .join(" ")
}
