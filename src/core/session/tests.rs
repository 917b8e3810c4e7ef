use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};

use super::*;
use crate::core::message::TransactionRef;

const ME: &str = "U1";
const PARTNER: &str = "U2";
const CHAT: &str = "match-1";

fn ts(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().expect("valid timestamp")
}

fn msg(sender: &str, body: &str, millis: i64) -> Message {
    Message::confirmed(sender, body, ts(millis), MessageOrigin::Conventional)
}

fn ledger_msg(sender: &str, body: &str, millis: i64, tx: &str) -> Message {
    Message::confirmed(sender, body, ts(millis), MessageOrigin::LedgerBacked)
        .with_transaction(TransactionRef(tx.to_string()))
}

struct Harness {
    session: ChatSession,
    base: Instant,
}

impl Harness {
    fn new(mode: SessionMode) -> Self {
        let settings = SessionSettings {
            default_mode: mode,
            ..SessionSettings::default()
        };
        Self {
            session: ChatSession::new(CHAT, Some(PARTNER.to_string()), settings),
            base: Instant::now(),
        }
    }

    /// Opens as `ME` and completes the first load with `history`.
    fn ready(mode: SessionMode, history: Vec<Message>) -> Self {
        let mut harness = Self::new(mode);
        harness
            .apply(SessionAction::Open {
                user_id: Ok(ME.to_string()),
            })
            .expect("open");
        harness
            .apply(SessionAction::HistoryLoaded {
                generation: 0,
                result: Ok(history),
            })
            .expect("history");
        harness
    }

    fn ctx(&self, millis: u64) -> SessionActionContext {
        SessionActionContext::new(
            self.base + Duration::from_millis(millis),
            ts(millis as i64),
        )
    }

    fn apply(&mut self, action: SessionAction) -> Result<Vec<SessionCommand>, SessionError> {
        self.apply_at(action, 0)
    }

    fn apply_at(
        &mut self,
        action: SessionAction,
        millis: u64,
    ) -> Result<Vec<SessionCommand>, SessionError> {
        let ctx = self.ctx(millis);
        apply_action(&mut self.session, action, ctx)
    }

    fn send(&mut self, body: &str) -> OutgoingMessage {
        let commands = self
            .apply(SessionAction::SubmitMessage {
                body: body.to_string(),
            })
            .expect("send accepted");
        sent_message(&commands)
    }

    fn bodies(&self) -> Vec<String> {
        self.session
            .log()
            .iter()
            .map(|entry| entry.body.clone())
            .collect()
    }
}

fn sent_message(commands: &[SessionCommand]) -> OutgoingMessage {
    commands
        .iter()
        .find_map(|command| match command {
            SessionCommand::Send { message, .. } => Some(message.clone()),
            _ => None,
        })
        .expect("send command")
}

fn accepted() -> Result<Confirmation, TransportError> {
    Ok(Confirmation {
        accepted_at: ts(0),
        transaction: None,
    })
}

#[test]
fn missing_identity_blocks_all_network_work() {
    let mut harness = Harness::new(MessageOrigin::Conventional);
    let result = harness.apply(SessionAction::Open {
        user_id: Err(SessionError::IdentityUnavailable),
    });
    assert_eq!(result, Err(SessionError::IdentityUnavailable));
    assert_eq!(harness.session.state(), SessionState::Uninitialized);
    assert!(harness.session.identity_missing());

    assert_eq!(harness.apply(SessionAction::PollTick), Ok(Vec::new()));
    assert_eq!(harness.apply(SessionAction::PresenceTick), Ok(Vec::new()));
    assert_eq!(
        harness.apply(SessionAction::SubmitMessage { body: "hi".into() }),
        Err(SessionError::IdentityUnavailable)
    );
    assert!(harness.session.snapshot(harness.base).identity_missing);
}

#[test]
fn conventional_load_seeds_log_then_opens_live_channel() {
    let mut harness = Harness::new(MessageOrigin::Conventional);
    let commands = harness
        .apply(SessionAction::Open {
            user_id: Ok(ME.to_string()),
        })
        .expect("open");
    assert_eq!(
        commands,
        vec![SessionCommand::FetchHistory {
            generation: 0,
            mode: MessageOrigin::Conventional,
            conversation_id: CHAT.to_string(),
        }]
    );
    assert_eq!(
        harness.session.state(),
        SessionState::Loading(MessageOrigin::Conventional)
    );

    let commands = harness
        .apply(SessionAction::HistoryLoaded {
            generation: 0,
            result: Ok(vec![msg(PARTNER, "hey", 1_000), msg(ME, "hello", 2_000)]),
        })
        .expect("history");
    assert_eq!(
        commands,
        vec![SessionCommand::OpenLive {
            generation: 0,
            mode: MessageOrigin::Conventional,
            user_id: ME.to_string(),
        }]
    );
    assert_eq!(
        harness.session.state(),
        SessionState::Ready(MessageOrigin::Conventional)
    );

    let snapshot = harness.session.snapshot(harness.base);
    assert_eq!(snapshot.state, "ready");
    assert!(!snapshot.messages[0].is_me);
    assert!(snapshot.messages[1].is_me);
}

#[test]
fn ledger_mode_never_opens_a_live_channel() {
    let mut harness = Harness::ready(MessageOrigin::LedgerBacked, Vec::new());
    assert_eq!(
        harness.session.state(),
        SessionState::Ready(MessageOrigin::LedgerBacked)
    );
    let commands = harness.apply(SessionAction::PollTick).expect("tick");
    assert!(commands
        .iter()
        .all(|command| matches!(command, SessionCommand::FetchHistory { .. })));
}

#[test]
fn repeated_polls_merge_without_duplicates() {
    let mut harness = Harness::ready(
        MessageOrigin::Conventional,
        vec![msg("a", "m1", 1_000), msg("b", "m2", 2_000)],
    );
    harness.apply_at(SessionAction::PollTick, 6_000).expect("tick");
    harness
        .apply(SessionAction::HistoryLoaded {
            generation: 0,
            result: Ok(vec![
                msg("a", "m1", 1_000),
                msg("b", "m2", 2_000),
                msg("a", "m3", 5_500),
            ]),
        })
        .expect("history");
    assert_eq!(harness.bodies(), vec!["m1", "m2", "m3"]);
}

#[test]
fn push_echo_replaces_pending_entry() {
    let mut harness = Harness::ready(MessageOrigin::Conventional, Vec::new());
    let outgoing = harness.send("hi");
    assert_eq!(harness.session.log().pending_count(), 1);

    harness
        .apply_at(
            SessionAction::LiveMessage {
                generation: 0,
                message: msg(ME, "hi", 0),
            },
            50,
        )
        .expect("push");
    assert_eq!(harness.bodies(), vec!["hi"]);
    assert!(!harness.session.log().entries()[0].pending);

    let commands = harness
        .apply(send_resolved_action(0, &outgoing, accepted()))
        .expect("resolved");
    assert_eq!(harness.bodies(), vec!["hi"]);
    assert!(matches!(
        commands.as_slice(),
        [SessionCommand::FetchHistory { generation: 0, .. }]
    ));
}

#[test]
fn send_success_before_push_leaves_exactly_one_copy() {
    let mut harness = Harness::ready(MessageOrigin::Conventional, Vec::new());
    let outgoing = harness.send("hi");
    harness
        .apply(send_resolved_action(0, &outgoing, accepted()))
        .expect("resolved");
    assert!(harness.session.log().is_empty());

    let mut echoed = msg(ME, "hi", 10);
    echoed.client_key = Some(outgoing.client_key.clone());
    harness
        .apply(SessionAction::LiveMessage {
            generation: 0,
            message: echoed.clone(),
        })
        .expect("push");
    harness
        .apply(SessionAction::HistoryLoaded {
            generation: 0,
            result: Ok(vec![echoed]),
        })
        .expect("refresh");
    assert_eq!(harness.bodies(), vec!["hi"]);
}

#[test]
fn canonical_copy_of_an_earlier_send_leaves_a_repeat_pending() {
    let mut harness = Harness::ready(MessageOrigin::LedgerBacked, Vec::new());
    let first = harness.send("gm");
    let commands = harness
        .apply(send_resolved_action(0, &first, accepted()))
        .expect("first confirmed");
    assert!(matches!(
        commands.as_slice(),
        [SessionCommand::FetchHistory { .. }]
    ));

    let second = harness.send("gm");
    assert_ne!(first.client_key, second.client_key);

    let canonical = ledger_msg(ME, "gm", 10, "0x1").with_client_key(first.client_key.clone());
    harness
        .apply(SessionAction::HistoryLoaded {
            generation: 0,
            result: Ok(vec![canonical]),
        })
        .expect("refresh");
    assert_eq!(harness.bodies(), vec!["gm", "gm"]);
    assert_eq!(harness.session.log().pending_count(), 1);

    harness
        .apply(send_resolved_action(
            0,
            &second,
            Err(TransportError::rejected(None, "tx failed")),
        ))
        .expect("second rejected");
    assert_eq!(harness.bodies(), vec!["gm"]);
    let failed = harness.session.failed_sends();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].body, "gm");
    assert_eq!(failed[0].client_key, second.client_key);
}

#[test]
fn identical_text_cannot_be_pending_twice() {
    let mut harness = Harness::ready(MessageOrigin::Conventional, Vec::new());
    harness.send("same");
    let second = harness.apply(SessionAction::SubmitMessage {
        body: "same".into(),
    });
    assert_eq!(second, Err(SessionError::DuplicatePending));
    assert_eq!(harness.session.log().pending_count(), 1);
    assert_eq!(
        harness.session.snapshot(harness.base).notice.as_deref(),
        Some("an identical message is still being delivered")
    );

    harness.send("different");
    assert_eq!(harness.session.log().pending_count(), 2);
}

#[test]
fn rejected_send_removes_only_its_pending_entry() {
    let mut harness = Harness::ready(
        MessageOrigin::Conventional,
        vec![msg(PARTNER, "m1", 1_000)],
    );
    let outgoing = harness.send("yo");
    let before_other: Vec<Message> = harness
        .session
        .log()
        .iter()
        .filter(|entry| !entry.pending)
        .cloned()
        .collect();

    harness
        .apply(send_resolved_action(
            0,
            &outgoing,
            Err(TransportError::rejected(Some(500), "boom")),
        ))
        .expect("resolved");

    assert_eq!(harness.session.log().entries(), before_other.as_slice());
    let failed = harness.session.failed_sends();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].body, "yo");
    assert!(!failed[0].unconfirmed);
    assert_eq!(harness.session.snapshot(harness.base).failed_sends.len(), 1);
}

#[test]
fn blank_and_early_sends_are_rejected() {
    let mut harness = Harness::new(MessageOrigin::Conventional);
    harness
        .apply(SessionAction::Open {
            user_id: Ok(ME.to_string()),
        })
        .expect("open");
    assert_eq!(
        harness.apply(SessionAction::SubmitMessage { body: "hi".into() }),
        Err(SessionError::NotReady)
    );
    harness
        .apply(SessionAction::HistoryLoaded {
            generation: 0,
            result: Ok(Vec::new()),
        })
        .expect("history");
    assert_eq!(
        harness.apply(SessionAction::SubmitMessage { body: "   ".into() }),
        Err(SessionError::EmptyMessage)
    );
}

#[test]
fn confirmation_timeout_keeps_entry_visible_as_unconfirmed() {
    let mut harness = Harness::ready(MessageOrigin::LedgerBacked, Vec::new());
    let outgoing = harness.send("gm");
    harness
        .apply(send_resolved_action(
            0,
            &outgoing,
            Err(TransportError::ConfirmationTimeout {
                transaction: TransactionRef("0xabc".into()),
            }),
        ))
        .expect("resolved");

    let entry = &harness.session.log().entries()[0];
    assert!(entry.unconfirmed);
    assert!(!entry.pending);
    assert!(harness.session.failed_sends()[0].unconfirmed);

    // The transaction landed after all; the poll reconciles it.
    harness.apply(SessionAction::PollTick).expect("tick");
    harness
        .apply(SessionAction::HistoryLoaded {
            generation: 0,
            result: Ok(vec![ledger_msg(ME, "gm", 100, "0xabc")]),
        })
        .expect("history");
    assert_eq!(harness.bodies(), vec!["gm"]);
    assert!(!harness.session.log().entries()[0].is_local_echo());
    assert!(harness.session.failed_sends().is_empty());
}

#[test]
fn retry_replaces_unconfirmed_entry_with_a_fresh_send() {
    let mut harness = Harness::ready(MessageOrigin::LedgerBacked, Vec::new());
    let first = harness.send("gm");
    harness
        .apply(send_resolved_action(
            0,
            &first,
            Err(TransportError::ConfirmationTimeout {
                transaction: TransactionRef("0x1".into()),
            }),
        ))
        .expect("resolved");

    let commands = harness
        .apply(SessionAction::RetryFailedSend {
            client_key: first.client_key.clone(),
        })
        .expect("retry");
    let retried = sent_message(&commands);
    assert_ne!(retried.client_key, first.client_key);
    assert_eq!(retried.body, "gm");
    assert_eq!(harness.session.log().len(), 1);
    assert!(harness.session.log().entries()[0].pending);
    assert!(harness.session.failed_sends().is_empty());
}

#[test]
fn dismissing_a_failure_twice_is_an_error() {
    let mut harness = Harness::ready(MessageOrigin::Conventional, Vec::new());
    let outgoing = harness.send("lost");
    harness
        .apply(send_resolved_action(
            0,
            &outgoing,
            Err(TransportError::LiveChannelClosed),
        ))
        .expect("resolved");
    harness
        .apply(SessionAction::DismissFailedSend {
            client_key: outgoing.client_key.clone(),
        })
        .expect("dismiss");
    assert!(harness.session.failed_sends().is_empty());
    assert_eq!(
        harness.apply(SessionAction::DismissFailedSend {
            client_key: outgoing.client_key,
        }),
        Err(SessionError::UnknownMessage)
    );
}

#[test]
fn mode_switch_clears_log_and_reloads_from_the_other_transport() {
    let mut harness = Harness::ready(
        MessageOrigin::Conventional,
        vec![msg(PARTNER, "old", 1_000)],
    );
    harness
        .apply(SessionAction::LiveSubscribed {
            generation: 0,
            result: Ok(true),
        })
        .expect("subscribed");

    harness
        .apply(SessionAction::RequestModeSwitch)
        .expect("request");
    assert_eq!(
        harness.session.snapshot(harness.base).mode_switch_prompt,
        Some(MessageOrigin::LedgerBacked)
    );
    assert_eq!(harness.bodies(), vec!["old"]);

    let commands = harness
        .apply(SessionAction::ConfirmModeSwitch)
        .expect("confirm");
    assert_eq!(
        commands,
        vec![
            SessionCommand::CloseLive,
            SessionCommand::FetchHistory {
                generation: 1,
                mode: MessageOrigin::LedgerBacked,
                conversation_id: CHAT.to_string(),
            },
        ]
    );
    assert!(harness.session.log().is_empty());
    assert_eq!(
        harness.session.state(),
        SessionState::Loading(MessageOrigin::LedgerBacked)
    );
    assert!(!harness.session.live_connected());
}

#[test]
fn results_from_a_superseded_generation_are_dropped() {
    let mut harness = Harness::ready(MessageOrigin::Conventional, Vec::new());
    let outgoing = harness.send("before switch");
    harness.apply(SessionAction::PollTick).expect("tick");
    harness
        .apply(SessionAction::RequestModeSwitch)
        .expect("request");
    harness
        .apply(SessionAction::ConfirmModeSwitch)
        .expect("confirm");

    harness
        .apply(SessionAction::HistoryLoaded {
            generation: 0,
            result: Ok(vec![msg(PARTNER, "stale", 1)]),
        })
        .expect("stale history");
    harness
        .apply(SessionAction::LiveMessage {
            generation: 0,
            message: msg(PARTNER, "stale push", 2),
        })
        .expect("stale push");
    harness
        .apply(SessionAction::LiveTyping { generation: 0 })
        .expect("stale typing");
    harness
        .apply(send_resolved_action(
            0,
            &outgoing,
            Err(TransportError::rejected(Some(500), "late")),
        ))
        .expect("stale send");

    assert!(harness.session.log().is_empty());
    assert!(harness.session.failed_sends().is_empty());
    assert!(!harness.session.partner_typing(harness.base));
    assert_eq!(
        harness.session.state(),
        SessionState::Loading(MessageOrigin::LedgerBacked)
    );

    harness
        .apply(SessionAction::HistoryLoaded {
            generation: 1,
            result: Ok(vec![ledger_msg(PARTNER, "fresh", 5, "0x5")]),
        })
        .expect("fresh history");
    assert_eq!(harness.bodies(), vec!["fresh"]);
}

#[test]
fn cancelling_a_switch_leaves_everything_in_place() {
    let mut harness = Harness::ready(
        MessageOrigin::Conventional,
        vec![msg(PARTNER, "keep", 1_000)],
    );
    harness
        .apply(SessionAction::RequestModeSwitch)
        .expect("request");
    harness
        .apply(SessionAction::CancelModeSwitch)
        .expect("cancel");
    assert_eq!(
        harness.session.state(),
        SessionState::Ready(MessageOrigin::Conventional)
    );
    assert_eq!(harness.session.generation(), 0);
    assert_eq!(harness.bodies(), vec!["keep"]);
    assert_eq!(
        harness.apply(SessionAction::ConfirmModeSwitch),
        Err(SessionError::NoModeSwitchPending)
    );
}

#[test]
fn toggling_twice_returns_to_the_original_mode() {
    let mut harness = Harness::ready(MessageOrigin::Conventional, Vec::new());
    for expected in [MessageOrigin::LedgerBacked, MessageOrigin::Conventional] {
        harness
            .apply(SessionAction::RequestModeSwitch)
            .expect("request");
        harness
            .apply(SessionAction::ConfirmModeSwitch)
            .expect("confirm");
        let generation = harness.session.generation();
        let commands = harness
            .apply(SessionAction::HistoryLoaded {
                generation,
                result: Ok(Vec::new()),
            })
            .expect("history");
        assert_eq!(harness.session.mode(), expected);
        assert_eq!(
            commands.is_empty(),
            expected == MessageOrigin::LedgerBacked
        );
    }
    assert_eq!(harness.session.generation(), 2);
}

#[test]
fn history_loaded_while_awaiting_switch_confirmation_keeps_the_prompt() {
    let mut harness = Harness::new(MessageOrigin::Conventional);
    harness
        .apply(SessionAction::Open {
            user_id: Ok(ME.to_string()),
        })
        .expect("open");
    harness
        .apply(SessionAction::RequestModeSwitch)
        .expect("request");
    harness
        .apply(SessionAction::HistoryLoaded {
            generation: 0,
            result: Ok(vec![msg(PARTNER, "m1", 1)]),
        })
        .expect("history");
    assert!(matches!(
        harness.session.state(),
        SessionState::SwitchingMode { loaded: true, .. }
    ));
    harness
        .apply(SessionAction::CancelModeSwitch)
        .expect("cancel");
    assert_eq!(
        harness.session.state(),
        SessionState::Ready(MessageOrigin::Conventional)
    );
}

#[test]
fn at_most_one_history_fetch_in_flight() {
    let mut harness = Harness::ready(MessageOrigin::LedgerBacked, Vec::new());
    let first = harness.apply(SessionAction::PollTick).expect("tick");
    assert_eq!(first.len(), 1);
    let second = harness.apply(SessionAction::PollTick).expect("tick");
    assert!(second.is_empty());

    harness
        .apply(SessionAction::HistoryLoaded {
            generation: 0,
            result: Ok(Vec::new()),
        })
        .expect("history");
    let third = harness.apply(SessionAction::PollTick).expect("tick");
    assert_eq!(third.len(), 1);
}

#[test]
fn initial_load_failure_is_visible_and_retried() {
    let mut harness = Harness::new(MessageOrigin::LedgerBacked);
    harness
        .apply(SessionAction::Open {
            user_id: Ok(ME.to_string()),
        })
        .expect("open");
    harness
        .apply(SessionAction::HistoryLoaded {
            generation: 0,
            result: Err(TransportError::NetworkFailure("offline".into())),
        })
        .expect("failure");

    let snapshot = harness.session.snapshot(harness.base);
    assert!(snapshot.messages.is_empty());
    assert_eq!(snapshot.state, "loading");
    assert_eq!(
        snapshot.load_error.as_deref(),
        Some("network failure: offline")
    );

    let retry = harness.apply(SessionAction::PollTick).expect("tick");
    assert!(matches!(
        retry.as_slice(),
        [SessionCommand::FetchHistory { .. }]
    ));
    harness
        .apply(SessionAction::HistoryLoaded {
            generation: 0,
            result: Ok(vec![ledger_msg(PARTNER, "hi", 1, "0x1")]),
        })
        .expect("history");
    let snapshot = harness.session.snapshot(harness.base);
    assert_eq!(snapshot.state, "ready");
    assert_eq!(snapshot.load_error, None);
}

#[test]
fn transient_poll_failures_surface_only_after_threshold() {
    let mut harness = Harness::ready(
        MessageOrigin::LedgerBacked,
        vec![ledger_msg(PARTNER, "kept", 1, "0x1")],
    );
    let threshold = harness.session.settings().failure_threshold;

    for attempt in 1..=threshold {
        harness.apply(SessionAction::PollTick).expect("tick");
        harness
            .apply(SessionAction::HistoryLoaded {
                generation: 0,
                result: Err(TransportError::NetworkFailure("blip".into())),
            })
            .expect("failure");
        let visible = harness.session.visible_load_error().is_some();
        assert_eq!(visible, attempt >= threshold, "attempt {attempt}");
        assert_eq!(harness.bodies(), vec!["kept"]);
    }

    harness.apply(SessionAction::PollTick).expect("tick");
    harness
        .apply(SessionAction::HistoryLoaded {
            generation: 0,
            result: Ok(Vec::new()),
        })
        .expect("recovered");
    assert_eq!(harness.session.consecutive_failures(), 0);
    assert!(harness.session.visible_load_error().is_none());
}

#[test]
fn rejected_or_garbled_polls_surface_immediately() {
    let mut harness = Harness::ready(
        MessageOrigin::Conventional,
        vec![msg(PARTNER, "kept", 1_000)],
    );

    harness.apply(SessionAction::PollTick).expect("tick");
    harness
        .apply(SessionAction::HistoryLoaded {
            generation: 0,
            result: Err(TransportError::rejected(Some(403), "forbidden")),
        })
        .expect("failure");
    assert_eq!(harness.session.consecutive_failures(), 1);
    assert!(matches!(
        harness.session.visible_load_error(),
        Some(TransportError::ServerRejected { .. })
    ));

    harness.apply(SessionAction::PollTick).expect("tick");
    harness
        .apply(SessionAction::HistoryLoaded {
            generation: 0,
            result: Err(TransportError::Malformed("not json".into())),
        })
        .expect("failure");
    assert!(harness.session.visible_load_error().is_some());
    assert_eq!(harness.bodies(), vec!["kept"]);
}

#[test]
fn typing_indicator_expires_and_clears_on_partner_message() {
    let mut harness = Harness::ready(MessageOrigin::Conventional, Vec::new());
    harness
        .apply_at(SessionAction::LiveTyping { generation: 0 }, 1_000)
        .expect("typing");
    assert!(harness.session.partner_typing(harness.base + Duration::from_millis(3_500)));
    assert!(!harness.session.partner_typing(harness.base + Duration::from_millis(4_000)));

    harness
        .apply_at(SessionAction::TypingExpired, 4_000)
        .expect("expired");
    assert_eq!(harness.session.typing_deadline(), None);

    harness
        .apply_at(SessionAction::LiveTyping { generation: 0 }, 5_000)
        .expect("typing");
    harness
        .apply_at(
            SessionAction::LiveMessage {
                generation: 0,
                message: msg(PARTNER, "done typing", 5_100),
            },
            5_100,
        )
        .expect("push");
    assert!(!harness.session.partner_typing(harness.base + Duration::from_millis(5_200)));
}

#[test]
fn outbound_typing_signals_are_throttled() {
    let mut harness = Harness::ready(MessageOrigin::Conventional, Vec::new());
    assert!(harness
        .apply(SessionAction::ComposeChanged)
        .expect("compose")
        .is_empty());

    harness
        .apply(SessionAction::LiveConnection {
            generation: 0,
            connected: true,
        })
        .expect("connected");
    let first = harness
        .apply_at(SessionAction::ComposeChanged, 0)
        .expect("compose");
    assert_eq!(
        first,
        vec![SessionCommand::SignalTyping {
            generation: 0,
            mode: MessageOrigin::Conventional,
            receiver_id: PARTNER.to_string(),
        }]
    );
    assert!(harness
        .apply_at(SessionAction::ComposeChanged, 1_000)
        .expect("compose")
        .is_empty());
    assert_eq!(
        harness
            .apply_at(SessionAction::ComposeChanged, 2_000)
            .expect("compose")
            .len(),
        1
    );
}

#[test]
fn reactions_are_local_and_survive_later_polls() {
    let mut harness = Harness::ready(MessageOrigin::Conventional, vec![msg(PARTNER, "pic", 1)]);
    harness
        .apply(SessionAction::AddReaction {
            index: 0,
            emoji: "🔥".into(),
        })
        .expect("react");
    harness
        .apply(SessionAction::AddReaction {
            index: 0,
            emoji: "🔥".into(),
        })
        .expect("react");
    assert_eq!(
        harness.apply(SessionAction::AddReaction {
            index: 9,
            emoji: "🔥".into(),
        }),
        Err(SessionError::UnknownMessage)
    );
    assert_eq!(
        harness.apply(SessionAction::AddReaction {
            index: 0,
            emoji: " ".into(),
        }),
        Err(SessionError::InvalidReaction)
    );

    harness.apply(SessionAction::PollTick).expect("tick");
    harness
        .apply(SessionAction::HistoryLoaded {
            generation: 0,
            result: Ok(vec![msg(PARTNER, "pic", 1)]),
        })
        .expect("history");
    let snapshot = harness.session.snapshot(harness.base);
    assert_eq!(snapshot.messages[0].reactions, vec![("🔥".to_string(), 2)]);
}

#[test]
fn presence_is_polled_for_the_partner_and_survives_mode_switch() {
    let mut harness = Harness::ready(MessageOrigin::Conventional, Vec::new());
    assert_eq!(
        harness.apply(SessionAction::PresenceTick),
        Ok(vec![SessionCommand::FetchPresence {
            user_id: PARTNER.to_string()
        }])
    );
    harness
        .apply(SessionAction::PresenceUpdated {
            result: Ok(Some(true)),
        })
        .expect("presence");
    harness
        .apply(SessionAction::RequestModeSwitch)
        .expect("request");
    harness
        .apply(SessionAction::ConfirmModeSwitch)
        .expect("confirm");
    harness
        .apply(SessionAction::PresenceUpdated {
            result: Err(TransportError::NetworkFailure("x".into())),
        })
        .expect("presence error");
    assert_eq!(harness.session.partner_online(), Some(true));
}

#[test]
fn live_subscription_outcomes() {
    let mut harness = Harness::ready(MessageOrigin::Conventional, Vec::new());
    harness
        .apply(SessionAction::LiveSubscribed {
            generation: 0,
            result: Err(TransportError::NetworkFailure("refused".into())),
        })
        .expect("subscribe failed");
    let commands = harness.apply(SessionAction::PollTick).expect("tick");
    assert!(commands
        .iter()
        .any(|command| matches!(command, SessionCommand::OpenLive { .. })));

    harness
        .apply(SessionAction::LiveSubscribed {
            generation: 0,
            result: Ok(false),
        })
        .expect("no push");
    harness
        .apply(SessionAction::HistoryLoaded {
            generation: 0,
            result: Ok(Vec::new()),
        })
        .expect("history");
    let commands = harness.apply(SessionAction::PollTick).expect("tick");
    assert!(!commands
        .iter()
        .any(|command| matches!(command, SessionCommand::OpenLive { .. })));
}

#[test]
fn close_is_terminal() {
    let mut harness = Harness::ready(MessageOrigin::Conventional, vec![msg(PARTNER, "m", 1)]);
    harness
        .apply(SessionAction::LiveSubscribed {
            generation: 0,
            result: Ok(true),
        })
        .expect("subscribed");
    let commands = harness.apply(SessionAction::Close).expect("close");
    assert_eq!(
        commands,
        vec![SessionCommand::CloseLive, SessionCommand::Shutdown]
    );
    assert_eq!(harness.session.state(), SessionState::Closed);

    assert_eq!(harness.apply(SessionAction::PollTick), Ok(Vec::new()));
    assert_eq!(
        harness.apply(SessionAction::HistoryLoaded {
            generation: 1,
            result: Ok(vec![msg(PARTNER, "late", 2)]),
        }),
        Ok(Vec::new())
    );
    assert_eq!(
        harness.apply(SessionAction::SubmitMessage { body: "hi".into() }),
        Err(SessionError::Closed)
    );
    assert_eq!(harness.apply(SessionAction::Close), Ok(Vec::new()));
    assert!(harness.session.log().is_empty());
}

/// Interleaves pushes, polls, sends and resolutions and checks the two log
/// invariants after every step.
#[test]
fn log_stays_sorted_and_never_reorders_under_interleaving() {
    let mut harness = Harness::ready(MessageOrigin::Conventional, Vec::new());
    let history = [
        msg(PARTNER, "p1", 1_000),
        msg(ME, "u1", 1_500),
        msg(PARTNER, "p2", 2_000),
        msg(PARTNER, "p3", 2_001),
        msg(ME, "u2", 3_000),
        msg(PARTNER, "p4", 4_000),
    ];

    let mut previous: Vec<Message> = Vec::new();
    let mut pending: Vec<OutgoingMessage> = Vec::new();
    for step in 0..24_u64 {
        let action = match step % 6 {
            0 => SessionAction::LiveMessage {
                generation: 0,
                message: history[(step as usize * 5) % history.len()].clone(),
            },
            1 => SessionAction::HistoryLoaded {
                generation: 0,
                result: Ok(history[..((step as usize / 6) + 2).min(history.len())]
                    .iter()
                    .rev()
                    .cloned()
                    .collect()),
            },
            2 => SessionAction::SubmitMessage {
                body: format!("local {step}"),
            },
            3 => match pending.pop() {
                Some(outgoing) => send_resolved_action(0, &outgoing, accepted()),
                None => SessionAction::PollTick,
            },
            4 => SessionAction::LiveMessage {
                generation: 0,
                message: msg(PARTNER, &format!("late {step}"), 500 + step as i64),
            },
            _ => SessionAction::PollTick,
        };
        let commands = harness
            .apply_at(action, step * 100)
            .expect("action applies");
        if let Some(outgoing) = commands.iter().find_map(|command| match command {
            SessionCommand::Send { message, .. } => Some(message.clone()),
            _ => None,
        }) {
            pending.push(outgoing);
        }

        let log = harness.session.log();
        assert!(log.is_sorted(), "unsorted after step {step}");

        let survivors: Vec<&Message> = previous
            .iter()
            .filter(|entry| {
                !entry.is_local_echo()
                    && log.iter().any(|current| current.identity() == entry.identity())
            })
            .collect();
        let order: Vec<usize> = survivors
            .iter()
            .filter_map(|entry| {
                log.iter()
                    .position(|current| current.identity() == entry.identity())
            })
            .collect();
        assert!(
            order.windows(2).all(|pair| pair[0] < pair[1]),
            "reordered after step {step}"
        );
        assert_eq!(
            survivors.len(),
            previous.iter().filter(|e| !e.is_local_echo()).count(),
            "confirmed entry lost after step {step}"
        );
        previous = log.entries().to_vec();
    }
}
