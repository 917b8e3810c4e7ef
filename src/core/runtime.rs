//! Async driver for a [`ChatSession`].
//!
//! The controller never touches the network. This task owns the timers, the
//! live subscription and the transports: it applies queued actions, executes
//! the commands they produce on spawned tasks, feeds every result back as a
//! generation-tagged action, and publishes a fresh [`SessionSnapshot`] after
//! each step.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::session::{
    apply_action, apply_actions, send_resolved_action, ChatSession, SessionAction,
    SessionActionContext, SessionActionDispatcher, SessionActionEnvelope, SessionCommand,
    SessionError, SessionMode, SessionSnapshot,
};
use crate::transport::{LiveHandlers, Subscription, TransportSet};

/// Handle to a running session. Dropping it stops the session task.
pub struct SessionHandle {
    dispatcher: SessionActionDispatcher,
    snapshots: watch::Receiver<SessionSnapshot>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Queues an action. Returns false once the session has shut down.
    pub fn dispatch(&self, action: SessionAction) -> bool {
        self.dispatcher.dispatch(action)
    }

    pub fn dispatcher(&self) -> SessionActionDispatcher {
        self.dispatcher.clone()
    }

    pub fn snapshots(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Closes the session and waits for the live channel to be released.
    pub async fn close(mut self) {
        self.dispatcher.dispatch(SessionAction::Close);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.cancel.cancel();
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct SessionRuntime {
    session: ChatSession,
    transports: TransportSet,
    dispatcher: SessionActionDispatcher,
    cancel: CancellationToken,
    live: Option<Subscription>,
    snapshots: watch::Sender<SessionSnapshot>,
}

impl SessionRuntime {
    /// Starts the session task and immediately opens the session with the
    /// resolved identity.
    pub fn spawn(
        session: ChatSession,
        transports: TransportSet,
        user_id: Result<String, SessionError>,
    ) -> SessionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = SessionActionDispatcher::new(tx);
        let cancel = CancellationToken::new();
        let initial = session.snapshot(Instant::now().into_std());
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);

        dispatcher.dispatch(SessionAction::Open { user_id });

        let runtime = SessionRuntime {
            session,
            transports,
            dispatcher: dispatcher.clone(),
            cancel: cancel.clone(),
            live: None,
            snapshots: snapshot_tx,
        };
        let task = tokio::spawn(runtime.run(rx));

        SessionHandle {
            dispatcher,
            snapshots: snapshot_rx,
            cancel,
            task: Some(task),
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionActionEnvelope>) {
        let settings = *self.session.settings();
        let mut poll_mode = self.session.mode();
        let mut poll = ticker(settings.poll_interval_for(poll_mode));
        let mut presence = ticker(settings.presence_interval);

        loop {
            let typing_deadline = self.session.typing_deadline().map(Instant::from_std);
            let typing_sleep = sleep_until(typing_deadline.unwrap_or_else(Instant::now));

            let commands = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                envelope = rx.recv() => {
                    let Some(envelope) = envelope else {
                        break;
                    };
                    let mut batch = vec![envelope];
                    while let Ok(next) = rx.try_recv() {
                        batch.push(next);
                    }
                    apply_actions(&mut self.session, batch)
                }
                _ = typing_sleep, if typing_deadline.is_some() => {
                    self.apply(SessionAction::TypingExpired)
                }
                _ = poll.tick() => self.apply(SessionAction::PollTick),
                _ = presence.tick() => self.apply(SessionAction::PresenceTick),
            };

            let shutdown = self.execute(commands).await;

            if self.session.mode() != poll_mode {
                poll_mode = self.session.mode();
                poll = ticker(settings.poll_interval_for(poll_mode));
                debug!(mode = %poll_mode, "Poll interval reset for new mode");
            }

            self.publish();
            if shutdown {
                break;
            }
        }

        if let Some(subscription) = self.live.take() {
            subscription.close().await;
        }
        self.cancel.cancel();
        self.publish();
        info!(
            conversation_id = %self.session.conversation_id(),
            "Session task finished"
        );
    }

    fn apply(&mut self, action: SessionAction) -> Vec<SessionCommand> {
        apply_action(&mut self.session, action, SessionActionContext::capture())
            .unwrap_or_default()
    }

    fn publish(&self) {
        let snapshot = self.session.snapshot(Instant::now().into_std());
        self.snapshots.send_replace(snapshot);
    }

    /// Runs each command; returns true once the session asked to shut down.
    async fn execute(&mut self, commands: Vec<SessionCommand>) -> bool {
        let mut shutdown = false;
        for command in commands {
            match command {
                SessionCommand::FetchHistory {
                    generation,
                    mode,
                    conversation_id,
                } => {
                    let transport = self.transports.for_mode(mode);
                    self.spawn_task(async move {
                        let result = transport.fetch_history(&conversation_id).await;
                        SessionAction::HistoryLoaded { generation, result }
                    });
                }
                SessionCommand::OpenLive {
                    generation,
                    mode,
                    user_id,
                } => self.open_live(generation, mode, &user_id).await,
                SessionCommand::CloseLive => {
                    if let Some(subscription) = self.live.take() {
                        debug!("Closing live subscription");
                        subscription.close().await;
                    }
                }
                SessionCommand::Send {
                    generation,
                    mode,
                    message,
                } => {
                    let transport = self.transports.for_mode(mode);
                    self.spawn_task(async move {
                        let result = transport.send_message(&message).await;
                        send_resolved_action(generation, &message, result)
                    });
                }
                SessionCommand::SignalTyping {
                    generation,
                    mode,
                    receiver_id,
                } => {
                    let transport = self.transports.for_mode(mode);
                    let cancel = self.cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            result = transport.signal_typing(&receiver_id) => {
                                if let Err(err) = result {
                                    debug!(generation, error = %err, "Typing signal not delivered");
                                }
                            }
                        }
                    });
                }
                SessionCommand::FetchPresence { user_id } => {
                    let transport = std::sync::Arc::clone(&self.transports.conventional);
                    self.spawn_task(async move {
                        let result = transport.fetch_presence(&user_id).await;
                        SessionAction::PresenceUpdated { result }
                    });
                }
                SessionCommand::Shutdown => shutdown = true,
            }
        }
        shutdown
    }

    /// Runs `work` off the session task and feeds its result back in, unless
    /// the session is torn down first.
    fn spawn_task<F>(&self, work: F)
    where
        F: std::future::Future<Output = SessionAction> + Send + 'static,
    {
        let dispatcher = self.dispatcher.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                action = work => {
                    dispatcher.dispatch(action);
                }
            }
        });
    }

    async fn open_live(&mut self, generation: u64, mode: SessionMode, user_id: &str) {
        if let Some(previous) = self.live.take() {
            previous.close().await;
        }

        let transport = self.transports.for_mode(mode);
        let handlers = live_handlers(self.dispatcher.clone(), generation);
        let result = match transport.subscribe_live(user_id, handlers).await {
            Ok(Some(subscription)) => {
                info!(generation, mode = %mode, "Live channel subscribed");
                self.live = Some(subscription);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(err) => {
                warn!(generation, error = %err, "Live channel unavailable");
                Err(err)
            }
        };
        self.dispatcher
            .dispatch(SessionAction::LiveSubscribed { generation, result });
    }
}

/// Callbacks that tag every live event with the generation that opened the
/// channel, so events from a superseded channel are dropped.
fn live_handlers(dispatcher: SessionActionDispatcher, generation: u64) -> LiveHandlers {
    let on_message = dispatcher.clone();
    let on_typing = dispatcher.clone();
    LiveHandlers::new(
        move |message| {
            on_message.dispatch(SessionAction::LiveMessage {
                generation,
                message,
            });
        },
        move || {
            on_typing.dispatch(SessionAction::LiveTyping { generation });
        },
        move |connected| {
            dispatcher.dispatch(SessionAction::LiveConnection {
                generation,
                connected,
            });
        },
    )
}

fn ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
