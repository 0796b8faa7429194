//! The user station's authentication state machine.
//!
//! A single actor task owns the relay connection. It drains an action queue
//! fed by [`StationClient`]s, reads packets from the socket, and reports
//! everything that happens as [`StationEvent`]s on an unbounded channel, so a
//! slow consumer never stalls packet reads. Writes go through a writer pump.

use crate::config::StationConfig;
use crate::error::StationError;
use chrono::{DateTime, Utc};
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use samcom_common::transport::{self, ClientStream, Inbound, Outbound};
use samcom_common::types::{reason, PacketIdGen};
use samcom_common::{AuthStatus, Body, LogoutStatus, Packet};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Duration, Instant};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

const ACTION_QUEUE_CAPACITY: usize = 64;
const WRITE_QUEUE_CAPACITY: usize = 256;

/// Reason given to requests that were in flight when the link dropped.
pub const CONNECTION_LOST: &str = "connection lost";

/// Reason given when the relay does not complete the WebSocket handshake
/// within the authentication timeout.
pub const CONNECT_TIMED_OUT: &str = "connect timed out";

/// Where the station is in its authentication lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StationState {
    /// No relay connection.
    Disconnected,
    /// Connected; `auth` sent, waiting for the outcome or a retry.
    Authenticating,
    /// Authenticated; text may be sent.
    Authenticated,
    /// Logged out. Terminal.
    LoggedOut,
}

impl fmt::Display for StationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::LoggedOut => "logged_out",
        })
    }
}

/// Notifications for the station's owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StationEvent {
    /// The center accepted the challenge response.
    Authenticated,
    /// Authentication failed or timed out; `connect` again to retry.
    AuthenticationFailed {
        /// Failure reason.
        reason: String,
    },
    /// A text from another user arrived.
    MessageReceived {
        /// Sending user.
        source_user: String,
        /// Message body.
        message: String,
        /// Local receive time.
        received_at: DateTime<Utc>,
    },
    /// The center forwarded one of our texts to its target's relay.
    TextForwarded {
        /// The text's target.
        target_user: String,
    },
    /// Logout completed.
    LoggedOut,
    /// An action was refused or the network reported an error.
    Error {
        /// Error reason.
        reason: String,
    },
    /// The relay connection dropped before logout.
    Disconnected {
        /// Why the link ended.
        reason: String,
    },
}

type Reply = Option<oneshot::Sender<Result<(), String>>>;

/// Requests from the station's owner to the station task.
#[derive(Debug)]
pub enum Action {
    /// Open the relay connection and authenticate, or retry a failed attempt.
    Connect {
        /// Resolved once authentication succeeds or fails.
        reply: Reply,
    },
    /// Send a text to another user.
    SendText {
        /// Receiving user.
        target_user: String,
        /// Message body.
        message: String,
        /// Resolved when the center acks or refuses the text.
        reply: Reply,
    },
    /// Log out and stop sending.
    Logout {
        /// Resolved when the center confirms or the link closes.
        reply: Reply,
    },
}

/// Cloneable front door to a running station.
#[derive(Debug, Clone)]
pub struct StationClient {
    actions: mpsc::Sender<Action>,
    state: watch::Receiver<StationState>,
}

impl StationClient {
    pub(crate) const fn new(
        actions: mpsc::Sender<Action>,
        state: watch::Receiver<StationState>,
    ) -> Self {
        Self { actions, state }
    }

    async fn request(
        &self,
        action: impl FnOnce(Reply) -> Action,
    ) -> Result<(), StationError> {
        let (tx, rx) = oneshot::channel();
        self.actions
            .send(action(Some(tx)))
            .await
            .map_err(|_| StationError::Stopped)?;
        rx.await
            .map_err(|_| StationError::Stopped)?
            .map_err(StationError::Rejected)
    }

    /// Connects and authenticates, waiting for the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`StationError::Rejected`] with the failure reason, or
    /// [`StationError::Stopped`] if the station task is gone.
    pub async fn connect(&self) -> Result<(), StationError> {
        self.request(|reply| Action::Connect { reply }).await
    }

    /// Sends a text and waits until the center forwards or refuses it.
    ///
    /// # Errors
    ///
    /// Returns [`StationError::Rejected`] with the refusal reason, or
    /// [`StationError::Stopped`] if the station task is gone.
    pub async fn send_text(&self, target_user: &str, message: &str) -> Result<(), StationError> {
        self.request(|reply| Action::SendText {
            target_user: target_user.to_string(),
            message: message.to_string(),
            reply,
        })
        .await
    }

    /// Logs out, waiting for the center's confirmation.
    ///
    /// # Errors
    ///
    /// Returns [`StationError::Rejected`] if the station is not authenticated,
    /// or [`StationError::Stopped`] if the station task is gone.
    pub async fn logout(&self) -> Result<(), StationError> {
        self.request(|reply| Action::Logout { reply }).await
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> StationState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<StationState> {
        self.state.clone()
    }
}

/// Owner's handle to a spawned station: actions, state and events.
#[derive(Debug)]
pub struct StationHandle {
    client: StationClient,
    events: mpsc::UnboundedReceiver<StationEvent>,
    task: JoinHandle<()>,
}

impl StationHandle {
    /// See [`StationClient::connect`].
    ///
    /// # Errors
    ///
    /// As [`StationClient::connect`].
    pub async fn connect(&self) -> Result<(), StationError> {
        self.client.connect().await
    }

    /// See [`StationClient::send_text`].
    ///
    /// # Errors
    ///
    /// As [`StationClient::send_text`].
    pub async fn send_text(&self, target_user: &str, message: &str) -> Result<(), StationError> {
        self.client.send_text(target_user, message).await
    }

    /// See [`StationClient::logout`].
    ///
    /// # Errors
    ///
    /// As [`StationClient::logout`].
    pub async fn logout(&self) -> Result<(), StationError> {
        self.client.logout().await
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> StationState {
        self.client.state()
    }

    /// Waits for the next event. `None` once the station task has exited.
    pub async fn next_event(&mut self) -> Option<StationEvent> {
        self.events.recv().await
    }

    /// A cloneable client for the same station.
    #[must_use]
    pub fn client(&self) -> StationClient {
        self.client.clone()
    }

    /// Splits the handle into its client and event stream. The station task
    /// keeps running until every client is dropped.
    #[must_use]
    pub fn into_parts(self) -> (StationClient, mpsc::UnboundedReceiver<StationEvent>) {
        (self.client, self.events)
    }

    /// Stops the station task, closing its connection.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Spawns station tasks.
#[derive(Debug)]
pub struct UserStation;

impl UserStation {
    /// Starts a station for `config`, initially [`StationState::Disconnected`].
    ///
    /// An invalid `config` still yields a running station, but one that
    /// refuses every action with the validation error.
    #[must_use]
    pub fn spawn(config: StationConfig) -> StationHandle {
        let invalid = config.validate().err();
        if let Some(ref e) = invalid {
            warn!(user_id = %config.user_id, error = %e, "invalid station configuration");
        }
        let (action_tx, action_rx) = mpsc::channel(ACTION_QUEUE_CAPACITY);
        let (state_tx, state_rx) = watch::channel(StationState::Disconnected);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let actor = Actor {
            config,
            invalid,
            state_tx,
            events: event_tx,
            ids: PacketIdGen::new(),
            link: None,
            auth_deadline: None,
            awaiting_retry: false,
            pending_connect: Vec::new(),
            pending_texts: HashMap::new(),
            logout: None,
        };
        let task = tokio::spawn(actor.run(action_rx));

        StationHandle {
            client: StationClient::new(action_tx, state_rx),
            events: event_rx,
            task,
        }
    }
}

struct Link {
    out_tx: mpsc::Sender<Outbound>,
    ws_rx: SplitStream<ClientStream>,
}

struct PendingText {
    target_user: String,
    reply: Reply,
}

struct Actor {
    config: StationConfig,
    /// Why `config` failed validation, if it did.
    invalid: Option<String>,
    state_tx: watch::Sender<StationState>,
    events: mpsc::UnboundedSender<StationEvent>,
    ids: PacketIdGen,
    link: Option<Link>,
    auth_deadline: Option<Instant>,
    awaiting_retry: bool,
    pending_connect: Vec<Reply>,
    pending_texts: HashMap<u64, PendingText>,
    /// Set while a logout is in flight; holds its reply.
    logout: Option<Reply>,
}

fn resolve(reply: Reply, result: Result<(), String>) {
    if let Some(tx) = reply {
        let _ = tx.send(result);
    }
}

async fn next_message(link: &mut Option<Link>) -> Option<Result<Message, tungstenite::Error>> {
    match link {
        Some(link) => link.ws_rx.next().await,
        None => std::future::pending().await,
    }
}

impl Actor {
    async fn run(mut self, mut actions: mpsc::Receiver<Action>) {
        let period = Duration::from_secs(self.config.keepalive.interval_s.max(1));
        let mut keepalive = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                action = actions.recv() => {
                    let Some(action) = action else { break };
                    self.on_action(action).await;
                }
                msg = next_message(&mut self.link), if self.link.is_some() => {
                    self.on_message(msg).await;
                }
                () = sleep_until(self.auth_deadline.unwrap_or_else(Instant::now)), if self.auth_deadline.is_some() => {
                    self.on_auth_timeout();
                }
                _ = keepalive.tick(), if self.link.is_some() => {
                    self.send(Outbound::Ping).await;
                }
            }
        }
        debug!(user_id = %self.config.user_id, "station task stopped");
    }

    fn state(&self) -> StationState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: StationState) {
        if self.state_tx.send_replace(state) != state {
            debug!(user_id = %self.config.user_id, %state, "station state changed");
        }
    }

    fn emit(&self, event: StationEvent) {
        if self.events.send(event).is_err() {
            debug!("station event dropped: no receiver");
        }
    }

    fn refuse(&self, reply: Reply, reason: &str) {
        self.emit(StationEvent::Error {
            reason: reason.to_string(),
        });
        resolve(reply, Err(reason.to_string()));
    }

    async fn send(&self, item: impl Into<Outbound>) {
        if let Some(link) = &self.link {
            if link.out_tx.send(item.into()).await.is_err() {
                debug!("relay writer closed");
            }
        }
    }

    async fn on_action(&mut self, action: Action) {
        if let Some(ref e) = self.invalid {
            let reason = format!("invalid configuration: {e}");
            let reply = match action {
                Action::Connect { reply }
                | Action::SendText { reply, .. }
                | Action::Logout { reply } => reply,
            };
            return self.refuse(reply, &reason);
        }
        match action {
            Action::Connect { reply } => self.on_connect(reply).await,
            Action::SendText {
                target_user,
                message,
                reply,
            } => self.on_send_text(target_user, &message, reply).await,
            Action::Logout { reply } => self.on_logout(reply).await,
        }
    }

    async fn on_connect(&mut self, reply: Reply) {
        match self.state() {
            StationState::Disconnected => {
                let limit = Duration::from_secs(self.config.auth_timeout_s);
                match tokio::time::timeout(limit, transport::connect(&self.config.relay)).await {
                    Ok(Ok(ws)) => {
                        let (ws_tx, ws_rx) = ws.split();
                        let (out_tx, out_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
                        tokio::spawn(transport::write_pump(ws_tx, out_rx));
                        self.link = Some(Link { out_tx, ws_rx });
                        info!(relay = %self.config.relay, "connected to relay node");
                        self.start_auth(reply).await;
                    }
                    Ok(Err(e)) => {
                        warn!(relay = %self.config.relay, error = %e, "failed to connect to relay node");
                        self.refuse(reply, &format!("connect failed: {e}"));
                    }
                    Err(_) => {
                        warn!(relay = %self.config.relay, "relay node did not answer the handshake");
                        self.refuse(reply, CONNECT_TIMED_OUT);
                    }
                }
            }
            StationState::Authenticating if self.awaiting_retry => {
                debug!(user_id = %self.config.user_id, "retrying authentication");
                self.start_auth(reply).await;
            }
            StationState::Authenticating => {
                self.refuse(reply, "authentication already in progress");
            }
            StationState::Authenticated => self.refuse(reply, "already authenticated"),
            StationState::LoggedOut => self.refuse(reply, "station has logged out"),
        }
    }

    async fn start_auth(&mut self, reply: Reply) {
        self.awaiting_retry = false;
        self.pending_connect.push(reply);
        self.auth_deadline =
            Some(Instant::now() + Duration::from_secs(self.config.auth_timeout_s));
        self.set_state(StationState::Authenticating);
        let auth = Packet::auth(&self.config.user_id).with_packet_id(Some(self.ids.next_id()));
        self.send(auth).await;
    }

    async fn on_send_text(&mut self, target_user: String, message: &str, reply: Reply) {
        if self.state() != StationState::Authenticated {
            self.refuse(reply, "not authenticated");
            return;
        }
        let packet_id = self.ids.next_id();
        let text = Packet::text(&self.config.user_id, &target_user, message)
            .with_packet_id(Some(packet_id));
        self.pending_texts
            .insert(packet_id, PendingText { target_user, reply });
        self.send(text).await;
    }

    async fn on_logout(&mut self, reply: Reply) {
        if self.state() != StationState::Authenticated {
            self.refuse(reply, "not authenticated");
            return;
        }
        self.logout = Some(reply);
        self.set_state(StationState::LoggedOut);
        let logout =
            Packet::auth_logout(&self.config.user_id).with_packet_id(Some(self.ids.next_id()));
        self.send(logout).await;
    }

    fn finish_auth(&mut self, result: Result<(), String>) {
        self.auth_deadline = None;
        match &result {
            Ok(()) => {
                self.set_state(StationState::Authenticated);
                info!(user_id = %self.config.user_id, "authenticated");
                self.emit(StationEvent::Authenticated);
            }
            Err(reason) => {
                self.awaiting_retry = true;
                warn!(user_id = %self.config.user_id, reason = %reason, "authentication failed");
                self.emit(StationEvent::AuthenticationFailed {
                    reason: reason.clone(),
                });
            }
        }
        for reply in self.pending_connect.drain(..) {
            resolve(reply, result.clone());
        }
    }

    fn finish_logout(&mut self, result: Result<(), String>) {
        if let Some(reply) = self.logout.take() {
            info!(user_id = %self.config.user_id, "logged out");
            self.emit(StationEvent::LoggedOut);
            resolve(reply, result);
        }
    }

    fn on_auth_timeout(&mut self) {
        if self.state() == StationState::Authenticating {
            self.finish_auth(Err(reason::AUTH_TIMEOUT.to_string()));
        } else {
            self.auth_deadline = None;
        }
    }

    async fn on_message(&mut self, msg: Option<Result<Message, tungstenite::Error>>) {
        let msg = match msg {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => return self.on_link_closed(&e.to_string()),
            None => return self.on_link_closed("relay closed the connection"),
        };
        match transport::classify(msg) {
            Inbound::Packet(packet) => self.on_packet(packet).await,
            Inbound::Invalid(e) => warn!(error = %e, "invalid packet from relay node"),
            Inbound::Ping(data) => self.send(Outbound::Pong(data)).await,
            Inbound::Control => {}
            Inbound::Close => self.on_link_closed("relay closed the connection"),
        }
    }

    async fn on_packet(&mut self, packet: Packet) {
        let packet_id = packet.packet_id;
        let kind = packet.kind();
        match packet.body {
            Body::Challenge { challenge, .. } => {
                if self.state() != StationState::Authenticating {
                    debug!("ignoring challenge outside authentication");
                    return;
                }
                let response = samcom_common::crypto::respond(
                    &self.config.user_id,
                    self.config.secret.expose(),
                    &challenge,
                );
                let answer = Packet::auth_response(&self.config.user_id, &challenge, &response)
                    .with_packet_id(Some(self.ids.next_id()));
                self.send(answer).await;
            }
            Body::AuthResult { status, error, .. } => {
                if self.state() != StationState::Authenticating {
                    debug!(?status, "ignoring auth result outside authentication");
                    return;
                }
                match status {
                    AuthStatus::Authenticated => self.finish_auth(Ok(())),
                    AuthStatus::Failed => self.finish_auth(Err(
                        error.unwrap_or_else(|| "authentication failed".to_string())
                    )),
                }
            }
            Body::LogoutResult { status, error, .. } => {
                let result = match status {
                    LogoutStatus::LoggedOut => Ok(()),
                    LogoutStatus::Failed => {
                        Err(error.unwrap_or_else(|| "logout failed".to_string()))
                    }
                };
                self.finish_logout(result);
            }
            Body::Text {
                source_user,
                message,
                ..
            } => {
                debug!(source_user = %source_user, "text received");
                self.emit(StationEvent::MessageReceived {
                    source_user,
                    message,
                    received_at: Utc::now(),
                });
            }
            Body::TextAck { target_user, .. } => {
                let pending = packet_id.and_then(|id| self.pending_texts.remove(&id));
                if let Some(pending) = pending {
                    resolve(pending.reply, Ok(()));
                }
                self.emit(StationEvent::TextForwarded { target_user });
            }
            Body::Error { error, .. } => self.on_error(packet_id, error),
            _ => debug!(kind, "ignoring packet not meant for a station"),
        }
    }

    fn on_error(&mut self, packet_id: Option<u64>, error: String) {
        if let Some(pending) = packet_id.and_then(|id| self.pending_texts.remove(&id)) {
            warn!(target_user = %pending.target_user, error = %error, "text refused");
            self.refuse(pending.reply, &error);
            return;
        }
        if self.state() == StationState::Authenticating && !self.awaiting_retry {
            self.finish_auth(Err(error));
            return;
        }
        warn!(error = %error, "relay reported an error");
        self.emit(StationEvent::Error { reason: error });
    }

    fn on_link_closed(&mut self, why: &str) {
        self.link = None;
        self.auth_deadline = None;
        self.awaiting_retry = false;

        for reply in self.pending_connect.drain(..) {
            resolve(reply, Err(CONNECTION_LOST.to_string()));
        }
        for (_, pending) in self.pending_texts.drain() {
            resolve(pending.reply, Err(CONNECTION_LOST.to_string()));
        }

        if self.state() == StationState::LoggedOut {
            debug!(reason = %why, "relay connection closed after logout");
            self.finish_logout(Ok(()));
            return;
        }
        warn!(reason = %why, "relay connection lost");
        self.set_state(StationState::Disconnected);
        self.emit(StationEvent::Disconnected {
            reason: why.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Secret;

    fn config(relay: &str) -> StationConfig {
        StationConfig {
            relay: relay.to_string(),
            user_id: "A".to_string(),
            secret: Secret::new("k1"),
            ..StationConfig::default()
        }
    }

    #[test]
    fn events_serialize_with_event_tag() {
        let json = serde_json::to_value(StationEvent::AuthenticationFailed {
            reason: "response mismatch".to_string(),
        })
        .unwrap();
        assert_eq!(json["event"], "authentication_failed");
        assert_eq!(json["reason"], "response mismatch");

        let json = serde_json::to_value(StationEvent::Authenticated).unwrap();
        assert_eq!(json, serde_json::json!({"event": "authenticated"}));
    }

    #[test]
    fn state_display_matches_serialized_name() {
        for state in [
            StationState::Disconnected,
            StationState::Authenticating,
            StationState::Authenticated,
            StationState::LoggedOut,
        ] {
            let json = serde_json::to_value(state).unwrap();
            assert_eq!(json, state.to_string());
        }
    }

    #[tokio::test]
    async fn actions_before_connect_are_refused() {
        let mut station = UserStation::spawn(config("ws://127.0.0.1:1"));
        assert_eq!(station.state(), StationState::Disconnected);

        let err = station.send_text("B", "hi").await.unwrap_err();
        assert!(matches!(err, StationError::Rejected(ref r) if r == "not authenticated"));
        assert_eq!(
            station.next_event().await,
            Some(StationEvent::Error {
                reason: "not authenticated".to_string()
            })
        );

        assert!(station.logout().await.is_err());
        assert_eq!(station.state(), StationState::Disconnected);
    }

    #[tokio::test]
    async fn connect_failure_stays_disconnected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut station = UserStation::spawn(config(&format!("ws://{addr}")));
        let err = station.connect().await.unwrap_err();
        assert!(matches!(err, StationError::Rejected(ref r) if r.starts_with("connect failed")));
        assert!(matches!(
            station.next_event().await,
            Some(StationEvent::Error { .. })
        ));
        assert_eq!(station.state(), StationState::Disconnected);
    }

    #[tokio::test]
    async fn unanswered_handshake_times_out() {
        // Bound but never accepted: TCP connects, the upgrade never completes.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut config = config(&format!("ws://{addr}"));
        config.auth_timeout_s = 1;
        let mut station = UserStation::spawn(config);
        let err = tokio::time::timeout(Duration::from_secs(5), station.connect())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, StationError::Rejected(ref r) if r == CONNECT_TIMED_OUT));
        assert_eq!(
            station.next_event().await,
            Some(StationEvent::Error {
                reason: CONNECT_TIMED_OUT.to_string()
            })
        );
        assert_eq!(station.state(), StationState::Disconnected);
        drop(listener);
    }

    #[tokio::test]
    async fn invalid_config_refuses_every_action() {
        let mut config = config("ws://127.0.0.1:1");
        config.keepalive.interval_s = 0;
        let mut station = UserStation::spawn(config);

        let err = station.connect().await.unwrap_err();
        assert!(matches!(
            err,
            StationError::Rejected(ref r) if r.starts_with("invalid configuration") && r.contains("keepalive")
        ));
        assert!(matches!(
            station.next_event().await,
            Some(StationEvent::Error { .. })
        ));
        assert!(station.send_text("B", "hi").await.is_err());
        assert!(station.logout().await.is_err());
        assert_eq!(station.state(), StationState::Disconnected);
    }

    #[tokio::test]
    async fn dropping_every_client_stops_the_task() {
        let station = UserStation::spawn(config("ws://127.0.0.1:1"));
        let (client, mut events) = station.into_parts();
        drop(client);
        assert_eq!(events.recv().await, None);
    }
}
