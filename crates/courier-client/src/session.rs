//! The client session manager.
//!
//! Owns one outbound connection and its reconnect lifecycle. The server
//! may drop a session without warning (a superseded registration, a
//! heartbeat prune, a crash); the session manager's job is to make that
//! survivable: status is observable, sends fail fast instead of queueing,
//! and reconnects are bounded and fixed-delay.

use std::time::Duration;

use courier_protocol::{codec, ClientEnvelope, ServerEnvelope};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

/// Connection status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No connection, none being attempted.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// Live; sends will be accepted.
    Connected,
    /// The transport failed; a reconnect may follow.
    Error,
}

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session is not connected; sends are rejected, not queued.
    #[error("not connected")]
    NotConnected,

    /// The session's driver task is gone.
    #[error("session closed")]
    Closed,
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:8081/ws`.
    pub url: String,
    /// Bearer credential supplied as a connection parameter.
    pub token: String,
    /// Whether to schedule reconnect attempts automatically.
    pub auto_reconnect: bool,
    /// Maximum consecutive reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
}

impl SessionConfig {
    /// Create a config with the default reconnect policy.
    #[must_use]
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(3),
        }
    }

    /// Override the reconnect policy.
    #[must_use]
    pub fn with_reconnect(mut self, auto: bool, max_attempts: u32, delay: Duration) -> Self {
        self.auto_reconnect = auto;
        self.max_reconnect_attempts = max_attempts;
        self.reconnect_delay = delay;
        self
    }
}

/// Fixed-delay, bounded-attempt retry bookkeeping.
///
/// The counter resets on every successful connection; once exhausted, the
/// session stays down until an explicit reconnect request.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    attempts: u32,
    max_attempts: u32,
    delay: Duration,
    enabled: bool,
}

impl ReconnectPolicy {
    /// Create a policy.
    #[must_use]
    pub fn new(max_attempts: u32, delay: Duration, enabled: bool) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            delay,
            enabled,
        }
    }

    /// Consecutive attempts since the last successful connection.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Claim the next retry slot. Returns the delay to wait, or `None`
    /// when auto-reconnect is disabled or the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.enabled || self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.delay)
    }

    /// A connection succeeded; the budget refills.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

enum Command {
    Send(ClientEnvelope),
    Reconnect,
    Disconnect,
}

/// How a connection (or connection attempt) ended.
enum ConnectionEnd {
    /// Transport lost or never established; eligible for auto-reconnect.
    Lost,
    /// The consumer asked for a disconnect; wait for a manual reconnect.
    ManualStop,
    /// The consumer dropped the session; the driver exits.
    HandleGone,
}

/// A handle to a running session.
pub struct Session {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
}

impl Session {
    /// Spawn a session driver and return the handle plus the stream of
    /// inbound server envelopes.
    #[must_use]
    pub fn connect(config: SessionConfig) -> (Self, mpsc::UnboundedReceiver<ServerEnvelope>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(SessionStatus::Disconnected);

        tokio::spawn(driver(config, command_rx, event_tx, status_tx));

        (Self { commands, status }, events)
    }

    /// Current connection status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Block until the session reaches `target`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the driver exits first.
    pub async fn wait_for(&mut self, target: SessionStatus) -> Result<(), SessionError> {
        loop {
            if *self.status.borrow_and_update() == target {
                return Ok(());
            }
            self.status
                .changed()
                .await
                .map_err(|_| SessionError::Closed)?;
        }
    }

    /// Send an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotConnected`] unless the session is
    /// currently connected; pending sends are never queued across a
    /// disconnect.
    pub fn send(&self, envelope: ClientEnvelope) -> Result<(), SessionError> {
        if self.status() != SessionStatus::Connected {
            return Err(SessionError::NotConnected);
        }
        self.commands
            .send(Command::Send(envelope))
            .map_err(|_| SessionError::Closed)
    }

    /// Request a reconnect, also refilling an exhausted retry budget.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the driver is gone.
    pub fn reconnect(&self) -> Result<(), SessionError> {
        self.commands
            .send(Command::Reconnect)
            .map_err(|_| SessionError::Closed)
    }

    /// Close the connection and stay down until [`Session::reconnect`].
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the driver is gone.
    pub fn disconnect(&self) -> Result<(), SessionError> {
        self.commands
            .send(Command::Disconnect)
            .map_err(|_| SessionError::Closed)
    }
}

async fn driver(
    config: SessionConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ServerEnvelope>,
    status: watch::Sender<SessionStatus>,
) {
    let mut policy = ReconnectPolicy::new(
        config.max_reconnect_attempts,
        config.reconnect_delay,
        config.auto_reconnect,
    );
    let url = format!("{}?token={}", config.url, config.token);

    loop {
        status.send_replace(SessionStatus::Connecting);
        let end = run_connection(&url, &mut policy, &mut commands, &events, &status).await;
        status.send_replace(SessionStatus::Disconnected);

        match end {
            ConnectionEnd::HandleGone => return,
            ConnectionEnd::ManualStop => {
                if !wait_for_reconnect(&mut commands).await {
                    return;
                }
                policy.reset();
            }
            ConnectionEnd::Lost => match policy.next_delay() {
                Some(delay) => {
                    debug!(attempt = policy.attempts(), "scheduling reconnect");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    debug!("reconnect budget spent; waiting for manual reconnect");
                    if !wait_for_reconnect(&mut commands).await {
                        return;
                    }
                    policy.reset();
                }
            },
        }
    }
}

/// Park until an explicit reconnect request. Returns `false` when the
/// handle is gone.
async fn wait_for_reconnect(commands: &mut mpsc::UnboundedReceiver<Command>) -> bool {
    loop {
        match commands.recv().await {
            Some(Command::Reconnect) => return true,
            // A send that raced the disconnect; drop it, sends are not
            // queued across connections.
            Some(Command::Send(_)) => {}
            Some(Command::Disconnect) => {}
            None => return false,
        }
    }
}

async fn run_connection(
    url: &str,
    policy: &mut ReconnectPolicy,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    events: &mpsc::UnboundedSender<ServerEnvelope>,
    status: &watch::Sender<SessionStatus>,
) -> ConnectionEnd {
    let (ws, _response) = match connect_async(url).await {
        Ok(connected) => connected,
        Err(err) => {
            warn!(error = %err, "connect failed");
            status.send_replace(SessionStatus::Error);
            return ConnectionEnd::Lost;
        }
    };

    policy.reset();
    status.send_replace(SessionStatus::Connected);
    debug!("session connected");

    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send(envelope)) => match codec::encode_client(&envelope) {
                    Ok(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            status.send_replace(SessionStatus::Error);
                            return ConnectionEnd::Lost;
                        }
                    }
                    Err(err) => warn!(error = %err, "dropping unencodable envelope"),
                },
                Some(Command::Reconnect) => {} // already connected
                Some(Command::Disconnect) => {
                    let _ = sink.close().await;
                    return ConnectionEnd::ManualStop;
                }
                None => {
                    let _ = sink.close().await;
                    return ConnectionEnd::HandleGone;
                }
            },

            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => match codec::decode_server(&text) {
                    Ok(envelope) => {
                        if events.send(envelope).is_err() {
                            let _ = sink.close().await;
                            return ConnectionEnd::HandleGone;
                        }
                    }
                    Err(err) => warn!(error = %err, "discarding undecodable envelope"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    debug!("server closed the connection");
                    return ConnectionEnd::Lost;
                }
                // Pings and pongs are handled by the transport.
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(error = %err, "transport error");
                    status.send_replace(SessionStatus::Error);
                    return ConnectionEnd::Lost;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_protocol::{ConnectionStatus, ServerEnvelope};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[test]
    fn test_policy_bounds_attempts() {
        let mut policy = ReconnectPolicy::new(2, Duration::from_secs(3), true);

        assert_eq!(policy.next_delay(), Some(Duration::from_secs(3)));
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(3)));
        assert_eq!(policy.next_delay(), None);
        assert_eq!(policy.attempts(), 2);
    }

    #[test]
    fn test_policy_resets_on_success() {
        let mut policy = ReconnectPolicy::new(1, Duration::from_secs(3), true);

        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());

        policy.reset();
        assert_eq!(policy.attempts(), 0);
        assert!(policy.next_delay().is_some());
    }

    #[test]
    fn test_policy_disabled() {
        let mut policy = ReconnectPolicy::new(5, Duration::from_secs(3), false);
        assert_eq!(policy.next_delay(), None);
    }

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::new("ws://localhost/ws", "token");
        assert!(config.auto_reconnect);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_delay, Duration::from_secs(3));
    }

    /// Accept `connections` WebSocket upgrades; greet each, then close.
    async fn flaky_server(connections: usize) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            for _ in 0..connections {
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = accept_async(stream).await.unwrap();
                let greeting =
                    ServerEnvelope::connection(ConnectionStatus::Connected, "alice");
                let text = codec::encode_server(&greeting).unwrap();
                ws.send(Message::Text(text)).await.unwrap();
                ws.close(None).await.ok();
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_connects_and_receives_envelopes() {
        let addr = flaky_server(1).await;
        let config = SessionConfig::new(format!("ws://{addr}"), "token")
            .with_reconnect(false, 0, Duration::from_millis(10));

        let (mut session, mut events) = Session::connect(config);
        session.wait_for(SessionStatus::Connected).await.unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            envelope,
            ServerEnvelope::connection(ConnectionStatus::Connected, "alice")
        );

        // The server hung up and auto-reconnect is off.
        session.wait_for(SessionStatus::Disconnected).await.unwrap();
        assert!(matches!(
            session.send(ClientEnvelope::join("chat-1")),
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_send_rejected_until_connected() {
        // Nothing is listening on this address.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = SessionConfig::new(format!("ws://{addr}"), "token")
            .with_reconnect(false, 0, Duration::from_millis(10));
        let (session, _events) = Session::connect(config);

        assert!(matches!(
            session.send(ClientEnvelope::join("chat-1")),
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_auto_reconnect_with_fixed_delay() {
        let addr = flaky_server(2).await;
        let config = SessionConfig::new(format!("ws://{addr}"), "token")
            .with_reconnect(true, 3, Duration::from_millis(50));

        let (mut session, mut events) = Session::connect(config);

        // Both connections greet us: the first, then the reconnect.
        for _ in 0..2 {
            let envelope = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(envelope, ServerEnvelope::Connection { .. }));
        }

        // The second close exhausts no budget ahead of time; the session
        // keeps retrying until the cap and then parks disconnected.
        session.wait_for(SessionStatus::Disconnected).await.unwrap();
    }

    #[tokio::test]
    async fn test_manual_reconnect_after_exhaustion() {
        let addr = flaky_server(2).await;
        let config = SessionConfig::new(format!("ws://{addr}"), "token")
            .with_reconnect(false, 0, Duration::from_millis(10));

        let (mut session, mut events) = Session::connect(config);
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        session.wait_for(SessionStatus::Disconnected).await.unwrap();

        // Auto-reconnect is off, so this takes an explicit request.
        session.reconnect().unwrap();
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
    }
}
