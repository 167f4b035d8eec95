//! Connection lifecycle state machine.
//!
//! ```text
//!  Disconnected ──connect──▶ Connecting ──opened──▶ Open
//!        ▲                       ▲  │                 │
//!        │                       │  └─failed─┐        ├─ close(Away / abnormal / error / idle)
//!        │                       │           ▼        ▼
//!        │                       └──delay── Reconnecting
//!        │                                            │
//!        └── close(Normal/Policy), _disconnect, renewal failure,
//!            401, caller close, attempts exhausted
//! ```
//!
//! [`Lifecycle`] only decides; the session performs the I/O it asks for.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::ws::config::StreamingConfig;

/// Connection state of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected and not trying to.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Receiving frames.
    Open,
    /// Waiting out the backoff delay before the next connect attempt.
    Reconnecting,
    /// Close frame sent, waiting for the transport to finish.
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Open => write!(f, "Open"),
            Self::Reconnecting => write!(f, "Reconnecting"),
            Self::Closing => write!(f, "Closing"),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// The server closed with a normal close code.
    Normal,
    /// The server sent `_disconnect`; a fresh token is needed.
    ServerRequested,
    /// The server closed with a policy violation (usually an auth problem).
    PolicyViolation,
    /// The handshake was rejected as unauthorized.
    Unauthorized,
    /// Renewing the token failed.
    RenewalFailed,
    /// The caller closed the session, or dropped every handle.
    ClosedByCaller,
    /// Reconnecting was disabled or ran out of attempts.
    ReconnectExhausted,
}

impl DisconnectReason {
    /// Whether the caller has to obtain a new token before connecting again.
    pub fn requires_reauthentication(self) -> bool {
        matches!(
            self,
            Self::ServerRequested | Self::PolicyViolation | Self::Unauthorized | Self::RenewalFailed
        )
    }
}

/// What the session should do after a transport ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Wait `delay`, then connect again with the same context id.
    Reconnect(Duration),
    /// Stop for good.
    Stop(DisconnectReason),
}

/// Pure connection state machine plus the resume message id.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: ConnectionState,
    last_message_id: Option<u64>,
    attempts: u32,
    auto_reconnect: bool,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl Lifecycle {
    /// A disconnected lifecycle using the reconnect settings of `config`.
    pub fn new(config: &StreamingConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_message_id: None,
            attempts: 0,
            auto_reconnect: config.auto_reconnect,
            max_attempts: config.max_reconnect_attempts,
            base_delay: Duration::from_millis(config.reconnect_delay_ms),
            max_delay: Duration::from_millis(config.max_reconnect_delay_ms),
            multiplier: config.backoff_multiplier.max(1.0),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Id of the last received sub-message on this context.
    pub fn last_message_id(&self) -> Option<u64> {
        self.last_message_id
    }

    /// Reconnect attempts since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a received message id (control messages included).
    pub fn record_message_id(&mut self, message_id: u64) {
        self.last_message_id = Some(message_id);
    }

    /// Enter `Connecting`. Returns the message id to resume from.
    pub fn begin_connect(&mut self) -> Option<u64> {
        self.state = ConnectionState::Connecting;
        self.last_message_id
    }

    /// The handshake completed.
    pub fn opened(&mut self) {
        self.state = ConnectionState::Open;
        self.attempts = 0;
    }

    /// The handshake failed.
    pub fn connect_failed(&mut self, unauthorized: bool) -> Next {
        if unauthorized {
            return self.stop(DisconnectReason::Unauthorized);
        }
        self.schedule_reconnect()
    }

    /// The transport ended. `code` is `None` when it ended without a close
    /// frame (socket error, EOF, idle timeout).
    pub fn transport_closed(&mut self, code: Option<CloseCode>) -> Next {
        match code {
            Some(CloseCode::Normal) => self.stop(DisconnectReason::Normal),
            Some(CloseCode::Policy) => self.stop(DisconnectReason::PolicyViolation),
            _ => self.schedule_reconnect(),
        }
    }

    /// The server sent `_disconnect`.
    pub fn server_disconnect(&mut self) -> Next {
        self.stop(DisconnectReason::ServerRequested)
    }

    /// Token renewal failed.
    pub fn renewal_failed(&mut self) -> Next {
        self.stop(DisconnectReason::RenewalFailed)
    }

    /// The caller closed the session.
    pub fn close(&mut self) -> Next {
        self.stop(DisconnectReason::ClosedByCaller)
    }

    /// The caller asked to drop the transport and connect again right away.
    pub fn force_reconnect(&mut self) -> Next {
        self.state = ConnectionState::Reconnecting;
        Next::Reconnect(Duration::ZERO)
    }

    /// Mark the transport as closing (close frame sent).
    pub fn closing(&mut self) {
        self.state = ConnectionState::Closing;
    }

    /// Backoff delay before reconnect attempt number `attempt` (0-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let millis = (self.base_delay.as_millis() as f64 * factor).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    fn schedule_reconnect(&mut self) -> Next {
        if !self.auto_reconnect || (self.max_attempts > 0 && self.attempts >= self.max_attempts) {
            return self.stop(DisconnectReason::ReconnectExhausted);
        }
        let delay = self.backoff_delay(self.attempts);
        self.attempts += 1;
        self.state = ConnectionState::Reconnecting;
        Next::Reconnect(delay)
    }

    fn stop(&mut self, reason: DisconnectReason) -> Next {
        self.state = ConnectionState::Disconnected;
        Next::Stop(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lifecycle() -> Lifecycle {
        Lifecycle::new(&StreamingConfig {
            reconnect_delay_ms: 100,
            max_reconnect_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_reconnect_attempts: 0,
            ..StreamingConfig::default()
        })
    }

    #[test]
    fn open_then_going_away_reconnects_with_resume_id() {
        let mut lc = lifecycle();
        assert_eq!(lc.begin_connect(), None);
        lc.opened();
        assert_eq!(lc.state(), ConnectionState::Open);
        lc.record_message_id(41);
        lc.record_message_id(42);

        assert_eq!(
            lc.transport_closed(Some(CloseCode::Away)),
            Next::Reconnect(Duration::from_millis(100))
        );
        assert_eq!(lc.state(), ConnectionState::Reconnecting);
        assert_eq!(lc.begin_connect(), Some(42));
    }

    #[test]
    fn normal_and_policy_closes_are_terminal() {
        let mut lc = lifecycle();
        lc.begin_connect();
        lc.opened();
        assert_eq!(
            lc.transport_closed(Some(CloseCode::Normal)),
            Next::Stop(DisconnectReason::Normal)
        );
        assert_eq!(lc.state(), ConnectionState::Disconnected);

        lc.begin_connect();
        lc.opened();
        assert_eq!(
            lc.transport_closed(Some(CloseCode::Policy)),
            Next::Stop(DisconnectReason::PolicyViolation)
        );
    }

    #[test]
    fn abnormal_end_reconnects() {
        let mut lc = lifecycle();
        lc.begin_connect();
        lc.opened();
        assert!(matches!(lc.transport_closed(None), Next::Reconnect(_)));
        lc.begin_connect();
        lc.opened();
        assert!(matches!(
            lc.transport_closed(Some(CloseCode::Error)),
            Next::Reconnect(_)
        ));
    }

    #[test]
    fn server_disconnect_never_reconnects() {
        let mut lc = lifecycle();
        lc.begin_connect();
        lc.opened();
        let next = lc.server_disconnect();
        assert_eq!(next, Next::Stop(DisconnectReason::ServerRequested));
        assert!(DisconnectReason::ServerRequested.requires_reauthentication());
        assert!(!DisconnectReason::ClosedByCaller.requires_reauthentication());
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let mut lc = lifecycle();
        lc.begin_connect();
        let delays: Vec<_> = (0..6)
            .map(|_| match lc.connect_failed(false) {
                Next::Reconnect(d) => d.as_millis(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);

        lc.opened();
        assert_eq!(lc.attempts(), 0);
    }

    #[test]
    fn attempts_are_bounded_when_configured() {
        let mut lc = Lifecycle::new(&StreamingConfig {
            max_reconnect_attempts: 2,
            ..StreamingConfig::default()
        });
        lc.begin_connect();
        assert!(matches!(lc.connect_failed(false), Next::Reconnect(_)));
        assert!(matches!(lc.connect_failed(false), Next::Reconnect(_)));
        assert_eq!(
            lc.connect_failed(false),
            Next::Stop(DisconnectReason::ReconnectExhausted)
        );
    }

    #[test]
    fn auto_reconnect_disabled_stops() {
        let mut lc = Lifecycle::new(&StreamingConfig {
            auto_reconnect: false,
            ..StreamingConfig::default()
        });
        lc.begin_connect();
        lc.opened();
        assert_eq!(
            lc.transport_closed(Some(CloseCode::Away)),
            Next::Stop(DisconnectReason::ReconnectExhausted)
        );
    }

    #[test]
    fn unauthorized_handshake_stops() {
        let mut lc = lifecycle();
        lc.begin_connect();
        assert_eq!(lc.connect_failed(true), Next::Stop(DisconnectReason::Unauthorized));
    }
}
