//! Session state machine and heartbeat supervisor (spec.md §4.C5).
//!
//! Pure state: no socket, no timers. The dispatcher drives this machine with
//! inbound events and timer ticks and acts on the actions it returns —
//! keeping the tricky liveness policy (heartbeat cadence, test-request
//! retries, P6) unit-testable without a live connection.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    LoggedIn,
    LoggingOut,
    SequenceReset,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    PeerClosed,
    ProtocolError,
    Timeout,
    ApplicationRequested,
    SequenceError,
}

/// The three requests scheduled after a successful logon (spec.md §4.C5
/// "Post-logon orchestration"), in send order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostLogonStep {
    TradingSessionStatus,
    EquitySecurityList,
    IndexSecurityList,
}

impl PostLogonStep {
    pub const SEQUENCE: [PostLogonStep; 3] = [
        PostLogonStep::TradingSessionStatus,
        PostLogonStep::EquitySecurityList,
        PostLogonStep::IndexSecurityList,
    ];

    /// Minimum stagger between consecutive post-logon sends (spec.md §4.C5:
    /// "Staggers are ≥ 500 ms apart").
    pub const STAGGER: Duration = Duration::from_millis(500);
}

/// A state machine transition's side effect, for the dispatcher to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    StartHeartbeatSupervisor,
    StopHeartbeatSupervisor,
    ScheduleReconnect,
    ScheduleLogonAfterConnect,
    SchedulePostLogonOrchestration,
    None,
}

/// Plain transition table for §4.C5's diagram. `SessionMachine` never holds a
/// socket or timer handle; it only tracks which state it's in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionMachine {
    state: SessionState,
}

impl SessionMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_logged_in(&self) -> bool {
        self.state == SessionState::LoggedIn
    }

    pub fn on_connect_requested(&mut self) -> Action {
        self.state = SessionState::Connecting;
        Action::None
    }

    pub fn on_socket_connected(&mut self) -> Action {
        self.state = SessionState::Connected;
        Action::ScheduleLogonAfterConnect
    }

    pub fn on_logon_sent(&mut self) -> Action {
        // Still Connected, awaiting the server's Logon per spec.md §4.C5.
        Action::None
    }

    pub fn on_logon_received(&mut self) -> Action {
        self.state = SessionState::LoggedIn;
        Action::StartHeartbeatSupervisor
    }

    pub fn on_logout_received(&mut self, is_sequence_error: bool) -> Action {
        if is_sequence_error {
            self.state = SessionState::SequenceReset;
            Action::StopHeartbeatSupervisor
        } else {
            self.state = SessionState::LoggingOut;
            Action::StopHeartbeatSupervisor
        }
    }

    pub fn on_reject_sequence_error(&mut self) -> Action {
        self.state = SessionState::SequenceReset;
        Action::StopHeartbeatSupervisor
    }

    pub fn on_socket_closed(&mut self) -> Action {
        let was_logging_out = self.state == SessionState::LoggingOut;
        self.state = SessionState::Disconnected;
        if was_logging_out {
            Action::None
        } else {
            Action::ScheduleReconnect
        }
    }

    pub fn on_sequence_reset_complete(&mut self) -> Action {
        self.state = SessionState::Connecting;
        Action::None
    }

    pub fn on_fatal_error(&mut self) -> Action {
        self.state = SessionState::Error;
        Action::StopHeartbeatSupervisor
    }
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Liveness policy: one tick every `heartbeatInterval / 2` (spec.md §4.C5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    None,
    SendHeartbeat,
    /// Carries a fresh TestReqID for the caller to stamp onto the message.
    SendTestRequest,
    /// ≥ 3 unanswered test requests: the connection is dead (P6's retry cap).
    ConnectionDead,
}

#[derive(Debug, Clone)]
pub struct HeartbeatSupervisor {
    interval: Duration,
    unanswered_test_requests: u32,
    awaiting_test_request_reply: bool,
}

impl HeartbeatSupervisor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            unanswered_test_requests: 0,
            awaiting_test_request_reply: false,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        self.interval / 2
    }

    /// Evaluates one supervisor tick given idle time since the last inbound
    /// message. Enforces P6: while a TestRequest reply is outstanding, a
    /// further idle tick never issues a second one — it only advances toward
    /// the dead-connection verdict.
    pub fn on_tick(&mut self, idle: Duration) -> HeartbeatAction {
        let test_threshold = self.interval.mul_f64(1.5);
        if idle >= test_threshold {
            if self.awaiting_test_request_reply {
                self.unanswered_test_requests += 1;
                if self.unanswered_test_requests >= 3 {
                    return HeartbeatAction::ConnectionDead;
                }
                return HeartbeatAction::None;
            }
            self.awaiting_test_request_reply = true;
            return HeartbeatAction::SendTestRequest;
        }
        if idle >= self.interval {
            return HeartbeatAction::SendHeartbeat;
        }
        HeartbeatAction::None
    }

    /// A Heartbeat echoing the outstanding TestReqID clears the retry count
    /// (spec.md §4.C5, scenario 3).
    pub fn on_heartbeat_received(&mut self) {
        self.unanswered_test_requests = 0;
        self.awaiting_test_request_reply = false;
    }

    pub fn unanswered_test_requests(&self) -> u32 {
        self.unanswered_test_requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_logon_transitions_to_logged_in_and_starts_supervisor() {
        let mut machine = SessionMachine::new();
        assert_eq!(machine.on_connect_requested(), Action::None);
        assert_eq!(machine.state(), SessionState::Connecting);
        assert_eq!(
            machine.on_socket_connected(),
            Action::ScheduleLogonAfterConnect
        );
        assert_eq!(machine.state(), SessionState::Connected);
        assert_eq!(
            machine.on_logon_received(),
            Action::StartHeartbeatSupervisor
        );
        assert!(machine.is_logged_in());
    }

    #[test]
    fn sequence_error_logout_routes_to_sequence_reset_not_logging_out() {
        let mut machine = SessionMachine::new();
        machine.on_connect_requested();
        machine.on_socket_connected();
        machine.on_logon_received();
        let action = machine.on_logout_received(true);
        assert_eq!(action, Action::StopHeartbeatSupervisor);
        assert_eq!(machine.state(), SessionState::SequenceReset);
    }

    #[test]
    fn normal_logout_routes_through_logging_out() {
        let mut machine = SessionMachine::new();
        machine.on_connect_requested();
        machine.on_socket_connected();
        machine.on_logon_received();
        machine.on_logout_received(false);
        assert_eq!(machine.state(), SessionState::LoggingOut);
        assert_eq!(machine.on_socket_closed(), Action::None);
        assert_eq!(machine.state(), SessionState::Disconnected);
    }

    #[test]
    fn unplanned_disconnect_schedules_reconnect() {
        let mut machine = SessionMachine::new();
        machine.on_connect_requested();
        machine.on_socket_connected();
        machine.on_logon_received();
        assert_eq!(machine.on_socket_closed(), Action::ScheduleReconnect);
    }

    #[test]
    fn p6_at_most_one_in_flight_test_request() {
        let mut supervisor = HeartbeatSupervisor::new(Duration::from_secs(30));
        let threshold = Duration::from_secs(45); // 1.5x
        assert_eq!(
            supervisor.on_tick(threshold),
            HeartbeatAction::SendTestRequest
        );
        // A second idle tick while still awaiting a reply must not send another.
        assert_eq!(supervisor.on_tick(threshold), HeartbeatAction::None);
        assert_eq!(supervisor.unanswered_test_requests(), 1);
    }

    #[test]
    fn three_unanswered_test_requests_declares_connection_dead() {
        let mut supervisor = HeartbeatSupervisor::new(Duration::from_secs(30));
        let threshold = Duration::from_secs(45);
        assert_eq!(
            supervisor.on_tick(threshold),
            HeartbeatAction::SendTestRequest
        );
        assert_eq!(supervisor.on_tick(threshold), HeartbeatAction::None);
        assert_eq!(supervisor.on_tick(threshold), HeartbeatAction::None);
        assert_eq!(
            supervisor.on_tick(threshold),
            HeartbeatAction::ConnectionDead
        );
    }

    #[test]
    fn heartbeat_reply_clears_test_request_state() {
        let mut supervisor = HeartbeatSupervisor::new(Duration::from_secs(30));
        supervisor.on_tick(Duration::from_secs(45));
        supervisor.on_heartbeat_received();
        assert_eq!(supervisor.unanswered_test_requests(), 0);
        // Fresh idle at exactly the heartbeat interval sends a plain Heartbeat.
        assert_eq!(
            supervisor.on_tick(Duration::from_secs(30)),
            HeartbeatAction::SendHeartbeat
        );
    }

    #[test]
    fn idle_below_heartbeat_interval_takes_no_action() {
        let mut supervisor = HeartbeatSupervisor::new(Duration::from_secs(30));
        assert_eq!(
            supervisor.on_tick(Duration::from_secs(10)),
            HeartbeatAction::None
        );
    }
}
