//! Transport loop: owns the socket, drives the codec, classifies inbound
//! traffic, and recovers from sequence errors (spec.md §4.C6).
//!
//! This is the "single logical task per session" of spec.md §5: the socket,
//! the [`SequenceManager`], the [`SessionMachine`], and the heartbeat
//! supervisor are all owned here and touched from nowhere else. External
//! callers reach the dispatcher only through [`ConnectorCommand`] messages.

use crate::config::ConnectionConfig;
use crate::events::{CategorizedData, DisconnectReason as EventDisconnectReason, Event, EventSink};
use crate::handlers;
use crate::messages::{self, MarketDataSubscription, Product};
use crate::protocol::{self, FrameResult, MsgType};
use crate::sequence::SequenceManager;
use crate::session::{Action, HeartbeatAction, HeartbeatSupervisor, PostLogonStep, SessionMachine};
use crate::store::SequenceStore;
use bytes::BytesMut;
use chrono::Utc;
use std::path::PathBuf;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Duration};

/// Commands an application issues through a [`crate::client::PsxConnectorHandle`]
/// (spec.md §5's mailbox, generalized from the teacher's raw-bytes-only
/// command channel to this profile's three subscription requests plus
/// shutdown).
#[derive(Debug, Clone)]
pub enum ConnectorCommand {
    RequestMarketData(MarketDataSubscription),
    RequestSecurityList(Product),
    RequestTradingSessionStatus,
    Shutdown,
}

/// Why a connection attempt or an established session ended, used to decide
/// the next action (reconnect, sequence-reset reconnect, or stop).
enum SessionEnd {
    Shutdown,
    SequenceError { expected: Option<u32> },
    Disconnected,
}

pub struct Dispatcher {
    cfg: ConnectionConfig,
    events: EventSink,
    commands: mpsc::Receiver<ConnectorCommand>,
    seq_mgr: SequenceManager,
    store: SequenceStore,
}

impl Dispatcher {
    pub fn new(
        cfg: ConnectionConfig,
        events: EventSink,
        commands: mpsc::Receiver<ConnectorCommand>,
        initial_seq: SequenceManager,
        store: SequenceStore,
    ) -> Self {
        Self {
            cfg,
            events,
            commands,
            seq_mgr: initial_seq,
            store,
        }
    }

    /// Default snapshot path, adjacent to the working directory (spec.md §6).
    pub fn default_snapshot_path() -> PathBuf {
        PathBuf::from(crate::store::DEFAULT_FILENAME)
    }

    /// Runs until a `Shutdown` command is received. Reconnects on unplanned
    /// disconnects (spec.md §4.C5 "Reconnect") and on sequence errors
    /// (spec.md §4.C6 "Sequence-error recovery"), forever, unless shutting
    /// down.
    pub async fn run(mut self) {
        let mut machine = SessionMachine::new();
        loop {
            machine.on_connect_requested();
            let end = self.run_session(&mut machine).await;
            match end {
                SessionEnd::Shutdown => {
                    self.events.emit(Event::Disconnected {
                        reason: EventDisconnectReason::ShuttingDown,
                    });
                    return;
                }
                SessionEnd::SequenceError { expected } => {
                    if self.wait_or_shutdown(Duration::from_secs(2)).await {
                        self.events.emit(Event::Disconnected {
                            reason: EventDisconnectReason::ShuttingDown,
                        });
                        return;
                    }
                    match expected {
                        Some(n) => self.seq_mgr.force_reset(n),
                        None => self.seq_mgr.reset_all(),
                    }
                    machine.on_sequence_reset_complete();
                }
                SessionEnd::Disconnected => {
                    if self.wait_or_shutdown(Duration::from_secs(5)).await {
                        self.events.emit(Event::Disconnected {
                            reason: EventDisconnectReason::ShuttingDown,
                        });
                        return;
                    }
                }
            }
        }
    }

    /// Sleeps for `dur`, but wakes early on a `Shutdown` command (or a
    /// closed mailbox) so shutdown takes effect during backoff/connect
    /// delays, not just once a session is established (spec.md §5). Other
    /// commands arriving during this window are ignored: nothing is
    /// logged in yet to service them (spec.md §4.C5).
    async fn wait_or_shutdown(&mut self, dur: Duration) -> bool {
        let deadline = sleep(dur);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return false,
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(ConnectorCommand::Shutdown) | None => return true,
                        Some(_) => continue,
                    }
                }
            }
        }
    }

    /// Connects, logs on, and services one session until it ends.
    async fn run_session(&mut self, machine: &mut SessionMachine) -> SessionEnd {
        let host = self.cfg.host.clone();
        let port = self.cfg.port;
        let connect_fut =
            tokio::time::timeout(self.cfg.connect_timeout(), TcpStream::connect((host, port)));
        tokio::pin!(connect_fut);
        let stream = loop {
            tokio::select! {
                result = &mut connect_fut => {
                    break match result {
                        Ok(Ok(stream)) => stream,
                        Ok(Err(err)) => {
                            self.events.emit(Event::Error {
                                message: format!("connect failed: {err}"),
                            });
                            return SessionEnd::Disconnected;
                        }
                        Err(_) => {
                            self.events.emit(Event::Error {
                                message: "connect timed out".to_string(),
                            });
                            return SessionEnd::Disconnected;
                        }
                    };
                }
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(ConnectorCommand::Shutdown) | None => return SessionEnd::Shutdown,
                        Some(_) => continue,
                    }
                }
            }
        };
        machine.on_socket_connected();
        self.events.emit(Event::Connected);

        // spec.md §4.C5: "schedule logon after 500ms".
        if self.wait_or_shutdown(Duration::from_millis(500)).await {
            return SessionEnd::Shutdown;
        }
        let logon_frame = messages::build_logon(&self.cfg, &mut self.seq_mgr);
        let mut stream = stream;
        if let Err(err) = stream.write_all(&logon_frame).await {
            self.events.emit(Event::Error {
                message: format!("failed to send logon: {err}"),
            });
            return SessionEnd::Disconnected;
        }
        machine.on_logon_sent();

        self.service_session(stream, machine).await
    }

    async fn service_session(
        &mut self,
        mut stream: TcpStream,
        machine: &mut SessionMachine,
    ) -> SessionEnd {
        let mut buf = BytesMut::with_capacity(8192);
        let mut read_buf = [0u8; 4096];
        let mut last_activity = Instant::now();
        let mut supervisor: Option<HeartbeatSupervisor> = None;
        let mut heartbeat_ticker: Option<tokio::time::Interval> = None;
        let mut post_logon_steps: Vec<PostLogonStep> = Vec::new();
        let mut post_logon_timer: Option<tokio::time::Interval> = None;

        loop {
            let heartbeat_tick = async {
                match heartbeat_ticker.as_mut() {
                    Some(ticker) => ticker.tick().await,
                    None => std::future::pending().await,
                }
            };
            let post_logon_tick = async {
                match post_logon_timer.as_mut() {
                    Some(ticker) => ticker.tick().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                result = stream.read(&mut read_buf) => {
                    match result {
                        Ok(0) => {
                            self.events.emit(Event::Disconnected { reason: EventDisconnectReason::PeerClosed });
                            machine.on_socket_closed();
                            return SessionEnd::Disconnected;
                        }
                        Ok(n) => {
                            buf.extend_from_slice(&read_buf[..n]);
                            last_activity = Instant::now();
                            if let Some(end) = self
                                .drain_frames(&mut buf, machine, &mut stream, &mut supervisor)
                                .await
                            {
                                return end;
                            }
                            if machine.is_logged_in() && supervisor.is_none() {
                                let hb = HeartbeatSupervisor::new(self.cfg.heartbeat_interval());
                                heartbeat_ticker = Some(interval(hb.tick_interval()));
                                supervisor = Some(hb);
                                post_logon_steps = PostLogonStep::SEQUENCE.iter().rev().copied().collect();
                                post_logon_timer = Some(interval(PostLogonStep::STAGGER));
                            }
                        }
                        Err(err) => {
                            self.events.emit(Event::Error { message: format!("read error: {err}") });
                            self.events.emit(Event::Disconnected { reason: EventDisconnectReason::TransportError });
                            machine.on_socket_closed();
                            return SessionEnd::Disconnected;
                        }
                    }
                }
                _ = heartbeat_tick => {
                    let Some(sup) = supervisor.as_mut() else { continue };
                    let idle = last_activity.elapsed();
                    match sup.on_tick(idle) {
                        HeartbeatAction::None => {}
                        HeartbeatAction::SendHeartbeat => {
                            let frame = messages::build_heartbeat(&self.cfg, &mut self.seq_mgr, None);
                            if self.write_frame(&mut stream, &frame).await.is_err() {
                                machine.on_socket_closed();
                                return SessionEnd::Disconnected;
                            }
                        }
                        HeartbeatAction::SendTestRequest => {
                            let (_, frame) = messages::build_test_request(&self.cfg, &mut self.seq_mgr);
                            if self.write_frame(&mut stream, &frame).await.is_err() {
                                machine.on_socket_closed();
                                return SessionEnd::Disconnected;
                            }
                        }
                        HeartbeatAction::ConnectionDead => {
                            self.events.emit(Event::Disconnected { reason: EventDisconnectReason::HeartbeatTimeout });
                            machine.on_socket_closed();
                            return SessionEnd::Disconnected;
                        }
                    }
                }
                _ = post_logon_tick => {
                    if let Some(step) = post_logon_steps.pop() {
                        self.send_post_logon_step(&mut stream, step).await;
                    }
                    if post_logon_steps.is_empty() {
                        post_logon_timer = None;
                    }
                }
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(ConnectorCommand::Shutdown) | None => {
                            let frame = messages::build_logout(&self.cfg, &mut self.seq_mgr, Some("shutting down"));
                            let _ = tokio::time::timeout(Duration::from_millis(500), stream.write_all(&frame)).await;
                            return SessionEnd::Shutdown;
                        }
                        Some(ConnectorCommand::RequestMarketData(sub)) if machine.is_logged_in() => {
                            let (_, frame) = messages::build_market_data_request(&self.cfg, &mut self.seq_mgr, &sub);
                            if self.write_frame(&mut stream, &frame).await.is_err() {
                                machine.on_socket_closed();
                                return SessionEnd::Disconnected;
                            }
                        }
                        Some(ConnectorCommand::RequestSecurityList(product)) if machine.is_logged_in() => {
                            let (_, frame) = messages::build_security_list_request(&self.cfg, &mut self.seq_mgr, product);
                            if self.write_frame(&mut stream, &frame).await.is_err() {
                                machine.on_socket_closed();
                                return SessionEnd::Disconnected;
                            }
                        }
                        Some(ConnectorCommand::RequestTradingSessionStatus) if machine.is_logged_in() => {
                            let (_, frame) = messages::build_trading_session_status_request(&self.cfg, &mut self.seq_mgr);
                            if self.write_frame(&mut stream, &frame).await.is_err() {
                                machine.on_socket_closed();
                                return SessionEnd::Disconnected;
                            }
                        }
                        Some(_) => {
                            // Not yet logged in: application requests are gated (spec.md §4.C5).
                        }
                    }
                }
            }
        }
    }

    async fn write_frame(
        &self,
        stream: &mut TcpStream,
        frame: &bytes::Bytes,
    ) -> std::io::Result<()> {
        stream.write_all(frame).await
    }

    async fn send_post_logon_step(&mut self, stream: &mut TcpStream, step: PostLogonStep) {
        let frame = match step {
            PostLogonStep::TradingSessionStatus => {
                messages::build_trading_session_status_request(&self.cfg, &mut self.seq_mgr).1
            }
            PostLogonStep::EquitySecurityList => {
                messages::build_security_list_request(&self.cfg, &mut self.seq_mgr, Product::Equity)
                    .1
            }
            PostLogonStep::IndexSecurityList => {
                messages::build_security_list_request(&self.cfg, &mut self.seq_mgr, Product::Index)
                    .1
            }
        };
        let _ = self.write_frame(stream, &frame).await;
    }

    /// Drains as many complete frames as the buffer currently holds, in
    /// receive order (spec.md §5 "Ordering guarantees"). Returns `Some` when
    /// the session must end (a sequence error recovery was triggered).
    async fn drain_frames(
        &mut self,
        buf: &mut BytesMut,
        machine: &mut SessionMachine,
        stream: &mut TcpStream,
        supervisor: &mut Option<HeartbeatSupervisor>,
    ) -> Option<SessionEnd> {
        loop {
            match protocol::next_frame(buf) {
                FrameResult::Incomplete => return None,
                FrameResult::Skipped(reason) => {
                    tracing::warn!(reason, "skipped malformed frame");
                    self.events.emit(Event::Error {
                        message: format!("malformed frame skipped: {reason}"),
                    });
                    continue;
                }
                FrameResult::Frame(frame) => {
                    let msg = match protocol::decode(&frame) {
                        Ok(msg) => msg,
                        Err(err) => {
                            tracing::warn!(error = %err, "failed to decode structurally valid frame");
                            self.events.emit(Event::Error {
                                message: err.to_string(),
                            });
                            continue;
                        }
                    };

                    let is_sequence_error_carrier = match msg.msg_type {
                        MsgType::Logout => {
                            handlers::handle_logout(&msg)
                                .sequence_error
                                .is_sequence_error
                        }
                        MsgType::Reject => handlers::handle_reject(&msg).1.is_sequence_error,
                        _ => false,
                    };
                    if !is_sequence_error_carrier {
                        if let Some(seq) = msg.get_u32(protocol::tags::MSG_SEQ_NUM) {
                            self.seq_mgr.update_server_seq(seq);
                            self.store.persist(self.seq_mgr.snapshot());
                        }
                    }

                    self.events
                        .emit(Event::Message(handlers::to_field_map(&msg)));
                    self.events
                        .emit(Event::RawMessage(handlers::to_field_map(&msg)));

                    if let Some(end) = self.handle_message(&msg, machine, stream, supervisor).await
                    {
                        return Some(end);
                    }
                }
            }
        }
    }

    async fn handle_message(
        &mut self,
        msg: &protocol::ParsedMessage,
        machine: &mut SessionMachine,
        stream: &mut TcpStream,
        supervisor: &mut Option<HeartbeatSupervisor>,
    ) -> Option<SessionEnd> {
        match msg.msg_type {
            MsgType::Logon => {
                let info = handlers::handle_logon(msg);
                self.seq_mgr.update_server_seq(info.server_seq);
                self.seq_mgr.process_logon(info.server_seq, info.reset_flag);
                self.store.persist(self.seq_mgr.snapshot());
                machine.on_logon_received();
                self.events.emit(Event::Logon);
                None
            }
            MsgType::Logout => {
                let outcome = handlers::handle_logout(msg);
                let action = machine.on_logout_received(outcome.sequence_error.is_sequence_error);
                self.apply_action(action, supervisor);
                if outcome.sequence_error.is_sequence_error {
                    Some(SessionEnd::SequenceError {
                        expected: outcome.sequence_error.expected_seq_num,
                    })
                } else {
                    self.events.emit(Event::Logout);
                    None
                }
            }
            MsgType::Heartbeat => {
                if let Some(sup) = supervisor.as_mut() {
                    sup.on_heartbeat_received();
                }
                None
            }
            MsgType::TestRequest => {
                if let Some(test_req_id) = handlers::handle_test_request(msg) {
                    let frame =
                        messages::build_heartbeat(&self.cfg, &mut self.seq_mgr, Some(&test_req_id));
                    let _ = self.write_frame(stream, &frame).await;
                }
                None
            }
            MsgType::MarketDataSnapshotFullRefresh => {
                let snapshot = handlers::handle_market_data_snapshot(msg);
                self.emit_market_data(snapshot);
                None
            }
            MsgType::MarketDataIncrementalRefresh => {
                let snapshot = handlers::handle_market_data_incremental(msg);
                self.emit_market_data(snapshot);
                None
            }
            MsgType::MarketDataRequestReject => {
                let reject = handlers::handle_market_data_reject(msg);
                self.events.emit(Event::MarketDataReject {
                    md_req_id: reject.md_req_id,
                    reject_reason: reject.reject_reason,
                    text: reject.text,
                });
                None
            }
            MsgType::SecurityList => {
                let outcome = handlers::handle_security_list(msg);
                self.events.emit(Event::SecurityList {
                    security_req_id: outcome.security_req_id.clone(),
                    entries: outcome.entries.clone(),
                });
                match outcome.product.as_deref() {
                    Some("4") => self.events.emit(Event::EquitySecurityList {
                        security_req_id: outcome.security_req_id,
                        entries: outcome.entries,
                    }),
                    Some("5") => self.events.emit(Event::IndexSecurityList {
                        security_req_id: outcome.security_req_id,
                        entries: outcome.entries,
                    }),
                    _ => {}
                }
                None
            }
            MsgType::TradingSessionStatus => {
                let info = handlers::handle_trading_session_status(msg);
                self.events.emit(Event::TradingSessionStatus(info));
                None
            }
            MsgType::TradingStatus => {
                let status = handlers::handle_trading_status(msg);
                self.events.emit(Event::TradingStatus {
                    symbol: status.symbol,
                    status: status.status,
                    timestamp: status.timestamp,
                });
                None
            }
            MsgType::Reject => {
                let (info, sequence_error) = handlers::handle_reject(msg);
                self.events.emit(Event::Reject(info));
                if sequence_error.is_sequence_error {
                    let action = machine.on_reject_sequence_error();
                    self.apply_action(action, supervisor);
                    Some(SessionEnd::SequenceError {
                        expected: sequence_error.expected_seq_num,
                    })
                } else {
                    None
                }
            }
            MsgType::Other
            | MsgType::MarketDataRequest
            | MsgType::SecurityListRequest
            | MsgType::TradingSessionStatusRequest => {
                self.events.emit(Event::CategorizedData(CategorizedData {
                    category: "UNKNOWN".to_string(),
                    msg_type: msg.msg_type_raw.clone(),
                    symbol: msg.get(protocol::tags::SYMBOL).map(str::to_string),
                    data: handlers::to_field_map(msg),
                    timestamp: Utc::now(),
                }));
                None
            }
        }
    }

    fn emit_market_data(&mut self, snapshot: handlers::MarketDataSnapshot) {
        self.events.emit(Event::MarketData {
            symbol: snapshot.symbol.clone(),
            items: snapshot.items.clone(),
        });
        if snapshot.is_kse_index {
            self.events.emit(Event::KseData {
                symbol: snapshot.symbol,
                items: snapshot.items,
            });
        }
    }

    fn apply_action(&self, action: Action, supervisor: &mut Option<HeartbeatSupervisor>) {
        if matches!(action, Action::StopHeartbeatSupervisor) {
            *supervisor = None;
        }
    }
}
