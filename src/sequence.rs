//! Multi-stream sequence-number manager (spec.md §3 SequenceState, §4.C2).
//!
//! Owns five counters and presents them as a single server-facing stream by
//! drawing each outbound send from a disjoint per-family counter, all of
//! which advance under one write lock (see [`crate::dispatcher`]).

use serde::{Deserialize, Serialize};

/// Which outbound counter a message is drawn from (spec.md §4.C3 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Main,
    MarketData,
    SecurityList,
    TradingStatus,
}

/// The five integers that make up session sequencing state (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceState {
    pub main: u32,
    pub server: u32,
    pub market_data: u32,
    pub security_list: u32,
    pub trading_status: u32,
}

impl Default for SequenceState {
    fn default() -> Self {
        Self::first_logon_defaults()
    }
}

impl SequenceState {
    /// All counters start at 1 on first logon, except `security_list`, which
    /// starts at 3 by policy to avoid collision with startup session traffic
    /// on this gateway (spec.md §3, §9 open question: the source used both 2
    /// and 3 as the post-reset baseline; this implementation settles on 3
    /// uniformly — see DESIGN.md).
    pub fn first_logon_defaults() -> Self {
        Self {
            main: 1,
            server: 0,
            market_data: 1,
            security_list: 3,
            trading_status: 1,
        }
    }
}

/// Owns the five counters for one session. Not thread-safe by itself; the
/// dispatcher task is its single owner (spec.md §5), typically reached
/// through a `tokio::sync::Mutex<SequenceManager>`.
#[derive(Debug, Clone)]
pub struct SequenceManager {
    state: SequenceState,
}

impl SequenceManager {
    pub fn new() -> Self {
        Self {
            state: SequenceState::first_logon_defaults(),
        }
    }

    pub fn from_state(state: SequenceState) -> Self {
        Self { state }
    }

    /// Atomic read-then-increment: returns the pre-increment value, which is
    /// the value that must be placed on the wire (I1).
    pub fn next_and_inc(&mut self, stream: Stream) -> u32 {
        let counter = match stream {
            Stream::Main => &mut self.state.main,
            Stream::MarketData => &mut self.state.market_data,
            Stream::SecurityList => &mut self.state.security_list,
            Stream::TradingStatus => &mut self.state.trading_status,
        };
        let value = *counter;
        *counter += 1;
        value
    }

    pub fn peek(&self, stream: Stream) -> u32 {
        match stream {
            Stream::Main => self.state.main,
            Stream::MarketData => self.state.market_data,
            Stream::SecurityList => self.state.security_list,
            Stream::TradingStatus => self.state.trading_status,
        }
    }

    pub fn peek_all(&self) -> SequenceState {
        self.state
    }

    /// Advances the inbound server counter. Returns `true` if `n` arrived
    /// more than one past the previous value, indicating a gap (I3): this
    /// gateway has no resend mechanism, so gaps are reported but the policy
    /// is a full re-logon with sequence reset, not a ResendRequest.
    pub fn update_server_seq(&mut self, n: u32) -> bool {
        let gapped = n > self.state.server + 1;
        if n >= self.state.server {
            self.state.server = n;
        }
        gapped
    }

    /// Applies logon sequencing per spec.md §4.C2. When `reset_flag` is set,
    /// both sides are understood to have reinitialized to 1 and consumed
    /// sequence 1 on the logon itself, so outbound counters land on 2 (3 for
    /// `security_list`, by the policy above) and `server` becomes 1.
    /// Otherwise, `main` continues from the server's logon sequence number.
    pub fn process_logon(&mut self, server_seq: u32, reset_flag: bool) {
        if reset_flag {
            self.state = SequenceState {
                main: 2,
                server: 1,
                market_data: 2,
                security_list: 3,
                trading_status: 2,
            };
        } else {
            self.state.main = server_seq + 1;
            self.state.market_data = self.state.market_data.max(server_seq + 1);
            self.state.security_list = self.state.security_list.max(server_seq + 1);
            self.state.trading_status = self.state.trading_status.max(server_seq + 1);
            self.state.server = server_seq;
        }
    }

    /// Applies a gateway-driven re-baseline to a specific expected sequence
    /// number (spec.md §4.C2, §4.C6 sequence-error recovery).
    pub fn force_reset(&mut self, expected: u32) {
        self.state.main = expected;
        self.state.security_list = expected + 1;
        self.state.market_data = expected;
        self.state.trading_status = expected;
    }

    /// Reinitializes all counters to first-logon defaults (used when a
    /// sequence error carries no parseable expected value).
    pub fn reset_all(&mut self) {
        self.state = SequenceState::first_logon_defaults();
    }

    pub fn snapshot(&self) -> SequenceState {
        self.state
    }

    pub fn restore(&mut self, state: SequenceState) {
        self.state = state;
    }
}

impl Default for SequenceManager {
    fn default() -> Self {
        Self::new()
    }
}
