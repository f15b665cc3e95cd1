//! Typed event surface consumed by external collaborators (spec.md §4.C7).
//!
//! Backed by a `tokio::sync::broadcast` channel: multi-subscriber, and
//! delivery is synchronous with respect to the dispatcher's parsing loop —
//! the consumer is responsible for keeping up (spec.md §5).

use crate::handlers::{MarketDataItem, RejectInfo, SecurityListEntry, TradingSessionStatusInfo};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Reason a session dropped (mirrors the teacher's `DisconnectReason`,
/// generalized beyond socket-level causes to the session-level ones this
/// profile's recovery paths produce).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    PeerClosed,
    TransportError,
    SequenceError,
    ShuttingDown,
    HeartbeatTimeout,
}

/// An annotated envelope for messages the dispatcher couldn't otherwise
/// classify, or that downstream consumers want a uniform view of
/// (spec.md §4.C7 `categorizedData`).
#[derive(Debug, Clone)]
pub struct CategorizedData {
    pub category: String,
    pub msg_type: String,
    pub symbol: Option<String>,
    pub data: HashMap<u32, String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum Event {
    Connected,
    Disconnected {
        reason: DisconnectReason,
    },
    Logon,
    Logout,
    Error {
        message: String,
    },
    /// A fully parsed inbound message, tag-keyed.
    Message(HashMap<u32, String>),
    /// The same message, preserved for consumers that want the raw map
    /// under its own channel name per spec.md §4.C7.
    RawMessage(HashMap<u32, String>),
    MarketData {
        symbol: String,
        items: Vec<MarketDataItem>,
    },
    KseData {
        symbol: String,
        items: Vec<MarketDataItem>,
    },
    SecurityList {
        security_req_id: Option<String>,
        entries: Vec<SecurityListEntry>,
    },
    EquitySecurityList {
        security_req_id: Option<String>,
        entries: Vec<SecurityListEntry>,
    },
    IndexSecurityList {
        security_req_id: Option<String>,
        entries: Vec<SecurityListEntry>,
    },
    TradingSessionStatus(TradingSessionStatusInfo),
    TradingStatus {
        symbol: String,
        status: Option<String>,
        timestamp: Option<String>,
    },
    MarketDataReject {
        md_req_id: Option<String>,
        reject_reason: Option<String>,
        text: Option<String>,
    },
    Reject(RejectInfo),
    CategorizedData(CategorizedData),
}

/// Multi-subscriber event sink. Cloning shares the same broadcast channel.
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<Event>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Emits an event to all current subscribers. A send with no
    /// subscribers is not an error — back-pressure and presence are the
    /// consumer's concern (spec.md §5).
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(4096)
    }
}
