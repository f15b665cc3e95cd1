//! Top-level connector handle: the crate's public entry point.
//!
//! Mirrors the teacher's `FixClient`/`Session` split, generalized: a
//! connector spawns its own dispatcher task (spec.md §5's "single logical
//! task per session") and returns a cloneable handle whose methods enqueue
//! commands onto that task's mailbox.

use crate::config::ConnectionConfig;
use crate::dispatcher::{ConnectorCommand, Dispatcher};
use crate::error::{PsxFixError, Result};
use crate::events::{Event, EventSink};
use crate::messages::{MarketDataSubscription, Product};
use crate::sequence::SequenceManager;
use crate::store::SequenceStore;
use chrono::Utc;
use std::path::PathBuf;
use tokio::sync::{broadcast, mpsc};

/// A running connector's handle. Cloning shares the same dispatcher task and
/// event sink.
#[derive(Clone)]
pub struct PsxConnectorHandle {
    commands: mpsc::Sender<ConnectorCommand>,
    events: EventSink,
}

impl PsxConnectorHandle {
    /// Connects to the configured gateway and starts servicing the session
    /// in the background. Returns immediately; subscribe to events via
    /// [`Self::subscribe`] to observe session lifecycle and market data.
    pub async fn connect(cfg: ConnectionConfig) -> Result<Self> {
        Self::connect_with_snapshot_path(cfg, Dispatcher::default_snapshot_path()).await
    }

    pub async fn connect_with_snapshot_path(
        cfg: ConnectionConfig,
        snapshot_path: PathBuf,
    ) -> Result<Self> {
        let initial_state = crate::store::load_sequences(&snapshot_path, Utc::now())
            .await
            .unwrap_or_default();
        let seq_mgr = SequenceManager::from_state(initial_state);

        let (store, _writer) = SequenceStore::spawn(snapshot_path);
        let events = EventSink::default();
        let (cmd_tx, cmd_rx) = mpsc::channel(256);

        let dispatcher = Dispatcher::new(cfg, events.clone(), cmd_rx, seq_mgr, store);
        tokio::spawn(dispatcher.run());

        Ok(Self {
            commands: cmd_tx,
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub async fn request_market_data(&self, subscription: MarketDataSubscription) -> Result<()> {
        self.commands
            .send(ConnectorCommand::RequestMarketData(subscription))
            .await
            .map_err(|_| PsxFixError::ChannelClosed)
    }

    pub async fn request_security_list(&self, product: Product) -> Result<()> {
        self.commands
            .send(ConnectorCommand::RequestSecurityList(product))
            .await
            .map_err(|_| PsxFixError::ChannelClosed)
    }

    pub async fn request_trading_session_status(&self) -> Result<()> {
        self.commands
            .send(ConnectorCommand::RequestTradingSessionStatus)
            .await
            .map_err(|_| PsxFixError::ChannelClosed)
    }

    /// Graceful shutdown (spec.md §5 "Cancellation & timeouts"): the
    /// dispatcher sends a Logout, waits briefly for the flush, then stops
    /// reconnecting.
    pub async fn shutdown(&self) -> Result<()> {
        self.commands
            .send(ConnectorCommand::Shutdown)
            .await
            .map_err(|_| PsxFixError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_returns_a_handle_without_waiting_on_the_socket() {
        let cfg = ConnectionConfig::builder()
            .host("127.0.0.1")
            .port(1) // nothing listens here; the dispatcher retries in the background
            .sender_comp_id("realtime")
            .target_comp_id("NMDUFISQ0001")
            .build()
            .unwrap();
        let path =
            std::env::temp_dir().join(format!("psxfix-client-test-{}.json", std::process::id()));
        let handle = PsxConnectorHandle::connect_with_snapshot_path(cfg, path.clone())
            .await
            .unwrap();
        let mut rx = handle.subscribe();
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("dispatcher should report a connect error within 5s")
            .unwrap();
        assert!(matches!(event, Event::Error { .. }));
        let _ = handle.shutdown().await;
        let _ = std::fs::remove_file(&path);
    }
}
