//! Sequence-snapshot persistence (spec.md §6 "Sequence-store file").
//!
//! A single JSON document written by one background task, generalized from
//! the teacher's batched message-journal writer in `storage.rs` down to a
//! single small snapshot (no message log or resend range is kept — spec.md
//! §1 excludes that as a non-goal).

use crate::sequence::SequenceState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

pub const DEFAULT_FILENAME: &str = "sequence-store.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceSnapshot {
    pub main: u32,
    pub server: u32,
    pub market_data: u32,
    pub security_list: u32,
    pub trading_status: u32,
    pub last_updated: DateTime<Utc>,
}

impl SequenceSnapshot {
    fn from_state(state: SequenceState, now: DateTime<Utc>) -> Self {
        Self {
            main: state.main,
            server: state.server,
            market_data: state.market_data,
            security_list: state.security_list,
            trading_status: state.trading_status,
            last_updated: now,
        }
    }

    fn to_state(&self) -> SequenceState {
        SequenceState {
            main: self.main,
            server: self.server,
            market_data: self.market_data,
            security_list: self.security_list,
            trading_status: self.trading_status,
        }
    }
}

/// Reads the snapshot at `path`, implementing P7: returns `None` when the
/// file is absent, unparseable, or its `lastUpdated` calendar date (UTC)
/// differs from `now`'s — a fresh trading day starts sequences over.
pub async fn load_sequences(path: &Path, now: DateTime<Utc>) -> Option<SequenceState> {
    let contents = tokio::fs::read_to_string(path).await.ok()?;
    let snapshot: SequenceSnapshot = serde_json::from_str(&contents).ok()?;
    if snapshot.last_updated.date_naive() != now.date_naive() {
        tracing::info!(
            path = %path.display(),
            stored_date = %snapshot.last_updated.date_naive(),
            "discarding stale sequence snapshot from a previous day"
        );
        return None;
    }
    Some(snapshot.to_state())
}

/// Background writer: receives sequence-state updates and persists them as
/// JSON, skipping writes that would be identical to the last one on disk
/// (spec.md §6: "Written only on change").
pub struct SequenceStore {
    tx: mpsc::UnboundedSender<SequenceState>,
}

impl SequenceStore {
    /// Spawns the writer task and returns a handle plus its join handle, so
    /// callers can await a clean shutdown after dropping the handle.
    pub fn spawn(path: PathBuf) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<SequenceState>();
        let handle = tokio::spawn(async move {
            let mut last_written: Option<SequenceState> = None;
            while let Some(state) = rx.recv().await {
                if last_written == Some(state) {
                    continue;
                }
                let snapshot = SequenceSnapshot::from_state(state, Utc::now());
                match serde_json::to_string_pretty(&snapshot) {
                    Ok(json) => {
                        if let Err(err) = tokio::fs::write(&path, json).await {
                            tracing::warn!(error = %err, path = %path.display(), "failed to write sequence snapshot");
                            continue;
                        }
                        last_written = Some(state);
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to serialize sequence snapshot");
                    }
                }
            }
        });
        (Self { tx }, handle)
    }

    /// Queues the current sequence state for persistence. Never blocks the
    /// dispatcher on disk I/O (spec.md §5: the socket's owner is the only
    /// thing that must stay on the dispatcher task).
    pub fn persist(&self, state: SequenceState) {
        let _ = self.tx.send(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn sample_state() -> SequenceState {
        SequenceState {
            main: 10,
            server: 9,
            market_data: 4,
            security_list: 5,
            trading_status: 3,
        }
    }

    #[tokio::test]
    async fn p7_fresh_snapshot_from_today_loads() {
        let dir = tempdir();
        let path = dir.join("seq.json");
        let now = Utc::now();
        let snapshot = SequenceSnapshot::from_state(sample_state(), now);
        tokio::fs::write(&path, serde_json::to_string(&snapshot).unwrap())
            .await
            .unwrap();

        let loaded = load_sequences(&path, now).await;
        assert_eq!(loaded, Some(sample_state()));
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn p7_stale_snapshot_from_yesterday_is_discarded() {
        let dir = tempdir();
        let path = dir.join("seq_stale.json");
        let yesterday = Utc::now() - ChronoDuration::days(1);
        let snapshot = SequenceSnapshot::from_state(sample_state(), yesterday);
        tokio::fs::write(&path, serde_json::to_string(&snapshot).unwrap())
            .await
            .unwrap();

        let loaded = load_sequences(&path, Utc::now()).await;
        assert_eq!(loaded, None);
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn p7_missing_file_returns_none() {
        let dir = tempdir();
        let path = dir.join("does_not_exist.json");
        assert_eq!(load_sequences(&path, Utc::now()).await, None);
    }

    #[tokio::test]
    async fn writer_persists_and_skips_duplicate_writes() {
        let dir = tempdir();
        let path = dir.join("seq_written.json");
        let (store, handle) = SequenceStore::spawn(path.clone());

        store.persist(sample_state());
        let mut other = sample_state();
        other.main += 1;
        store.persist(other);
        store.persist(other); // duplicate, should not re-write

        drop(store);
        handle.await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let snapshot: SequenceSnapshot = serde_json::from_str(&contents).unwrap();
        assert_eq!(snapshot.main, other.main);
        let _ = tokio::fs::remove_file(&path).await;
    }

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("psxfix-store-test-{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        dir
    }
}
