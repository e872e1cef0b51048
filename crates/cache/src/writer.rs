use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use wayfind_core::{Result, SelectorEntry};
use wayfind_storage::SelectorStore;

/// A durable mutation queued by the cache.
#[derive(Debug)]
pub enum StoreOp {
    Put(SelectorEntry),
    /// Atomic counter update; `entry` is written whole if the row is missing.
    Outcome { entry: SelectorEntry, success: bool },
    /// Alternatives changed; `entry` is written whole if the row is missing.
    Alternatives(SelectorEntry),
    Delete(String),
    Transition { from_url: String, to_url: String, at_ms: i64 },
    ResetNavigation,
    Flush(oneshot::Sender<()>),
}

impl StoreOp {
    fn kind(&self) -> &'static str {
        match self {
            StoreOp::Put(_) => "put",
            StoreOp::Outcome { .. } => "outcome",
            StoreOp::Alternatives(_) => "alternatives",
            StoreOp::Delete(_) => "delete",
            StoreOp::Transition { .. } => "transition",
            StoreOp::ResetNavigation => "reset_navigation",
            StoreOp::Flush(_) => "flush",
        }
    }
}

/// Sending half of the background store writer.
#[derive(Clone)]
pub struct StoreWriter {
    tx: mpsc::Sender<StoreOp>,
}

impl StoreWriter {
    /// Spawn the writer task. Ops are applied one at a time, in FIFO order.
    pub fn spawn(store: SelectorStore, queue_size: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let handle = tokio::spawn(run_writer(store, rx));
        (Self { tx }, handle)
    }

    /// Queue an op without waiting. A full queue drops the op.
    pub fn enqueue(&self, op: StoreOp) {
        let kind = op.kind();
        match self.tx.try_send(op) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(op = kind, "Store write queue full, dropping mutation");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(op = kind, "Store writer closed, dropping mutation");
            }
        }
    }

    /// Wait until every op queued before this call has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(StoreOp::Flush(done_tx)).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }
}

async fn run_writer(store: SelectorStore, mut rx: mpsc::Receiver<StoreOp>) {
    debug!("Store writer started");
    while let Some(op) = rx.recv().await {
        if let StoreOp::Flush(done) = op {
            let _ = done.send(());
            continue;
        }

        let kind = op.kind();
        let store = store.clone();
        match tokio::task::spawn_blocking(move || apply(&store, op)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(op = kind, error = %e, "Store mutation failed"),
            Err(e) => warn!(op = kind, error = %e, "Store mutation task panicked"),
        }
    }
    debug!("Store writer stopped");
}

fn apply(store: &SelectorStore, op: StoreOp) -> Result<()> {
    match op {
        StoreOp::Put(entry) => store.put(&entry),
        StoreOp::Outcome { entry, success } => {
            if !store.update_outcome_by_id(&entry.id, success, entry.last_updated_at)? {
                store.put(&entry)?;
            }
            Ok(())
        }
        StoreOp::Alternatives(entry) => {
            if !store.set_alternatives(&entry.id, &entry.alternatives)? {
                store.put(&entry)?;
            }
            Ok(())
        }
        StoreOp::Delete(id) => store.delete(&id).map(|_| ()),
        StoreOp::Transition { from_url, to_url, at_ms } => {
            store.record_transition(&from_url, &to_url, at_ms)
        }
        StoreOp::ResetNavigation => store.reset_navigation().map(|_| ()),
        StoreOp::Flush(done) => {
            let _ = done.send(());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wayfind_core::NewSelector;

    #[tokio::test]
    async fn test_ops_apply_in_order() {
        let dir = TempDir::new().unwrap();
        let store = SelectorStore::open(&dir.path().join("s.db")).unwrap();
        let (writer, handle) = StoreWriter::spawn(store.clone(), 16);

        let entry = NewSelector::new("x", "/p", "#a")
            .with_alternatives(&["#b"])
            .into_entry("e1".to_string(), 0, 60_000, 5);
        writer.enqueue(StoreOp::Put(entry.clone()));
        writer.enqueue(StoreOp::Outcome { entry: entry.clone(), success: true });
        writer.enqueue(StoreOp::Transition {
            from_url: "/a".to_string(),
            to_url: "/b".to_string(),
            at_ms: 1,
        });
        writer.flush().await;

        let stored = store.get_by_id("e1").unwrap().unwrap();
        assert_eq!(stored.success_count, 1);
        assert_eq!(store.transitions_from("/a").unwrap().len(), 1);

        drop(writer);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_outcome_on_missing_row_writes_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = SelectorStore::open(&dir.path().join("s.db")).unwrap();
        let (writer, _handle) = StoreWriter::spawn(store.clone(), 16);

        let mut entry = NewSelector::new("x", "/p", "#a").into_entry("e2".to_string(), 0, 60_000, 5);
        entry.failure_count = 1;
        entry.recompute_confidence();
        writer.enqueue(StoreOp::Outcome { entry, success: false });
        writer.flush().await;

        let stored = store.get_by_id("e2").unwrap().unwrap();
        assert_eq!(stored.failure_count, 1);
        assert_eq!(stored.confidence, 0.0);
    }
}
