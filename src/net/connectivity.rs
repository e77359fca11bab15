use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::storage::{load_json, store_json, Article, CacheError, Category, PersistenceAdapter};

/// Key prefix of the persisted raw batch per category.
pub const LAST_BATCH_KEY_PREFIX: &str = "cache.lastRawBatch.";

pub fn last_batch_key(category: Category) -> String {
    format!("{LAST_BATCH_KEY_PREFIX}{}", category.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

/// Platform connectivity report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Connected,
    Disconnected,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("{feature} is unavailable while offline")]
    FeatureUnavailableOffline { feature: String },
}

/// Tracks online/offline state and keeps the last raw batch per category.
///
/// Only a connectivity event can bring the gate back online; a successful
/// fetch while offline does not, and reconnecting does not trigger a refetch.
pub struct ConnectivityGate {
    state: watch::Sender<Connectivity>,
    batches: Mutex<LruCache<Category, Vec<Article>>>,
    kv: Arc<dyn PersistenceAdapter>,
}

impl ConnectivityGate {
    /// `memory_slots` bounds how many categories stay in memory; older
    /// batches are reloaded from the persistence adapter on demand.
    pub fn new(initial: Connectivity, kv: Arc<dyn PersistenceAdapter>, memory_slots: usize) -> Self {
        let (state, _) = watch::channel(initial);
        let capacity = NonZeroUsize::new(memory_slots).unwrap_or(NonZeroUsize::MIN);
        Self {
            state,
            batches: Mutex::new(LruCache::new(capacity)),
            kv,
        }
    }

    pub fn state(&self) -> Connectivity {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state() == Connectivity::Online
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }

    pub fn apply_event(&self, event: ConnectivityEvent) -> Connectivity {
        let next = match event {
            ConnectivityEvent::Connected => Connectivity::Online,
            ConnectivityEvent::Disconnected => Connectivity::Offline,
        };
        self.transition(next);
        next
    }

    /// A failed fetch implies the network is unreachable.
    pub fn record_fetch_failure(&self) {
        self.transition(Connectivity::Offline);
    }

    fn transition(&self, next: Connectivity) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            tracing::info!(state = ?next, "Connectivity changed");
        }
    }

    /// Pump events from `rx` until every sender is dropped.
    ///
    /// Abort the returned handle to stop listening early.
    pub fn listen(self: &Arc<Self>, mut rx: mpsc::Receiver<ConnectivityEvent>) -> JoinHandle<()> {
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                gate.apply_event(event);
            }
            tracing::debug!("Connectivity event source closed");
        })
    }

    /// Fail with [`GateError::FeatureUnavailableOffline`] while offline.
    pub fn require_online(&self, feature: &str) -> Result<(), GateError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(GateError::FeatureUnavailableOffline {
                feature: feature.to_string(),
            })
        }
    }

    /// Remember the raw batch of the latest successful fetch for `category`.
    ///
    /// The in-memory copy is replaced even when persisting fails.
    pub async fn record_batch(&self, category: Category, articles: Vec<Article>) -> Result<(), CacheError> {
        let key = last_batch_key(category);
        let result = store_json(self.kv.as_ref(), &key, &articles).await;
        self.batches.lock().await.put(category, articles);

        result.map_err(|source| {
            tracing::warn!(key = %key, error = %source, "Failed to persist raw batch");
            CacheError::PersistenceWrite { key, source }
        })
    }

    /// Last raw batch for `category`: memory, then persisted, then empty.
    pub async fn last_batch(&self, category: Category) -> Vec<Article> {
        if let Some(batch) = self.batches.lock().await.get(&category) {
            return batch.clone();
        }

        let loaded: Option<Vec<Article>> = load_json(self.kv.as_ref(), &last_batch_key(category)).await;
        match loaded {
            Some(batch) => {
                tracing::debug!(category = %category, count = batch.len(), "Reloaded raw batch");
                self.batches.lock().await.put(category, batch.clone());
                batch
            }
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::FlakyKv;
    use crate::storage::MemoryKv;
    use pretty_assertions::assert_eq;

    fn gate(initial: Connectivity) -> ConnectivityGate {
        ConnectivityGate::new(initial, Arc::new(MemoryKv::new()), 4)
    }

    fn batch(ids: &[&str]) -> Vec<Article> {
        ids.iter().map(|id| Article::new(*id, format!("Title {id}"))).collect()
    }

    #[test]
    fn test_events_drive_transitions() {
        let gate = gate(Connectivity::Online);
        assert_eq!(gate.apply_event(ConnectivityEvent::Disconnected), Connectivity::Offline);
        assert!(!gate.is_online());
        assert_eq!(gate.apply_event(ConnectivityEvent::Connected), Connectivity::Online);
        assert!(gate.is_online());
    }

    #[test]
    fn test_fetch_failure_goes_offline_and_stays() {
        let gate = gate(Connectivity::Online);
        gate.record_fetch_failure();
        assert_eq!(gate.state(), Connectivity::Offline);
        gate.record_fetch_failure();
        assert_eq!(gate.state(), Connectivity::Offline);
    }

    #[test]
    fn test_require_online() {
        let gate = gate(Connectivity::Offline);
        assert_eq!(
            gate.require_online("search"),
            Err(GateError::FeatureUnavailableOffline {
                feature: "search".to_string()
            })
        );
        gate.apply_event(ConnectivityEvent::Connected);
        assert!(gate.require_online("search").is_ok());
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let gate = gate(Connectivity::Online);
        let mut rx = gate.subscribe();

        gate.record_fetch_failure();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), Connectivity::Offline);

        // Same-state event does not notify
        gate.apply_event(ConnectivityEvent::Disconnected);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_listen_pumps_events_until_sender_dropped() {
        let gate = Arc::new(gate(Connectivity::Online));
        let mut state_rx = gate.subscribe();
        let (tx, rx) = mpsc::channel(4);
        let handle = gate.listen(rx);

        tx.send(ConnectivityEvent::Disconnected).await.unwrap();
        state_rx.changed().await.unwrap();
        assert_eq!(gate.state(), Connectivity::Offline);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_last_batch_empty_without_prior_fetch() {
        let gate = gate(Connectivity::Offline);
        assert!(gate.last_batch(Category::Science).await.is_empty());
    }

    #[tokio::test]
    async fn test_batch_survives_restart() {
        let kv: Arc<dyn PersistenceAdapter> = Arc::new(MemoryKv::new());
        let first = ConnectivityGate::new(Connectivity::Online, Arc::clone(&kv), 4);
        first.record_batch(Category::Sports, batch(&["a", "b"])).await.unwrap();

        let second = ConnectivityGate::new(Connectivity::Offline, kv, 4);
        let ids: Vec<_> = second
            .last_batch(Category::Sports)
            .await
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(second.last_batch(Category::Health).await.is_empty());
    }

    #[tokio::test]
    async fn test_evicted_batch_reloads_from_storage() {
        let gate = ConnectivityGate::new(Connectivity::Online, Arc::new(MemoryKv::new()), 1);
        gate.record_batch(Category::Sports, batch(&["s"])).await.unwrap();
        gate.record_batch(Category::Health, batch(&["h"])).await.unwrap();

        assert_eq!(gate.last_batch(Category::Sports).await[0].id, "s");
        assert_eq!(gate.last_batch(Category::Health).await[0].id, "h");
    }

    #[tokio::test]
    async fn test_persist_failure_keeps_memory_copy() {
        let kv = Arc::new(FlakyKv::default());
        kv.set_failing(true);
        let gate = ConnectivityGate::new(Connectivity::Online, kv, 4);

        let result = gate.record_batch(Category::All, batch(&["x"])).await;
        assert!(matches!(result, Err(CacheError::PersistenceWrite { .. })));
        assert_eq!(gate.last_batch(Category::All).await.len(), 1);
    }

    #[test]
    fn test_batch_key_format() {
        assert_eq!(last_batch_key(Category::Technology), "cache.lastRawBatch.technology");
        assert_eq!(last_batch_key(Category::All), "cache.lastRawBatch.all");
    }
}
