use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};

use super::kv::{load_json, store_json, PersistenceAdapter};
use super::types::{
    CacheError, Collection, CollectionEntry, MembershipMeta, MutationOutcome, ToggleOutcome,
    DEFAULT_READ_TIME_MINUTES,
};

/// One named collection: its entries plus the gate serializing its writers.
struct CollectionSlot {
    collection: Collection,
    entries: RwLock<Vec<CollectionEntry>>,
    // Held for the whole read-modify-persist unit of a mutation
    write_gate: Mutex<()>,
    dirty: AtomicBool,
}

impl CollectionSlot {
    fn new(collection: Collection, entries: Vec<CollectionEntry>) -> Self {
        Self {
            collection,
            entries: RwLock::new(entries),
            write_gate: Mutex::new(()),
            dirty: AtomicBool::new(false),
        }
    }
}

/// Named membership sets (saved, offline, read, followed sources).
///
/// Each collection is an insertion-ordered list of [`CollectionEntry`]
/// persisted under its own key. Mutations on one collection are serialized:
/// the in-memory list is replaced in a single step and then the whole list
/// is flushed while the collection's write gate is still held.
///
/// Persistence is last-writer-wins with no rollback. When a flush fails the
/// change stays in memory, the collection is marked dirty, and the next
/// mutation of that collection rewrites its key.
pub struct CollectionIndex {
    slots: Vec<CollectionSlot>,
    kv: Arc<dyn PersistenceAdapter>,
}

impl CollectionIndex {
    /// Load every collection, starting empty for missing or unreadable keys.
    pub async fn load(kv: Arc<dyn PersistenceAdapter>) -> Self {
        let mut slots = Vec::with_capacity(Collection::ALL.len());
        for collection in Collection::ALL {
            let loaded: Vec<CollectionEntry> = load_json(kv.as_ref(), collection.storage_key())
                .await
                .unwrap_or_default();
            let entries = dedup_entries(loaded);
            tracing::debug!(
                collection = %collection,
                count = entries.len(),
                "Loaded collection"
            );
            slots.push(CollectionSlot::new(collection, entries));
        }

        Self { slots, kv }
    }

    fn slot(&self, collection: Collection) -> &CollectionSlot {
        &self.slots[collection.slot()]
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Add `id` to `collection`. Adding a present id changes nothing.
    ///
    /// # Errors
    ///
    /// - [`CacheError::SnapshotRequired`] for `offline` without offline metadata
    /// - [`CacheError::MetadataMismatch`] when the metadata kind does not fit the collection
    /// - [`CacheError::EmptyIdentifier`] for a blank id
    pub async fn add(
        &self,
        collection: Collection,
        id: &str,
        meta: Option<MembershipMeta>,
    ) -> Result<MutationOutcome, CacheError> {
        check_identifier(collection, id)?;
        let meta = resolve_meta(collection, meta)?;

        let slot = self.slot(collection);
        let _gate = slot.write_gate.lock().await;

        let changed = {
            let mut entries = slot.entries.write().await;
            if entries.iter().any(|e| e.id == id) {
                false
            } else {
                entries.push(CollectionEntry {
                    id: id.to_string(),
                    added_at: Utc::now(),
                    meta,
                });
                true
            }
        };

        let persisted = self.persist_if_needed(slot, changed).await;
        Ok(MutationOutcome { changed, persisted })
    }

    /// Remove `id` from `collection`. Removing an absent id changes nothing.
    pub async fn remove(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<MutationOutcome, CacheError> {
        let slot = self.slot(collection);
        let _gate = slot.write_gate.lock().await;

        let changed = {
            let mut entries = slot.entries.write().await;
            let before = entries.len();
            entries.retain(|e| e.id != id);
            entries.len() != before
        };

        let persisted = self.persist_if_needed(slot, changed).await;
        Ok(MutationOutcome { changed, persisted })
    }

    /// Remove `id` if present, otherwise add it with `meta_if_adding`.
    ///
    /// The membership check and the change happen under the collection's
    /// write gate, so concurrent toggles apply in call order.
    pub async fn toggle(
        &self,
        collection: Collection,
        id: &str,
        meta_if_adding: Option<MembershipMeta>,
    ) -> Result<ToggleOutcome, CacheError> {
        check_identifier(collection, id)?;

        let slot = self.slot(collection);
        let _gate = slot.write_gate.lock().await;

        let added = {
            let mut entries = slot.entries.write().await;
            match entries.iter().position(|e| e.id == id) {
                Some(pos) => {
                    entries.remove(pos);
                    false
                }
                None => {
                    // Only the adding direction needs valid metadata
                    let meta = resolve_meta(collection, meta_if_adding)?;
                    entries.push(CollectionEntry {
                        id: id.to_string(),
                        added_at: Utc::now(),
                        meta,
                    });
                    true
                }
            }
        };

        let persisted = self.persist_if_needed(slot, true).await;
        Ok(ToggleOutcome { added, persisted })
    }

    /// Retry every collection whose last flush failed.
    pub async fn flush_pending(&self) -> Result<(), CacheError> {
        let mut first_error = None;
        for slot in &self.slots {
            if !slot.dirty.load(Ordering::SeqCst) {
                continue;
            }
            let _gate = slot.write_gate.lock().await;
            if let Err(e) = self.flush_slot(slot).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn has_pending_writes(&self, collection: Collection) -> bool {
        self.slot(collection).dirty.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn contains(&self, collection: Collection, id: &str) -> bool {
        self.slot(collection)
            .entries
            .read()
            .await
            .iter()
            .any(|e| e.id == id)
    }

    /// Member ids in insertion order.
    pub async fn list(&self, collection: Collection) -> Vec<String> {
        self.slot(collection)
            .entries
            .read()
            .await
            .iter()
            .map(|e| e.id.clone())
            .collect()
    }

    /// Member ids as a set, for membership filters.
    pub async fn id_set(&self, collection: Collection) -> HashSet<String> {
        self.slot(collection)
            .entries
            .read()
            .await
            .iter()
            .map(|e| e.id.clone())
            .collect()
    }

    /// Full entries (with metadata) in insertion order.
    pub async fn entries(&self, collection: Collection) -> Vec<CollectionEntry> {
        self.slot(collection).entries.read().await.clone()
    }

    pub async fn entry(&self, collection: Collection, id: &str) -> Option<CollectionEntry> {
        self.slot(collection)
            .entries
            .read()
            .await
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    pub async fn len(&self, collection: Collection) -> usize {
        self.slot(collection).entries.read().await.len()
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Flush when something changed or an earlier flush is still owed.
    ///
    /// Must be called with the slot's write gate held.
    async fn persist_if_needed(&self, slot: &CollectionSlot, changed: bool) -> bool {
        if !changed && !slot.dirty.load(Ordering::SeqCst) {
            return true;
        }
        match self.flush_slot(slot).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    collection = %slot.collection,
                    error = %e,
                    "Collection flush failed; keeping in-memory state"
                );
                false
            }
        }
    }

    async fn flush_slot(&self, slot: &CollectionSlot) -> Result<(), CacheError> {
        let key = slot.collection.storage_key();
        let result = {
            let entries = slot.entries.read().await;
            store_json(self.kv.as_ref(), key, entries.as_slice()).await
        };

        match result {
            Ok(()) => {
                slot.dirty.store(false, Ordering::SeqCst);
                Ok(())
            }
            Err(source) => {
                slot.dirty.store(true, Ordering::SeqCst);
                Err(CacheError::PersistenceWrite {
                    key: key.to_string(),
                    source,
                })
            }
        }
    }
}

fn check_identifier(collection: Collection, id: &str) -> Result<(), CacheError> {
    if id.trim().is_empty() {
        return Err(CacheError::EmptyIdentifier(collection));
    }
    Ok(())
}

/// Validate caller metadata against the collection, filling defaults.
fn resolve_meta(
    collection: Collection,
    meta: Option<MembershipMeta>,
) -> Result<MembershipMeta, CacheError> {
    match (collection, meta) {
        (Collection::Offline, Some(meta @ MembershipMeta::Offline { .. })) => Ok(meta),
        (Collection::Offline, None) => Err(CacheError::SnapshotRequired),
        (Collection::Saved, Some(meta @ MembershipMeta::Saved { .. })) => Ok(meta),
        (Collection::Saved, None) => Ok(MembershipMeta::Saved {
            read_time_minutes: DEFAULT_READ_TIME_MINUTES,
        }),
        (Collection::Read | Collection::FollowedSources, None | Some(MembershipMeta::Plain)) => {
            Ok(MembershipMeta::Plain)
        }
        (collection, Some(other)) => Err(CacheError::MetadataMismatch {
            collection,
            kind: other.kind(),
        }),
    }
}

/// Drop repeated ids from a loaded list, keeping the first.
fn dedup_entries(entries: Vec<CollectionEntry>) -> Vec<CollectionEntry> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|e| seen.insert(e.id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::FlakyKv;
    use crate::storage::{Article, MemoryKv};
    use pretty_assertions::assert_eq;

    async fn empty_index() -> CollectionIndex {
        CollectionIndex::load(Arc::new(MemoryKv::new())).await
    }

    fn snapshot_meta(title: &str) -> MembershipMeta {
        MembershipMeta::offline_for(&Article::new("https://a/1", title), Utc::now())
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let index = empty_index().await;

        let first = index.add(Collection::Read, "https://a/1", None).await.unwrap();
        let second = index.add(Collection::Read, "https://a/1", None).await.unwrap();

        assert!(first.changed);
        assert!(!second.changed);
        assert_eq!(index.list(Collection::Read).await, vec!["https://a/1"]);
    }

    #[tokio::test]
    async fn test_remove_absent_is_noop() {
        let index = empty_index().await;
        let outcome = index.remove(Collection::Saved, "https://a/1").await.unwrap();
        assert!(!outcome.changed);
        assert!(outcome.persisted);
    }

    #[tokio::test]
    async fn test_toggle_twice_restores_state() {
        let index = empty_index().await;

        let on = index
            .toggle(Collection::FollowedSources, "BBC News", None)
            .await
            .unwrap();
        assert!(on.added);
        assert!(index.contains(Collection::FollowedSources, "BBC News").await);

        let off = index
            .toggle(Collection::FollowedSources, "BBC News", None)
            .await
            .unwrap();
        assert!(!off.added);
        assert!(!index.contains(Collection::FollowedSources, "BBC News").await);
    }

    #[tokio::test]
    async fn test_offline_requires_snapshot() {
        let index = empty_index().await;

        let err = index
            .add(Collection::Offline, "https://a/1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::SnapshotRequired));

        let err = index
            .toggle(Collection::Offline, "https://a/1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::SnapshotRequired));
        assert_eq!(index.len(Collection::Offline).await, 0);
    }

    #[tokio::test]
    async fn test_toggle_off_offline_needs_no_snapshot() {
        let index = empty_index().await;
        index
            .add(Collection::Offline, "https://a/1", Some(snapshot_meta("Kept")))
            .await
            .unwrap();

        let outcome = index
            .toggle(Collection::Offline, "https://a/1", None)
            .await
            .unwrap();
        assert!(!outcome.added);
    }

    #[tokio::test]
    async fn test_metadata_mismatch_rejected() {
        let index = empty_index().await;
        let err = index
            .add(Collection::Read, "https://a/1", Some(snapshot_meta("x")))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CacheError::MetadataMismatch {
                collection: Collection::Read,
                kind: "offline"
            }
        ));
    }

    #[tokio::test]
    async fn test_empty_identifier_rejected() {
        let index = empty_index().await;
        let err = index
            .add(Collection::FollowedSources, " ", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CacheError::EmptyIdentifier(Collection::FollowedSources)
        ));
    }

    #[tokio::test]
    async fn test_saved_defaults_read_time() {
        let index = empty_index().await;
        index.add(Collection::Saved, "https://a/1", None).await.unwrap();

        let entry = index.entry(Collection::Saved, "https://a/1").await.unwrap();
        assert_eq!(entry.read_time_minutes(), Some(DEFAULT_READ_TIME_MINUTES));
    }

    #[tokio::test]
    async fn test_list_preserves_insertion_order() {
        let index = empty_index().await;
        for id in ["c", "a", "b"] {
            index.add(Collection::Read, id, None).await.unwrap();
        }
        index.remove(Collection::Read, "a").await.unwrap();
        index.add(Collection::Read, "a", None).await.unwrap();

        assert_eq!(index.list(Collection::Read).await, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_collections_are_independent() {
        let index = empty_index().await;
        index.add(Collection::Saved, "https://a/1", None).await.unwrap();

        assert!(index.contains(Collection::Saved, "https://a/1").await);
        assert!(!index.contains(Collection::Read, "https://a/1").await);
    }

    #[tokio::test]
    async fn test_persists_and_reloads() {
        let kv: Arc<dyn PersistenceAdapter> = Arc::new(MemoryKv::new());
        {
            let index = CollectionIndex::load(kv.clone()).await;
            index.add(Collection::Saved, "https://a/1", None).await.unwrap();
            index
                .add(Collection::Offline, "https://a/1", Some(snapshot_meta("Frozen")))
                .await
                .unwrap();
        }

        let reloaded = CollectionIndex::load(kv).await;
        assert_eq!(reloaded.list(Collection::Saved).await, vec!["https://a/1"]);
        let entry = reloaded
            .entry(Collection::Offline, "https://a/1")
            .await
            .unwrap();
        let (snapshot, _) = entry.offline_snapshot().unwrap();
        assert_eq!(snapshot.title, "Frozen");
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_memory_and_retries_on_next_mutation() {
        let kv = Arc::new(FlakyKv::default());
        let index = CollectionIndex::load(kv.clone()).await;

        kv.set_failing(true);
        let outcome = index.add(Collection::Saved, "https://a/1", None).await.unwrap();
        assert!(outcome.changed);
        assert!(!outcome.persisted);
        assert!(index.contains(Collection::Saved, "https://a/1").await);
        assert!(index.has_pending_writes(Collection::Saved));

        kv.set_failing(false);
        // A no-op add on the same collection still pays the owed flush
        let outcome = index.add(Collection::Saved, "https://a/1", None).await.unwrap();
        assert!(!outcome.changed);
        assert!(outcome.persisted);
        assert!(!index.has_pending_writes(Collection::Saved));

        let reloaded = CollectionIndex::load(kv).await;
        assert!(reloaded.contains(Collection::Saved, "https://a/1").await);
    }

    #[tokio::test]
    async fn test_flush_pending_retries_dirty_collections() {
        let kv = Arc::new(FlakyKv::default());
        let index = CollectionIndex::load(kv.clone()).await;

        kv.set_failing(true);
        index.add(Collection::Read, "https://a/1", None).await.unwrap();
        assert!(index.flush_pending().await.is_err());

        kv.set_failing(false);
        index.flush_pending().await.unwrap();
        assert!(!index.has_pending_writes(Collection::Read));
    }

    #[tokio::test]
    async fn test_unchanged_mutation_does_not_write() {
        let kv = Arc::new(FlakyKv::default());
        let index = CollectionIndex::load(kv.clone()).await;

        index.remove(Collection::Read, "https://a/1").await.unwrap();
        assert_eq!(kv.write_count(), 0);
    }

    #[tokio::test]
    async fn test_load_drops_duplicate_entries() {
        let kv = Arc::new(MemoryKv::new());
        let entry = CollectionEntry {
            id: "https://a/1".to_string(),
            added_at: Utc::now(),
            meta: MembershipMeta::Plain,
        };
        let blob = serde_json::to_string(&vec![entry.clone(), entry]).unwrap();
        kv.set(Collection::Read.storage_key(), &blob).await.unwrap();

        let index = CollectionIndex::load(kv).await;
        assert_eq!(index.len(Collection::Read).await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_toggles_are_serialized() {
        let index = Arc::new(empty_index().await);

        let handles: Vec<_> = (0..40)
            .map(|_| {
                let index = index.clone();
                tokio::spawn(async move {
                    index
                        .toggle(Collection::Saved, "https://a/1", None)
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut added = 0;
        for handle in handles {
            if handle.await.unwrap().added {
                added += 1;
            }
        }

        // Every add is paired with a remove when applied one at a time
        assert_eq!(added, 20);
        assert!(!index.contains(Collection::Saved, "https://a/1").await);
    }
}
