//! Data flow for a consuming UI: fetch or fall back, assemble, mutate
//! collections and resolve related content.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::feed::{
    Feed, FeedAssembler, FeedContext, FeedFilter, RelatedContentBundle, RelatedContentResolver,
    Sampler, SelectionTracker,
};
use crate::net::{Connectivity, ConnectivityGate, FetchError, GateError, NewsSource};
use crate::storage::{
    Article, ArticleStore, CacheError, Category, Collection, CollectionIndex, MembershipMeta,
    MutationOutcome, PersistenceAdapter, ToggleOutcome,
};

#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Offline(#[from] GateError),

    #[error("Search failed: {0}")]
    Network(#[from] FetchError),
}

/// Where the raw batch behind a feed came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOrigin {
    Network,
    /// Last batch fetched for the category, possibly empty
    OfflineCache,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedView {
    pub category: Category,
    pub feed: Feed,
    pub origin: FeedOrigin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedArticle {
    pub article: Article,
    pub read_time_minutes: Option<u32>,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineArticle {
    /// Copy frozen when the article was made available offline
    pub snapshot: Article,
    pub saved_at: DateTime<Utc>,
}

pub struct NewsSession {
    source: Arc<dyn NewsSource>,
    articles: Arc<ArticleStore>,
    collections: Arc<CollectionIndex>,
    gate: Arc<ConnectivityGate>,
    assembler: FeedAssembler,
    resolver: RelatedContentResolver,
    selections: SelectionTracker,
}

impl NewsSession {
    /// Load persisted state from `kv` and wire up the components.
    pub async fn load(
        source: Arc<dyn NewsSource>,
        kv: Arc<dyn PersistenceAdapter>,
        connectivity: Connectivity,
        sampler: Arc<Sampler>,
        raw_batch_slots: usize,
    ) -> Self {
        let articles = Arc::new(ArticleStore::load(Arc::clone(&kv)).await);
        let collections = Arc::new(CollectionIndex::load(Arc::clone(&kv)).await);
        let gate = Arc::new(ConnectivityGate::new(connectivity, kv, raw_batch_slots));

        Self {
            source,
            articles,
            collections,
            gate,
            assembler: FeedAssembler::new(Arc::clone(&sampler)),
            resolver: RelatedContentResolver::new(sampler),
            selections: SelectionTracker::new(),
        }
    }

    pub fn articles(&self) -> &Arc<ArticleStore> {
        &self.articles
    }

    pub fn collections(&self) -> &Arc<CollectionIndex> {
        &self.collections
    }

    pub fn gate(&self) -> &Arc<ConnectivityGate> {
        &self.gate
    }

    async fn feed_context(&self) -> FeedContext {
        FeedContext {
            followed_sources: self.collections.id_set(Collection::FollowedSources).await,
            saved_ids: self.collections.id_set(Collection::Saved).await,
        }
    }

    // ========================================================================
    // Feeds
    // ========================================================================

    /// Fetch and assemble the feed for `category`.
    ///
    /// While offline, or when the fetch fails, the feed is built from the
    /// last batch recorded for the category. A failed fetch also moves the
    /// gate offline.
    pub async fn load_feed(&self, category: Category, filters: &[FeedFilter]) -> FeedView {
        if self.gate.is_online() {
            match self.source.fetch_headlines(category).await {
                Ok(raw) => {
                    if let Err(e) = self.gate.record_batch(category, raw.clone()).await {
                        tracing::warn!(category = %category, error = %e, "Raw batch kept in memory only");
                    }
                    self.articles.bulk_upsert(raw.iter().cloned()).await;

                    let ctx = self.feed_context().await;
                    return FeedView {
                        category,
                        feed: self.assembler.build_feed(&raw, &ctx, filters),
                        origin: FeedOrigin::Network,
                    };
                }
                Err(e) => {
                    tracing::warn!(category = %category, error = %e, "Headline fetch failed, using cached batch");
                    self.gate.record_fetch_failure();
                }
            }
        }

        FeedView {
            category,
            feed: self.apply_filters(category, filters).await,
            origin: FeedOrigin::OfflineCache,
        }
    }

    /// Rebuild the feed for `category` from its last batch without any I/O.
    pub async fn apply_filters(&self, category: Category, filters: &[FeedFilter]) -> Feed {
        let raw = self.gate.last_batch(category).await;
        let ctx = self.feed_context().await;
        self.assembler.build_feed(&raw, &ctx, filters)
    }

    /// Search the news source. Only available online.
    pub async fn search(&self, query: &str) -> Result<Feed, SearchError> {
        self.gate.require_online("search")?;

        let raw = match self.source.search(query).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "Search failed");
                self.gate.record_fetch_failure();
                return Err(SearchError::Network(e));
            }
        };

        self.articles.bulk_upsert(raw.iter().cloned()).await;
        let ctx = self.feed_context().await;
        Ok(self.assembler.build_feed(&raw, &ctx, &[]))
    }

    // ========================================================================
    // Collections
    // ========================================================================

    /// Save or unsave `article`, freezing its read time when saving.
    ///
    /// The article record is only written when saving.
    pub async fn toggle_saved(&self, article: &Article) -> Result<ToggleOutcome, CacheError> {
        self.store_if_adding(Collection::Saved, article).await?;
        self.collections
            .toggle(
                Collection::Saved,
                &article.id,
                Some(MembershipMeta::saved_for(article)),
            )
            .await
    }

    /// Make `article` available offline with a snapshot taken now, or drop it.
    pub async fn toggle_offline(&self, article: &Article) -> Result<ToggleOutcome, CacheError> {
        self.store_if_adding(Collection::Offline, article).await?;
        self.collections
            .toggle(
                Collection::Offline,
                &article.id,
                Some(MembershipMeta::offline_for(article, Utc::now())),
            )
            .await
    }

    async fn store_if_adding(
        &self,
        collection: Collection,
        article: &Article,
    ) -> Result<(), CacheError> {
        if !self.collections.contains(collection, &article.id).await {
            self.articles.upsert(article.clone()).await?;
        }
        Ok(())
    }

    pub async fn toggle_follow(&self, source_name: &str) -> Result<ToggleOutcome, CacheError> {
        self.collections
            .toggle(Collection::FollowedSources, source_name.trim(), None)
            .await
    }

    pub async fn mark_read(&self, article: &Article) -> Result<MutationOutcome, CacheError> {
        self.articles.upsert(article.clone()).await?;
        self.collections.add(Collection::Read, &article.id, None).await
    }

    /// Saved articles in the order they were saved, with current field data.
    pub async fn saved_articles(&self) -> Vec<SavedArticle> {
        let mut saved = Vec::new();
        for entry in self.collections.entries(Collection::Saved).await {
            match self.articles.get(&entry.id).await {
                Ok(article) => saved.push(SavedArticle {
                    read_time_minutes: entry.read_time_minutes(),
                    saved_at: entry.added_at,
                    article,
                }),
                Err(e) => tracing::debug!(id = %entry.id, error = %e, "Skipping saved entry"),
            }
        }
        saved
    }

    /// Offline articles from their snapshots; later store updates do not show.
    pub async fn offline_articles(&self) -> Vec<OfflineArticle> {
        self.collections
            .entries(Collection::Offline)
            .await
            .iter()
            .filter_map(|entry| entry.offline_snapshot())
            .map(|(snapshot, saved_at)| OfflineArticle {
                snapshot: snapshot.clone(),
                saved_at,
            })
            .collect()
    }

    // ========================================================================
    // Related Content
    // ========================================================================

    /// Resolve related content for a newly selected article.
    ///
    /// Returns `None` if another selection started before this one finished.
    pub async fn select(&self, focal: &Article, pool: &[Article]) -> Option<RelatedContentBundle> {
        let ticket = self.selections.begin();
        self.resolver
            .resolve_for(&self.selections, ticket, focal, pool)
            .await
    }

    /// Retry every write that has not reached storage yet.
    ///
    /// Both stores are attempted; the first error is returned.
    pub async fn flush_pending(&self) -> Result<(), CacheError> {
        let articles = self.articles.flush_pending().await;
        let collections = self.collections.flush_pending().await;
        articles.and(collections)
    }
}
