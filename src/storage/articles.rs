use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use super::kv::{load_json, store_json, PersistenceAdapter};
use super::types::{Article, BulkUpsertReport, CacheError, UpsertOutcome};
use crate::util::strip_control_chars;

/// Persistence key for the article map.
pub const ARTICLES_KEY: &str = "articles.store";

/// Normalized, deduplicated article records keyed by canonical URL.
///
/// The store is the single owner of article field data. Records are merged on
/// every observation and never deleted; collections only reference ids.
///
/// Writes update memory first and then flush the whole map. A failed flush is
/// logged, reported through `persisted: false` and leaves the store dirty; the
/// next mutation (or [`flush_pending`]) writes the current state again.
///
/// [`flush_pending`]: ArticleStore::flush_pending
pub struct ArticleStore {
    articles: RwLock<BTreeMap<String, Article>>,
    kv: Arc<dyn PersistenceAdapter>,
    // Held across encode + write so a later flush never persists older state
    flush_lock: Mutex<()>,
    dirty: AtomicBool,
}

impl ArticleStore {
    /// Load the persisted map, starting empty if it is missing or unreadable.
    pub async fn load(kv: Arc<dyn PersistenceAdapter>) -> Self {
        let articles: BTreeMap<String, Article> =
            load_json(kv.as_ref(), ARTICLES_KEY).await.unwrap_or_default();
        tracing::debug!(count = articles.len(), "Loaded article store");

        Self {
            articles: RwLock::new(articles),
            kv,
            flush_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Merge one article into the store.
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidArticle`] if the id is blank, or if the article is
    /// new and has a blank title. The store is left untouched.
    pub async fn upsert(&self, article: Article) -> Result<UpsertOutcome, CacheError> {
        let inserted = {
            let mut articles = self.articles.write().await;
            merge_into(&mut articles, article)?
        };
        let persisted = self.flush_logged().await;
        Ok(UpsertOutcome {
            inserted,
            persisted,
        })
    }

    /// Merge a batch of articles with a single flush.
    ///
    /// Each record is applied on its own: a rejected record is counted and
    /// logged, and the rest of the batch still lands.
    pub async fn bulk_upsert<I>(&self, batch: I) -> BulkUpsertReport
    where
        I: IntoIterator<Item = Article>,
    {
        let mut report = BulkUpsertReport::default();
        {
            let mut articles = self.articles.write().await;
            for article in batch {
                match merge_into(&mut articles, article) {
                    Ok(true) => report.inserted += 1,
                    Ok(false) => report.updated += 1,
                    Err(_) => report.rejected += 1,
                }
            }
        }

        if report.inserted + report.updated > 0 {
            report.persisted = self.flush_logged().await;
        }
        tracing::debug!(
            inserted = report.inserted,
            updated = report.updated,
            rejected = report.rejected,
            "Bulk upsert complete"
        );
        report
    }

    pub async fn get(&self, id: &str) -> Result<Article, CacheError> {
        self.articles
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CacheError::NotFound(id.to_string()))
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.articles.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.articles.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.articles.read().await.is_empty()
    }

    /// True if the last flush failed and memory is ahead of storage.
    pub fn has_pending_writes(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Write the current map to the persistence adapter.
    pub async fn flush(&self) -> Result<(), CacheError> {
        let _guard = self.flush_lock.lock().await;
        self.dirty.store(false, Ordering::SeqCst);

        let result = {
            let articles = self.articles.read().await;
            store_json(self.kv.as_ref(), ARTICLES_KEY, &*articles).await
        };

        result.map_err(|source| {
            self.dirty.store(true, Ordering::SeqCst);
            CacheError::PersistenceWrite {
                key: ARTICLES_KEY.to_string(),
                source,
            }
        })
    }

    /// Flush only if an earlier write failed.
    pub async fn flush_pending(&self) -> Result<(), CacheError> {
        if !self.has_pending_writes() {
            return Ok(());
        }
        self.flush().await
    }

    async fn flush_logged(&self) -> bool {
        match self.flush().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Article store flush failed; keeping in-memory state");
                false
            }
        }
    }
}

/// Returns true if the article was inserted rather than merged.
fn merge_into(
    articles: &mut BTreeMap<String, Article>,
    article: Article,
) -> Result<bool, CacheError> {
    if article.id.trim().is_empty() {
        tracing::warn!(title = %article.title, "Rejecting article with empty id");
        return Err(CacheError::InvalidArticle("article id is empty".to_string()));
    }

    let article = sanitize(article);
    match articles.get_mut(&article.id) {
        Some(existing) => {
            existing.merge_from(article);
            Ok(false)
        }
        None => {
            if article.title.trim().is_empty() {
                tracing::warn!(id = %article.id, "Rejecting new article without a title");
                return Err(CacheError::InvalidArticle(format!(
                    "article '{}' has no title",
                    article.id
                )));
            }
            articles.insert(article.id.clone(), article);
            Ok(true)
        }
    }
}

/// Strip terminal control sequences from display fields.
fn sanitize(mut article: Article) -> Article {
    fn clean(value: &mut String) {
        let cleaned = match strip_control_chars(value) {
            Cow::Borrowed(_) => return,
            Cow::Owned(s) => s,
        };
        *value = cleaned;
    }

    clean(&mut article.title);
    for field in [
        &mut article.description,
        &mut article.author,
        &mut article.source_name,
    ]
    .into_iter()
    .flatten()
    {
        clean(field);
    }
    article
}
