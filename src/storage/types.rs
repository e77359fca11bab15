use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Failures of the key-value persistence backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Another process has the SQLite file locked
    #[error("Another instance of newsdesk appears to be running. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Storage migration failed: {0}")]
    Migration(String),

    /// Generic SQLite error
    #[error("Storage error: {0}")]
    Backend(#[from] sqlx::Error),

    /// The backend refused or could not complete the operation
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// A value could not be encoded for storage
    #[error("Failed to encode value: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StorageError {
    /// Classify a sqlx error, mapping SQLite lock conditions to `InstanceLocked`.
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return StorageError::InstanceLocked;
        }

        StorageError::Backend(err)
    }
}

/// Errors raised by the article store and the collection index.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Malformed or incomplete article record
    #[error("Invalid article: {0}")]
    InvalidArticle(String),

    /// Offline membership was requested without a content snapshot
    #[error("Adding to the offline collection requires a content snapshot")]
    SnapshotRequired,

    /// Metadata kind does not belong to the target collection
    #[error("Metadata of kind '{kind}' cannot be stored in the {collection} collection")]
    MetadataMismatch {
        collection: Collection,
        kind: &'static str,
    },

    /// Blank article id or source name passed to a collection
    #[error("Empty identifier for the {0} collection")]
    EmptyIdentifier(Collection),

    #[error("Article not found: {0}")]
    NotFound(String),

    /// Flushing to the persistence adapter failed; in-memory state was kept
    #[error("Failed to persist '{key}': {source}")]
    PersistenceWrite {
        key: String,
        #[source]
        source: StorageError,
    },
}

// ============================================================================
// Article
// ============================================================================

/// The canonical content unit, keyed by its URL.
///
/// Every optional field follows merge semantics in [`Article::merge_from`]:
/// a present incoming value overwrites, an absent one never clears.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl Article {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            content: None,
            author: None,
            published_at: None,
            image_url: None,
            source_name: None,
            category: None,
        }
    }

    pub fn with_source(mut self, source_name: impl Into<String>) -> Self {
        self.source_name = Some(source_name.into());
        self
    }

    pub fn with_image(mut self, image_url: impl Into<String>) -> Self {
        self.image_url = Some(image_url.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_published(mut self, published_at: DateTime<Utc>) -> Self {
        self.published_at = Some(published_at);
        self
    }

    /// True if the article carries a non-blank image reference.
    ///
    /// Image-less articles are excluded from any visual feed.
    pub fn has_image(&self) -> bool {
        self.image_url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty())
    }

    /// Source name comparison used by follow-boost and same-source selection.
    pub fn is_from(&self, source_name: &str) -> bool {
        self.source_name.as_deref() == Some(source_name)
    }

    /// Merge a later observation of the same article into this record.
    ///
    /// The `id` never changes. A blank incoming title is treated as absent.
    pub fn merge_from(&mut self, incoming: Article) {
        debug_assert_eq!(self.id, incoming.id);

        if !incoming.title.trim().is_empty() {
            self.title = incoming.title;
        }
        merge_field(&mut self.description, incoming.description);
        merge_field(&mut self.content, incoming.content);
        merge_field(&mut self.author, incoming.author);
        merge_field(&mut self.published_at, incoming.published_at);
        merge_field(&mut self.image_url, incoming.image_url);
        merge_field(&mut self.source_name, incoming.source_name);
        merge_field(&mut self.category, incoming.category);
    }
}

fn merge_field<T>(slot: &mut Option<T>, incoming: Option<T>) {
    if incoming.is_some() {
        *slot = incoming;
    }
}

// ============================================================================
// Categories
// ============================================================================

/// Headline categories understood by the news source.
///
/// `All` means "top headlines without a category filter".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Category {
    #[default]
    All,
    Business,
    Entertainment,
    General,
    Health,
    Science,
    Sports,
    Technology,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::All,
        Category::Business,
        Category::Entertainment,
        Category::General,
        Category::Health,
        Category::Science,
        Category::Sports,
        Category::Technology,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::All => "all",
            Category::Business => "business",
            Category::Entertainment => "entertainment",
            Category::General => "general",
            Category::Health => "health",
            Category::Science => "science",
            Category::Sports => "sports",
            Category::Technology => "technology",
        }
    }

    /// Query value for the headlines endpoint; `None` for [`Category::All`].
    pub fn api_value(self) -> Option<&'static str> {
        match self {
            Category::All => None,
            other => Some(other.as_str()),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == lowered)
            .ok_or_else(|| format!("unknown category '{s}'"))
    }
}

// ============================================================================
// Collections
// ============================================================================

/// Named membership sets layered over the article store.
///
/// `FollowedSources` indexes source names rather than article ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Saved,
    Offline,
    Read,
    FollowedSources,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Saved,
        Collection::Offline,
        Collection::Read,
        Collection::FollowedSources,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Collection::Saved => "saved",
            Collection::Offline => "offline",
            Collection::Read => "read",
            Collection::FollowedSources => "followedSources",
        }
    }

    /// Persistence key holding this collection's entries.
    pub fn storage_key(self) -> &'static str {
        match self {
            Collection::Saved => "collections.saved",
            Collection::Offline => "collections.offline",
            Collection::Read => "collections.read",
            Collection::FollowedSources => "collections.followedSources",
        }
    }

    pub(crate) fn slot(self) -> usize {
        match self {
            Collection::Saved => 0,
            Collection::Offline => 1,
            Collection::Read => 2,
            Collection::FollowedSources => 3,
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Read time used when an article has no content to measure.
pub const DEFAULT_READ_TIME_MINUTES: u32 = 5;

/// Characters of content counted as one minute of reading.
const CHARS_PER_MINUTE: usize = 1000;

/// Implementation-defined reading estimate: one minute per thousand characters.
pub fn estimate_read_time(content: Option<&str>) -> u32 {
    let chars = content.map(|c| c.chars().count()).unwrap_or(0);
    if chars == 0 {
        return DEFAULT_READ_TIME_MINUTES;
    }
    chars.div_ceil(CHARS_PER_MINUTE) as u32
}

/// Per-membership metadata, frozen at the time the membership is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum MembershipMeta {
    Plain,
    Saved {
        read_time_minutes: u32,
    },
    Offline {
        saved_at: DateTime<Utc>,
        snapshot: Article,
    },
}

impl MembershipMeta {
    /// Saved metadata with the read time computed from the article's content now.
    pub fn saved_for(article: &Article) -> Self {
        MembershipMeta::Saved {
            read_time_minutes: estimate_read_time(article.content.as_deref()),
        }
    }

    /// Offline metadata carrying a frozen copy of the article.
    pub fn offline_for(article: &Article, saved_at: DateTime<Utc>) -> Self {
        MembershipMeta::Offline {
            saved_at,
            snapshot: article.clone(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MembershipMeta::Plain => "plain",
            MembershipMeta::Saved { .. } => "saved",
            MembershipMeta::Offline { .. } => "offline",
        }
    }
}

/// One persisted membership record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionEntry {
    pub id: String,
    pub added_at: DateTime<Utc>,
    pub meta: MembershipMeta,
}

impl CollectionEntry {
    pub fn read_time_minutes(&self) -> Option<u32> {
        match &self.meta {
            MembershipMeta::Saved { read_time_minutes } => Some(*read_time_minutes),
            _ => None,
        }
    }

    pub fn offline_snapshot(&self) -> Option<(&Article, DateTime<Utc>)> {
        match &self.meta {
            MembershipMeta::Offline { saved_at, snapshot } => Some((snapshot, *saved_at)),
            _ => None,
        }
    }
}

// ============================================================================
// Operation Outcomes
// ============================================================================

/// Result of merging one article.
///
/// `persisted` is false when the flush failed and the record lives only in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub inserted: bool,
    pub persisted: bool,
}

/// Per-record results of a bulk upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkUpsertReport {
    pub inserted: usize,
    pub updated: usize,
    pub rejected: usize,
    pub persisted: bool,
}

impl Default for BulkUpsertReport {
    fn default() -> Self {
        Self {
            inserted: 0,
            updated: 0,
            rejected: 0,
            persisted: true,
        }
    }
}

/// Result of an idempotent add/remove.
///
/// `persisted` is false when the flush failed and the change lives only in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationOutcome {
    pub changed: bool,
    pub persisted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToggleOutcome {
    pub added: bool,
    pub persisted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_merge_keeps_existing_fields_when_incoming_is_absent() {
        let mut stored = Article::new("https://a.example/1", "Original")
            .with_source("Wire")
            .with_content("body");
        let incoming = Article::new("https://a.example/1", "Refreshed");

        stored.merge_from(incoming);

        assert_eq!(stored.title, "Refreshed");
        assert_eq!(stored.source_name.as_deref(), Some("Wire"));
        assert_eq!(stored.content.as_deref(), Some("body"));
    }

    #[test]
    fn test_merge_ignores_blank_title() {
        let mut stored = Article::new("https://a.example/1", "Original");
        stored.merge_from(Article::new("https://a.example/1", "   ").with_source("Wire"));

        assert_eq!(stored.title, "Original");
        assert_eq!(stored.source_name.as_deref(), Some("Wire"));
    }

    #[test]
    fn test_has_image_rejects_blank() {
        assert!(!Article::new("u", "t").has_image());
        assert!(!Article::new("u", "t").with_image("  ").has_image());
        assert!(Article::new("u", "t").with_image("https://img/1.jpg").has_image());
    }

    #[test]
    fn test_estimate_read_time() {
        assert_eq!(estimate_read_time(None), DEFAULT_READ_TIME_MINUTES);
        assert_eq!(estimate_read_time(Some("")), DEFAULT_READ_TIME_MINUTES);
        assert_eq!(estimate_read_time(Some("x")), 1);
        assert_eq!(estimate_read_time(Some(&"x".repeat(1000))), 1);
        assert_eq!(estimate_read_time(Some(&"x".repeat(1001))), 2);
    }

    #[test]
    fn test_category_parse() {
        assert_eq!("Technology".parse::<Category>(), Ok(Category::Technology));
        assert_eq!(" all ".parse::<Category>(), Ok(Category::All));
        assert!("weather".parse::<Category>().is_err());
        assert_eq!(Category::All.api_value(), None);
        assert_eq!(Category::Sports.api_value(), Some("sports"));
    }

    #[test]
    fn test_article_json_uses_camel_case() {
        let published = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let article = Article::new("https://a.example/1", "Title")
            .with_image("https://img.example/1.jpg")
            .with_source("Wire")
            .with_published(published);

        let json = serde_json::to_string(&article).unwrap();
        assert!(json.contains("\"imageUrl\""));
        assert!(json.contains("\"sourceName\""));
        assert!(json.contains("\"publishedAt\""));
        assert!(!json.contains("\"content\""));
    }

    #[test]
    fn test_membership_meta_json_shape() {
        let entry = CollectionEntry {
            id: "https://a.example/1".to_string(),
            added_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            meta: MembershipMeta::Saved {
                read_time_minutes: 3,
            },
        };

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"kind\":\"saved\""));
        assert!(json.contains("\"readTimeMinutes\":3"));

        let back: CollectionEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.read_time_minutes(), Some(3));
    }
}
