use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::sampling::Sampler;
use crate::storage::Article;

pub const TRENDING_COUNT: usize = 4;
pub const RECOMMENDED_COUNT: usize = 3;

/// Title words must be strictly longer than this to count as keywords.
const MIN_KEYWORD_CHARS: usize = 4;

/// Lists shown next to a focal article.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelatedContentBundle {
    pub focal_id: String,
    pub same_source: Vec<Article>,
    pub trending: Vec<Article>,
    pub recommended: Vec<Article>,
    /// How many leading `recommended` entries came from keyword matches
    pub keyword_matches: usize,
}

pub struct RelatedContentResolver {
    sampler: Arc<Sampler>,
}

impl RelatedContentResolver {
    pub fn new(sampler: Arc<Sampler>) -> Self {
        Self { sampler }
    }

    /// Compute the related lists for `focal` from `pool`.
    ///
    /// `same_source` and the keyword-matched prefix of `recommended` follow
    /// pool order. `trending` and the padding of `recommended` are random.
    pub fn resolve(&self, focal: &Article, pool: &[Article]) -> RelatedContentBundle {
        let candidates = distinct_candidates(focal, pool);

        let same_source = match focal.source_name.as_deref() {
            Some(source) => candidates
                .iter()
                .filter(|a| a.is_from(source))
                .map(|a| (*a).clone())
                .collect(),
            None => Vec::new(),
        };

        let trending = self
            .sampler
            .sample(&candidates, TRENDING_COUNT)
            .into_iter()
            .cloned()
            .collect();

        let keywords = title_keywords(&focal.title);
        let matched: Vec<&Article> = candidates
            .iter()
            .copied()
            .filter(|a| matches_keywords(a, &keywords))
            .take(RECOMMENDED_COUNT)
            .collect();
        let keyword_matches = matched.len();

        let mut recommended: Vec<Article> = matched.iter().map(|a| (*a).clone()).collect();
        if keyword_matches < RECOMMENDED_COUNT {
            let chosen: HashSet<&str> = matched.iter().map(|a| a.id.as_str()).collect();
            let rest: Vec<&Article> = candidates
                .iter()
                .copied()
                .filter(|a| !chosen.contains(a.id.as_str()))
                .collect();
            recommended.extend(
                self.sampler
                    .sample(&rest, RECOMMENDED_COUNT - keyword_matches)
                    .into_iter()
                    .cloned(),
            );
        }

        tracing::trace!(
            focal = %focal.id,
            candidates = candidates.len(),
            keyword_matches,
            "Resolved related content"
        );

        RelatedContentBundle {
            focal_id: focal.id.clone(),
            same_source,
            trending,
            recommended,
            keyword_matches,
        }
    }

    /// Resolve for a selection, discarding the result if a newer one began.
    pub async fn resolve_for(
        &self,
        tracker: &SelectionTracker,
        ticket: SelectionTicket,
        focal: &Article,
        pool: &[Article],
    ) -> Option<RelatedContentBundle> {
        // Let a rapid follow-up selection bump the sequence first
        tokio::task::yield_now().await;
        if !tracker.is_current(ticket) {
            tracing::debug!(focal = %focal.id, "Skipping superseded selection");
            return None;
        }

        let bundle = self.resolve(focal, pool);
        tracker.is_current(ticket).then_some(bundle)
    }
}

/// Lowercased title words longer than four characters.
pub fn title_keywords(title: &str) -> Vec<String> {
    title
        .to_lowercase()
        .split(' ')
        .filter(|w| w.chars().count() > MIN_KEYWORD_CHARS)
        .map(str::to_string)
        .collect()
}

fn matches_keywords(article: &Article, keywords: &[String]) -> bool {
    if keywords.is_empty() {
        return false;
    }
    let title = article.title.to_lowercase();
    keywords.iter().any(|k| title.contains(k.as_str()))
}

/// Pool entries other than the focal article, first occurrence per id.
fn distinct_candidates<'a>(focal: &Article, pool: &'a [Article]) -> Vec<&'a Article> {
    let mut seen = HashSet::with_capacity(pool.len());
    pool.iter()
        .filter(|a| a.id != focal.id)
        .filter(|a| seen.insert(a.id.as_str()))
        .collect()
}

// ============================================================================
// Selection Sequencing
// ============================================================================

/// Opaque sequence number for one focal-article selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SelectionTicket(u64);

/// Last-selection-wins sequencing for related-content resolution.
#[derive(Debug, Default)]
pub struct SelectionTracker {
    current: AtomicU64,
}

impl SelectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new selection, superseding every earlier ticket.
    pub fn begin(&self) -> SelectionTicket {
        SelectionTicket(self.current.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn is_current(&self, ticket: SelectionTicket) -> bool {
        self.current.load(Ordering::SeqCst) == ticket.0
    }
}
