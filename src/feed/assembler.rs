use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::sampling::Sampler;
use crate::storage::Article;

/// User-selectable feed filters.
///
/// Active filters combine: `Latest` and `Popular` reorder, `Followed` and
/// `Saved` restrict. They are applied in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedFilter {
    /// Newest `published_at` first, undated articles last
    Latest,
    /// Random order; there is no popularity signal to sort by
    Popular,
    Followed,
    Saved,
}

impl FeedFilter {
    pub const ALL: [FeedFilter; 4] = [
        FeedFilter::Latest,
        FeedFilter::Popular,
        FeedFilter::Followed,
        FeedFilter::Saved,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FeedFilter::Latest => "latest",
            FeedFilter::Popular => "popular",
            FeedFilter::Followed => "followed",
            FeedFilter::Saved => "saved",
        }
    }
}

impl fmt::Display for FeedFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        FeedFilter::ALL
            .into_iter()
            .find(|f| f.as_str() == lowered)
            .ok_or_else(|| format!("unknown filter '{s}'"))
    }
}

/// Snapshot of collection state the feed is assembled against.
#[derive(Debug, Clone, Default)]
pub struct FeedContext {
    pub followed_sources: HashSet<String>,
    pub saved_ids: HashSet<String>,
}

impl FeedContext {
    fn is_followed(&self, article: &Article) -> bool {
        article
            .source_name
            .as_deref()
            .is_some_and(|s| self.followed_sources.contains(s))
    }
}

/// Ordered, deduplicated articles for one (category, filter set) query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Feed {
    articles: Vec<Article>,
}

impl Feed {
    pub fn articles(&self) -> &[Article] {
        &self.articles
    }

    pub fn into_articles(self) -> Vec<Article> {
        self.articles
    }

    pub fn ids(&self) -> Vec<&str> {
        self.articles.iter().map(|a| a.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.articles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.articles.is_empty()
    }
}

/// Turns a raw batch into a feed: dedup, follow-boost, then filters.
pub struct FeedAssembler {
    sampler: Arc<Sampler>,
}

impl FeedAssembler {
    pub fn new(sampler: Arc<Sampler>) -> Self {
        Self { sampler }
    }

    /// Build a feed from `raw`. Never fails; empty input gives an empty feed.
    pub fn build_feed(&self, raw: &[Article], ctx: &FeedContext, filters: &[FeedFilter]) -> Feed {
        let mut articles = follow_boost(dedup_visual(raw), ctx);

        if filters.contains(&FeedFilter::Latest) {
            articles.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        }
        if filters.contains(&FeedFilter::Popular) {
            self.sampler.shuffle(&mut articles);
        }
        if filters.contains(&FeedFilter::Followed) {
            articles.retain(|a| ctx.is_followed(a));
        }
        if filters.contains(&FeedFilter::Saved) {
            articles.retain(|a| ctx.saved_ids.contains(&a.id));
        }

        tracing::trace!(
            raw = raw.len(),
            kept = articles.len(),
            filters = filters.len(),
            "Assembled feed"
        );
        Feed { articles }
    }
}

/// Keep the first occurrence of each id among articles that carry an image.
pub fn dedup_visual(raw: &[Article]) -> Vec<Article> {
    let mut seen = HashSet::with_capacity(raw.len());
    raw.iter()
        .filter(|a| a.has_image())
        .filter(|a| seen.insert(a.id.as_str()))
        .cloned()
        .collect()
}

/// Stable two-bucket partition: followed sources first.
///
/// Relative order inside each bucket is unchanged; this is not a sort.
pub fn follow_boost(articles: Vec<Article>, ctx: &FeedContext) -> Vec<Article> {
    let (mut followed, rest): (Vec<_>, Vec<_>) =
        articles.into_iter().partition(|a| ctx.is_followed(a));
    followed.extend(rest);
    followed
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn article(id: &str, source: &str) -> Article {
        Article::new(id, format!("Title {id}"))
            .with_source(source)
            .with_image(format!("https://img.example/{id}.jpg"))
    }

    fn assembler() -> FeedAssembler {
        FeedAssembler::new(Arc::new(Sampler::seeded(11)))
    }

    fn followed(sources: &[&str]) -> FeedContext {
        FeedContext {
            followed_sources: sources.iter().map(|s| s.to_string()).collect(),
            saved_ids: HashSet::new(),
        }
    }

    #[test]
    fn test_empty_input_gives_empty_feed() {
        let feed = assembler().build_feed(&[], &FeedContext::default(), &[]);
        assert!(feed.is_empty());
    }

    #[test]
    fn test_duplicate_ids_keep_first() {
        let raw = vec![
            Article::new("u1", "First").with_image("https://img/1"),
            Article::new("u1", "Second").with_image("https://img/1"),
        ];
        let feed = assembler().build_feed(&raw, &FeedContext::default(), &[]);

        assert_eq!(feed.len(), 1);
        assert_eq!(feed.articles()[0].title, "First");
    }

    #[test]
    fn test_imageless_articles_dropped() {
        let raw = vec![
            Article::new("u1", "No image"),
            Article::new("u2", "Blank image").with_image(" "),
            article("u3", "A"),
        ];
        let feed = assembler().build_feed(&raw, &FeedContext::default(), &[]);
        assert_eq!(feed.ids(), vec!["u3"]);
    }

    #[test]
    fn test_imageless_duplicate_does_not_shadow_later_copy() {
        let raw = vec![Article::new("u1", "No image"), article("u1", "A")];
        let feed = assembler().build_feed(&raw, &FeedContext::default(), &[]);
        assert_eq!(feed.ids(), vec!["u1"]);
    }

    #[test]
    fn test_follow_boost_is_stable_partition() {
        let raw = vec![
            article("1", "X"),
            article("2", "F"),
            article("3", "Y"),
            article("4", "F"),
            article("5", "X"),
        ];
        let feed = assembler().build_feed(&raw, &followed(&["F"]), &[]);
        assert_eq!(feed.ids(), vec!["2", "4", "1", "3", "5"]);
    }

    #[test]
    fn test_latest_sorts_descending_with_undated_last() {
        let day = |d| Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap();
        let raw = vec![
            article("old", "A").with_published(day(1)),
            article("undated", "A"),
            article("new", "A").with_published(day(3)),
            article("mid", "A").with_published(day(2)),
        ];
        let feed = assembler().build_feed(&raw, &FeedContext::default(), &[FeedFilter::Latest]);
        assert_eq!(feed.ids(), vec!["new", "mid", "old", "undated"]);
    }

    #[test]
    fn test_followed_filter_restricts() {
        let raw = vec![article("1", "X"), article("2", "F"), article("3", "G")];
        let feed = assembler().build_feed(&raw, &followed(&["F", "G"]), &[FeedFilter::Followed]);
        assert_eq!(feed.ids(), vec!["2", "3"]);
    }

    #[test]
    fn test_saved_and_followed_combine_with_and() {
        let raw = vec![article("1", "F"), article("2", "F"), article("3", "X")];
        let mut ctx = followed(&["F"]);
        ctx.saved_ids = ["2", "3"].iter().map(|s| s.to_string()).collect();

        let feed = assembler().build_feed(&raw, &ctx, &[FeedFilter::Saved, FeedFilter::Followed]);
        assert_eq!(feed.ids(), vec!["2"]);
    }

    #[test]
    fn test_popular_is_permutation() {
        let raw: Vec<_> = (0..12).map(|i| article(&i.to_string(), "A")).collect();
        let feed = assembler().build_feed(&raw, &FeedContext::default(), &[FeedFilter::Popular]);

        let mut ids = feed.ids();
        ids.sort();
        let mut expected: Vec<String> = (0..12).map(|i| i.to_string()).collect();
        expected.sort();
        assert_eq!(ids, expected.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[test]
    fn test_filter_parse() {
        assert_eq!("Latest".parse::<FeedFilter>(), Ok(FeedFilter::Latest));
        assert!("trending".parse::<FeedFilter>().is_err());
    }

    fn arb_raw() -> impl Strategy<Value = Vec<(u8, u8, bool)>> {
        // (id, source, has_image)
        prop::collection::vec((0u8..12, 0u8..4, any::<bool>()), 0..40)
    }

    fn to_articles(raw: &[(u8, u8, bool)]) -> Vec<Article> {
        raw.iter()
            .map(|(id, source, image)| {
                let a = Article::new(format!("u{id}"), "t").with_source(format!("s{source}"));
                if *image {
                    a.with_image("https://img")
                } else {
                    a
                }
            })
            .collect()
    }

    proptest! {
        #[test]
        fn prop_feed_has_no_duplicate_ids(raw in arb_raw(), filter_mask in 0u8..16) {
            let filters: Vec<_> = FeedFilter::ALL
                .into_iter()
                .enumerate()
                .filter(|(i, _)| filter_mask & (1 << i) != 0)
                .map(|(_, f)| f)
                .collect();
            let feed = assembler().build_feed(&to_articles(&raw), &followed(&["s1"]), &filters);

            let ids: HashSet<_> = feed.ids().into_iter().collect();
            prop_assert_eq!(ids.len(), feed.len());
        }

        #[test]
        fn prop_followed_precede_others_in_input_order(raw in arb_raw()) {
            let articles = to_articles(&raw);
            let ctx = followed(&["s0", "s2"]);
            let feed = assembler().build_feed(&articles, &ctx, &[]);

            let flags: Vec<bool> = feed.articles().iter().map(|a| ctx.is_followed(a)).collect();
            // No followed article after an unfollowed one
            prop_assert!(flags.windows(2).all(|w| w[0] || !w[1]));

            // Each bucket keeps first-seen order from the deduplicated input
            let deduped = dedup_visual(&articles);
            for bucket in [true, false] {
                let expected: Vec<_> = deduped
                    .iter()
                    .filter(|a| ctx.is_followed(a) == bucket)
                    .map(|a| a.id.clone())
                    .collect();
                let actual: Vec<_> = feed
                    .articles()
                    .iter()
                    .filter(|a| ctx.is_followed(a) == bucket)
                    .map(|a| a.id.clone())
                    .collect();
                prop_assert_eq!(expected, actual);
            }
        }
    }
}
