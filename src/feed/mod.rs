//! Feed assembly and related-content selection.
//!
//! Both stages are pure functions of their inputs plus the shared
//! [`Sampler`], which supplies the randomness for the "popular" ordering
//! and the trending list.
//!
//! - [`assembler`] - dedup, follow-boost and filter a raw batch into a [`Feed`]
//! - [`related`] - same-source, trending and recommended lists for a focal article
//! - [`sampling`] - uniform sampling without replacement

pub mod assembler;
pub mod related;
pub mod sampling;

pub use assembler::{dedup_visual, follow_boost, Feed, FeedAssembler, FeedContext, FeedFilter};
pub use related::{
    title_keywords, RelatedContentBundle, RelatedContentResolver, SelectionTicket,
    SelectionTracker, RECOMMENDED_COUNT, TRENDING_COUNT,
};
pub use sampling::Sampler;
