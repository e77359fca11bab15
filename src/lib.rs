//! Client-side article cache and synchronization layer for a news reader.
//!
//! - [`storage`] - article records, named collections and the key-value persistence seam
//! - [`feed`] - feed assembly, related content and the sampling primitive
//! - [`net`] - connectivity gate, NewsAPI client and the new-article watcher
//! - [`session`] - the data flow a UI drives: fetch, fallback, toggle, select

pub mod config;
pub mod feed;
pub mod net;
pub mod session;
pub mod storage;
pub mod util;
