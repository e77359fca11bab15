//! Scripted news source for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::news_api::{FetchError, NewsSource};
use crate::storage::{Article, Category};

/// Replays queued responses in order; an exhausted script yields empty batches.
#[derive(Default)]
pub(crate) struct ScriptedSource {
    headlines: Mutex<VecDeque<Result<Vec<Article>, FetchError>>>,
    search_results: Mutex<VecDeque<Result<Vec<Article>, FetchError>>>,
    headline_calls: AtomicUsize,
    search_calls: AtomicUsize,
}

impl ScriptedSource {
    pub(crate) fn new(headlines: Vec<Result<Vec<Article>, FetchError>>) -> Self {
        Self {
            headlines: Mutex::new(headlines.into()),
            ..Default::default()
        }
    }

    pub(crate) async fn push_search(&self, result: Result<Vec<Article>, FetchError>) {
        self.search_results.lock().await.push_back(result);
    }

    pub(crate) fn headline_calls(&self) -> usize {
        self.headline_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NewsSource for ScriptedSource {
    async fn fetch_headlines(&self, _category: Category) -> Result<Vec<Article>, FetchError> {
        self.headline_calls.fetch_add(1, Ordering::SeqCst);
        self.headlines.lock().await.pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn search(&self, _query: &str) -> Result<Vec<Article>, FetchError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        self.search_results.lock().await.pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}
