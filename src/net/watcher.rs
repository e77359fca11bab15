use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::news_api::NewsSource;
use crate::storage::{Article, Category};

/// Detects a new head article across successive headline batches.
#[derive(Debug, Default, Clone)]
pub struct NewsWatcher {
    last_seen_id: Option<String>,
}

impl NewsWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a previously observed head id.
    pub fn with_last_seen(id: impl Into<String>) -> Self {
        Self {
            last_seen_id: Some(id.into()),
        }
    }

    pub fn last_seen_id(&self) -> Option<&str> {
        self.last_seen_id.as_deref()
    }

    /// Record the head of `batch` and return it if it is new.
    ///
    /// The first observation only establishes a baseline. An empty batch
    /// changes nothing.
    pub fn observe(&mut self, batch: &[Article]) -> Option<Article> {
        let head = batch.first()?;
        let previous = self.last_seen_id.replace(head.id.clone());
        match previous {
            Some(prev) if prev != head.id => Some(head.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    NewArticle(Article),
    FetchFailed(String),
}

/// Poll `category` headlines every `interval`, reporting on `tx`.
///
/// The first poll runs immediately. The task ends when the receiver is
/// dropped and returns the watcher so the caller can resume from it.
pub fn spawn_poll(
    source: Arc<dyn NewsSource>,
    category: Category,
    interval: Duration,
    mut watcher: NewsWatcher,
    tx: mpsc::Sender<WatchEvent>,
) -> JoinHandle<NewsWatcher> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tx.closed() => break,
            }

            let event = match source.fetch_headlines(category).await {
                Ok(batch) => watcher.observe(&batch).map(WatchEvent::NewArticle),
                Err(e) => {
                    tracing::warn!(category = %category, error = %e, "Headline poll failed");
                    Some(WatchEvent::FetchFailed(e.to_string()))
                }
            };

            if let Some(event) = event {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        }

        tracing::debug!(category = %category, "Headline polling stopped");
        watcher
    })
}
