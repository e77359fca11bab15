//! Network-facing pieces: the news API client, connectivity tracking and
//! headline polling.

mod connectivity;
mod news_api;
#[cfg(test)]
pub(crate) mod test_support;
mod watcher;

pub use connectivity::{
    last_batch_key, Connectivity, ConnectivityEvent, ConnectivityGate, GateError,
    LAST_BATCH_KEY_PREFIX,
};
pub use news_api::{FetchError, NewsApiClient, NewsApiConfig, NewsSource, DEFAULT_BASE_URL};
pub use watcher::{spawn_poll, NewsWatcher, WatchEvent};
