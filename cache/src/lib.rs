//! Hold a value in memory and refresh it in the background.
//!
//! A [Cache] is populated by a [Fetcher] when it is created and refreshed by a single
//! coordination loop, either periodically or on demand ([Cache::fetch]). The loop never runs
//! two refreshes at once: callers that request a refresh while one is in flight wait for that
//! refresh and all receive its result.
//!
//! # Failure Semantics
//!
//! - The initial fetch must succeed, otherwise [Cache::init] returns the error.
//! - A failed periodic refresh is logged and the previous value is retained.
//! - A failed on-demand refresh is returned to every caller waiting on it.
//!
//! # Data Sources
//!
//! [DataSource] selects between a relational store and a file store. The fetch strategy is
//! chosen once, when [DataSource::fetcher] is called with the per-source fetchers in
//! [ConnectorParams].

use futures::future::{BoxFuture, FutureExt};
use std::{future::Future, sync::Arc};
use thiserror::Error;

mod actor;
mod config;
pub use config::Config;
mod connector;
pub use connector::{ConnectorParams, DataSource, DbFetcher, FileFetcher};
mod ingress;
mod metrics;
pub use metrics::Metrics;

pub use actor::Cache;

/// Errors that can occur when interacting with a [Cache].
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("fetch failed: {0}")]
    Fetch(Arc<dyn std::error::Error + Send + Sync + 'static>),
    #[error("no fetcher configured for the {0} data source")]
    MissingFetcher(&'static str),
    #[error("cache closed")]
    Closed,
}

impl Error {
    /// Wrap a data source error.
    pub fn fetch(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Fetch(Arc::new(err))
    }
}

impl From<bastion_persistence::Error> for Error {
    fn from(err: bastion_persistence::Error) -> Self {
        Self::fetch(err)
    }
}

/// Produces a fresh value for a [Cache].
pub type Fetcher<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, Error>> + Send + Sync>;

/// Create a [Fetcher] from an async closure.
pub fn fetcher<T, F, Fut>(f: F) -> Fetcher<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, Error>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_persistence::{memory, BinaryStore, FileReader};
    use futures::future::join_all;
    use prometheus_client::{encoding::text::encode, registry::Registry};
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio_util::sync::CancellationToken;

    const INTERVAL: Duration = Duration::from_secs(60);

    fn config() -> Config {
        Config {
            refresh_interval: INTERVAL,
            mailbox_size: 16,
        }
    }

    /// Returns a fetcher yielding 1, 2, 3, ... and the shared call counter.
    fn counting(delay: Duration) -> (Fetcher<usize>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = {
            let calls = calls.clone();
            fetcher(move || {
                let calls = calls.clone();
                async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Ok(calls.fetch_add(1, Ordering::SeqCst) + 1)
                }
            })
        };
        (fetch, calls)
    }

    /// Returns a fetcher that fails while the flag is set.
    fn flaky(failing: Arc<AtomicBool>) -> (Fetcher<usize>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = {
            let calls = calls.clone();
            fetcher(move || {
                let calls = calls.clone();
                let failing = failing.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if failing.load(Ordering::SeqCst) {
                        return Err(Error::fetch(std::io::Error::other("source down")));
                    }
                    Ok(n)
                }
            })
        };
        (fetch, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_failure_is_returned() {
        let failing = Arc::new(AtomicBool::new(true));
        let (fetch, _) = flaky(failing);
        let result = Cache::init(CancellationToken::new(), fetch, config()).await;
        assert!(matches!(result, Err(Error::Fetch(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dump_returns_initial_value() {
        let (fetch, calls) = counting(Duration::ZERO);
        let cache = Cache::init(CancellationToken::new(), fetch, config())
            .await
            .unwrap();
        assert_eq!(*cache.dump(), 1);
        assert_eq!(*cache.dump(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_refresh() {
        let (fetch, calls) = counting(Duration::ZERO);
        let cache = Cache::init(CancellationToken::new(), fetch, config())
            .await
            .unwrap();

        tokio::time::sleep(INTERVAL + INTERVAL / 2).await;
        assert_eq!(*cache.dump(), 2);
        tokio::time::sleep(INTERVAL).await;
        assert_eq!(*cache.dump(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_failure_keeps_value() {
        let failing = Arc::new(AtomicBool::new(false));
        let (fetch, calls) = flaky(failing.clone());
        let cache = Cache::init(CancellationToken::new(), fetch, config())
            .await
            .unwrap();

        failing.store(true, Ordering::SeqCst);
        tokio::time::sleep(INTERVAL * 3 + INTERVAL / 2).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(*cache.dump(), 1);

        failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(INTERVAL).await;
        assert_eq!(*cache.dump(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_is_returned() {
        let failing = Arc::new(AtomicBool::new(false));
        let (fetch, _) = flaky(failing.clone());
        let cache = Cache::init(CancellationToken::new(), fetch, config())
            .await
            .unwrap();

        failing.store(true, Ordering::SeqCst);
        assert!(matches!(cache.fetch().await, Err(Error::Fetch(_))));
        assert_eq!(*cache.dump(), 1);

        failing.store(false, Ordering::SeqCst);
        assert_eq!(*cache.fetch().await.unwrap(), 3);
        assert_eq!(*cache.dump(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_fetch_single_flight() {
        let (fetch, calls) = counting(Duration::from_secs(5));
        let cache = Cache::init(CancellationToken::new(), fetch, config())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let results = join_all((0..8).map(|_| cache.fetch())).await;
        for result in results {
            assert_eq!(*result.unwrap(), 2);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*cache.dump(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_joins_periodic_refresh() {
        let (fetch, calls) = counting(Duration::from_secs(5));
        let cache = Cache::init(CancellationToken::new(), fetch, config())
            .await
            .unwrap();

        // Land inside the periodic refresh window
        tokio::time::sleep(INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(*cache.fetch().await.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_refresh() {
        let (fetch, calls) = counting(Duration::ZERO);
        let cancel = CancellationToken::new();
        let cache = Cache::init(cancel.clone(), fetch, config()).await.unwrap();
        assert_eq!(*cache.fetch().await.unwrap(), 2);

        cancel.cancel();
        tokio::time::sleep(INTERVAL * 5).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*cache.dump(), 2);
        assert!(matches!(cache.fetch().await, Err(Error::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_source_selects_fetcher() {
        let db = Arc::new(memory::Database::new());
        let files = Arc::new(memory::Files::new());
        files.put("value.txt", "from file");

        let params = || ConnectorParams {
            db_fetcher: Some(Arc::new(|db: Arc<dyn BinaryStore>| {
                async move {
                    Ok::<_, Error>(format!("rows: {}", db.binary_checksums().await?.len()))
                }
                .boxed()
            }) as DbFetcher<String>),
            file_fetcher: Some(Arc::new(|reader: Arc<dyn FileReader>| {
                async move {
                    let raw = reader.read_file("value.txt").await?;
                    Ok::<_, Error>(String::from_utf8_lossy(&raw).into_owned())
                }
                .boxed()
            }) as FileFetcher<String>),
        };

        let cache = Cache::connect(
            CancellationToken::new(),
            DataSource::File(files),
            params(),
            config(),
        )
        .await
        .unwrap();
        assert_eq!(cache.dump().as_str(), "from file");

        let cache = Cache::connect(
            CancellationToken::new(),
            DataSource::Db(db.clone()),
            params(),
            config(),
        )
        .await
        .unwrap();
        assert_eq!(cache.dump().as_str(), "rows: 0");
        assert_eq!(db.queries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_source_missing_fetcher() {
        let params: ConnectorParams<String> = ConnectorParams {
            db_fetcher: None,
            file_fetcher: None,
        };
        let result = Cache::connect(
            CancellationToken::new(),
            DataSource::File(Arc::new(memory::Files::new())),
            params,
            config(),
        )
        .await;
        assert!(matches!(result, Err(Error::MissingFetcher("file"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_registered() {
        let failing = Arc::new(AtomicBool::new(false));
        let (fetch, _) = flaky(failing.clone());
        let cache = Cache::init(CancellationToken::new(), fetch, config())
            .await
            .unwrap();
        let mut registry = Registry::default();
        cache.register(&mut registry, "abh");

        cache.fetch().await.unwrap();
        failing.store(true, Ordering::SeqCst);
        cache.fetch().await.unwrap_err();

        let mut buffer = String::new();
        encode(&mut buffer, &registry).unwrap();
        assert!(buffer.contains("abh_refreshes_total 2"));
        assert!(buffer.contains("abh_refresh_failures_total 1"));
    }
}
