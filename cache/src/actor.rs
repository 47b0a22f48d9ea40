use crate::{
    ingress::{Mailbox, Message},
    Config, ConnectorParams, DataSource, Error, Fetcher, Metrics,
};
use futures::{channel::mpsc, future::BoxFuture, StreamExt};
use prometheus_client::registry::Registry;
use std::{
    future::pending,
    sync::{Arc, RwLock},
    time::{Duration, SystemTime},
};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The current value of a [Cache].
struct Entry<T> {
    payload: Arc<T>,
    produced_at: SystemTime,
}

impl<T> Entry<T> {
    fn new(payload: Arc<T>) -> Self {
        Self {
            payload,
            produced_at: SystemTime::now(),
        }
    }
}

type Slot<T> = Arc<RwLock<Entry<T>>>;

/// A value held in memory and refreshed in the background.
///
/// Cloning a [Cache] is cheap and all clones share the same value and coordination loop. The
/// loop stops when the governing [CancellationToken] is cancelled or all clones are dropped.
pub struct Cache<T> {
    slot: Slot<T>,
    mailbox: Mailbox<T>,
    metrics: Metrics,
}

impl<T> Clone for Cache<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            mailbox: self.mailbox.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Cache<T> {
    /// Perform the initial fetch and start the coordination loop.
    ///
    /// Returns the error of the initial fetch, if any. No loop is started in that case.
    pub async fn init(
        context: CancellationToken,
        fetcher: Fetcher<T>,
        cfg: Config,
    ) -> Result<Self, Error> {
        let metrics = Metrics::default();
        let payload = fetcher().await?;
        metrics.refreshes.inc();
        let slot = Arc::new(RwLock::new(Entry::new(Arc::new(payload))));

        let (sender, receiver) = mpsc::channel(cfg.mailbox_size);
        let actor = Actor {
            context,
            fetcher,
            slot: slot.clone(),
            receiver,
            refresh_interval: cfg.refresh_interval,
            metrics: metrics.clone(),
        };
        tokio::spawn(actor.run());

        Ok(Self {
            slot,
            mailbox: Mailbox::new(sender),
            metrics,
        })
    }

    /// Bind the fetch strategy for `source` and [Cache::init] with it.
    pub async fn connect(
        context: CancellationToken,
        source: DataSource,
        params: ConnectorParams<T>,
        cfg: Config,
    ) -> Result<Self, Error> {
        debug!(?source, "connecting cache");
        Self::init(context, source.fetcher(params)?, cfg).await
    }
}

impl<T> Cache<T> {
    /// Return the current value without waiting.
    ///
    /// The value is shared with all other readers and must be treated as immutable.
    pub fn dump(&self) -> Arc<T> {
        self.slot.read().unwrap().payload.clone()
    }

    /// Return when the current value was produced.
    pub fn produced_at(&self) -> SystemTime {
        self.slot.read().unwrap().produced_at
    }

    /// Force a refresh and return the refreshed value.
    ///
    /// If a refresh is already in flight, wait for it instead of starting another.
    pub async fn fetch(&self) -> Result<Arc<T>, Error> {
        self.mailbox.clone().fetch().await
    }

    /// Register the metrics of this cache under `prefix`.
    pub fn register(&self, registry: &mut Registry, prefix: &str) {
        self.metrics
            .register(registry.sub_registry_with_prefix(prefix));
    }
}

/// The coordination loop of a [Cache]. Sole writer of the slot.
struct Actor<T> {
    context: CancellationToken,
    fetcher: Fetcher<T>,
    slot: Slot<T>,
    receiver: mpsc::Receiver<Message<T>>,
    refresh_interval: Duration,
    metrics: Metrics,
}

type Waiter<T> = futures::channel::oneshot::Sender<Result<Arc<T>, Error>>;

impl<T: Send + Sync + 'static> Actor<T> {
    async fn run(mut self) {
        let mut ticker = interval_at(
            Instant::now() + self.refresh_interval,
            self.refresh_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut inflight: Option<BoxFuture<'static, Result<T, Error>>> = None;
        let mut waiters: Vec<Waiter<T>> = Vec::new();
        loop {
            self.metrics.waiters.set(waiters.len() as i64);
            tokio::select! {
                biased;

                _ = self.context.cancelled() => {
                    debug!("context cancelled, stopping cache");
                    break;
                },

                result = async {
                    match inflight.as_mut() {
                        Some(refresh) => refresh.await,
                        None => pending().await,
                    }
                } => {
                    inflight = None;
                    self.complete(result, &mut waiters);
                },

                _ = ticker.tick(), if inflight.is_none() => {
                    debug!("periodic refresh");
                    inflight = Some((self.fetcher)());
                },

                message = self.receiver.next() => {
                    let Some(Message::Fetch { responder }) = message else {
                        debug!("all handles dropped, stopping cache");
                        break;
                    };
                    waiters.push(responder);
                    if inflight.is_none() {
                        debug!("on-demand refresh");
                        inflight = Some((self.fetcher)());
                    }
                },
            }
        }
    }

    fn complete(&mut self, result: Result<T, Error>, waiters: &mut Vec<Waiter<T>>) {
        match result {
            Ok(payload) => {
                let payload = Arc::new(payload);
                *self.slot.write().unwrap() = Entry::new(payload.clone());
                self.metrics.refreshes.inc();
                for waiter in waiters.drain(..) {
                    let _ = waiter.send(Ok(payload.clone()));
                }
            }
            Err(err) => {
                self.metrics.refresh_failures.inc();
                if waiters.is_empty() {
                    warn!(?err, "periodic refresh failed, keeping previous value");
                    return;
                }
                debug!(?err, waiters = waiters.len(), "on-demand refresh failed");
                for waiter in waiters.drain(..) {
                    let _ = waiter.send(Err(err.clone()));
                }
            }
        }
    }
}
