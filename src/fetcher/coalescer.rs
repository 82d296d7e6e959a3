//! Single-flight fetch execution with per-fingerprint result caching.

use super::traits::DataFetcher;
use super::types::{AsyncFetchData, AsyncFetchReq, FetchFn, FetcherStats};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Delivery channel capacity used when the caller supplies `<= 1`.
pub const FALLBACK_CHANNEL_CAPACITY: usize = 16;

/// Cache entry for one fingerprint.
enum FetchEntry {
    /// The fetch is running; subscribers hold receivers on this channel.
    InFlight(broadcast::Sender<AsyncFetchData>),
    /// The fetch finished; late subscribers are served from this value.
    Settled(AsyncFetchData),
}

/// Request-scoped fetcher that deduplicates by fingerprint.
///
/// Each unique fingerprint executes its closure at most once for the
/// lifetime of the fetcher; every caller that registered before settlement
/// receives exactly one copy of the settled result, and later callers are
/// served from the cache without blocking. Create one instance per
/// composition - the cache is never invalidated.
pub struct CoalescingFetcher {
    /// Fingerprint cache. `Arc` so background executors can settle entries
    /// after the caller's borrow of the fetcher has ended.
    entries: Arc<DashMap<String, FetchEntry>>,
    /// Capacity for each fingerprint's delivery channel.
    channel_capacity: usize,
    /// Sequence for fingerprints synthesized from hash-less requests.
    anon_seq: AtomicU64,
    total_requests: AtomicU64,
    coalesced_requests: AtomicU64,
    new_requests: AtomicU64,
}

impl CoalescingFetcher {
    /// Create a fetcher whose delivery channels hold `channel_capacity`
    /// results.
    ///
    /// A sensible capacity is the number of nodes in the composition, since
    /// a node is not expected to request the same fingerprint twice. Values
    /// `<= 1` are replaced with [`FALLBACK_CHANNEL_CAPACITY`].
    pub fn new(channel_capacity: usize) -> Self {
        let channel_capacity = if channel_capacity <= 1 {
            FALLBACK_CHANNEL_CAPACITY
        } else {
            channel_capacity
        };
        Self {
            entries: Arc::new(DashMap::new()),
            channel_capacity,
            anon_seq: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            coalesced_requests: AtomicU64::new(0),
            new_requests: AtomicU64::new(0),
        }
    }

    /// Returns a snapshot of the coalescing counters.
    pub fn stats(&self) -> FetcherStats {
        FetcherStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            coalesced_requests: self.coalesced_requests.load(Ordering::Relaxed),
            new_requests: self.new_requests.load(Ordering::Relaxed),
        }
    }

    /// Number of fetches currently executing.
    pub fn in_flight_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.value(), FetchEntry::InFlight(_)))
            .count()
    }

    /// Resolve the fingerprint for a request, synthesizing a unique one for
    /// requests that opted out of coalescing with an empty hash.
    fn fingerprint(&self, req: &AsyncFetchReq) -> String {
        if req.hash.is_empty() {
            let seq = self.anon_seq.fetch_add(1, Ordering::Relaxed);
            format!("anonymous-fetch-{seq}")
        } else {
            req.hash.clone()
        }
    }

    /// Build a channel that already carries a settled result.
    ///
    /// The receiver is subscribed before the send, so the value is retained
    /// for it; the send itself never blocks.
    fn preloaded_channel(data: AsyncFetchData) -> broadcast::Receiver<AsyncFetchData> {
        let (tx, rx) = broadcast::channel(1);
        let _ = tx.send(data);
        rx
    }

    /// Run the fetch closure in the background and settle its entry.
    fn spawn_executor(&self, ctx: CancellationToken, hash: String, fetch: FetchFn) {
        let entries = Arc::clone(&self.entries);
        tokio::spawn(async move {
            let outcome = (fetch)(ctx).await;
            let data = AsyncFetchData::from_outcome(hash, outcome);

            match entries.get_mut(&data.hash) {
                Some(mut entry) => {
                    let previous =
                        std::mem::replace(entry.value_mut(), FetchEntry::Settled(data.clone()));
                    if let FetchEntry::InFlight(tx) = previous {
                        let subscribers = tx.receiver_count();
                        // One send delivers a copy to every live subscriber.
                        let _ = tx.send(data.clone());
                        debug!(
                            hash = %data.hash,
                            subscribers,
                            failed = data.is_err(),
                            "fetch settled"
                        );
                    }
                }
                None => {
                    // The cache never evicts, so a missing entry means the
                    // bookkeeping is broken somewhere.
                    warn!(hash = %data.hash, "settled fetch has no cache entry");
                }
            }
        });
    }
}

impl DataFetcher for CoalescingFetcher {
    fn fetch(
        &self,
        ctx: &CancellationToken,
        req: &AsyncFetchReq,
    ) -> broadcast::Receiver<AsyncFetchData> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let hash = self.fingerprint(req);

        let mut launch = None;
        let rx = match self.entries.entry(hash.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => match entry.get() {
                FetchEntry::InFlight(tx) => {
                    self.coalesced_requests.fetch_add(1, Ordering::Relaxed);
                    debug!(hash = %hash, "joining in-flight fetch");
                    tx.subscribe()
                }
                FetchEntry::Settled(data) => {
                    self.coalesced_requests.fetch_add(1, Ordering::Relaxed);
                    debug!(hash = %hash, "serving settled fetch from cache");
                    Self::preloaded_channel(data.clone())
                }
            },
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let (tx, rx) = broadcast::channel(self.channel_capacity);
                entry.insert(FetchEntry::InFlight(tx));
                self.new_requests.fetch_add(1, Ordering::Relaxed);
                debug!(hash = %hash, "starting new fetch");
                launch = Some(req.fetch.clone());
                rx
            }
        };

        if let Some(fetch) = launch {
            self.spawn_executor(ctx.clone(), hash, fetch);
        }
        rx
    }
}

impl std::fmt::Debug for CoalescingFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoalescingFetcher")
            .field("channel_capacity", &self.channel_capacity)
            .field("cached_fingerprints", &self.entries.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::FetchError;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};
    use tokio::time::sleep;

    fn counting_req(hash: &str, counter: Arc<AtomicUsize>) -> AsyncFetchReq {
        AsyncFetchReq::new(hash, move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(10)).await;
                Ok(json!({"fetched": true}))
            }
        })
    }

    #[tokio::test]
    async fn test_single_flight_under_concurrency() {
        let fetcher = Arc::new(CoalescingFetcher::new(16));
        let ctx = CancellationToken::new();
        let invocations = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let fetcher = Arc::clone(&fetcher);
                let ctx = ctx.clone();
                let req = counting_req("shared", Arc::clone(&invocations));
                tokio::spawn(async move { fetcher.wait_for_fetch(&ctx, &req).await })
            })
            .collect();

        let results = futures::future::join_all(handles).await;
        for result in results {
            let data = result.unwrap().unwrap();
            assert_eq!(*data.result, json!({"fetched": true}));
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_settled_fetch_served_without_rerun() {
        let fetcher = CoalescingFetcher::new(16);
        let ctx = CancellationToken::new();
        let invocations = Arc::new(AtomicUsize::new(0));
        let req = counting_req("cached", Arc::clone(&invocations));

        let first = fetcher.wait_for_fetch(&ctx, &req).await.unwrap();
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        // The second wait must come straight from the cache.
        let started = Instant::now();
        let second = fetcher.wait_for_fetch(&ctx, &req).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(1));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(first.result, second.result);
    }

    #[tokio::test]
    async fn test_distinct_hashes_not_coalesced() {
        let fetcher = CoalescingFetcher::new(16);
        let ctx = CancellationToken::new();
        let invocations = Arc::new(AtomicUsize::new(0));

        let req_a = counting_req("a", Arc::clone(&invocations));
        let req_b = counting_req("b", Arc::clone(&invocations));
        fetcher.wait_for_fetch(&ctx, &req_a).await.unwrap();
        fetcher.wait_for_fetch(&ctx, &req_b).await.unwrap();

        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_hash_never_coalesces() {
        let fetcher = CoalescingFetcher::new(16);
        let ctx = CancellationToken::new();
        let invocations = Arc::new(AtomicUsize::new(0));

        let req = counting_req("", Arc::clone(&invocations));
        fetcher.wait_for_fetch(&ctx, &req).await.unwrap();
        fetcher.wait_for_fetch(&ctx, &req).await.unwrap();

        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_closure_error_delivered_to_all_subscribers() {
        let fetcher = Arc::new(CoalescingFetcher::new(16));
        let ctx = CancellationToken::new();
        let req = AsyncFetchReq::new("failing", |_ctx| async {
            sleep(Duration::from_millis(5)).await;
            Err::<Value, _>("upstream offline".into())
        });

        let mut rx_a = fetcher.fetch(&ctx, &req);
        let mut rx_b = fetcher.fetch(&ctx, &req);

        let data_a = rx_a.recv().await.unwrap();
        let data_b = rx_b.recv().await.unwrap();
        assert!(data_a.is_err());
        assert!(data_b.is_err());
        assert_eq!(*data_a.result, Value::Null);
    }

    #[tokio::test]
    async fn test_delivery_count_matches_subscribers() {
        let fetcher = Arc::new(CoalescingFetcher::new(16));
        let ctx = CancellationToken::new();
        let req = AsyncFetchReq::new("fanout", |_ctx| async {
            sleep(Duration::from_millis(10)).await;
            Ok(json!(42))
        });

        let mut receivers: Vec<_> = (0..5).map(|_| fetcher.fetch(&ctx, &req)).collect();
        for rx in &mut receivers {
            let data = rx.recv().await.unwrap();
            assert_eq!(*data.result, json!(42));
            // Exactly one delivery per subscription.
            assert!(matches!(
                rx.try_recv(),
                Err(broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed)
            ));
        }
    }

    #[tokio::test]
    async fn test_wait_for_fetches_preserves_request_order() {
        let fetcher = CoalescingFetcher::new(16);
        let ctx = CancellationToken::new();

        // The slow request comes first to prove ordering is by input, not
        // completion.
        let slow = AsyncFetchReq::new("slow", |_ctx| async {
            sleep(Duration::from_millis(20)).await;
            Ok(json!("slow"))
        });
        let fast = AsyncFetchReq::new("fast", |_ctx| async { Ok(json!("fast")) });

        let results = fetcher
            .wait_for_fetches(&ctx, &[slow, fast])
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(*results[0].result, json!("slow"));
        assert_eq!(*results[1].result, json!("fast"));
    }

    #[tokio::test]
    async fn test_wait_for_fetch_honours_cancellation() {
        let fetcher = CoalescingFetcher::new(16);
        let ctx = CancellationToken::new();
        let req = AsyncFetchReq::new("stuck", |_ctx| async {
            sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        });

        let cancel = ctx.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(5)).await;
            cancel.cancel();
        });

        let err = fetcher.wait_for_fetch(&ctx, &req).await.unwrap_err();
        assert_eq!(err, FetchError::Cancelled);
    }

    #[tokio::test]
    async fn test_stats_track_coalescing() {
        let fetcher = Arc::new(CoalescingFetcher::new(16));
        let ctx = CancellationToken::new();
        let req = AsyncFetchReq::new("stats", |_ctx| async {
            sleep(Duration::from_millis(10)).await;
            Ok(Value::Null)
        });

        let _first = fetcher.fetch(&ctx, &req);
        let _second = fetcher.fetch(&ctx, &req);
        let _third = fetcher.fetch(&ctx, &req);

        let stats = fetcher.stats();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.new_requests, 1);
        assert_eq!(stats.coalesced_requests, 2);
    }

    #[tokio::test]
    async fn test_in_flight_count_drops_after_settlement() {
        let fetcher = Arc::new(CoalescingFetcher::new(16));
        let ctx = CancellationToken::new();
        let req = AsyncFetchReq::new("tracked", |_ctx| async {
            sleep(Duration::from_millis(10)).await;
            Ok(Value::Null)
        });

        let mut rx = fetcher.fetch(&ctx, &req);
        assert_eq!(fetcher.in_flight_count(), 1);

        rx.recv().await.unwrap();
        assert_eq!(fetcher.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_channel_capacity_floor() {
        let fetcher = CoalescingFetcher::new(0);
        assert_eq!(fetcher.channel_capacity, FALLBACK_CHANNEL_CAPACITY);

        let fetcher = CoalescingFetcher::new(64);
        assert_eq!(fetcher.channel_capacity, 64);
    }
}
