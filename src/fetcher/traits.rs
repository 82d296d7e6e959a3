//! Data fetcher seam for node builders and test doubles.

use super::types::{AsyncFetchData, AsyncFetchReq, FetchError};
use crate::BoxFuture;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Coalescing data retrieval, as seen by node builders.
///
/// `fetch` registers interest and returns immediately; the provided
/// `wait_for_*` helpers cover the common launch-then-block patterns.
pub trait DataFetcher: Send + Sync {
    /// Register a fetch and return its delivery channel.
    ///
    /// Never blocks. The channel yields exactly one [`AsyncFetchData`] for
    /// this call; closure failures arrive inside that value, not as channel
    /// errors.
    fn fetch(
        &self,
        ctx: &CancellationToken,
        req: &AsyncFetchReq,
    ) -> broadcast::Receiver<AsyncFetchData>;

    /// Launch a fetch and wait for its result, honouring cancellation.
    fn wait_for_fetch<'a>(
        &'a self,
        ctx: &'a CancellationToken,
        req: &'a AsyncFetchReq,
    ) -> BoxFuture<'a, Result<AsyncFetchData, FetchError>> {
        let mut rx = self.fetch(ctx, req);
        Box::pin(async move {
            tokio::select! {
                delivered = rx.recv() => delivered.map_err(|_| FetchError::ChannelClosed),
                _ = ctx.cancelled() => Err(FetchError::Cancelled),
            }
        })
    }

    /// Launch several fetches, then wait for all of them.
    ///
    /// All fetches start before the first receive, so they run in parallel.
    /// Results come back in request order. On cancellation mid-receive the
    /// remaining fetches are orphaned; they still settle in the cache and
    /// their deliveries are discarded.
    fn wait_for_fetches<'a>(
        &'a self,
        ctx: &'a CancellationToken,
        reqs: &'a [AsyncFetchReq],
    ) -> BoxFuture<'a, Result<Vec<AsyncFetchData>, FetchError>> {
        let mut channels: Vec<_> = reqs.iter().map(|req| self.fetch(ctx, req)).collect();
        Box::pin(async move {
            let mut results = Vec::with_capacity(channels.len());
            for rx in &mut channels {
                tokio::select! {
                    delivered = rx.recv() => match delivered {
                        Ok(data) => results.push(data),
                        Err(_) => return Err(FetchError::ChannelClosed),
                    },
                    _ = ctx.cancelled() => return Err(FetchError::Cancelled),
                }
            }
            Ok(results)
        })
    }
}

/// Trait object [`DataFetcher`].
pub type DynDataFetcher = Arc<dyn DataFetcher>;
