//! The response builder and its background orchestrator.

use super::config::BuilderConfig;
use super::slot::{NodeOutcome, NodeSlot};
use crate::fetcher::DynDataFetcher;
use crate::node::NodeConf;
use crate::storage::DynKeyValStorage;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error a cooperative node builder reports when it observes the build
/// token cancelled (deadline or caller cancellation) and gives up early.
///
/// The engine never aborts a builder itself; returning this (or any other
/// error) on cancellation is the builder's own responsibility.
#[derive(Debug, Error)]
#[error("node build cancelled before completion")]
pub struct BuildCancelled;

/// Builds one keyed response from parallel node builders.
///
/// A builder is a single-composition object: construct it, call
/// [`build`](Self::build) once, read [`result`](Self::result) when the
/// readiness signals (or your own deadline) say so, then drop it.
///
/// The values in the returned map are shared with the background build, so
/// they arrive as [`Arc`]s; add or remove map entries freely, the values
/// themselves are immutable.
pub struct ResponseBuilder {
    inner: Arc<BuilderInner>,
}

struct BuilderInner {
    storage_key: String,
    storage: DynKeyValStorage,
    fetcher: DynDataFetcher,
    config: BuilderConfig,
    num_required: usize,
    slots: RwLock<Vec<NodeSlot>>,
    /// One-shot build guard; also the start of the composition clock.
    build_started: Mutex<Option<Instant>>,
}

/// Pending/error bookkeeping for one composition run.
///
/// Owned exclusively by the orchestrator task; nothing else reads or writes
/// these counts.
struct PendingCounters {
    req_pending: usize,
    opt_pending: usize,
    req_err: usize,
    opt_err: usize,
}

impl PendingCounters {
    fn outstanding(&self) -> usize {
        self.req_pending + self.opt_pending
    }

    fn all_clean(&self) -> bool {
        self.req_err == 0 && self.opt_err == 0
    }
}

impl ResponseBuilder {
    /// Create a builder for one composition.
    ///
    /// `storage_key` must be unique for the logical request being composed;
    /// it is both the pre-load lookup and the persistence target for static
    /// nodes. Duplicate node keys are dropped with a warning, first
    /// occurrence winning.
    pub fn new(
        storage_key: impl Into<String>,
        storage: DynKeyValStorage,
        fetcher: DynDataFetcher,
        nodes: Vec<NodeConf>,
        config: BuilderConfig,
    ) -> Self {
        let mut seen = HashSet::with_capacity(nodes.len());
        let mut slots = Vec::with_capacity(nodes.len());
        let mut num_required = 0;

        for conf in nodes {
            if !seen.insert(conf.key.clone()) {
                warn!(key = %conf.key, "dropping duplicate node definition");
                continue;
            }
            if conf.required {
                num_required += 1;
            }
            slots.push(NodeSlot::new(conf));
        }

        Self {
            inner: Arc::new(BuilderInner {
                storage_key: storage_key.into(),
                storage,
                fetcher,
                config,
                num_required,
                slots: RwLock::new(slots),
                build_started: Mutex::new(None),
            }),
        }
    }

    /// Start the composition in the background.
    ///
    /// Idempotent: only the first call does anything. Either readiness
    /// sender may be omitted; emissions are `try_send`, so an unread or
    /// full channel drops the signal instead of stalling the build.
    ///
    /// Cancelling `ctx` aborts the gather loop; whatever settled by then is
    /// persisted and stays readable through [`result`](Self::result).
    /// In-flight builders are not aborted: one that keeps running past the
    /// cancellation still writes its slot, and later [`result`](Self::result)
    /// calls will see that value.
    pub fn build(
        &self,
        ctx: CancellationToken,
        required_ready: Option<mpsc::Sender<bool>>,
        full_ready: Option<mpsc::Sender<bool>>,
    ) {
        {
            let mut started = self.inner.build_started.lock().unwrap();
            if started.is_some() {
                debug!(key = %self.inner.storage_key, "build already started");
                return;
            }
            *started = Some(Instant::now());
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run(ctx, required_ready, full_ready).await;
        });
    }

    /// Snapshot of everything settled so far.
    ///
    /// Returns a fresh map of `key -> value` for every node that settled
    /// without error. Safe to call at any point, including mid-build and
    /// after cancellation.
    pub fn result(&self) -> HashMap<String, Arc<Value>> {
        let slots = self.inner.slots.read().unwrap();
        slots
            .iter()
            .filter(|slot| slot.settled && slot.err.is_none())
            .filter_map(|slot| {
                slot.value
                    .clone()
                    .map(|value| (slot.conf.key.clone(), value))
            })
            .collect()
    }
}

impl BuilderInner {
    /// Background orchestrator for one composition.
    async fn run(
        self: Arc<Self>,
        ctx: CancellationToken,
        required_ready: Option<mpsc::Sender<bool>>,
        full_ready: Option<mpsc::Sender<bool>>,
    ) {
        let started = Instant::now();
        let mut counters = self.preload_from_storage(&ctx).await;

        if counters.req_pending == 0 {
            signal_ready(&required_ready, true);
            if counters.opt_pending == 0 {
                signal_ready(&full_ready, true);
                debug!(key = %self.storage_key, "composition served entirely from storage");
                return;
            }
        }

        // Deadline for outstanding builders: one wall clock for the whole
        // composition, not per node.
        let build_token = ctx.child_token();
        if let Some(timeout) = self.config.build_timeout {
            let deadline_token = build_token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => deadline_token.cancel(),
                    _ = deadline_token.cancelled() => {}
                }
            });
        }

        // Completions never block: the channel holds every outstanding node.
        let (done_tx, mut done_rx) = mpsc::channel(counters.outstanding().max(1));
        self.spawn_node_tasks(&build_token, &done_tx);
        drop(done_tx);

        let mut cancelled = false;
        while counters.outstanding() > 0 && !cancelled {
            tokio::select! {
                outcome = done_rx.recv() => {
                    let Some(outcome) = outcome else {
                        break;
                    };
                    self.record_outcome(outcome, &mut counters, &required_ready);
                }
                _ = ctx.cancelled() => {
                    cancelled = true;
                }
            }
        }

        self.persist_static(&ctx).await;

        if counters.outstanding() == 0 {
            signal_ready(&full_ready, counters.all_clean());
        }

        info!(
            key = %self.storage_key,
            elapsed_ms = started.elapsed().as_millis() as u64,
            required_errors = counters.req_err,
            optional_errors = counters.opt_err,
            cancelled,
            "composition finished"
        );
    }

    /// Apply one node completion to the counters and readiness signalling.
    fn record_outcome(
        &self,
        outcome: NodeOutcome,
        counters: &mut PendingCounters,
        required_ready: &Option<mpsc::Sender<bool>>,
    ) {
        if outcome.required {
            counters.req_pending -= 1;
        } else {
            counters.opt_pending -= 1;
        }

        if outcome.failed {
            if outcome.required {
                counters.req_err += 1;
                if counters.req_err == 1 {
                    signal_ready(required_ready, false);
                }
            } else {
                counters.opt_err += 1;
            }
        } else if outcome.required && counters.req_pending == 0 && counters.req_err == 0 {
            signal_ready(required_ready, true);
        }
    }

    /// Pre-populate slots from the storage snapshot, returning the pending
    /// counters that remain after the pre-load.
    async fn preload_from_storage(&self, ctx: &CancellationToken) -> PendingCounters {
        let total = self.slots.read().unwrap().len();
        let mut counters = PendingCounters {
            req_pending: self.num_required,
            opt_pending: total - self.num_required,
            req_err: 0,
            opt_err: 0,
        };

        let bytes = match self.storage.get(ctx, &self.storage_key).await {
            Ok(Some(bytes)) if !bytes.is_empty() => bytes,
            Ok(_) => {
                debug!(key = %self.storage_key, "no prior snapshot in storage");
                return counters;
            }
            Err(err) => {
                warn!(key = %self.storage_key, error = %err, "storage read failed; building from scratch");
                return counters;
            }
        };

        let mut cached: HashMap<String, Value> = match serde_json::from_slice(&bytes) {
            Ok(cached) => cached,
            Err(err) => {
                warn!(key = %self.storage_key, error = %err, "discarding undecodable snapshot");
                return counters;
            }
        };

        let mut slots = self.slots.write().unwrap();
        let mut preloaded = 0;
        for slot in slots.iter_mut() {
            if let Some(value) = cached.remove(&slot.conf.key) {
                slot.settle_from_storage(value);
                if slot.conf.required {
                    counters.req_pending -= 1;
                } else {
                    counters.opt_pending -= 1;
                }
                preloaded += 1;
            }
        }
        if preloaded > 0 {
            debug!(key = %self.storage_key, preloaded, "pre-populated nodes from storage");
        }
        counters
    }

    /// Spawn one background task per unsettled slot.
    ///
    /// Pre-settled slots never rerun their builders - that is what makes
    /// the static round-trip free. Each task runs its builder closure to
    /// completion and is never aborted: the build token only lets a
    /// cooperative builder notice the deadline or the caller's cancellation
    /// and return early. A builder that ignores the token keeps running,
    /// and its eventual write still lands in the slot it owns.
    fn spawn_node_tasks(
        self: &Arc<Self>,
        build_token: &CancellationToken,
        done_tx: &mpsc::Sender<NodeOutcome>,
    ) {
        let unsettled: Vec<(usize, NodeConf)> = {
            let slots = self.slots.read().unwrap();
            slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| !slot.settled)
                .map(|(idx, slot)| (idx, slot.conf.clone()))
                .collect()
        };

        for (idx, conf) in unsettled {
            let inner = Arc::clone(self);
            let token = build_token.clone();
            let fetcher = Arc::clone(&self.fetcher);
            let done_tx = done_tx.clone();

            tokio::spawn(async move {
                let outcome = (conf.builder)(token, fetcher).await;

                let completed = {
                    let mut slots = inner.slots.write().unwrap();
                    let slot = &mut slots[idx];
                    slot.settle(outcome);
                    NodeOutcome {
                        required: slot.conf.required,
                        failed: slot.err.is_some(),
                    }
                };
                let _ = done_tx.send(completed).await;
            });
        }
    }

    /// Persist every static node that settled.
    ///
    /// A slot that settled with an error carries no value and contributes
    /// `null` under its key, which is exactly what its empty result holds.
    async fn persist_static(&self, ctx: &CancellationToken) {
        let null = Value::Null;
        let encoded = {
            let slots = self.slots.read().unwrap();
            let snapshot: HashMap<&str, &Value> = slots
                .iter()
                .filter(|slot| slot.conf.is_static && slot.settled)
                .map(|slot| {
                    (
                        slot.conf.key.as_str(),
                        slot.value.as_deref().unwrap_or(&null),
                    )
                })
                .collect();
            serde_json::to_vec(&snapshot)
        };

        let bytes = match encoded {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(key = %self.storage_key, error = %err, "static snapshot failed to serialize");
                return;
            }
        };

        if let Err(err) = self.storage.set(ctx, &self.storage_key, bytes).await {
            warn!(key = %self.storage_key, error = %err, "static snapshot write failed");
        }
    }
}

/// Emit a readiness value without ever blocking the orchestrator.
///
/// The channel may be absent, full, or closed; in all three cases the
/// signal is dropped - the caller was not listening, and the build must not
/// wait for it.
fn signal_ready(channel: &Option<mpsc::Sender<bool>>, value: bool) {
    if let Some(tx) = channel {
        if let Err(err) = tx.try_send(value) {
            debug!(value, error = %err, "readiness signal dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::CoalescingFetcher;
    use crate::storage::NopKeyValStorage;
    use serde_json::json;

    fn test_builder(nodes: Vec<NodeConf>) -> ResponseBuilder {
        ResponseBuilder::new(
            "test-key",
            Arc::new(NopKeyValStorage::new()),
            Arc::new(CoalescingFetcher::new(16)),
            nodes,
            BuilderConfig::default(),
        )
    }

    fn value_node(key: &str, value: Value) -> NodeConf {
        NodeConf::new(key, move |_ctx, _fetcher| {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    #[tokio::test]
    async fn test_duplicate_keys_first_occurrence_wins() {
        let builder = test_builder(vec![
            value_node("dup", json!("first")).with_required(true),
            value_node("dup", json!("second")),
            value_node("other", json!("ok")),
        ]);

        let slots = builder.inner.slots.read().unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].conf.key, "dup");
        assert!(slots[0].conf.required);
        assert_eq!(builder.inner.num_required, 1);
    }

    #[tokio::test]
    async fn test_result_empty_before_build() {
        let builder = test_builder(vec![value_node("a", json!(1))]);
        assert!(builder.result().is_empty());
    }

    #[tokio::test]
    async fn test_result_returns_fresh_maps() {
        let builder = test_builder(vec![value_node("a", json!(1))]);

        let mut first = builder.result();
        first.insert("injected".to_string(), Arc::new(json!(true)));
        let second = builder.result();

        assert!(!second.contains_key("injected"));
    }

    #[tokio::test]
    async fn test_build_is_idempotent() {
        let builder = test_builder(vec![value_node("a", json!(1)).with_required(true)]);
        let (tx, mut rx) = mpsc::channel(4);

        builder.build(CancellationToken::new(), Some(tx.clone()), None);
        builder.build(CancellationToken::new(), Some(tx), None);

        assert_eq!(rx.recv().await, Some(true));
        // A second build would have produced a second signal.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_signal_ready_tolerates_missing_channel() {
        signal_ready(&None, true);
    }

    #[tokio::test]
    async fn test_signal_ready_tolerates_full_channel() {
        let (tx, rx) = mpsc::channel(1);
        signal_ready(&Some(tx.clone()), true);
        signal_ready(&Some(tx), false);

        drop(rx);
    }

    #[tokio::test]
    async fn test_signal_ready_tolerates_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        signal_ready(&Some(tx), true);
    }
}
