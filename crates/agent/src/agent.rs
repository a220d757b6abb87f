//! The reflection agent: watchers feed the aggregator, the aggregator feeds
//! the apply lanes, and one stop token tears all of it down.

use std::sync::Arc;
use std::time::Duration;

use kubist_apply::{ApplyError, Applier};
use kubist_core::LanePlanner;
use kubist_kubehub::{ResourceWatcher, WatchError, WatchStats, WatchTarget};
use kubist_store::DocumentStore;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregator::{AggregatorError, ChannelAggregator};
use crate::lanes::{ApplyCounts, ApplyPool};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error("apply: {0}")]
    Apply(#[from] ApplyError),
    #[error(transparent)]
    Aggregator(#[from] AggregatorError),
    #[error("no resources to watch")]
    NoTargets,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Number of apply lanes.
    pub lanes: usize,
    /// Bound of every internal queue.
    pub queue_capacity: usize,
    pub resync_period: Option<Duration>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { lanes: 10, queue_capacity: 1024, resync_period: None }
    }
}

/// What the agent did before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AgentReport {
    pub dispatched: u64,
    pub applied: ApplyCounts,
    pub watched: WatchStats,
}

pub struct ReflectionAgent<S: DocumentStore + ?Sized + 'static> {
    applier: Applier<S>,
    config: AgentConfig,
    stop: CancellationToken,
}

impl<S: DocumentStore + ?Sized + 'static> ReflectionAgent<S> {
    pub fn new(store: Arc<S>, config: AgentConfig) -> Self {
        Self { applier: Applier::new(store), config, stop: CancellationToken::new() }
    }

    /// Token that stops the agent when cancelled; cancel it from a signal handler.
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Reflect `targets` into the store until stopped, until every watch
    /// stream ends, or until a fatal error.
    pub async fn run(&self, targets: Vec<WatchTarget>) -> Result<AgentReport, AgentError> {
        if targets.is_empty() {
            return Err(AgentError::NoTargets);
        }
        let cap = self.config.queue_capacity.max(1);
        let (merged_tx, mut merged_rx) = mpsc::channel(cap);
        let aggregator = ChannelAggregator::with_stop(merged_tx, self.stop.child_token());

        let mut watchers = JoinSet::new();
        for target in targets {
            let mut watcher = ResourceWatcher::new(target)
                .with_stop(self.stop.child_token())
                .with_capacity(cap)
                .with_resync(self.config.resync_period);
            let rx = watcher.watch()?;
            aggregator.add(rx)?;
            info!(resource = %watcher.resource(), "watching");
            watchers.spawn(watcher.join());
        }

        let planner = LanePlanner::new(self.config.lanes);
        let (pool, mut lane_errors) = ApplyPool::spawn(self.applier.clone(), planner, cap);
        let mut report = AgentReport::default();
        let mut fatal: Option<AgentError> = None;

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    info!("stop requested");
                    break;
                }
                Some(err) = lane_errors.recv() => {
                    fatal = Some(err.into());
                    break;
                }
                Some(joined) = watchers.join_next() => {
                    match joined {
                        Ok(Ok(stats)) => add_stats(&mut report.watched, &stats),
                        Ok(Err(e)) => {
                            fatal = Some(e.into());
                            break;
                        }
                        Err(e) => {
                            error!(error = %e, "watcher task panicked");
                        }
                    }
                    if watchers.is_empty() {
                        info!("all watch streams ended");
                        break;
                    }
                }
                Some(delta) = merged_rx.recv() => {
                    if pool.dispatch(delta).await.is_ok() {
                        report.dispatched += 1;
                    }
                }
            }
        }

        if let Some(e) = &fatal {
            error!(error = %e, "fatal error; stopping agent");
            self.stop.cancel();
        }

        // Stopping cancels the forwarders; on a natural end they finish once
        // their sources are drained. Either way the merged queue closes after
        // the aggregator is dropped.
        let closer = tokio::spawn(async move {
            aggregator.wait().await;
            drop(aggregator);
        });
        while let Some(delta) = merged_rx.recv().await {
            if pool.dispatch(delta).await.is_ok() {
                report.dispatched += 1;
            }
        }
        if let Err(e) = closer.await {
            warn!(error = %e, "aggregator shutdown task failed");
        }

        while let Some(joined) = watchers.join_next().await {
            match joined {
                Ok(Ok(stats)) => add_stats(&mut report.watched, &stats),
                Ok(Err(e)) => {
                    if fatal.is_none() {
                        fatal = Some(e.into());
                    } else {
                        warn!(error = %e, "watcher failed during shutdown");
                    }
                }
                Err(e) => error!(error = %e, "watcher task panicked"),
            }
        }

        report.applied = pool.shutdown().await;
        if fatal.is_none() {
            if let Ok(err) = lane_errors.try_recv() {
                fatal = Some(err.into());
            }
        }
        info!(dispatched = report.dispatched, applied = report.applied.total(), conflicts = report.applied.conflicts, "agent stopped");
        match fatal {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

fn add_stats(total: &mut WatchStats, s: &WatchStats) {
    total.added += s.added;
    total.updated += s.updated;
    total.deleted += s.deleted;
    total.synced += s.synced;
    total.dropped_deletes += s.dropped_deletes;
}
