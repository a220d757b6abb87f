//! Fan-in of any number of producer channels into one output channel.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AggregatorError {
    #[error("aggregator is stopped")]
    Stopped,
}

/// Copies every item from each added source into `out`.
///
/// Order is kept per source; interleaving across sources is arbitrary. The
/// aggregator holds a clone of `out`, so the output closes once it is dropped
/// and every forwarding task has exited.
pub struct ChannelAggregator<T> {
    out: mpsc::Sender<T>,
    stop: CancellationToken,
    tracker: TaskTracker,
}

impl<T: Send + 'static> ChannelAggregator<T> {
    pub fn new(out: mpsc::Sender<T>) -> Self {
        Self::with_stop(out, CancellationToken::new())
    }

    pub fn with_stop(out: mpsc::Sender<T>, stop: CancellationToken) -> Self {
        Self { out, stop, tracker: TaskTracker::new() }
    }

    /// Start forwarding `source`. Fails once the aggregator has been stopped.
    pub fn add(&self, mut source: mpsc::Receiver<T>) -> Result<(), AggregatorError> {
        if self.stop.is_cancelled() {
            return Err(AggregatorError::Stopped);
        }
        let out = self.out.clone();
        let stop = self.stop.clone();
        self.tracker.spawn(async move {
            let mut forwarded = 0u64;
            loop {
                let item = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    next = source.recv() => match next {
                        Some(item) => item,
                        None => break,
                    },
                };
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    sent = out.send(item) => if sent.is_err() { break },
                }
                forwarded += 1;
            }
            debug!(forwarded, "forwarding task exited");
        });
        Ok(())
    }

    /// Tell every forwarding task to exit. Later calls are no-ops.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Forwarding tasks still running.
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// Wait until every forwarding task has exited, either because its source
    /// ended or because of [`stop`](Self::stop).
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_after_stop_is_rejected() {
        let (tx, _rx) = mpsc::channel::<u32>(1);
        let agg = ChannelAggregator::new(tx);
        agg.stop();
        agg.stop();
        let (_stx, srx) = mpsc::channel::<u32>(1);
        assert_eq!(agg.add(srx), Err(AggregatorError::Stopped));
        assert_eq!(agg.active(), 0);
    }

    #[tokio::test]
    async fn output_closes_after_drop_and_drain() {
        let (tx, mut rx) = mpsc::channel::<u32>(4);
        let agg = ChannelAggregator::new(tx);
        let (stx, srx) = mpsc::channel(4);
        agg.add(srx).unwrap();
        stx.send(7).await.unwrap();
        drop(stx);
        agg.wait().await;
        drop(agg);
        assert_eq!(rx.recv().await, Some(7));
        assert_eq!(rx.recv().await, None);
    }
}
