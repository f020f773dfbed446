//! Statistics
//!
//! Producers push named integer counters through a [`StatsSink`]; a single
//! [`StatsCollector`] task adds them into running totals and logs the totals
//! at a fixed interval.
//!
//! Recording is fire-and-forget: a full or closed channel drops the sample
//! rather than stalling the producer.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default capacity of the stats channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// A set of counter increments reported together
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsSample {
    /// `(name, increment)` pairs
    pub counters: Vec<(String, i64)>,
}

impl StatsSample {
    /// An empty sample
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one counter increment
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: i64) -> Self {
        self.counters.push((name.into(), value));
        self
    }
}

/// Create a connected sink and collector
#[must_use]
pub fn stats_channel(capacity: usize) -> (StatsSink, StatsCollector) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        StatsSink { tx },
        StatsCollector {
            rx,
            totals: BTreeMap::new(),
        },
    )
}

/// Producer handle; cheap to clone
#[derive(Clone, Debug)]
pub struct StatsSink {
    tx: mpsc::Sender<StatsSample>,
}

impl StatsSink {
    /// Send a sample without waiting
    pub fn record(&self, sample: StatsSample) {
        match self.tx.try_send(sample) {
            Ok(()) => {}
            Err(TrySendError::Full(sample)) => {
                debug!(counters = sample.counters.len(), "Stats channel full; sample dropped");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

/// Accumulates samples into running totals
#[derive(Debug)]
pub struct StatsCollector {
    rx: mpsc::Receiver<StatsSample>,
    totals: BTreeMap<String, i64>,
}

impl StatsCollector {
    /// Add a sample into the totals
    pub fn absorb(&mut self, sample: &StatsSample) {
        add_into(&mut self.totals, sample);
    }

    /// Wait for the next sample and absorb it
    ///
    /// Returns `None` once every sink is gone.
    pub async fn recv(&mut self) -> Option<StatsSample> {
        let sample = self.rx.recv().await?;
        self.absorb(&sample);
        Some(sample)
    }

    /// Current totals
    #[must_use]
    pub fn totals(&self) -> &BTreeMap<String, i64> {
        &self.totals
    }

    /// Collect until every sink is gone or `cancel` fires, logging the
    /// totals every `interval` when they changed
    ///
    /// Returns the final totals.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) -> BTreeMap<String, i64> {
        let Self { mut rx, mut totals } = self;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut dirty = false;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if dirty {
                        info!(totals = ?totals, "Stats");
                        dirty = false;
                    }
                }
                sample = rx.recv() => {
                    let Some(sample) = sample else { break };
                    add_into(&mut totals, &sample);
                    dirty = true;
                }
            }
        }

        info!(totals = ?totals, "Stats collector stopped");
        totals
    }
}

fn add_into(totals: &mut BTreeMap<String, i64>, sample: &StatsSample) {
    for (name, value) in &sample.counters {
        let total = totals.entry(name.clone()).or_default();
        *total = total.saturating_add(*value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_totals_accumulate() {
        let (sink, mut collector) = stats_channel(4);
        sink.record(StatsSample::new().with("ops", 100).with("usecs", 50));
        sink.record(StatsSample::new().with("ops", 100).with("usecs", 70));

        collector.recv().await.unwrap();
        collector.recv().await.unwrap();

        let expected: BTreeMap<String, i64> =
            [("ops".to_owned(), 200), ("usecs".to_owned(), 120)].into();
        assert_eq!(collector.totals(), &expected);
    }

    #[tokio::test]
    async fn test_totals_saturate_instead_of_overflowing() {
        let (sink, mut collector) = stats_channel(4);
        sink.record(StatsSample::new().with("usecs", i64::MAX - 1));
        sink.record(StatsSample::new().with("usecs", 10));

        collector.recv().await.unwrap();
        collector.recv().await.unwrap();
        assert_eq!(collector.totals().get("usecs"), Some(&i64::MAX));
    }

    #[tokio::test]
    async fn test_full_channel_drops_instead_of_blocking() {
        let (sink, mut collector) = stats_channel(1);
        sink.record(StatsSample::new().with("ops", 1));
        sink.record(StatsSample::new().with("ops", 1));
        drop(sink);

        while collector.recv().await.is_some() {}
        assert_eq!(collector.totals().get("ops"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_returns_totals_when_sinks_gone() {
        let (sink, collector) = stats_channel(8);
        let handle = tokio::spawn(collector.run(Duration::from_secs(1), CancellationToken::new()));

        sink.record(StatsSample::new().with("tot_workload_ops", 1000));
        tokio::time::sleep(Duration::from_secs(3)).await;
        drop(sink);

        let totals = handle.await.unwrap();
        assert_eq!(totals.get("tot_workload_ops"), Some(&1000));
    }

    #[tokio::test]
    async fn test_record_after_collector_gone_is_silent() {
        let (sink, collector) = stats_channel(1);
        drop(collector);
        sink.record(StatsSample::new().with("ops", 1));
    }
}
