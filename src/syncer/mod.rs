//! Periodic resync pulses.
//!
//! A syncer turns a resource's `resyncPeriod` into a stream of pulses. The
//! controller wires that stream in as an event source, so every pulse
//! re-queues all instances of the kind and time-driven reconciliation works
//! even when nothing changes in the cluster.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tracing::debug;

use crate::config::ResourceConfig;
use crate::Result;

/// Ticker emitting one pulse per resync period.
pub struct Syncer {
    interval: Duration,
    name: String,
}

impl Syncer {
    /// Create a syncer with an explicit interval.
    pub fn new(interval: Duration, name: impl Into<String>) -> Self {
        Self {
            interval,
            name: name.into(),
        }
    }

    /// Build the syncer for a resource, if it declares a resync period.
    pub fn from_resource(config: &ResourceConfig) -> Result<Option<Self>> {
        Ok(config
            .resync_period()?
            .map(|interval| Self::new(interval, config.controller_name())))
    }

    /// Start the ticker worker and return the pulse stream. The worker
    /// exits and releases its ticker as soon as the consumer drops the
    /// stream.
    pub fn start(self) -> impl Stream<Item = ()> + Send + 'static {
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of an interval fires immediately; the initial
            // watch already covers that round.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if tx.send(()).await.is_err() {
                    break;
                }
                debug!(syncer = %self.name, "synced");
            }

            debug!(syncer = %self.name, "stopping syncer");
        });

        ReceiverStream::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn resources_without_period_get_no_syncer() {
        let config = ResourceConfig::default();
        assert!(Syncer::from_resource(&config).unwrap().is_none());

        let config: ResourceConfig = serde_yaml::from_str(
            r#"
version: v1
kind: Hello
resyncPeriod: 250ms
"#,
        )
        .unwrap();
        assert!(Syncer::from_resource(&config).unwrap().is_some());
    }

    #[tokio::test]
    async fn pulses_arrive_at_the_configured_interval() {
        let syncer = Syncer::new(Duration::from_millis(10), "hello-controller");
        let mut pulses = Box::pin(syncer.start());

        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(1), pulses.next())
                .await
                .expect("pulse before deadline")
                .expect("stream open");
        }
    }

    #[tokio::test]
    async fn dropping_the_stream_stops_the_worker() {
        let syncer = Syncer::new(Duration::from_millis(5), "hello-controller");
        let pulses = Box::pin(syncer.start());
        drop(pulses);

        // The worker notices the closed channel on its next tick; nothing
        // to assert beyond "does not hang or panic".
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
