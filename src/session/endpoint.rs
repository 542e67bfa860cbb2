//! Silence-based endpointing.
//!
//! The monitor sleeps through the minimum capture window, then polls the time
//! of the last transcript change. Once that is older than the idle timeout it
//! fires the auto-stop trigger exactly once and exits.

use crate::config::EndpointingConfig;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EndpointPolicy {
    pub min_capture: Duration,
    pub idle_timeout: Duration,
    pub poll_interval: Duration,
}

impl EndpointPolicy {
    pub fn from_config(config: &EndpointingConfig) -> Self {
        Self {
            min_capture: config.min_capture(),
            idle_timeout: config.idle_timeout(),
            poll_interval: config.poll_interval(),
        }
    }

    /// Past the floor, and strictly longer than the idle timeout since the last change.
    pub fn should_auto_stop(&self, started: Instant, last_update: Instant, now: Instant) -> bool {
        now.saturating_duration_since(started) >= self.min_capture
            && now.saturating_duration_since(last_update) > self.idle_timeout
    }
}

/// Run the silence monitor for a session that started recording at `started`.
///
/// `last_update` must start out equal to `started`.
pub fn spawn_silence_monitor(
    policy: EndpointPolicy,
    started: Instant,
    last_update: watch::Receiver<Instant>,
    trigger: mpsc::Sender<()>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(started + policy.min_capture) => {}
        }

        let mut ticker = tokio::time::interval(policy.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            let last = *last_update.borrow();
            if policy.should_auto_stop(started, last, now) {
                debug!(
                    idle_ms = now.saturating_duration_since(last).as_millis() as u64,
                    "no new transcript, triggering auto-stop"
                );
                // A full or closed trigger means the session is already stopping.
                let _ = trigger.try_send(());
                return;
            }
        }
    }
    .in_current_span())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> EndpointPolicy {
        EndpointPolicy {
            min_capture: Duration::from_secs(8),
            idle_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_policy_thresholds() {
        let start = Instant::now();
        let p = policy();

        // Silence before the floor never stops.
        assert!(!p.should_auto_stop(start, start, start + Duration::from_millis(7_999)));
        assert!(p.should_auto_stop(start, start, start + Duration::from_secs(8)));

        // Exactly the idle timeout is not enough.
        let last = start + Duration::from_secs(10);
        assert!(!p.should_auto_stop(start, last, last + Duration::from_secs(3)));
        assert!(p.should_auto_stop(start, last, last + Duration::from_millis(3_001)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_speech_stops_at_floor() {
        let start = Instant::now();
        let (_last_tx, last_rx) = watch::channel(start);
        let (trigger_tx, mut trigger_rx) = mpsc::channel(1);

        let monitor = spawn_silence_monitor(policy(), start, last_rx, trigger_tx, CancellationToken::new());
        trigger_rx.recv().await.unwrap();

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(8), "fired early at {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(8_200), "fired late at {:?}", elapsed);
        monitor.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_three_seconds_after_last_update() {
        let start = Instant::now();
        let (last_tx, last_rx) = watch::channel(start);
        let (trigger_tx, mut trigger_rx) = mpsc::channel(1);
        let _monitor = spawn_silence_monitor(policy(), start, last_rx, trigger_tx, CancellationToken::new());

        // Speech keeps the transcript changing once a second until T = 10s.
        for second in 1..=10 {
            tokio::time::sleep_until(start + Duration::from_secs(second)).await;
            last_tx.send(Instant::now()).unwrap();
        }

        trigger_rx.recv().await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed > Duration::from_secs(13), "fired early at {:?}", elapsed);
        // One poll interval of slack.
        assert!(elapsed < Duration::from_millis(13_400), "fired late at {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_monitor() {
        let start = Instant::now();
        let (_last_tx, last_rx) = watch::channel(start);
        let (trigger_tx, mut trigger_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let monitor = spawn_silence_monitor(policy(), start, last_rx, trigger_tx, cancel.clone());

        tokio::time::sleep(Duration::from_secs(2)).await;
        cancel.cancel();
        monitor.await.unwrap();

        // Sender dropped without firing.
        assert!(trigger_rx.recv().await.is_none());
    }
}
