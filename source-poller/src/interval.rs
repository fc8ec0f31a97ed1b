use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::traits::PageSource;
use crate::types::{RatePolicy, BUDGET_PERIOD};

/// Recomputes the polling cadence from the shared request budget and hands
/// material changes to the polling loop.
#[derive(Debug, Clone)]
pub struct IntervalController {
    policy: RatePolicy,
    source_count: usize,
    check_interval: Duration,
    last_reset: i64,
}

impl IntervalController {
    pub fn new(policy: RatePolicy, source_count: usize, check_interval: Duration) -> Self {
        Self {
            policy,
            source_count,
            check_interval,
            last_reset: BUDGET_PERIOD.as_secs() as i64,
        }
    }

    /// Requests per second each source may use.
    pub fn target_rate(&self) -> f64 {
        self.policy.nominal_rate() / self.source_count.max(1) as f64
    }

    pub fn target_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.target_rate())
    }

    /// New cadence to apply, or `None` when the active one is within 25% of
    /// the target.
    pub fn evaluate(&self, active: Duration) -> Option<Duration> {
        let target = self.target_interval();
        if active.is_zero() {
            return Some(target);
        }

        let drift = target.as_secs_f64() - active.as_secs_f64();
        if drift.abs() > active.as_secs_f64() / 4.0 {
            Some(target)
        } else {
            None
        }
    }

    /// Record the latest reset countdown. Returns true when it jumped back up
    /// from a low value, i.e. a new budget window started.
    pub fn observe_reset(&mut self, reset_secs: i64) -> bool {
        let rolled_over = reset_secs > self.last_reset && self.last_reset < 100;
        self.last_reset = reset_secs;
        rolled_over
    }

    pub async fn run(
        mut self,
        source: Arc<dyn PageSource>,
        active: watch::Receiver<Duration>,
        tx: mpsc::Sender<Duration>,
        cancel: CancellationToken,
    ) {
        let start = tokio::time::Instant::now() + self.check_interval;
        let mut ticker = tokio::time::interval_at(start, self.check_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Interval controller stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let budget = source.rate_budget();
                    if self.observe_reset(budget.reset_secs) {
                        info!("Detected new rate limit period, values have reset");
                    }

                    let current = *active.borrow();
                    let Some(next) = self.evaluate(current) else {
                        continue;
                    };

                    let target_rate = self.target_rate();
                    info!(
                        old_interval_sec = current.as_secs_f64(),
                        new_interval_sec = next.as_secs_f64(),
                        reset_countdown_sec = budget.reset_secs,
                        used_requests = budget.used,
                        total_allocation = self.policy.total_allowed,
                        period_seconds = self.policy.period.as_secs(),
                        target_req_per_sec = target_rate,
                        target_req_per_min = target_rate * 60.0,
                        source_count = self.source_count,
                        "Adjusting polling interval to the rate limit"
                    );

                    match tx.try_send(next) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            debug!("Interval adjustment already pending, dropping {:?}", next);
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            debug!("Polling loop gone, stopping interval controller");
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Page, RateBudget, Result};
    use async_trait::async_trait;

    struct FixedBudget(RateBudget);

    #[async_trait]
    impl PageSource for FixedBudget {
        async fn fetch_page(&self, _source: &str, _limit: usize, _cursor: &str) -> Result<Page> {
            Ok(Page::default())
        }

        fn rate_budget(&self) -> RateBudget {
            self.0
        }
    }

    fn controller(sources: usize) -> IntervalController {
        IntervalController::new(RatePolicy::default(), sources, Duration::from_secs(10))
    }

    #[test]
    fn target_interval_splits_budget_across_sources() {
        let one = controller(1).target_interval().as_secs_f64();
        let three = controller(3).target_interval().as_secs_f64();

        assert!((one - 600.0 / 950.0).abs() < 1e-6);
        assert!((three - 3.0 * 600.0 / 950.0).abs() < 1e-6);
        assert_eq!(controller(0).target_interval(), controller(1).target_interval());
    }

    #[test]
    fn evaluate_applies_quarter_threshold() {
        let controller = controller(1);
        let target = controller.target_interval();

        assert_eq!(controller.evaluate(Duration::ZERO), Some(target));
        assert_eq!(controller.evaluate(Duration::from_secs(60)), Some(target));
        assert_eq!(controller.evaluate(target), None);
        // 0.63s against 0.70s active is a 10% drift
        assert_eq!(controller.evaluate(Duration::from_millis(700)), None);
    }

    #[test]
    fn rollover_needs_low_previous_countdown() {
        let mut controller = controller(1);

        assert!(!controller.observe_reset(500));
        assert!(!controller.observe_reset(90));
        assert!(controller.observe_reset(599));
        assert!(!controller.observe_reset(598));
        assert!(!controller.observe_reset(600));
    }

    #[tokio::test(start_paused = true)]
    async fn emits_once_and_drops_while_slot_is_full() {
        let source: Arc<dyn PageSource> = Arc::new(FixedBudget(RateBudget::default()));
        let (_active_tx, active_rx) = watch::channel(Duration::from_secs(60));
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(controller(1).run(source, active_rx, tx, cancel.clone()));

        // Three ticks without anyone draining the slot
        tokio::time::sleep(Duration::from_secs(31)).await;
        cancel.cancel();
        handle.await.unwrap();

        let first = rx.recv().await;
        assert_eq!(first, Some(controller(1).target_interval()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_receiver_is_dropped() {
        let source: Arc<dyn PageSource> = Arc::new(FixedBudget(RateBudget::default()));
        let (_active_tx, active_rx) = watch::channel(Duration::ZERO);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let handle = tokio::spawn(controller(2).run(source, active_rx, tx, CancellationToken::new()));
        let finished = tokio::time::timeout(Duration::from_secs(11), handle).await;
        assert!(finished.is_ok());
    }
}
