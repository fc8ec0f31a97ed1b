use crate::aggregator::StatsAggregator;
use crate::interval::IntervalController;
use crate::pagination::PaginationRegistry;
use crate::state::StatsState;
use crate::traits::PageSource;
use crate::types::{PollerError, RatePolicy, Result, MAX_PAGE_LIMIT};
use interfaces::defs::{Item, ItemStore};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub sources: Vec<String>,
    pub initial_interval: Duration,
    pub page_limit: usize,
    pub stats_interval: Duration,
    pub pagination_reset_interval: Duration,
    pub adjust_interval: Duration,
    pub policy: RatePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sources: vec!["rust".to_string()],
            initial_interval: Duration::from_secs(60),
            page_limit: MAX_PAGE_LIMIT,
            stats_interval: Duration::from_secs(10),
            pagination_reset_interval: Duration::from_secs(5 * 60),
            adjust_interval: Duration::from_secs(10),
            policy: RatePolicy::default(),
        }
    }
}

/// Outcome of one fetch cycle across all sources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub sources_ok: usize,
    pub sources_failed: usize,
    pub items_processed: usize,
    pub items_failed: usize,
    pub overran: bool,
}

enum SourceOutcome {
    Fetched { source: String, processed: usize, failed: usize },
    Failed { source: String, error: PollerError },
}

/// Polling control loop: fans out one fetch per source per cycle and one
/// save per fetched item, and keeps statistics and cursors up to date.
pub struct PollingPipeline {
    source: Arc<dyn PageSource>,
    store: Arc<dyn ItemStore>,
    cursors: Arc<PaginationRegistry>,
    aggregator: StatsAggregator,
    processed: Mutex<u64>,
    config: PipelineConfig,
}

impl PollingPipeline {
    pub fn new(
        source: Arc<dyn PageSource>,
        store: Arc<dyn ItemStore>,
        state: Arc<StatsState>,
        config: PipelineConfig,
    ) -> Self {
        let aggregator = StatsAggregator::new(store.clone(), state, config.sources.clone());
        Self {
            source,
            store,
            cursors: Arc::new(PaginationRegistry::new()),
            aggregator,
            processed: Mutex::new(0),
            config,
        }
    }

    pub fn cursors(&self) -> &Arc<PaginationRegistry> {
        &self.cursors
    }

    pub fn stats(&self) -> &Arc<StatsState> {
        self.aggregator.state()
    }

    /// Items saved since startup.
    pub fn processed_count(&self) -> u64 {
        *self.processed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record_processed(&self) {
        *self.processed.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) += 1;
    }

    /// Run until `cancel` fires. Always returns `Err(PollerError::Cancelled)`
    /// on shutdown; a cycle still in flight is left to finish on its own.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut cadence = self.config.initial_interval;
        let (cadence_tx, mut cadence_rx) = mpsc::channel(1);
        let (active_tx, active_rx) = watch::channel(cadence);

        let controller = IntervalController::new(
            self.config.policy,
            self.config.sources.len(),
            self.config.adjust_interval,
        );
        tokio::spawn(controller.run(self.source.clone(), active_rx, cadence_tx, cancel.child_token()));

        info!(
            sources = ?self.config.sources,
            interval_sec = cadence.as_secs_f64(),
            reset_interval_minutes = self.config.pagination_reset_interval.as_secs_f64() / 60.0,
            "Starting polling loop"
        );

        let mut in_flight: JoinHandle<()> = self.spawn_cycle(cadence);

        let now = Instant::now();
        let mut fetch_timer = interval_at(now + cadence, cadence);
        fetch_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats_timer = interval_at(now + self.config.stats_interval, self.config.stats_interval);
        let mut reset_timer = interval_at(
            now + self.config.pagination_reset_interval,
            self.config.pagination_reset_interval,
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Polling loop cancelled");
                    return Err(PollerError::Cancelled);
                }
                Some(next) = cadence_rx.recv() => {
                    info!("Polling interval changed from {:?} to {:?}", cadence, next);
                    cadence = next;
                    fetch_timer = interval_at(Instant::now() + cadence, cadence);
                    fetch_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    // Only fails once the controller has stopped.
                    let _ = active_tx.send(cadence);
                }
                _ = fetch_timer.tick() => {
                    if !in_flight.is_finished() {
                        warn!("Previous fetch cycle still running, skipping this tick");
                        continue;
                    }
                    in_flight = self.spawn_cycle(cadence);
                }
                _ = stats_timer.tick() => {
                    let processed = self.processed_count();
                    if let Err(e) = self.aggregator.refresh(processed).await {
                        error!("Failed to refresh statistics: {}", e);
                    }
                    self.aggregator.log_summary(processed);
                }
                _ = reset_timer.tick() => {
                    let reset = self.cursors.reset_all().await;
                    debug!("Reset {} pagination cursors", reset);
                }
            }
        }
    }

    fn spawn_cycle(self: &Arc<Self>, cadence: Duration) -> JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move {
            let report = pipeline.fetch_cycle(cadence / 2).await;
            info!(
                sources_ok = report.sources_ok,
                sources_failed = report.sources_failed,
                items_processed = report.items_processed,
                items_failed = report.items_failed,
                overran = report.overran,
                "Fetch cycle finished"
            );
        })
    }

    /// Fetch every source once and save what comes back.
    ///
    /// `deadline` is advisory: a cycle that takes longer is reported as
    /// overrun but nothing is aborted.
    pub async fn fetch_cycle(self: &Arc<Self>, deadline: Duration) -> CycleReport {
        let started = Instant::now();
        info!(sources = ?self.config.sources, "Fetching items from all sources");

        // Every source starts from the cursor it had when the cycle began.
        let mut planned = Vec::with_capacity(self.config.sources.len());
        for source in &self.config.sources {
            let cursor = self.cursors.get(source).await;
            info!(source = %source, pagination_cursor = %cursor, "Using pagination cursor for fetch");
            planned.push((source.clone(), cursor));
        }

        let mut tasks = JoinSet::new();
        for (source, cursor) in planned {
            let pipeline = self.clone();
            tasks.spawn(async move { pipeline.poll_source(source, cursor).await });
        }

        let mut report = CycleReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(SourceOutcome::Fetched { source, processed, failed }) => {
                    debug!("Source {} done: {} saved, {} failed", source, processed, failed);
                    report.sources_ok += 1;
                    report.items_processed += processed;
                    report.items_failed += failed;
                }
                Ok(SourceOutcome::Failed { source, error }) => {
                    error!("Failed to fetch items from {}: {}", source, error);
                    report.sources_failed += 1;
                }
                Err(e) => {
                    error!("Source task failed: {}", e);
                    report.sources_failed += 1;
                }
            }
        }

        let elapsed = started.elapsed();
        if elapsed > deadline {
            warn!("Fetch cycle took {:?}, longer than its {:?} deadline", elapsed, deadline);
            report.overran = true;
        }

        if report.items_processed > 0 {
            if let Err(e) = self.aggregator.refresh(self.processed_count()).await {
                error!("Failed to refresh statistics after fetch cycle: {}", e);
            }
        }

        report
    }

    async fn poll_source(self: Arc<Self>, source: String, cursor: String) -> SourceOutcome {
        debug!("Starting fetch for {}", source);

        let page = match self.source.fetch_page(&source, self.config.page_limit, &cursor).await {
            Ok(page) => page,
            Err(error) => return SourceOutcome::Failed { source, error },
        };

        info!(
            source = %source,
            count = page.items.len(),
            old_pagination_cursor = %cursor,
            new_pagination_cursor = %page.next_cursor,
            pagination_changed = cursor != page.next_cursor,
            "Fetched items with pagination update"
        );
        self.cursors.set(&source, page.next_cursor).await;

        let (processed, failed) = self.process_items(page.items).await;
        SourceOutcome::Fetched { source, processed, failed }
    }

    /// Save each item on its own task. Returns (saved, failed).
    async fn process_items(self: &Arc<Self>, items: Vec<Item>) -> (usize, usize) {
        if items.is_empty() {
            info!("No new items to process");
            return (0, 0);
        }
        info!(count = items.len(), "Processing items");

        let mut tasks = JoinSet::new();
        for item in items {
            let pipeline = self.clone();
            tasks.spawn(async move {
                pipeline.store.save_item(&item).await?;
                pipeline.record_processed();
                Ok::<_, PollerError>(())
            });
        }

        let (mut processed, mut failed) = (0, 0);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => processed += 1,
                Ok(Err(e)) => {
                    error!("Error processing item: {}", e);
                    failed += 1;
                }
                Err(e) => {
                    error!("Item task failed: {}", e);
                    failed += 1;
                }
            }
        }
        (processed, failed)
    }
}
