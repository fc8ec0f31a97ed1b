pub mod aggregator;
pub mod api;
pub mod config;
pub mod fetcher;
pub mod interval;
pub mod pagination;
pub mod pipeline;
pub mod rate_limiter;
pub mod state;
pub mod traits;
pub mod types;

pub use aggregator::StatsAggregator;
pub use config::{AppConfig, Cli};
pub use fetcher::Fetcher;
pub use interval::IntervalController;
pub use pagination::PaginationRegistry;
pub use pipeline::{CycleReport, PipelineConfig, PollingPipeline};
pub use rate_limiter::{RateBudgetCache, TokenBucket};
pub use state::{SourceStats, Statistics, StatsState};
pub use traits::PageSource;
pub use types::*;
