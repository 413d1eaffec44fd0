//! # Analytics
//!
//! Historical job metrics, utilization forecasts, bottleneck detection and
//! optimization recommendations.

pub mod engine;
pub mod sink;

pub use engine::{
    ewma, linear_fit, AnalyticsEngine, Bottleneck, BottleneckKind, JobStatistics, Recommendation,
    RecommendationPriority, ResourceForecast, ServiceStatistics, StepStatistics,
    StrategyStatistics, SystemAnalyticsReport,
};
pub use sink::{HistorySink, InMemoryHistorySink, JobSummary, StepRecord, TracingHistorySink};
