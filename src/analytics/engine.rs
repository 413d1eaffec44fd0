//! # Analytics & Optimization Engine
//!
//! Read-only feedback loop over finished jobs and pool utilization samples.
//! Nothing here gates orchestration decisions; reports are computed on
//! demand from bounded in-memory windows.
//!
//! - **Forecasts**: per-dimension least-squares trend over the sample window,
//!   projected `forecast_horizon_minutes` ahead, alongside an EWMA-smoothed
//!   current saturation.
//! - **Bottlenecks**: saturated dimensions, slow step types, unreliable
//!   services, open circuits and services with an unhealthy majority.
//! - **Recommendations**: one actionable line per bottleneck plus analyzer
//!   calibration hints from estimate accuracy.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::sink::{HistorySink, JobSummary};
use crate::config::AnalyticsConfig;
use crate::models::{ProcessingStrategy, ResourceType, ResourceUtilization, StepType};
use crate::orchestration::status_sink::JobStatus;
use crate::registry::ServiceHealthSummary;
use crate::resilience::{CircuitState, SystemCircuitBreakerMetrics};
use crate::resources::ResourceAllocator;

const EWMA_ALPHA: f64 = 0.3;
/// Runs needed before a failure rate is trusted
const MIN_RUNS_FOR_RATES: usize = 3;
const ESTIMATE_UNDERSHOOT: f64 = 1.5;
const ESTIMATE_OVERSHOOT: f64 = 0.5;
const STRATEGY_SUCCESS_FLOOR: f64 = 0.8;

#[derive(Debug, Clone, PartialEq)]
struct UtilizationSample {
    captured_at: DateTime<Utc>,
    saturation: BTreeMap<ResourceType, f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobStatistics {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub success_rate: f64,
    pub average_duration_secs: f64,
    /// Mean of actual over estimated duration
    pub estimate_ratio: Option<f64>,
    pub average_rollbacks: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyStatistics {
    pub strategy: ProcessingStrategy,
    pub jobs: usize,
    pub success_rate: f64,
    pub average_duration_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStatistics {
    pub step_type: StepType,
    pub runs: usize,
    pub failures: usize,
    pub failure_rate: f64,
    pub average_duration_ms: f64,
    pub average_attempts: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatistics {
    pub service: String,
    pub runs: usize,
    pub failures: usize,
    pub failure_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceForecast {
    pub resource_type: ResourceType,
    pub current_saturation: f64,
    pub smoothed_saturation: f64,
    /// Saturation change per minute from the fitted trend
    pub trend_per_minute: f64,
    pub predicted_saturation: f64,
    pub horizon_minutes: u32,
    /// Minutes until the trend reaches full saturation, if it is rising
    pub minutes_to_exhaustion: Option<f64>,
    pub samples: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BottleneckKind {
    Resource,
    SlowStep,
    UnreliableService,
    OpenCircuit,
    UnhealthyService,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub kind: BottleneckKind,
    pub subject: String,
    /// 0.0 - 1.0, relative to the threshold that flagged it
    pub severity: f64,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationPriority {
    Low,
    Medium,
    High,
}

impl fmt::Display for RecommendationPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RecommendationPriority::Low => "low",
            RecommendationPriority::Medium => "medium",
            RecommendationPriority::High => "high",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub priority: RecommendationPriority,
    pub category: String,
    pub message: String,
}

/// Breaker activity across every protected service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitStatistics {
    pub breakers: usize,
    pub open: Vec<String>,
    pub half_open: usize,
    pub total_calls: u64,
    pub failure_rate: f64,
    /// Fraction of breakers whose metrics look healthy
    pub health_score: f64,
}

impl From<&SystemCircuitBreakerMetrics> for CircuitStatistics {
    fn from(metrics: &SystemCircuitBreakerMetrics) -> Self {
        let counts = metrics.count_by_state();
        Self {
            breakers: metrics.circuit_breakers.len(),
            open: metrics.open_circuits(),
            half_open: counts.get(&CircuitState::HalfOpen).copied().unwrap_or(0),
            total_calls: metrics.total_calls(),
            failure_rate: metrics.system_failure_rate(),
            health_score: metrics.health_score(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemAnalyticsReport {
    pub generated_at: DateTime<Utc>,
    pub jobs: JobStatistics,
    pub strategies: Vec<StrategyStatistics>,
    pub steps: Vec<StepStatistics>,
    pub services: Vec<ServiceStatistics>,
    pub forecasts: Vec<ResourceForecast>,
    /// Finished jobs per hour across the history window
    pub throughput_per_hour: Option<f64>,
    pub circuit_breakers: CircuitStatistics,
    pub bottlenecks: Vec<Bottleneck>,
    pub recommendations: Vec<Recommendation>,
}

/// Least-squares line through `points`; `None` when x has no spread
pub fn linear_fit(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let sxx: f64 = points.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
    if sxx <= f64::EPSILON {
        return None;
    }
    let sxy: f64 = points
        .iter()
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum();
    let slope = sxy / sxx;
    Some((slope, mean_y - slope * mean_x))
}

/// Exponentially weighted moving average, oldest value first
pub fn ewma(values: impl IntoIterator<Item = f64>, alpha: f64) -> Option<f64> {
    values.into_iter().fold(None, |acc, value| match acc {
        None => Some(value),
        Some(previous) => Some(alpha * value + (1.0 - alpha) * previous),
    })
}

fn rate(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

pub struct AnalyticsEngine {
    config: AnalyticsConfig,
    history: Mutex<VecDeque<JobSummary>>,
    samples: Mutex<VecDeque<UtilizationSample>>,
    sinks: Vec<Arc<dyn HistorySink>>,
}

impl std::fmt::Debug for AnalyticsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyticsEngine")
            .field("history", &self.history.lock().len())
            .field("samples", &self.samples.lock().len())
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl AnalyticsEngine {
    pub fn new(config: AnalyticsConfig) -> Self {
        Self {
            config,
            history: Mutex::new(VecDeque::new()),
            samples: Mutex::new(VecDeque::new()),
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn HistorySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    pub fn record_job(&self, summary: JobSummary) {
        for sink in &self.sinks {
            sink.record(&summary);
        }
        let mut history = self.history.lock();
        if history.len() >= self.config.history_capacity.max(1) {
            history.pop_front();
        }
        history.push_back(summary);
    }

    pub fn record_utilization(&self, utilization: &ResourceUtilization) {
        let sample = UtilizationSample {
            captured_at: utilization.captured_at,
            saturation: utilization
                .dimensions
                .iter()
                .map(|d| (d.resource_type, d.saturation()))
                .collect(),
        };
        let mut samples = self.samples.lock();
        if samples.len() >= self.config.sample_capacity.max(1) {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn sample_len(&self) -> usize {
        self.samples.lock().len()
    }

    fn job_statistics(history: &[JobSummary]) -> JobStatistics {
        let total = history.len();
        let count = |status: JobStatus| history.iter().filter(|s| s.status == status).count();
        let completed = count(JobStatus::Completed);
        let ratios: Vec<f64> = history.iter().filter_map(JobSummary::estimate_ratio).collect();

        JobStatistics {
            total,
            completed,
            failed: count(JobStatus::Failed),
            cancelled: count(JobStatus::Cancelled),
            success_rate: rate(completed, total),
            average_duration_secs: if total == 0 {
                0.0
            } else {
                history.iter().map(|s| s.actual_duration_secs).sum::<f64>() / total as f64
            },
            estimate_ratio: (!ratios.is_empty())
                .then(|| ratios.iter().sum::<f64>() / ratios.len() as f64),
            average_rollbacks: if total == 0 {
                0.0
            } else {
                history.iter().map(|s| f64::from(s.rollbacks)).sum::<f64>() / total as f64
            },
        }
    }

    fn strategy_statistics(history: &[JobSummary]) -> Vec<StrategyStatistics> {
        let mut grouped: BTreeMap<String, (ProcessingStrategy, usize, usize, f64)> =
            BTreeMap::new();
        for summary in history {
            let entry = grouped
                .entry(summary.strategy.to_string())
                .or_insert((summary.strategy, 0, 0, 0.0));
            entry.1 += 1;
            if summary.status == JobStatus::Completed {
                entry.2 += 1;
            }
            entry.3 += summary.actual_duration_secs;
        }
        grouped
            .into_values()
            .map(|(strategy, jobs, completed, duration)| StrategyStatistics {
                strategy,
                jobs,
                success_rate: rate(completed, jobs),
                average_duration_secs: duration / jobs as f64,
            })
            .collect()
    }

    fn step_statistics(history: &[JobSummary]) -> Vec<StepStatistics> {
        let mut grouped: BTreeMap<StepType, (usize, usize, u64, u64)> = BTreeMap::new();
        for step in history.iter().flat_map(|s| &s.steps) {
            let entry = grouped.entry(step.step_type).or_default();
            entry.0 += 1;
            if !step.succeeded {
                entry.1 += 1;
            }
            entry.2 += step.duration_ms;
            entry.3 += u64::from(step.attempts);
        }
        grouped
            .into_iter()
            .map(|(step_type, (runs, failures, duration, attempts))| StepStatistics {
                step_type,
                runs,
                failures,
                failure_rate: rate(failures, runs),
                average_duration_ms: duration as f64 / runs as f64,
                average_attempts: attempts as f64 / runs as f64,
            })
            .collect()
    }

    fn service_statistics(history: &[JobSummary]) -> Vec<ServiceStatistics> {
        let mut grouped: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
        for step in history.iter().flat_map(|s| &s.steps) {
            let entry = grouped.entry(step.service.as_str()).or_default();
            entry.0 += 1;
            if !step.succeeded {
                entry.1 += 1;
            }
        }
        grouped
            .into_iter()
            .map(|(service, (runs, failures))| ServiceStatistics {
                service: service.to_string(),
                runs,
                failures,
                failure_rate: rate(failures, runs),
            })
            .collect()
    }

    /// Trend forecast for every dimension seen in the sample window
    pub fn forecasts(&self) -> Vec<ResourceForecast> {
        let samples: Vec<UtilizationSample> = self.samples.lock().iter().cloned().collect();
        let Some(first) = samples.first() else {
            return Vec::new();
        };
        let origin = first.captured_at;
        let horizon = f64::from(self.config.forecast_horizon_minutes);

        ResourceType::ALL
            .iter()
            .filter_map(|&resource_type| {
                let points: Vec<(f64, f64)> = samples
                    .iter()
                    .filter_map(|s| {
                        let minutes =
                            (s.captured_at - origin).num_milliseconds() as f64 / 60_000.0;
                        s.saturation.get(&resource_type).map(|v| (minutes, *v))
                    })
                    .collect();
                let &(last_x, current) = points.last()?;
                let smoothed = ewma(points.iter().map(|(_, y)| *y), EWMA_ALPHA).unwrap_or(current);
                let (slope, intercept) = linear_fit(&points).unwrap_or((0.0, current));
                let predicted = if slope == 0.0 {
                    current
                } else {
                    intercept + slope * (last_x + horizon)
                };
                let minutes_to_exhaustion = if current >= 1.0 {
                    Some(0.0)
                } else if slope > 1e-9 {
                    Some((1.0 - current) / slope)
                } else {
                    None
                };

                Some(ResourceForecast {
                    resource_type,
                    current_saturation: current,
                    smoothed_saturation: smoothed,
                    trend_per_minute: slope,
                    predicted_saturation: predicted.clamp(0.0, 1.0),
                    horizon_minutes: self.config.forecast_horizon_minutes,
                    minutes_to_exhaustion,
                    samples: points.len(),
                })
            })
            .collect()
    }

    fn throughput_per_hour(history: &[JobSummary]) -> Option<f64> {
        let first = history.iter().map(|s| s.finished_at).min()?;
        let last = history.iter().map(|s| s.finished_at).max()?;
        let hours = (last - first).num_milliseconds() as f64 / 3_600_000.0;
        (history.len() >= 2 && hours > 0.0).then(|| history.len() as f64 / hours)
    }

    fn bottlenecks(
        &self,
        forecasts: &[ResourceForecast],
        steps: &[StepStatistics],
        services: &[ServiceStatistics],
        open_circuits: &[String],
        health: &[ServiceHealthSummary],
    ) -> Vec<Bottleneck> {
        let mut found = Vec::new();
        let threshold = self.config.bottleneck_saturation;

        for forecast in forecasts {
            let level = forecast.smoothed_saturation.max(forecast.current_saturation);
            if level >= threshold {
                found.push(Bottleneck {
                    kind: BottleneckKind::Resource,
                    subject: forecast.resource_type.to_string(),
                    severity: level.clamp(0.0, 1.0),
                    detail: format!(
                        "{} saturation at {:.0}%, forecast {:.0}% in {} min",
                        forecast.resource_type,
                        level * 100.0,
                        forecast.predicted_saturation * 100.0,
                        forecast.horizon_minutes
                    ),
                });
            }
        }

        for step in steps {
            if step.average_duration_ms >= self.config.slow_step_ms && self.config.slow_step_ms > 0.0 {
                found.push(Bottleneck {
                    kind: BottleneckKind::SlowStep,
                    subject: step.step_type.to_string(),
                    severity: (1.0 - self.config.slow_step_ms / step.average_duration_ms)
                        .clamp(0.0, 1.0),
                    detail: format!(
                        "{} steps average {:.0}ms over {} runs",
                        step.step_type, step.average_duration_ms, step.runs
                    ),
                });
            }
        }

        for service in services {
            if service.runs >= MIN_RUNS_FOR_RATES
                && service.failure_rate >= self.config.failure_rate_threshold
            {
                found.push(Bottleneck {
                    kind: BottleneckKind::UnreliableService,
                    subject: service.service.clone(),
                    severity: service.failure_rate.clamp(0.0, 1.0),
                    detail: format!(
                        "{} failed {} of {} step runs",
                        service.service, service.failures, service.runs
                    ),
                });
            }
        }

        for breaker in open_circuits {
            found.push(Bottleneck {
                kind: BottleneckKind::OpenCircuit,
                subject: breaker.clone(),
                severity: 1.0,
                detail: format!("circuit {breaker} is open"),
            });
        }

        for summary in health.iter().filter(|s| s.unhealthy_majority()) {
            found.push(Bottleneck {
                kind: BottleneckKind::UnhealthyService,
                subject: summary.service_name.clone(),
                severity: rate(summary.unhealthy, summary.total),
                detail: format!(
                    "{} of {} {} instances unhealthy",
                    summary.unhealthy, summary.total, summary.service_name
                ),
            });
        }

        found
    }

    fn recommendations(
        bottlenecks: &[Bottleneck],
        forecasts: &[ResourceForecast],
        jobs: &JobStatistics,
        strategies: &[StrategyStatistics],
    ) -> Vec<Recommendation> {
        let mut out = Vec::new();

        for bottleneck in bottlenecks {
            let (priority, category, message) = match bottleneck.kind {
                BottleneckKind::Resource => {
                    let exhausting = forecasts.iter().any(|f| {
                        f.resource_type.to_string() == bottleneck.subject
                            && f.minutes_to_exhaustion
                                .is_some_and(|m| m <= f64::from(f.horizon_minutes))
                    });
                    (
                        if exhausting {
                            RecommendationPriority::High
                        } else {
                            RecommendationPriority::Medium
                        },
                        "capacity",
                        format!("Add {} capacity: {}", bottleneck.subject, bottleneck.detail),
                    )
                }
                BottleneckKind::SlowStep => (
                    RecommendationPriority::Medium,
                    "performance",
                    format!(
                        "Scale out the services running {} steps: {}",
                        bottleneck.subject, bottleneck.detail
                    ),
                ),
                BottleneckKind::UnreliableService => (
                    RecommendationPriority::High,
                    "reliability",
                    format!("Investigate {}: {}", bottleneck.subject, bottleneck.detail),
                ),
                BottleneckKind::OpenCircuit => (
                    RecommendationPriority::High,
                    "availability",
                    format!("Restore the service behind {}", bottleneck.detail),
                ),
                BottleneckKind::UnhealthyService => (
                    RecommendationPriority::High,
                    "availability",
                    format!("Replace unhealthy instances: {}", bottleneck.detail),
                ),
            };
            out.push(Recommendation {
                priority,
                category: category.to_string(),
                message,
            });
        }

        if jobs.total >= MIN_RUNS_FOR_RATES {
            match jobs.estimate_ratio {
                Some(ratio) if ratio > ESTIMATE_UNDERSHOOT => out.push(Recommendation {
                    priority: RecommendationPriority::Medium,
                    category: "analysis".to_string(),
                    message: format!(
                        "Jobs run {ratio:.1}x longer than estimated; raise analyzer cost weights"
                    ),
                }),
                Some(ratio) if ratio < ESTIMATE_OVERSHOOT => out.push(Recommendation {
                    priority: RecommendationPriority::Low,
                    category: "analysis".to_string(),
                    message: format!(
                        "Jobs finish in {:.0}% of the estimate; lower analyzer cost weights",
                        ratio * 100.0
                    ),
                }),
                _ => {}
            }
        }

        for strategy in strategies {
            if strategy.jobs >= MIN_RUNS_FOR_RATES && strategy.success_rate < STRATEGY_SUCCESS_FLOOR {
                out.push(Recommendation {
                    priority: RecommendationPriority::Medium,
                    category: "strategy".to_string(),
                    message: format!(
                        "{} jobs succeed {:.0}% of the time; review its workflow template",
                        strategy.strategy,
                        strategy.success_rate * 100.0
                    ),
                });
            }
        }

        out.sort_by(|a, b| b.priority.cmp(&a.priority));
        out
    }

    /// Build a full report. Breaker and registry state are passed in so the
    /// engine holds no references to live components.
    pub fn report(
        &self,
        breakers: &SystemCircuitBreakerMetrics,
        health: &[ServiceHealthSummary],
    ) -> SystemAnalyticsReport {
        let circuit_breakers = CircuitStatistics::from(breakers);
        let history: Vec<JobSummary> = self.history.lock().iter().cloned().collect();
        let jobs = Self::job_statistics(&history);
        let strategies = Self::strategy_statistics(&history);
        let steps = Self::step_statistics(&history);
        let services = Self::service_statistics(&history);
        let forecasts = self.forecasts();
        let bottlenecks =
            self.bottlenecks(&forecasts, &steps, &services, &circuit_breakers.open, health);
        let recommendations = Self::recommendations(&bottlenecks, &forecasts, &jobs, &strategies);

        debug!(
            jobs = jobs.total,
            bottlenecks = bottlenecks.len(),
            recommendations = recommendations.len(),
            "Analytics report built"
        );

        SystemAnalyticsReport {
            generated_at: Utc::now(),
            throughput_per_hour: Self::throughput_per_hour(&history),
            jobs,
            strategies,
            steps,
            services,
            forecasts,
            circuit_breakers,
            bottlenecks,
            recommendations,
        }
    }

    /// Sample pool utilization on the configured interval until `shutdown`
    /// flips to true
    pub fn spawn_sampler(
        self: Arc<Self>,
        allocator: Arc<ResourceAllocator>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sample_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                interval_ms = self.config.sample_interval_ms,
                "📊 Utilization sampler started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.record_utilization(&allocator.utilization());
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Utilization sampler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::sink::{InMemoryHistorySink, StepRecord};
    use crate::models::{DimensionUsage, JobComplexity};
    use crate::resilience::CircuitBreakerMetrics;

    fn utilization(at_minutes: i64, cpu: f64) -> ResourceUtilization {
        ResourceUtilization {
            dimensions: vec![
                DimensionUsage {
                    resource_type: ResourceType::Cpu,
                    total: 100.0,
                    available: 100.0 - cpu * 100.0,
                    reserved: cpu * 100.0,
                },
                DimensionUsage {
                    resource_type: ResourceType::Memory,
                    total: 100.0,
                    available: 90.0,
                    reserved: 10.0,
                },
            ],
            active_allocations: 1,
            captured_at: DateTime::<Utc>::from_timestamp(1_700_000_000, 0)
                .unwrap_or_else(Utc::now)
                + chrono::Duration::minutes(at_minutes),
        }
    }

    fn summary(job_id: &str, status: JobStatus, service_failed: bool) -> JobSummary {
        JobSummary {
            job_id: job_id.to_string(),
            workflow_id: None,
            strategy: ProcessingStrategy::BalancedAsync,
            complexity: JobComplexity::Moderate,
            status,
            estimated_duration_secs: 10.0,
            actual_duration_secs: 30.0,
            steps: vec![StepRecord {
                step_name: "render".to_string(),
                step_type: StepType::Rendering,
                service: "render-service".to_string(),
                attempts: 2,
                duration_ms: 90_000,
                succeeded: !service_failed,
            }],
            rollbacks: 0,
            error_code: None,
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_linear_fit_and_ewma() {
        let (slope, intercept) = linear_fit(&[(0.0, 1.0), (1.0, 3.0), (2.0, 5.0)]).unwrap();
        assert!((slope - 2.0).abs() < 1e-9);
        assert!((intercept - 1.0).abs() < 1e-9);
        assert!(linear_fit(&[(1.0, 1.0), (1.0, 2.0)]).is_none());
        assert!(linear_fit(&[(1.0, 1.0)]).is_none());

        assert_eq!(ewma(Vec::<f64>::new(), 0.5), None);
        assert_eq!(ewma(vec![1.0, 0.0], 0.5), Some(0.5));
    }

    #[test]
    fn test_forecast_projects_rising_trend() {
        let engine = AnalyticsEngine::new(AnalyticsConfig {
            forecast_horizon_minutes: 10,
            ..AnalyticsConfig::default()
        });
        for minute in 0..5 {
            engine.record_utilization(&utilization(minute, 0.1 + 0.05 * minute as f64));
        }

        let forecasts = engine.forecasts();
        let cpu = forecasts
            .iter()
            .find(|f| f.resource_type == ResourceType::Cpu)
            .unwrap();
        assert!((cpu.trend_per_minute - 0.05).abs() < 1e-6);
        assert!((cpu.predicted_saturation - 0.8).abs() < 1e-6);
        assert!((cpu.minutes_to_exhaustion.unwrap() - 14.0).abs() < 1e-6);

        let memory = forecasts
            .iter()
            .find(|f| f.resource_type == ResourceType::Memory)
            .unwrap();
        assert!(memory.minutes_to_exhaustion.is_none());
        assert!((memory.predicted_saturation - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_sample_window_is_bounded() {
        let engine = AnalyticsEngine::new(AnalyticsConfig {
            sample_capacity: 3,
            history_capacity: 2,
            ..AnalyticsConfig::default()
        });
        for minute in 0..10 {
            engine.record_utilization(&utilization(minute, 0.2));
        }
        for id in ["a", "b", "c"] {
            engine.record_job(summary(id, JobStatus::Completed, false));
        }
        assert_eq!(engine.sample_len(), 3);
        assert_eq!(engine.history_len(), 2);
    }

    #[test]
    fn test_report_flags_bottlenecks_and_recommends() {
        let sink = Arc::new(InMemoryHistorySink::new(10));
        let engine = AnalyticsEngine::new(AnalyticsConfig::default()).with_sink(sink.clone());
        engine.record_utilization(&utilization(0, 0.9));
        engine.record_utilization(&utilization(1, 0.95));
        engine.record_job(summary("a", JobStatus::Completed, false));
        engine.record_job(summary("b", JobStatus::Failed, true));
        engine.record_job(summary("c", JobStatus::Failed, true));

        let mut breakers = SystemCircuitBreakerMetrics::new();
        breakers.add_circuit_breaker(
            "render-service::rendering".to_string(),
            CircuitBreakerMetrics {
                total_calls: 4,
                failure_count: 4,
                ..CircuitBreakerMetrics::new()
            }
            .finalize(CircuitState::Open),
        );
        let report = engine.report(&breakers, &[]);

        assert_eq!(sink.len(), 3);
        assert_eq!(report.jobs.total, 3);
        assert_eq!(report.jobs.failed, 2);
        assert_eq!(report.jobs.estimate_ratio, Some(3.0));

        let kinds: Vec<BottleneckKind> = report.bottlenecks.iter().map(|b| b.kind).collect();
        assert!(kinds.contains(&BottleneckKind::Resource));
        assert!(kinds.contains(&BottleneckKind::SlowStep));
        assert!(kinds.contains(&BottleneckKind::UnreliableService));
        assert!(kinds.contains(&BottleneckKind::OpenCircuit));
        assert_eq!(report.circuit_breakers.open, vec!["render-service::rendering"]);
        assert_eq!(report.circuit_breakers.failure_rate, 1.0);
        assert_eq!(report.circuit_breakers.health_score, 0.0);

        assert!(!report.recommendations.is_empty());
        assert_eq!(report.recommendations[0].priority, RecommendationPriority::High);
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.category == "analysis"));
        assert!(report
            .recommendations
            .windows(2)
            .all(|w| w[0].priority >= w[1].priority));
    }

    #[test]
    fn test_empty_report() {
        let engine = AnalyticsEngine::new(AnalyticsConfig::default());
        let report = engine.report(&SystemCircuitBreakerMetrics::new(), &[]);
        assert_eq!(report.jobs.total, 0);
        assert!(report.forecasts.is_empty());
        assert!(report.bottlenecks.is_empty());
        assert!(report.throughput_per_hour.is_none());
        assert_eq!(report.circuit_breakers.breakers, 0);
        assert_eq!(report.circuit_breakers.health_score, 1.0);
    }
}
