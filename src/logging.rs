//! # Structured Logging Module
//!
//! Environment-aware structured logging for the orchestration core. Console
//! output is human readable; deployments that ship logs to a collector turn on
//! `telemetry.json_logs` for one JSON object per event.

use chrono::Utc;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::TelemetryConfig;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment defaults
pub fn init_structured_logging() {
    init_with_telemetry(&TelemetryConfig::default());
}

/// Initialize structured logging from the telemetry section. Only the first
/// call in a process has any effect.
pub fn init_with_telemetry(telemetry: &TelemetryConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let default_level = telemetry
            .log_level
            .clone()
            .unwrap_or_else(|| get_log_level(&environment).to_string());
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_level));

        let console_layer = (!telemetry.json_logs).then(|| {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true)
        });
        let json_layer = telemetry.json_logs.then(|| {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
        });

        // A host application may already own the global subscriber
        if tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(json_layer)
            .try_init()
            .is_err()
        {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            json = telemetry.json_logs,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

fn get_environment() -> String {
    std::env::var("REELFLOW_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        "test" => "warn",
        _ => "debug",
    }
}

/// Log structured data for job-level operations
pub fn log_job_operation(
    operation: &str,
    job_id: &str,
    strategy: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        job_id = %job_id,
        strategy = strategy,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🎬 JOB_OPERATION"
    );
}

/// Log structured data for workflow operations
pub fn log_workflow_operation(
    operation: &str,
    workflow_id: &str,
    job_id: &str,
    step_name: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        workflow_id = %workflow_id,
        job_id = %job_id,
        step_name = step_name,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🔧 WORKFLOW_OPERATION"
    );
}

/// Log structured data for resource allocation operations
pub fn log_allocation_operation(
    operation: &str,
    allocation_id: &str,
    job_id: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        allocation_id = %allocation_id,
        job_id = %job_id,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📦 ALLOCATION_OPERATION"
    );
}

/// Log structured data for service registry operations
pub fn log_service_operation(
    operation: &str,
    service_name: &str,
    instance_id: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        service_name = %service_name,
        instance_id = instance_id,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📚 SERVICE_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}
