//! Destination for agent telemetry
//!
//! The session handler hands every metrics report, event and command result to
//! a [`TelemetrySink`]. [`LoggingSink`] only logs; persistence or forwarding is
//! plugged in by implementing the trait.

use async_trait::async_trait;
use canopy_proto::{CommandResult, EventReport, EventSeverity, MetricsReport};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

/// Which session and message a telemetry item came from
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub cluster_id: String,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn record_metrics(&self, context: &SessionContext, report: &MetricsReport);

    async fn record_event(&self, context: &SessionContext, event: &EventReport);

    async fn record_command_result(&self, context: &SessionContext, result: &CommandResult);
}

/// Logs telemetry through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSink;

#[async_trait]
impl TelemetrySink for LoggingSink {
    async fn record_metrics(&self, context: &SessionContext, report: &MetricsReport) {
        debug!(
            session_id = %context.session_id,
            cluster_id = %context.cluster_id,
            jobs = report.jobs.len(),
            "Received metrics"
        );
        for job in &report.jobs {
            debug!(
                session_id = %context.session_id,
                job_id = %job.job_id,
                state = ?job.state,
                parallelism = job.parallelism,
                records_in_per_sec = job.records_in_per_sec,
                records_out_per_sec = job.records_out_per_sec,
                backpressure = ?job.backpressure,
                "Job metrics"
            );
        }
    }

    async fn record_event(&self, context: &SessionContext, event: &EventReport) {
        let job_id = event.job_id.as_deref().unwrap_or("-");
        match event.severity {
            EventSeverity::Info => info!(
                session_id = %context.session_id,
                event_type = %event.event_type,
                job_id,
                "{}", event.message
            ),
            EventSeverity::Warning => warn!(
                session_id = %context.session_id,
                event_type = %event.event_type,
                job_id,
                "{}", event.message
            ),
            EventSeverity::Error | EventSeverity::Critical => error!(
                session_id = %context.session_id,
                event_type = %event.event_type,
                severity = ?event.severity,
                job_id,
                "{}", event.message
            ),
        }
    }

    async fn record_command_result(&self, context: &SessionContext, result: &CommandResult) {
        if result.success {
            info!(
                session_id = %context.session_id,
                command_id = %result.command_id,
                "Command succeeded: {}", result.message
            );
        } else {
            warn!(
                session_id = %context.session_id,
                command_id = %result.command_id,
                "Command failed: {}", result.message
            );
        }
    }
}
