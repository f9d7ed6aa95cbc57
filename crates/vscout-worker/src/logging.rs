//! Structured logging for the worker.

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vscout_models::JobId;

/// Install the global subscriber. `LOG_FORMAT=json` switches to JSON lines;
/// `RUST_LOG` refines the default `vscout=info` filter.
pub fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,vscout=info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if use_json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry
            .with(fmt::layer().with_ansi(true).with_target(true))
            .try_init()
    };

    if let Err(e) = result {
        eprintln!("tracing subscriber already installed: {}", e);
    }
}

/// Lifecycle logging for one job within one component.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    operation: &'static str,
}

impl JobLogger {
    /// `operation` names the component, e.g. `"orchestrate"` or `"finalize"`.
    pub fn new(job_id: &JobId, operation: &'static str) -> Self {
        Self {
            job_id: job_id.to_string(),
            operation,
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(job_id = %self.job_id, operation = self.operation, "Job started: {}", message);
    }

    pub fn log_progress(&self, message: &str) {
        info!(job_id = %self.job_id, operation = self.operation, "Job progress: {}", message);
    }

    pub fn log_error(&self, message: &str) {
        error!(job_id = %self.job_id, operation = self.operation, "Job error: {}", message);
    }

    pub fn log_completion(&self, message: &str) {
        info!(job_id = %self.job_id, operation = self.operation, "Job completed: {}", message);
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn operation(&self) -> &str {
        self.operation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_logger_fields() {
        let job_id = JobId::from_string("job_42");
        let logger = JobLogger::new(&job_id, "finalize");
        assert_eq!(logger.job_id(), "job_42");
        assert_eq!(logger.operation(), "finalize");
        logger.log_progress("2/3 chunks complete");
    }

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        init_tracing();
        init_tracing();
    }
}
