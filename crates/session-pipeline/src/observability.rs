//! # Observability
//!
//! One-call setup of a `tracing` subscriber for pipeline runs.
//!
//! Every run is traced as a `pipeline_run` span containing one `stage` span
//! per stage and one `task` span per task, so a log line can always be tied
//! back to the session, stage and task that produced it.

use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Configuration for initializing the observability system.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// The maximum level captured for `session_pipeline` events.
    pub level: Level,
    /// The target for the logs.
    pub target: LogTarget,
    /// Print the emitting module path on each line.
    pub show_target: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            target: LogTarget::default(),
            show_target: true,
        }
    }
}

impl ObservabilityConfig {
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_target(mut self, target: LogTarget) -> Self {
        self.target = target;
        self
    }
}

/// Defines the output target for logs.
#[derive(Debug, Clone, Default)]
pub enum LogTarget {
    /// Log to the console (stdout).
    #[default]
    Console,
    /// Log to a file, truncating it.
    File(String),
}

/// Initializes the global tracing subscriber.
///
/// Call once at the start of `main`. `RUST_LOG` directives are honoured in
/// addition to the configured level. Fails if a global subscriber is already
/// installed.
pub fn init(config: ObservabilityConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("session_pipeline={}", config.level).parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    match config.target {
        LogTarget::Console => {
            let layer = fmt::layer()
                .with_writer(std::io::stdout)
                .with_target(config.show_target);
            subscriber.with(layer).try_init()?;
        }
        LogTarget::File(path) => {
            let file = std::fs::File::create(path)?;
            let layer = fmt::layer()
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .with_target(config.show_target);
            subscriber.with(layer).try_init()?;
        }
    };

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ObservabilityConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(matches!(config.target, LogTarget::Console));
    }

    #[test]
    fn test_builder() {
        let config = ObservabilityConfig::default()
            .with_level(Level::DEBUG)
            .with_target(LogTarget::File("run.log".to_string()));
        assert_eq!(config.level, Level::DEBUG);
        assert!(matches!(config.target, LogTarget::File(ref p) if p == "run.log"));
    }
}
