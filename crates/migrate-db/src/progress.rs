//! Observational progress reporting.

use tracing::info;

/// Receives one line per phase transition and table outcome.
///
/// Implementations must not panic; reporting never affects the migration.
pub trait ProgressSink: Send + Sync {
    fn report(&self, line: &str);
}

/// Forwards every line to `tracing::info!`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&self, line: &str) {
        info!(target: "migrate_db::progress", "{}", line);
    }
}

impl<F> ProgressSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn report(&self, line: &str) {
        self(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_closure_sink() {
        let lines = Mutex::new(Vec::new());
        let sink = |line: &str| lines.lock().unwrap().push(line.to_string());
        sink.report("Discovering schema");
        LogProgress.report("ignored by tests");
        assert_eq!(*lines.lock().unwrap(), vec!["Discovering schema"]);
    }
}
