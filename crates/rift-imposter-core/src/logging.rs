//! Scoped logger handed to matching, resolution and injected code.
//!
//! Log lines go through `tracing` with a `scope` field identifying the
//! imposter (e.g. `http:2525`). The dry-run validator uses a silenced logger
//! that drops debug/info/warn but keeps the error channel.

use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

/// Log level for a single buffered entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One log call captured from an injected script.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

/// Clonable logger with a scope prefix and an optional silenced mode.
#[derive(Clone)]
pub struct ScopedLogger {
    scope: Arc<str>,
    silenced: bool,
}

impl fmt::Debug for ScopedLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedLogger")
            .field("scope", &self.scope)
            .field("silenced", &self.silenced)
            .finish()
    }
}

impl Default for ScopedLogger {
    fn default() -> Self {
        Self::new("imposter")
    }
}

impl ScopedLogger {
    pub fn new(scope: impl AsRef<str>) -> Self {
        Self {
            scope: Arc::from(scope.as_ref()),
            silenced: false,
        }
    }

    /// Logger scoped to a child of this one, e.g. `http:2525` -> `http:2525:stub`.
    pub fn with_scope(&self, child: &str) -> Self {
        Self {
            scope: Arc::from(format!("{}:{}", self.scope, child)),
            silenced: self.silenced,
        }
    }

    /// Copy of this logger that only emits errors.
    pub fn silenced(&self) -> Self {
        Self {
            scope: self.scope.clone(),
            silenced: true,
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn is_silenced(&self) -> bool {
        self.silenced
    }

    pub fn debug(&self, message: impl fmt::Display) {
        if !self.silenced {
            tracing::debug!(scope = %self.scope, "{}", message);
        }
    }

    pub fn info(&self, message: impl fmt::Display) {
        if !self.silenced {
            tracing::info!(scope = %self.scope, "{}", message);
        }
    }

    pub fn warn(&self, message: impl fmt::Display) {
        if !self.silenced {
            tracing::warn!(scope = %self.scope, "{}", message);
        }
    }

    pub fn error(&self, message: impl fmt::Display) {
        tracing::error!(scope = %self.scope, "{}", message);
    }

    pub fn log(&self, entry: &LogEntry) {
        match entry.level {
            LogLevel::Debug => self.debug(&entry.message),
            LogLevel::Info => self.info(&entry.message),
            LogLevel::Warn => self.warn(&entry.message),
            LogLevel::Error => self.error(&entry.message),
        }
    }

    /// Replay entries captured inside an injected script.
    pub fn replay(&self, entries: &[LogEntry]) {
        for entry in entries {
            self.log(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_with_scope_appends_child() {
        let logger = ScopedLogger::new("http:2525").with_scope("stub");
        assert_eq!(logger.scope(), "http:2525:stub");
    }

    #[traced_test]
    #[test]
    fn test_silenced_logger_keeps_errors() {
        let logger = ScopedLogger::new("tcp:3000").silenced();
        assert!(logger.is_silenced());
        logger.info("dropped info line");
        logger.error("kept error line");
        assert!(!logs_contain("dropped info line"));
        assert!(logs_contain("kept error line"));
    }

    #[traced_test]
    #[test]
    fn test_replay_routes_by_level() {
        let logger = ScopedLogger::new("http:4545");
        logger.replay(&[
            LogEntry {
                level: LogLevel::Warn,
                message: "from script".to_string(),
            },
            LogEntry {
                level: LogLevel::Error,
                message: "script failure".to_string(),
            },
        ]);
        assert!(logs_contain("from script"));
        assert!(logs_contain("script failure"));
    }
}
