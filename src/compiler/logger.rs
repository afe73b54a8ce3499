//! Diagnostic sink for a compile
//!
//! Statement-level problems are logged here instead of aborting, so one pass
//! over a program reports every independent error it can find.

use crate::error::{Error, ErrorSeverity};
use crate::parser::Location;
use std::fmt;
use tracing::{debug, warn};

/// One logged problem
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    /// Error or warning
    pub severity: ErrorSeverity,
    /// What went wrong
    pub error: Error,
    /// Source position, when the tree was parsed from text
    pub location: Option<Location>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(loc) = self.location {
            write!(f, "{}: ", loc)?;
        }
        write!(f, "{}", self.error)
    }
}

/// Collects errors and warnings in emission order
#[derive(Debug, Clone, Default)]
pub struct Logger {
    diagnostics: Vec<Diagnostic>,
    max_errors: usize,
    warnings_as_errors: bool,
    error_count: usize,
}

impl Logger {
    /// Logger with no error limit
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop storing errors after `max` of them (0 keeps everything)
    pub fn with_max_errors(mut self, max: usize) -> Self {
        self.max_errors = max;
        self
    }

    /// Report warnings as errors
    pub fn with_warnings_as_errors(mut self, enabled: bool) -> Self {
        self.warnings_as_errors = enabled;
        self
    }

    /// Log an error
    pub fn error(&mut self, error: Error, location: Option<Location>) {
        self.error_count += 1;
        debug!(%error, ?location, "compile error");
        if self.max_errors == 0 || self.errors().count() < self.max_errors {
            self.diagnostics.push(Diagnostic {
                severity: ErrorSeverity::Recoverable,
                error,
                location,
            });
        }
    }

    /// Log a warning
    pub fn warning(&mut self, message: impl Into<String>, location: Option<Location>) {
        let message = message.into();
        if self.warnings_as_errors {
            self.error(Error::execution(message), location);
            return;
        }
        warn!(%message, ?location, "compile warning");
        self.diagnostics.push(Diagnostic {
            severity: ErrorSeverity::Warning,
            error: Error::execution(message),
            location,
        });
    }

    /// Logged errors
    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity != ErrorSeverity::Warning)
    }

    /// Logged warnings
    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == ErrorSeverity::Warning)
    }

    /// Every diagnostic in emission order
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// True once an error has been logged
    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }

    /// Number of errors logged, including ones dropped by the limit
    pub fn error_count(&self) -> usize {
        self.error_count
    }

    /// True when the error limit has been reached
    pub fn limit_reached(&self) -> bool {
        self.max_errors != 0 && self.error_count >= self.max_errors
    }

    /// Forget everything logged so far
    pub fn clear(&mut self) {
        self.diagnostics.clear();
        self.error_count = 0;
    }

    /// Aggregate the logged errors into a single [`Error::Compilation`]
    pub fn to_error(&self) -> Error {
        Error::Compilation {
            errors: self.errors().map(|d| d.to_string()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_and_warnings_are_separated() {
        let mut logger = Logger::new();
        logger.warning("shadowed", None);
        logger.error(Error::unsupported("&", "float"), Some(Location { line: 2, col: 5 }));
        assert!(logger.has_errors());
        assert_eq!(logger.errors().count(), 1);
        assert_eq!(logger.warnings().count(), 1);
        let msg = logger.to_error().to_string();
        assert!(msg.contains("2:5"));
    }

    #[test]
    fn test_max_errors() {
        let mut logger = Logger::new().with_max_errors(2);
        for _ in 0..5 {
            logger.error(Error::execution("x"), None);
        }
        assert_eq!(logger.errors().count(), 2);
        assert_eq!(logger.error_count(), 5);
        assert!(logger.limit_reached());
    }

    #[test]
    fn test_warnings_as_errors() {
        let mut logger = Logger::new().with_warnings_as_errors(true);
        logger.warning("shadowed", None);
        assert!(logger.has_errors());
    }
}
