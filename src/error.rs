//! Custom error types for the crate.
//!
//! This module defines the primary error type, `TspError`, for the whole
//! deployment stack. Using the `thiserror` crate, it provides a centralized
//! and consistent way to report the failure classes the script protocols
//! distinguish between.
//!
//! ## Error Hierarchy
//!
//! - **`InvalidArgument`**: A required identifier, path or collection was blank
//!   or missing. Raised before any device I/O and never retried.
//! - **`FileNotFound`**: A script source file does not exist. Also raised before
//!   anything is written to the transport.
//! - **`Device`**: The instrument error queue was non-empty. Carries the parsed
//!   queue entries together with the last action breadcrumb.
//! - **`InvalidOperation`**: The instrument ended up in an unexpected state
//!   (e.g. `IdleError` in the middle of a script body, or an object that should
//!   exist is nil).
//! - **`InvalidState`**: A local model invariant was violated (e.g. adding a
//!   subsystem to an SMU collection whose unit is not set).
//! - **`Timeout`**: A bounded polling loop expired and the active
//!   [`TimeoutPolicy`](crate::firmware::TimeoutPolicy) asked for an error.
//! - **`Transport`** / **`Io`**: The byte channel itself failed.
//! - **`Parse`**: A query reply could not be interpreted.
//!
//! By using `#[from]`, `TspError` can be created from the underlying error
//! types, so protocol code can use the `?` operator throughout.

use crate::config::ConfigError;
use crate::subsystem::ExecutionState;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type TspResult<T> = std::result::Result<T, TspError>;

/// One entry read back from the instrument error queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceError {
    /// Error code, negative for standard SCPI/TSP errors.
    pub code: i32,
    /// Message text reported by the instrument.
    pub message: String,
    /// Severity level (0 informational .. 4 fatal).
    pub severity: i32,
    /// Node that reported the error.
    pub node: i32,
}

impl DeviceError {
    /// Parses a `code<TAB>message<TAB>severity<TAB>node` error queue reply.
    ///
    /// Commas are accepted as separators as well since some firmware prints
    /// the queue entry with `print(a, b, c, d)` and others with `..','..`.
    pub fn parse(reply: &str) -> Option<Self> {
        let reply = reply.trim();
        if reply.is_empty() {
            return None;
        }
        let separator = if reply.contains('\t') { '\t' } else { ',' };
        let mut fields = reply.split(separator).map(str::trim);
        let code = fields.next()?.parse::<f64>().ok()? as i32;
        let mut rest: Vec<&str> = fields.collect();
        let node = rest
            .pop()
            .and_then(|v| v.parse::<f64>().ok())
            .map_or(0, |v| v as i32);
        let severity = rest
            .pop()
            .and_then(|v| v.parse::<f64>().ok())
            .map_or(0, |v| v as i32);
        Some(Self {
            code,
            message: rest.join(",").trim_matches('"').to_string(),
            severity,
            node,
        })
    }

    /// True when the entry is the "queue is empty" placeholder (code 0).
    pub fn is_no_error(&self) -> bool {
        self.code == 0
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{} (severity {}, node {})",
            self.code, self.message, self.severity, self.node
        )
    }
}

fn join_errors(errors: &[DeviceError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Primary error type for the crate.
#[derive(Error, Debug)]
pub enum TspError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Device error while '{last_action}': {}", join_errors(.errors))]
    Device {
        last_action: String,
        errors: Vec<DeviceError>,
    },

    #[error("Invalid operation while '{last_action}' (execution state {execution_state}): {detail}")]
    InvalidOperation {
        last_action: String,
        execution_state: ExecutionState,
        detail: String,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timeout after {timeout:?} while '{action}'")]
    Timeout { action: String, timeout: Duration },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected reply '{reply}' to '{query}'")]
    Parse { query: String, reply: String },
}

impl TspError {
    /// Shorthand for an [`TspError::InvalidArgument`] naming a blank field.
    pub fn blank(field: &str) -> Self {
        Self::InvalidArgument(format!("'{field}' must not be empty"))
    }

    /// Device errors attached to this error, if any.
    pub fn device_errors(&self) -> &[DeviceError] {
        match self {
            Self::Device { errors, .. } => errors,
            _ => &[],
        }
    }

    /// True for the error kinds that batch operations absorb into per-item
    /// outcomes instead of propagating.
    pub fn is_absorbable(&self) -> bool {
        matches!(
            self,
            Self::Device { .. }
                | Self::Transport(_)
                | Self::Io(_)
                | Self::Timeout { .. }
                | Self::Parse { .. }
                | Self::InvalidOperation { .. }
        )
    }
}

/// Fails with [`TspError::InvalidArgument`] when `value` is blank.
pub fn ensure_not_blank(field: &str, value: &str) -> TspResult<()> {
    if value.trim().is_empty() {
        Err(TspError::blank(field))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TspError::InvalidArgument("name".to_string());
        assert_eq!(err.to_string(), "Invalid argument: name");
    }

    #[test]
    fn test_parse_tab_separated_queue_entry() {
        let err = DeviceError::parse("-285\tTSP Syntax error at line 1\t2\t1").unwrap();
        assert_eq!(err.code, -285);
        assert_eq!(err.message, "TSP Syntax error at line 1");
        assert_eq!(err.severity, 2);
        assert_eq!(err.node, 1);
    }

    #[test]
    fn test_parse_comma_separated_queue_entry() {
        let err = DeviceError::parse("-1.00000e+02,Command error,2.00000e+00,2.00000e+00").unwrap();
        assert_eq!(err.code, -100);
        assert_eq!(err.message, "Command error");
        assert_eq!(err.node, 2);
    }

    #[test]
    fn test_parse_no_error_entry() {
        let err = DeviceError::parse("0\tQueue Is Empty\t0\t0").unwrap();
        assert!(err.is_no_error());
        assert!(DeviceError::parse("   ").is_none());
    }

    #[test]
    fn test_device_error_display_joins_entries() {
        let err = TspError::Device {
            last_action: "loading foo".into(),
            errors: vec![
                DeviceError::parse("-285\tsyntax\t2\t1").unwrap(),
                DeviceError::parse("-286\truntime\t2\t1").unwrap(),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("loading foo"));
        assert!(text.contains("-285,syntax"));
        assert!(text.contains("-286,runtime"));
        assert_eq!(err.device_errors().len(), 2);
    }

    #[test]
    fn test_absorbable_kinds() {
        assert!(TspError::Transport("closed".into()).is_absorbable());
        assert!(!TspError::blank("name").is_absorbable());
        assert!(!TspError::FileNotFound("x.tsp".into()).is_absorbable());
    }

    #[test]
    fn test_ensure_not_blank() {
        assert!(ensure_not_blank("name", "foo").is_ok());
        assert!(matches!(
            ensure_not_blank("name", " \t"),
            Err(TspError::InvalidArgument(_))
        ));
    }
}
