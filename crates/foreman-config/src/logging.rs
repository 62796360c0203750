//! Logging configuration shared by the supervisor and the engine daemon.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Supported logging output formats.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// Structured JSON suitable for ingestion by logging stacks.
    Json,
    /// Human-readable single line output.
    #[default]
    Compact,
}

/// Numeric debug mode resolved from configuration.
///
/// The supervisor and the engine daemon share the same 0/1/2 mapping: 0 keeps
/// informational logging, 1 enables debug logging, and 2 enables trace
/// logging. Values above 2 are clamped.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct DebugLevel(pub u8);

impl DebugLevel {
    /// Filter directive for the tracing subscriber.
    #[must_use]
    pub fn filter_directive(self) -> &'static str {
        match self.0 {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }

    /// Log-level argument accepted by the engine binary.
    #[must_use]
    pub fn engine_log_level(self) -> &'static str {
        match self.0 {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, "info")]
    #[case(1, "debug")]
    #[case(2, "trace")]
    #[case(7, "trace")]
    fn debug_level_maps_to_engine_flag(#[case] level: u8, #[case] expected: &str) {
        assert_eq!(DebugLevel(level).engine_log_level(), expected);
    }

    #[test]
    fn log_format_parses_case_insensitively() {
        let format: LogFormat = "JSON".parse().unwrap();
        assert_eq!(format, LogFormat::Json);
    }
}
