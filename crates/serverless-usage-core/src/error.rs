// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors a single probe can fail with. They never cross the executor boundary.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("probe {probe} timed out")]
    Timeout { probe: String },

    #[error("probe {probe} transport error (status {status:?}): {message}")]
    Transport {
        probe: String,
        status: Option<u16>,
        message: String,
    },

    #[error("probe {probe} could not parse response: {message}")]
    Parse { probe: String, message: String },

    #[error("probe {probe} panicked")]
    Panicked { probe: String },
}

impl ProbeError {
    /// Maps a reqwest failure onto the probe taxonomy.
    pub fn from_reqwest(probe: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            ProbeError::Timeout {
                probe: probe.to_string(),
            }
        } else if err.is_decode() {
            ProbeError::Parse {
                probe: probe.to_string(),
                message: err.to_string(),
            }
        } else {
            ProbeError::Transport {
                probe: probe.to_string(),
                status: err.status().map(|s| s.as_u16()),
                message: err.to_string(),
            }
        }
    }
}

/// Row-level problems found while merging a probe result. Offending rows are dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("row is missing join key column {column}")]
    MergeKeyMissing { column: String },

    #[error("duplicate join key {key} within a single result")]
    DuplicateKey { key: String },

    #[error("key shape [{incoming}] cannot be joined with [{existing}]")]
    IncompatibleKeys { incoming: String, existing: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink write failed: {0}")]
    Write(String),

    #[error("sink rejected write with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unsupported cluster type: {0}")]
    UnsupportedPlatform(String),

    #[error("field {field} declared with conflicting unit conversions")]
    ConflictingUnits { field: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ConfigError::InvalidConfig("missing cluster name".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid configuration: missing cluster name"
        );

        let error = ProbeError::Transport {
            probe: "cold_starts".to_string(),
            status: Some(503),
            message: "unavailable".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "probe cold_starts transport error (status Some(503)): unavailable"
        );
    }

    #[test]
    fn test_merge_error_display() {
        let error = MergeError::MergeKeyMissing {
            column: "function_name".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "row is missing join key column function_name"
        );
    }

    #[test]
    fn test_error_debug() {
        let error = SinkError::Rejected {
            status: 401,
            body: "unauthorized".to_string(),
        };
        let debug_str = format!("{:?}", error);
        assert!(debug_str.contains("Rejected"));
    }
}
