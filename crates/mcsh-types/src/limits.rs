//! Resource bounds for pipeline execution.

use std::time::Duration;

/// Engine resource limits. Every bound has a default and can be overridden
/// by the facade configuration; none is mutable while a pipeline runs.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Maximum input bytes a single stage may materialize before streaming.
    pub max_stage_input_bytes: usize,
    /// Maximum bytes captured into buffers per pipeline invocation.
    pub max_buffer_bytes: usize,
    /// Maximum final-output bytes returned in the envelope; beyond this the
    /// output is truncated with a warning.
    pub max_output_bytes: usize,
    /// Wall-time limit for one subprocess run.
    pub command_timeout: Duration,
    /// Wall-time limit for one remote tool invocation.
    pub tool_timeout: Duration,
    /// Maximum number of items a for_each stage may fan out over.
    pub max_for_each_items: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_stage_input_bytes: 32 * 1024 * 1024,
            max_buffer_bytes: 32 * 1024 * 1024,
            max_output_bytes: 8 * 1024 * 1024,
            command_timeout: Duration::from_secs(60),
            tool_timeout: Duration::from_secs(60),
            max_for_each_items: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_bounds() {
        let limits = Limits::default();
        assert_eq!(limits.max_stage_input_bytes, 32 * 1024 * 1024);
        assert_eq!(limits.max_output_bytes, 8 * 1024 * 1024);
        assert_eq!(limits.command_timeout, Duration::from_secs(60));
        assert_eq!(limits.max_for_each_items, 10_000);
    }
}
