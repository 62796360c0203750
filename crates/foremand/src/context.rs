//! Per-run execution context.

use std::time::{SystemTime, UNIX_EPOCH};

use foreman_config::NodeRole;

/// Context carried explicitly into role components.
///
/// Replaces ambient global tags: every log line emitted from role code hangs
/// off a span built from this context, so coordinator and follower output is
/// distinguishable even when both appear in one aggregated stream.
#[derive(Debug, Clone)]
pub struct RunContext {
    role: NodeRole,
    correlation: String,
}

impl RunContext {
    /// Builds a context for one `start` invocation.
    #[must_use]
    pub fn new(role: NodeRole) -> Self {
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        Self {
            role,
            correlation: format!("{:x}-{seconds:x}", std::process::id()),
        }
    }

    /// Role tag for log spans.
    #[must_use]
    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// Correlation id unique to this invocation.
    #[must_use]
    pub fn correlation(&self) -> &str {
        &self.correlation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carries_role_and_correlation() {
        let context = RunContext::new(NodeRole::Follower);
        assert_eq!(context.role(), NodeRole::Follower);
        assert!(!context.correlation().is_empty());
    }
}
