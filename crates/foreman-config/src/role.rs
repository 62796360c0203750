//! Cluster role resolved once from configuration.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Role this node plays in the cluster.
///
/// Resolved from configuration at the start of a run and never re-evaluated
/// within it: the coordinator and follower startup paths differ in ordering
/// and failure recovery.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum NodeRole {
    /// Centralised coordination role; starts first, never connects outward.
    #[default]
    Coordinator,
    /// Connects to a coordinator and must tolerate link loss.
    Follower,
}
