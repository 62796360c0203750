//! Process supervisor for a foreman node.
//!
//! `foremand` launches, verifies, and tears down the fixed set of daemons a
//! node runs (engine, communications API, management API), dispatching to a
//! coordinator or follower startup path based on the node's configured role.
//! The cluster protocol itself lives in the communications daemon; this crate
//! owns only the lifecycle around it.

pub mod cancel;
pub mod context;
pub mod control;
pub mod daemons;
mod files;
pub mod identity;
pub mod keys;
pub mod launcher;
pub mod orders;
pub mod pool;
pub mod probe;
pub mod proc_table;
pub mod registry;
pub mod role;
pub mod shutdown;
pub mod signals;
pub mod supervisor;
pub mod telemetry;
