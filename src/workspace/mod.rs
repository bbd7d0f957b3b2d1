//! Workspace isolation: a pool of shared git clones handed to workers.

mod pool;

pub use pool::{WorkspaceHandle, WorkspacePool};
