//! Compositor — declarative composition of cloud components.
//!
//! Instances declare typed inputs that may reference other instances'
//! outputs. The engine orders them by dependency, deploys only what changed
//! since the last persisted snapshot, and records the result.

pub mod cli;
pub mod core;
pub mod driver;
pub mod tripwire;

pub use crate::core::error::{EngineError, Result};
pub use crate::core::executor::{DeployContext, Orchestrator};
pub use crate::core::state::{FileStore, MemoryStore, SnapshotStore};
pub use crate::core::types::{Declaration, InstanceDecl, RunReport, TargetKey, Verdict};
pub use crate::driver::{Driver, DriverError, Registry, RunContext};
