//! conduit-lifecycle: connector lifecycle management.
//!
//! One `LifecycleManager` per workload kind (sources, sinks, functions)
//! implements the control-plane contract:
//!
//! - register / update / deregister with synchronous validation
//! - info, list and builtin catalog queries
//! - per-instance status, restart and stop, delegated to the connector's
//!   `InstanceSupervisor`
//! - recovery of persisted connectors at startup and periodic liveness
//!   sweeps
//!
//! # Connector states
//!
//! ```text
//! Starting ──► Running ◄──► Updating
//!     │           │            │
//!     └─────► Failed ◄─────────┘
//!
//! any ──► Deleting ──► (removed)
//! ```

pub mod error;
pub mod locks;
pub mod manager;
pub mod package;
pub mod transitions;

pub use error::{LifecycleError, LifecycleResult};
pub use locks::KeyedLocks;
pub use manager::{LifecycleManager, LifecycleOptions};
pub use package::{PackageResolver, ResolvedPackage};
