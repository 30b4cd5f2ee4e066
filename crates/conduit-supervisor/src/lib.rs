//! conduit-supervisor: keeps connector instances converged.
//!
//! One `InstanceSupervisor` per connector maps the connector's desired
//! state (from `conduit-state`) onto running workers obtained through a
//! `WorkerLauncher`. The supervisor:
//!
//! - Starts, replaces and removes instances to match the desired count
//!   and generation
//! - Persists instance records to the state store
//! - Restarts and stops instances on request
//! - Spreads placements over worker nodes round-robin
//! - Relaunches instances whose worker died
//!
//! # Architecture
//!
//! ```text
//! InstanceSupervisor
//!   ├── StateStore (read/write InstanceRecord)
//!   ├── WorkerLauncher (launch / terminate / is_alive)
//!   ├── NodePool (round-robin over worker nodes)
//!   └── RetryPolicy (bounded exponential backoff per actuation step)
//! ```

pub mod balancer;
pub mod error;
pub mod launcher;
pub mod retry;
pub mod supervisor;

pub use balancer::NodePool;
pub use error::{SupervisorError, SupervisorResult};
pub use launcher::{LaunchError, LaunchSpec, LocalLauncher, WorkerLauncher};
pub use retry::RetryPolicy;
pub use supervisor::{
    AggregateStatus, DesiredState, InstanceSupervisor, ReconcileReport, SupervisorOptions,
};
