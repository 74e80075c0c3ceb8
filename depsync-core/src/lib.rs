//! depsync core - cross-node dependency coordination
//!
//! The master and every worker node share this crate:
//! - `transport` / `router`: reconnectable envelope stream and operation dispatch
//! - `rendezvous`: fan-out/fan-in signalling for Update rounds
//! - `coordinator` (master) and `agent` (worker): the protocol itself
//! - `tasks`, `log_relay`, `version_cache`: per-operation bookkeeping
//! - `store`: in-memory document collections with JSON snapshots
//! - `nodes`, `catalog`: cluster membership and the installed-package view

pub mod agent;
pub mod catalog;
pub mod coordinator;
pub mod ecosystem;
pub mod error;
pub mod log_relay;
pub mod models;
pub mod nodes;
pub mod protocol;
pub mod rendezvous;
pub mod router;
pub mod store;
pub mod tasks;
pub mod transport;
pub mod version_cache;
pub mod workspace;

pub use agent::NodeAgent;
pub use coordinator::{
    Coordinator, CoordinatorConfig, DispatchReport, InstallCommand, RoundReport, TargetMode,
};
pub use ecosystem::{Managers, PackageManager};
pub use error::{CoreError, ManagerError, StoreError, TaskError, TransportError, WorkspaceError};
pub use nodes::NodeDirectory;
pub use models::{Dependency, Ecosystem, LogEntry, Node, Setting, Task, TaskAction, TaskStatus};
pub use protocol::{Envelope, Message, OperationCode};
pub use rendezvous::RendezvousRegistry;
pub use router::Router;
pub use store::Store;
pub use tasks::TaskTracker;
pub use transport::Link;
pub use version_cache::VersionCache;
