//! Node-level energy attribution core: reads CPU/GPU power sensors,
//! splits idle from dynamic energy, and attributes the dynamic share to
//! processes, containers, pods, and VMs, publishing one immutable
//! [`snapshot::Snapshot`] per tick for any number of concurrent readers.
//!
//! Sensor discovery strategy, HTTP/gRPC exposition, and orchestrator
//! metadata lookups are explicitly out of scope. This crate is the
//! accounting core a thin exporter process wraps.

pub mod backends;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gpu_attribution;
pub mod identity;
pub mod node_aggregator;
pub mod sharing_mode;
pub mod snapshot;
pub mod tracker;
pub mod workload_attribution;

pub use config::Config;
pub use coordinator::Coordinator;
pub use error::EngineError;
pub use identity::ProcessIdentity;
pub use snapshot::Snapshot;
