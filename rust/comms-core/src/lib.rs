// rust/comms-core/src/lib.rs

//! Communicator Context - Core Library
//!
//! This crate sets up communication sessions across a group of workers:
//! it creates a session identifier, bootstraps a collective substrate (and
//! optionally a direct point-to-point transport) on every worker, keeps the
//! per-worker handles in a process-local registry, and tears everything
//! down again.

pub mod config;
pub mod error;
pub mod session;

// Re-export commonly used types for convenience
pub use config::CommsConfig;
pub use error::{CommsError, Result, WorkerFailure};
pub use session::{
    new_session, Capabilities, ClientId, Rank, SessionDescriptor, SessionId, WorkerAddress,
};

pub mod transport;
pub use transport::{CommsHandle, LoopbackFabric, LoopbackOptions, LoopbackTransport, Transport};

pub mod cluster;
pub use cluster::{Cluster, LocalCluster, LocalClusterBuilder, WorkerTask};

pub mod registry;
pub use registry::{SessionEntry, WorkerRegistry};

pub mod ops;
pub mod worker;
pub use worker::Worker;

pub mod bootstrap;
pub use bootstrap::Bootstrapper;

pub mod context;
pub use context::{CommsContext, ContextState};

pub mod default;
pub use default::{DefaultComms, SharedContext};
