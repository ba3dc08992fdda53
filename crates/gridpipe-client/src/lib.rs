//! Unified client for staged tables and batch operations.
//!
//! One [`GridClient`] trait with three implementations: [`RemoteClient`]
//! against the cluster's HTTP API, [`LocalClient`] over a DuckDB-backed
//! directory tree, and [`MemoryClient`] for tests. Pipeline code holds a
//! `Box<dyn GridClient>` and stays unaware of which backend it runs on.

pub mod client;
pub mod error;
pub mod factory;
pub mod jobs;
pub mod local;
pub mod memory;
pub mod partition;
pub mod remote;

mod rows;

pub use client::{GridClient, RowStream};
pub use error::ClientError;
pub use factory::{create_client, ClientOptions, Mode};
pub use jobs::{
    ImageSpec, JobOutcome, JobState, MapJobSpec, OperationHandle, RegistryAuth, ResourceSpec,
    SandboxFile, SandboxSource, VanillaJobSpec,
};
pub use local::LocalClient;
pub use memory::{MapTransform, MemoryClient};
pub use partition::partition_rows;
pub use remote::{ClusterTransport, HttpRemoteClient, HttpTransport, RemoteClient};

pub use gridpipe_ir::{Row, TablePath};
