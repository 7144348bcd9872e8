//! Poolnode - worker-node runtime for a decentralized job market.
//!
//! A node advertises capability templates to a coordinating pool, leases
//! matching pending jobs, runs them through pluggable runners and reports
//! results and logs back.
//!
//! # Core Concepts
//!
//! - **Pool channel**: [`PoolConnector`] is the client side of the pool
//!   service; a [`PoolTransport`] opens one lazily for a [`PoolEndpoint`].
//!
//! - **Runner**: a [`JobRunner`] implements one job kind. Its
//!   [`RunnerConfig`] carries the metadata, filter, template and typed
//!   [`SocketSchema`] the node announces.
//!
//! - **Runtime**: [`NodeRuntime`] runs the announce, tick, scheduler and
//!   per-runner poll loops and drives each job through
//!   accept → run → complete or cancel.
//!
//! - **Job context**: every execution gets a [`JobContext`] with parameter
//!   accessors, remote [`Disk`]s, a two-tier cache, action discovery and
//!   sub-job dispatch.
//!
//! - **Events**: lifecycle [`NodeEvent`]s are published on an
//!   [`InProcEventBus`] for embedders and tests.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use poolnode::*;
//!
//! struct Echo(RunnerConfig);
//!
//! #[async_trait::async_trait]
//! impl JobRunner for Echo {
//!     fn config(&self) -> &RunnerConfig {
//!         &self.0
//!     }
//!
//!     async fn run(&self, ctx: &JobContext) -> anyhow::Result<String> {
//!         Ok(ctx.input(None).map(|input| input.data.clone()).unwrap_or_default())
//!     }
//! }
//! ```

/// Local and pool-backed cache tiers.
///
/// [`LocalCache`] keeps a value file and a meta file per key under the
/// node's cache directory; [`RemoteCache`] streams versioned blobs to and
/// from the pool. [`CacheOptions`] selects the tier.
pub mod cache;

/// Node configuration: [`NodeMeta`], [`PoolConfig`], [`RuntimeTimings`],
/// [`NodeConfig`] and the [`StartOptions`] accepted by `start`.
pub mod config;

/// Per-job execution surface handed to runners.
pub mod context;

/// Typed action descriptors and discovery filters.
pub mod discovery;

/// Streaming proxy for remote storage volumes.
///
/// - [`Disk`] - handle to one opened volume
/// - [`DiskReadStream`] - pull-based byte stream of one file
/// - [`DiskWriter`] - chunked upload of one file
pub mod disk;

/// Error types: [`RpcError`] for pool calls, [`DiskError`], [`CacheError`],
/// [`WaitError`] and the [`JobFailure`] published when a job is canceled.
pub mod error;

/// Node lifecycle events and the in-process event bus.
pub mod events;

/// Pool-owned job model.
pub mod job;

/// Local exclusion table for jobs this node is working on.
pub mod lease;

/// Per-job logger forwarding lines to the pool.
pub mod logger;

/// `tracing-subscriber` setup for processes hosting a node.
pub mod logging;

#[cfg(feature = "metrics")]
/// Prometheus collectors for poll, announce and job activity.
pub mod metrics;

/// Client side of the pool service.
///
/// The [`PoolConnector`] trait normalizes unary and streaming calls into
/// [`RpcResult`]s; [`ClientStream`] and [`ServerStream`] model the two
/// streaming shapes.
pub mod pool;

/// Runner trait and configuration.
pub mod runner;

/// Node runtime and its builder.
///
/// - [`NodeRuntime`] - the running node
/// - [`NodeRuntimeBuilder`] - dependency wiring
/// - [`ShutdownToken`] - graceful shutdown signaling
pub mod runtime;

/// Tracing spans and record helpers.
pub mod telemetry;

pub use cache::*;
pub use config::*;
pub use context::*;
pub use discovery::*;
pub use disk::*;
pub use error::*;
pub use events::*;
pub use job::*;
pub use lease::*;
pub use logger::*;
pub use pool::*;
pub use runner::*;
pub use runtime::*;
