//! # sl-hub: SIFTLINE query execution coordinator
//!
//! Drives an already-parsed query (filter tree + aggregation pipeline) from
//! submission to a terminal result:
//!
//! - [`registry::QueryRegistry`] tracks live executions, admits them, and
//!   arms their timeout watchdogs.
//! - [`multiplexer::StateMultiplexer`] merges the primary and optional
//!   companion state streams into one tagged stream.
//! - [`driver::Coordinator`] runs the lifecycle loop: launches execution,
//!   forwards progress, restarts on remote loss, reconciles histogram
//!   buckets and delivers the final payload.
//! - [`ws`] bridges a websocket to the driver; [`api`] wires the HTTP and
//!   websocket routes.
//!
//! Filter evaluation lives behind [`engine::ExecutionEngine`].

pub mod api;
pub mod config;
pub mod delivery;
pub mod driver;
pub mod engine;
pub mod error;
pub mod event;
pub mod multiplexer;
pub mod query;
pub mod registry;
pub mod ws;

pub use config::CoordinatorConfig;
pub use driver::{Coordinator, RunOutcome, RunRequest};
pub use engine::{ExecutionEngine, ExecutionRun};
pub use error::{CoordinatorError, ExecError};
pub use query::{QueryContext, QueryResponse, QuerySpec};
pub use registry::{QueryExecutionHandle, QueryRegistry};
