//! # sl-core: query lifecycle vocabulary for SIFTLINE
//!
//! Runtime-free building blocks shared by the coordinator:
//!
//! - [`QueryId`] and the [`QidAllocator`] that hands them out.
//! - [`QueryState`], the closed set of lifecycle states a query moves through.
//! - [`TimeRange`] and [`Granularity`], the inputs of histogram bucketing.
//! - [`BucketHolder`] and [`reconcile`], which turn a sparse time series into
//!   a dense, gap-free one.

pub mod bucket;
pub mod qid;
pub mod state;
pub mod time;

pub use bucket::{reconcile, BucketHolder, ReconcileError};
pub use qid::{QidAllocator, QueryId};
pub use state::{QueryState, QueryType, SourceIndex};
pub use time::{Granularity, TimeRange, TimeRangeError, TimeUnit};
