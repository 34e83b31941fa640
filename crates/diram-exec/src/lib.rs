#![forbid(unsafe_code)]
//! diram-exec: asynchronous allocation.
//!
//! `request_async` returns a pending [`Promise`] immediately and dispatches one
//! worker per request. The worker consults the [`LookaheadCache`], performs an
//! enhanced allocation, settles the promise and writes the outcome back to the
//! cache.
//!
//! Workers run on dedicated OS threads by default, or on tokio's blocking pool
//! with the `async-scheduler` feature.

pub mod lookahead;
pub mod metrics;
pub mod promise;
pub mod runtime;
pub mod worker;

pub use lookahead::{LookaheadCache, LookaheadEntry};
pub use promise::{
    AlreadySettled, AwaitStatus, LookaheadPlan, Promise, PromiseReceipt, PromiseState,
    RejectReason, Rejection,
};
pub use runtime::{AsyncAllocator, ExecError};
pub use worker::{classify, RetryPolicy, Worker};
