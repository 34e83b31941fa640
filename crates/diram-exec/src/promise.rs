//! Single-assignment promise with chained continuations.
//!
//! State moves `Pending -> Resolved` or `Pending -> Rejected` exactly once,
//! under the promise's mutex. Settling runs every continuation in
//! registration order, then the `finally` callback, then wakes all waiters.
//!
//! Continuations run while the promise's lock is held. They may settle other
//! promises (that is how `then` chains) but must not call back into the
//! promise they were registered on.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use diram_core::clock::unix_millis;
use diram_core::error::{ErrorCode, Severity, StatusPair};
use diram_core::hash::Receipt;
use diram_core::id::PromiseId;
use diram_core::process::{OsProcess, ProcessIdentity};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PromiseState {
    Pending,
    Resolved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RejectReason {
    MemoryExhausted,
    Timeout,
    Cancelled,
    Fatal,
    GovernanceViolation,
    LookaheadMiss,
}

impl RejectReason {
    pub fn code(self) -> ErrorCode {
        match self {
            RejectReason::MemoryExhausted => ErrorCode::MemoryExhausted,
            RejectReason::Timeout => ErrorCode::Timeout,
            RejectReason::Cancelled => ErrorCode::Cancelled,
            RejectReason::Fatal => ErrorCode::Fatal,
            RejectReason::GovernanceViolation => ErrorCode::GovernanceFail,
            RejectReason::LookaheadMiss => ErrorCode::LookaheadMiss,
        }
    }
}

/// Structured error context carried by a rejected promise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub reason: RejectReason,
    pub code: ErrorCode,
    pub message: String,
    pub timestamp_ms: u64,
    pub pid: u32,
    pub severity: Severity,
}

impl Rejection {
    pub fn new(reason: RejectReason, message: impl Into<String>) -> Self {
        let code = reason.code();
        Self {
            reason,
            code,
            message: message.into(),
            timestamp_ms: unix_millis(),
            pid: OsProcess.current_pid(),
            severity: code.severity(),
        }
    }

    /// Attribute the rejection to `pid` instead of the OS process id.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({}): {}", self.reason, self.code, self.message)
    }
}

/// A settle attempt on a promise that was already settled. Hands the value
/// back so nothing is lost.
pub struct AlreadySettled<T>(pub T);

impl<T> AlreadySettled<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for AlreadySettled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AlreadySettled(..)")
    }
}

impl<T> fmt::Display for AlreadySettled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("promise already settled")
    }
}

impl<T> std::error::Error for AlreadySettled<T> {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitStatus {
    Resolved,
    Rejected,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromiseReceipt {
    pub id: PromiseId,
    pub created_at_ms: u64,
    pub creator_pid: u32,
    pub creator_thread: String,
    /// Filled in by the worker once the allocation exists.
    pub allocation_receipt: Option<Receipt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LookaheadPlan {
    pub requested_size: usize,
    /// Size actually requested from the allocator.
    pub lookahead_size: usize,
    pub prediction_confidence: f64,
    pub access_pattern_hint: Option<u32>,
    pub prefetch_enabled: bool,
}

impl LookaheadPlan {
    pub fn requested(size: usize, hint: Option<u32>) -> Self {
        Self {
            requested_size: size,
            lookahead_size: size,
            prediction_confidence: 0.0,
            access_pattern_hint: hint,
            prefetch_enabled: false,
        }
    }
}

/// What a continuation sees once the promise has settled.
enum Outcome<'a, T> {
    Value(&'a T),
    /// Resolved, but the value was already moved out with `take_value`.
    Taken,
    Rejected(&'a Rejection),
}

type Continuation<T> = Box<dyn FnOnce(Outcome<'_, T>) + Send>;

struct Shared<T> {
    state: PromiseState,
    value: Option<T>,
    rejection: Option<Rejection>,
    continuations: Vec<Continuation<T>>,
    finally: Option<Box<dyn FnOnce() + Send>>,
    receipt: PromiseReceipt,
    plan: Option<LookaheadPlan>,
}

impl<T> Shared<T> {
    /// Only meaningful once settled.
    fn outcome(&self) -> Outcome<'_, T> {
        match (&self.rejection, &self.value) {
            (Some(r), _) => Outcome::Rejected(r),
            (None, Some(v)) => Outcome::Value(v),
            (None, None) => Outcome::Taken,
        }
    }
}

fn value_taken() -> Rejection {
    Rejection::new(RejectReason::Fatal, "resolved value already taken")
}

struct Inner<T> {
    id: PromiseId,
    shared: Mutex<Shared<T>>,
    settled: Condvar,
}

pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Promise<T> {
    pub fn new() -> Self {
        Self::for_process(OsProcess.current_pid())
    }

    /// A pending promise whose receipt names `creator_pid`.
    pub fn for_process(creator_pid: u32) -> Self {
        let id = PromiseId::next();
        let receipt = PromiseReceipt {
            id,
            created_at_ms: unix_millis(),
            creator_pid,
            creator_thread: thread_label(),
            allocation_receipt: None,
        };
        Self {
            inner: Arc::new(Inner {
                id,
                shared: Mutex::new(Shared {
                    state: PromiseState::Pending,
                    value: None,
                    rejection: None,
                    continuations: Vec::new(),
                    finally: None,
                    receipt,
                    plan: None,
                }),
                settled: Condvar::new(),
            }),
        }
    }

    pub fn resolved(value: T) -> Self {
        let p = Self::new();
        let _ = p.resolve(value);
        p
    }

    pub fn rejected(reason: RejectReason, message: impl Into<String>) -> Self {
        let p = Self::new();
        let _ = p.reject(reason, message);
        p
    }

    pub fn id(&self) -> PromiseId {
        self.inner.id
    }

    pub fn resolve(&self, value: T) -> Result<(), AlreadySettled<T>> {
        let mut s = self.inner.shared.lock();
        if s.state != PromiseState::Pending {
            return Err(AlreadySettled(value));
        }
        s.value = Some(value);
        s.state = PromiseState::Resolved;
        self.fire(s);
        Ok(())
    }

    pub fn reject(
        &self,
        reason: RejectReason,
        message: impl Into<String>,
    ) -> Result<(), AlreadySettled<Rejection>> {
        self.reject_with(Rejection::new(reason, message))
    }

    pub fn reject_with(&self, rejection: Rejection) -> Result<(), AlreadySettled<Rejection>> {
        let mut s = self.inner.shared.lock();
        if s.state != PromiseState::Pending {
            return Err(AlreadySettled(rejection));
        }
        s.rejection = Some(rejection);
        s.state = PromiseState::Rejected;
        self.fire(s);
        Ok(())
    }

    /// Reject with `Cancelled` if still pending. An in-flight worker may still
    /// try to settle afterwards; that attempt fails.
    pub fn cancel(&self) -> bool {
        self.reject(RejectReason::Cancelled, "cancelled by caller")
            .is_ok()
    }

    fn fire(&self, mut s: MutexGuard<'_, Shared<T>>) {
        let continuations = std::mem::take(&mut s.continuations);
        let finally = s.finally.take();
        for cont in continuations {
            cont(s.outcome());
        }
        if let Some(cb) = finally {
            cb();
        }
        drop(s);
        self.inner.settled.notify_all();
    }

    /// Register a continuation, or run it now if already settled.
    fn on_settle(&self, cont: Continuation<T>) {
        let mut s = self.inner.shared.lock();
        if s.state == PromiseState::Pending {
            s.continuations.push(cont);
        } else {
            cont(s.outcome());
        }
    }

    /// Chain a transformation. A rejection propagates unchanged.
    pub fn then<U, F>(&self, on_fulfilled: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(&T) -> U + Send + 'static,
    {
        let next = Promise::new();
        let out = next.clone();
        self.on_settle(Box::new(move |outcome| match outcome {
            Outcome::Value(v) => {
                let _ = out.resolve(on_fulfilled(v));
            }
            Outcome::Taken => {
                let _ = out.reject_with(value_taken());
            }
            Outcome::Rejected(r) => {
                let _ = out.reject_with(r.clone());
            }
        }));
        next
    }

    /// Chain with handlers for both outcomes. The next promise resolves with
    /// whichever handler ran. If the value was already taken neither runs and
    /// the next promise rejects with `Fatal`.
    pub fn then_or_else<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(&T) -> U + Send + 'static,
        R: FnOnce(&Rejection) -> U + Send + 'static,
    {
        let next = Promise::new();
        let out = next.clone();
        self.on_settle(Box::new(move |outcome| match outcome {
            Outcome::Value(v) => {
                let _ = out.resolve(on_fulfilled(v));
            }
            Outcome::Taken => {
                let _ = out.reject_with(value_taken());
            }
            Outcome::Rejected(r) => {
                let _ = out.resolve(on_rejected(r));
            }
        }));
        next
    }

    /// Observe a rejection. The returned promise resolves once this one
    /// settles either way.
    pub fn catch<R>(&self, on_rejected: R) -> Promise<()>
    where
        R: FnOnce(&Rejection) + Send + 'static,
    {
        let next = Promise::new();
        let out = next.clone();
        self.on_settle(Box::new(move |outcome| {
            if let Outcome::Rejected(r) = outcome {
                on_rejected(r);
            }
            let _ = out.resolve(());
        }));
        next
    }

    /// Run `cb` once after settlement and all continuations. A later call
    /// replaces an earlier, not yet run, callback.
    pub fn finally<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut s = self.inner.shared.lock();
        if s.state == PromiseState::Pending {
            s.finally = Some(Box::new(cb));
        } else {
            drop(s);
            cb();
        }
    }

    /// Block until settled or `timeout` elapses. Timing out leaves the promise
    /// untouched; it may still settle later. A timeout too large to express as
    /// a deadline waits without one.
    pub fn wait(&self, timeout: Duration) -> AwaitStatus {
        let deadline = Instant::now().checked_add(timeout);
        let mut s = self.inner.shared.lock();
        while s.state == PromiseState::Pending {
            match deadline {
                Some(deadline) => {
                    if self.inner.settled.wait_until(&mut s, deadline).timed_out() {
                        break;
                    }
                }
                None => self.inner.settled.wait(&mut s),
            }
        }
        match s.state {
            PromiseState::Pending => AwaitStatus::TimedOut,
            PromiseState::Resolved => AwaitStatus::Resolved,
            PromiseState::Rejected => AwaitStatus::Rejected,
        }
    }

    pub fn state(&self) -> PromiseState {
        self.inner.shared.lock().state
    }

    pub fn is_settled(&self) -> bool {
        self.state() != PromiseState::Pending
    }

    pub fn status(&self) -> StatusPair {
        let s = self.inner.shared.lock();
        match s.state {
            PromiseState::Pending => StatusPair::failed(ErrorCode::Pending),
            PromiseState::Resolved => StatusPair::ok(),
            PromiseState::Rejected => StatusPair::failed(
                s.rejection
                    .as_ref()
                    .map(|r| r.code)
                    .unwrap_or(ErrorCode::Unknown),
            ),
        }
    }

    /// Move the resolved value out. The promise stays resolved: `all`, `race`
    /// and `catch` still treat it as fulfilled, but a later `then` has no value
    /// to hand its callback.
    pub fn take_value(&self) -> Option<T> {
        let mut s = self.inner.shared.lock();
        if s.state != PromiseState::Resolved {
            return None;
        }
        s.value.take()
    }

    /// Inspect the resolved value without taking it.
    pub fn with_value<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let s = self.inner.shared.lock();
        s.value.as_ref().map(f)
    }

    pub fn rejection(&self) -> Option<Rejection> {
        let s = self.inner.shared.lock();
        if s.state == PromiseState::Rejected {
            s.rejection.clone()
        } else {
            None
        }
    }

    pub fn receipt(&self) -> PromiseReceipt {
        self.inner.shared.lock().receipt.clone()
    }

    pub fn plan(&self) -> Option<LookaheadPlan> {
        self.inner.shared.lock().plan
    }

    pub(crate) fn set_plan(&self, plan: LookaheadPlan) {
        self.inner.shared.lock().plan = Some(plan);
    }

    pub(crate) fn set_allocation_receipt(&self, receipt: Receipt) {
        self.inner.shared.lock().receipt.allocation_receipt = Some(receipt);
    }

    /// Resolves with every member's id once all resolve; rejects with the
    /// first rejection. An empty set resolves immediately.
    pub fn all(promises: &[Promise<T>]) -> Promise<Vec<PromiseId>> {
        let agg = Promise::new();
        if promises.is_empty() {
            let _ = agg.resolve(Vec::new());
            return agg;
        }
        let ids: Vec<PromiseId> = promises.iter().map(Promise::id).collect();
        let remaining = Arc::new(AtomicUsize::new(promises.len()));
        for p in promises {
            let agg = agg.clone();
            let ids = ids.clone();
            let remaining = Arc::clone(&remaining);
            p.on_settle(Box::new(move |outcome| match outcome {
                Outcome::Value(_) | Outcome::Taken => {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        let _ = agg.resolve(ids);
                    }
                }
                Outcome::Rejected(r) => {
                    let _ = agg.reject_with(r.clone());
                }
            }));
        }
        agg
    }

    /// Settles like whichever member settles first, resolving with its id.
    /// An empty set rejects immediately since it could never settle.
    pub fn race(promises: &[Promise<T>]) -> Promise<PromiseId> {
        let agg = Promise::new();
        if promises.is_empty() {
            let _ = agg.reject(RejectReason::Fatal, "race over an empty set");
            return agg;
        }
        for p in promises {
            let agg = agg.clone();
            let id = p.id();
            p.on_settle(Box::new(move |outcome| match outcome {
                Outcome::Value(_) | Outcome::Taken => {
                    let _ = agg.resolve(id);
                }
                Outcome::Rejected(r) => {
                    let _ = agg.reject_with(r.clone());
                }
            }));
        }
        agg
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.inner.shared.lock();
        f.debug_struct("Promise")
            .field("id", &self.inner.id)
            .field("state", &s.state)
            .field("continuations", &s.continuations.len())
            .finish()
    }
}

fn thread_label() -> String {
    let t = std::thread::current();
    match t.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", t.id()),
    }
}
