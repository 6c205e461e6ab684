//! request-scoped context
//!
//! Every collaborator call and caveat check receives a [`Context`]: a
//! request-scoped record carrying the clock, a cancellation signal, an
//! optional deadline and an extensible map of typed values. Deriving a
//! context (`with_value`, `with_deadline`, ...) never mutates the parent.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use time::OffsetDateTime;

use crate::error::Error;

/// source of the current time for `time-before` caveats
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// the system clock
#[derive(Clone, Copy, Debug, Default)]
pub struct WallClock;

impl Clock for WallClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// cancels the contexts derived from [`Context::with_cancellation`]
#[derive(Clone, Debug)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct Context {
    clock: Arc<dyn Clock>,
    values: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    cancelled: Option<Arc<AtomicBool>>,
    deadline: Option<OffsetDateTime>,
}

impl Context {
    /// the root context: wall clock, no values, never cancelled
    pub fn background() -> Self {
        Context {
            clock: Arc::new(WallClock),
            values: HashMap::new(),
            cancelled: None,
            deadline: None,
        }
    }

    /// derives a context carrying `value`, keyed by its type
    pub fn with_value<T: Any + Send + Sync>(&self, value: T) -> Self {
        let mut ctx = self.clone();
        ctx.values.insert(TypeId::of::<T>(), Arc::new(value));
        ctx
    }

    /// fetches a typed value set with [`Context::with_value`]
    pub fn value<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.values
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|v| Arc::downcast::<T>(v).ok())
    }

    pub fn with_clock(&self, clock: Arc<dyn Clock>) -> Self {
        let mut ctx = self.clone();
        ctx.clock = clock;
        ctx
    }

    /// the context's idea of "now"
    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    /// derives a cancellable context and the handle that cancels it
    pub fn with_cancellation(&self) -> (Self, CancelHandle) {
        let flag = Arc::new(AtomicBool::new(false));
        let mut ctx = self.clone();
        ctx.cancelled = Some(flag.clone());
        (ctx, CancelHandle(flag))
    }

    pub fn with_deadline(&self, deadline: OffsetDateTime) -> Self {
        let mut ctx = self.clone();
        ctx.deadline = Some(deadline);
        ctx
    }

    /// fails if the context has been cancelled or its deadline passed
    pub fn check_live(&self) -> Result<(), Error> {
        if let Some(flag) = &self.cancelled {
            if flag.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }
        }
        if let Some(deadline) = self.deadline {
            if self.now() >= deadline {
                return Err(Error::DeadlineExceeded);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("values", &self.values.len())
            .field("deadline", &self.deadline)
            .finish()
    }
}
