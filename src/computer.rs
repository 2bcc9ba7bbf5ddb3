//! Computers and the typed handles for their asynchronously produced
//! outputs.
//!
//! A computer is user code bound to one *output key*, the type of the
//! plan field it fills. Noisy computers return a value; silent computers
//! only report errors and are bridged into the common shape. Computers
//! receive the executing plan as an [`Arc<dyn PlanView>`] and downcast it
//! to a plan type they know satisfies their input contract.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::context::Context;
use crate::error::{Error, TaskResult};
use crate::plan::PlanView;
use crate::task::Task;

/// The untyped value a computer produces. Typed access goes through the
/// owning field's [`AsyncResult`].
pub type OutcomeValue = Arc<dyn Any + Send + Sync>;

/// Wraps a computed value into an [`OutcomeValue`].
pub fn outcome_value<T: Send + Sync + 'static>(value: T) -> OutcomeValue {
    Arc::new(value)
}

/// A unit of user logic producing one output for a plan.
///
/// Implementations downcast the plan with [`crate::expect_plan`];
/// a mismatch panics exactly like a failed type assertion would, which
/// is what [`crate::Engine::is_executable`] probes for.
#[async_trait]
pub trait Computer: Send + Sync + 'static {
    async fn compute(&self, ctx: Context, plan: Arc<dyn PlanView>) -> TaskResult<OutcomeValue>;
}

/// A computer with no observable output; only its error matters.
#[async_trait]
pub trait SilentComputer: Send + Sync + 'static {
    async fn compute(&self, ctx: Context, plan: Arc<dyn PlanView>) -> TaskResult<()>;
}

/// Adapts a [`SilentComputer`] to the noisy [`Computer`] shape.
pub(crate) struct BridgeComputer<C>(pub(crate) C);

#[async_trait]
impl<C: SilentComputer> Computer for BridgeComputer<C> {
    async fn compute(&self, ctx: Context, plan: Arc<dyn PlanView>) -> TaskResult<OutcomeValue> {
        self.0.compute(ctx, plan).await?;
        Ok(outcome_value(()))
    }
}

/// A typed handle over a computer's future output.
///
/// Plans hold an `AsyncResult<T>` (usually inside an output-key newtype)
/// for every asynchronously computed field. The engine binds the
/// component's task into the handle before execution starts; accessors
/// then await the untyped outcome and unwrap it as `T`.
///
/// Reading an unbound handle fails fast with
/// [`Error::ResultNotAvailable`] instead of blocking, so executability
/// probing cannot hang on missing wiring.
pub struct AsyncResult<T> {
    slot: RwLock<Option<Task<OutcomeValue>>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for AsyncResult<T> {
    fn default() -> Self {
        Self {
            slot: RwLock::new(None),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for AsyncResult<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncResult")
            .field("bound", &self.is_bound())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> AsyncResult<T> {
    /// Binds the task producing this result. The engine calls this via
    /// the component's recorded binder; a later bind replaces an earlier
    /// one, so a plan instance can be re-executed.
    pub fn bind(&self, task: Task<OutcomeValue>) {
        *self.slot.write().expect("async result lock poisoned") = Some(task);
    }

    /// Waits for the bound task and returns its outcome as `T`.
    pub async fn get(&self) -> TaskResult<T> {
        let task = self
            .slot
            .read()
            .expect("async result lock poisoned")
            .clone();

        let Some(task) = task else {
            return Err(Error::ResultNotAvailable);
        };

        let value = task.outcome().await?;
        value
            .downcast_ref::<T>()
            .cloned()
            .ok_or(Error::ResultNotAvailable)
    }
}

impl<T> AsyncResult<T> {
    /// True once the engine has bound a task to this handle.
    pub fn is_bound(&self) -> bool {
        self.slot
            .read()
            .expect("async result lock poisoned")
            .is_some()
    }
}

/// A plan field that receives an asynchronously computed output.
///
/// Output-key newtypes wrap an [`AsyncResult`] and delegate; the newtype
/// itself is the component id the computer registers under. A bare
/// `AsyncResult<T>` also works as a field type when no named key is
/// needed.
pub trait AsyncOutput: Send + Sync + 'static {
    fn bind(&self, task: Task<OutcomeValue>);
}

impl<T: Clone + Send + Sync + 'static> AsyncOutput for AsyncResult<T> {
    fn bind(&self, task: Task<OutcomeValue>) {
        AsyncResult::bind(self, task);
    }
}
