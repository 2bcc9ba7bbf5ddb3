//! Plans, blueprints and hooks.
//!
//! A plan is a user-defined aggregate whose fields declare the inputs
//! and outputs of a computation. Instead of runtime reflection, a plan
//! describes its own shape through [`Plan::blueprint`]: an ordered list
//! of components (computed outputs, plain component keys, nested plans)
//! plus pre/post hooks. The engine compiles that description into an
//! analyzed plan and executes it.

use std::any::{type_name, Any};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::computer::{AsyncOutput, OutcomeValue};
use crate::context::Context;
use crate::engine::Engine;
use crate::error::{Error, TaskResult};
use crate::task::Task;

/// A user-defined computation plan.
///
/// # Examples
///
/// ```
/// use taskx::{AsyncResult, Blueprint, Plan};
///
/// #[derive(Default)]
/// struct Quote {
///     base_price: AsyncResult<f64>,
///     tax: AsyncResult<f64>,
/// }
///
/// impl Plan for Quote {
///     fn is_sequential(&self) -> bool {
///         false
///     }
///
///     fn blueprint(b: &mut Blueprint<Self>) {
///         b.computes(|p: &Quote| &p.base_price)
///             .computes(|p: &Quote| &p.tax);
///     }
/// }
/// ```
pub trait Plan: Send + Sync + 'static {
    /// Sequential plans run their components one by one, in declaration
    /// order; parallel plans run them concurrently.
    fn is_sequential(&self) -> bool;

    /// Declares the plan's components and hooks, in field order.
    fn blueprint(blueprint: &mut Blueprint<Self>)
    where
        Self: Sized;
}

/// A master plan is the client-facing entry point: a plan that can be
/// executed directly, typically by delegating to an [`Engine`] handle it
/// carries or has access to.
#[async_trait]
pub trait MasterPlan: Plan {
    async fn execute(self: Arc<Self>, ctx: Context) -> TaskResult<()>;
}

/// Type-erased view of a plan, handed to computers and hooks.
///
/// Implemented automatically for every [`Plan`].
pub trait PlanView: Any + Send + Sync {
    /// The plan's full type name, which is also its registry key.
    fn plan_name(&self) -> &'static str;

    #[doc(hidden)]
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<P: Plan> PlanView for P {
    fn plan_name(&self) -> &'static str {
        type_name::<P>()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Downcasts a plan view to the concrete plan a computer was written
/// against.
///
/// Panics when the plan does not have the expected type, the moral
/// equivalent of a failed type assertion. That panic is exactly the signal
/// [`Engine::is_executable`] translates into
/// [`Error::PlanNotExecutable`].
pub fn expect_plan<P: Plan>(plan: &Arc<dyn PlanView>) -> Arc<P> {
    let name = plan.plan_name();
    Arc::clone(plan).into_any().downcast::<P>().unwrap_or_else(|_| {
        panic!(
            "plan {name} does not provide the inputs required by this computer (expected {})",
            type_name::<P>()
        )
    })
}

/// A hook that runs before a plan's components.
#[async_trait]
pub trait PreHook: Send + Sync + 'static {
    async fn pre_execute(&self, ctx: &Context, plan: Arc<dyn PlanView>) -> TaskResult<()>;
}

/// A hook that runs after a plan's components, only when they all
/// succeeded.
#[async_trait]
pub trait PostHook: Send + Sync + 'static {
    async fn post_execute(&self, ctx: &Context, plan: Arc<dyn PlanView>) -> TaskResult<()>;
}

pub(crate) type Binder<P> = Arc<dyn Fn(&P, Task<OutcomeValue>) + Send + Sync>;

pub(crate) type NestedExec<P> =
    Arc<dyn Fn(Engine, Context, Arc<P>) -> BoxFuture<'static, TaskResult<()>> + Send + Sync>;

pub(crate) type NestedVerify<P> =
    Arc<dyn Fn(Engine, Arc<P>) -> BoxFuture<'static, TaskResult<()>> + Send + Sync>;

pub(crate) enum ComponentKind<P> {
    /// A computer keyed by an output type; the binder is present for
    /// async output fields and absent for plain component keys.
    Computer { binder: Option<Binder<P>> },
    /// A nested plan executed recursively in its own mode.
    Nested {
        execute: NestedExec<P>,
        verify: NestedVerify<P>,
    },
}

pub(crate) struct Component<P> {
    pub(crate) id: &'static str,
    pub(crate) kind: ComponentKind<P>,
}

impl<P> Clone for Component<P> {
    fn clone(&self) -> Self {
        let kind = match &self.kind {
            ComponentKind::Computer { binder } => ComponentKind::Computer {
                binder: binder.clone(),
            },
            ComponentKind::Nested { execute, verify } => ComponentKind::Nested {
                execute: Arc::clone(execute),
                verify: Arc::clone(verify),
            },
        };
        Self { id: self.id, kind }
    }
}

/// Collects a plan's parsed components and hooks, in declaration order.
///
/// Obtained inside [`Plan::blueprint`]; every call appends one record to
/// the analyzed plan the engine will execute.
pub struct Blueprint<P: Plan> {
    sequential: bool,
    pub(crate) components: Vec<Component<P>>,
    pub(crate) pre_hooks: Vec<Arc<dyn PreHook>>,
    pub(crate) post_hooks: Vec<Arc<dyn PostHook>>,
    pub(crate) error: Option<Error>,
}

impl<P: Plan> Blueprint<P> {
    pub(crate) fn new(sequential: bool) -> Self {
        Self {
            sequential,
            components: Vec::new(),
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
            error: None,
        }
    }

    /// Declares an asynchronously computed output field. The field type
    /// is the component id; the computer registered under it produces
    /// the value, and the engine binds the producing task into the field
    /// before execution starts.
    ///
    /// Sequential plans cannot hold async outputs; declaring one makes
    /// analysis fail with [`Error::SequentialPlanHasAsyncOutput`].
    pub fn computes<F: AsyncOutput>(&mut self, accessor: fn(&P) -> &F) -> &mut Self {
        if self.sequential {
            self.error.get_or_insert(Error::SequentialPlanHasAsyncOutput);
            return self;
        }

        let binder: Binder<P> = Arc::new(move |plan, task| accessor(plan).bind(task));
        self.components.push(Component {
            id: type_name::<F>(),
            kind: ComponentKind::Computer {
                binder: Some(binder),
            },
        });
        self
    }

    /// Declares a component keyed by `K` with no output field: either a
    /// silently computed step or an input-only field. When no computer is
    /// registered under `K`, the component is skipped at execution.
    pub fn component<K: 'static>(&mut self) -> &mut Self {
        self.components.push(Component {
            id: type_name::<K>(),
            kind: ComponentKind::Computer { binder: None },
        });
        self
    }

    /// Declares a nested plan field. The nested plan must be analyzed
    /// before the parent executes; it runs in its own
    /// sequential/parallel mode.
    pub fn nested<N: Plan>(&mut self, accessor: fn(&P) -> Arc<N>) -> &mut Self {
        let execute: NestedExec<P> = Arc::new(move |engine, ctx, plan| {
            let nested = accessor(&plan);
            Box::pin(async move { engine.execute_inner(&ctx, nested).await })
        });

        let verify: NestedVerify<P> = Arc::new(move |engine, plan| {
            let nested = accessor(&plan);
            Box::pin(async move { engine.is_executable(&nested).await })
        });

        self.components.push(Component {
            id: type_name::<N>(),
            kind: ComponentKind::Nested { execute, verify },
        });
        self
    }

    /// Appends a pre-hook.
    pub fn pre_hook(&mut self, hook: impl PreHook) -> &mut Self {
        self.pre_hooks.push(Arc::new(hook));
        self
    }

    /// Appends a post-hook.
    pub fn post_hook(&mut self, hook: impl PostHook) -> &mut Self {
        self.post_hooks.push(Arc::new(hook));
        self
    }
}
