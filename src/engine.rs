//! The computation engine: computer registry, plan analysis and
//! execution.
//!
//! The engine keeps two registries: computers keyed by the full name of
//! the output type they produce, and analyzed plans keyed by the plan's
//! full type name. Registration and analysis happen up front; both maps
//! are read-only during execution.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tracing::debug;

use crate::computer::{AsyncOutput, BridgeComputer, Computer, SilentComputer};
use crate::context::Context;
use crate::error::{panic_text, Error, TaskResult};
use crate::plan::{Blueprint, Component, ComponentKind, Plan, PlanView, PostHook, PreHook};
use crate::task::{SilentTask, Task};

struct AnalyzedPlan<P: Plan> {
    sequential: bool,
    components: Vec<Component<P>>,
    pre_hooks: Vec<Arc<dyn PreHook>>,
    post_hooks: Vec<Arc<dyn PostHook>>,
}

impl<P: Plan> Clone for AnalyzedPlan<P> {
    fn clone(&self) -> Self {
        Self {
            sequential: self.sequential,
            components: self.components.clone(),
            pre_hooks: self.pre_hooks.clone(),
            post_hooks: self.post_hooks.clone(),
        }
    }
}

struct EngineInner {
    computers: RwLock<HashMap<&'static str, Arc<dyn Computer>>>,
    plans: RwLock<HashMap<&'static str, Box<dyn Any + Send + Sync>>>,
}

/// Executes analyzed plans by dispatching their components to registered
/// computers.
///
/// `Engine` is a cheap-to-clone handle; clones share the registries.
/// There are no global singletons: construct an engine, register
/// computers, analyze plans, then execute.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use taskx::{Context, Engine};
/// # use taskx::{AsyncResult, Blueprint, Plan};
/// # #[derive(Default)]
/// # struct MyPlan { out: AsyncResult<i32> }
/// # impl Plan for MyPlan {
/// #     fn is_sequential(&self) -> bool { false }
/// #     fn blueprint(b: &mut Blueprint<Self>) { b.computes(|p: &MyPlan| &p.out); }
/// # }
///
/// # async {
/// let engine = Engine::new();
/// // engine.register_computer::<...>(...);
/// let plan_name = engine.analyze_plan(&MyPlan::default()).unwrap();
///
/// let plan = Arc::new(MyPlan::default());
/// engine
///     .execute(&Context::background(), &plan_name, Arc::clone(&plan))
///     .await
///     .unwrap();
/// # };
/// ```
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Creates an engine with empty registries.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EngineInner {
                computers: RwLock::new(HashMap::new()),
                plans: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Registers a computer under the output key `F`. At most one
    /// computer exists per key: registering again replaces the earlier
    /// one, which is how dummy computers get overridden once real
    /// dependencies are available.
    pub fn register_computer<F: AsyncOutput>(&self, computer: impl Computer) {
        self.register_computer_for_key::<F>(computer);
    }

    /// Registers a silent computer under the component key `K`.
    pub fn register_silent_computer<K: 'static>(&self, computer: impl SilentComputer) {
        self.register_computer_for_key::<K>(BridgeComputer(computer));
    }

    fn register_computer_for_key<K: 'static>(&self, computer: impl Computer) {
        debug!(key = type_name::<K>(), "registering computer");
        self.inner
            .computers
            .write()
            .expect("computer registry poisoned")
            .insert(type_name::<K>(), Arc::new(computer));
    }

    /// True when a computer is registered under the key `K`.
    pub fn is_registered<K: 'static>(&self) -> bool {
        self.inner
            .computers
            .read()
            .expect("computer registry poisoned")
            .contains_key(type_name::<K>())
    }

    /// Compiles the plan's blueprint and persists it under the plan's
    /// full type name, which is returned for use with
    /// [`Engine::execute`]. Analysis happens once per plan type.
    pub fn analyze_plan<P: Plan>(&self, prototype: &P) -> TaskResult<String> {
        let mut blueprint = Blueprint::new(prototype.is_sequential());
        P::blueprint(&mut blueprint);

        if let Some(err) = blueprint.error {
            return Err(err);
        }

        let analyzed = AnalyzedPlan::<P> {
            sequential: prototype.is_sequential(),
            components: blueprint.components,
            pre_hooks: blueprint.pre_hooks,
            post_hooks: blueprint.post_hooks,
        };

        let plan_name = type_name::<P>();
        debug!(
            plan = plan_name,
            components = analyzed.components.len(),
            "analyzed plan"
        );

        self.inner
            .plans
            .write()
            .expect("plan registry poisoned")
            .insert(plan_name, Box::new(analyzed));

        Ok(plan_name.to_string())
    }

    /// True when the plan type has been analyzed.
    pub fn is_analyzed<P: Plan>(&self) -> bool {
        self.inner
            .plans
            .read()
            .expect("plan registry poisoned")
            .contains_key(type_name::<P>())
    }

    /// Appends a pre-hook to an analyzed plan.
    pub fn connect_pre_hook<P: Plan>(&self, hook: impl PreHook) -> TaskResult<()> {
        self.with_analyzed_mut::<P>(|analyzed| analyzed.pre_hooks.push(Arc::new(hook)))
    }

    /// Appends a post-hook to an analyzed plan.
    pub fn connect_post_hook<P: Plan>(&self, hook: impl PostHook) -> TaskResult<()> {
        self.with_analyzed_mut::<P>(|analyzed| analyzed.post_hooks.push(Arc::new(hook)))
    }

    fn with_analyzed_mut<P: Plan>(
        &self,
        apply: impl FnOnce(&mut AnalyzedPlan<P>),
    ) -> TaskResult<()> {
        let mut plans = self.inner.plans.write().expect("plan registry poisoned");
        let analyzed = plans
            .get_mut(type_name::<P>())
            .and_then(|entry| entry.downcast_mut::<AnalyzedPlan<P>>())
            .ok_or(Error::PlanNotAnalyzed)?;
        apply(analyzed);
        Ok(())
    }

    fn analyzed<P: Plan>(&self, plan_name: &str) -> TaskResult<AnalyzedPlan<P>> {
        self.inner
            .plans
            .read()
            .expect("plan registry poisoned")
            .get(plan_name)
            .and_then(|entry| entry.downcast_ref::<AnalyzedPlan<P>>())
            .cloned()
            .ok_or(Error::PlanNotAnalyzed)
    }

    fn computer(&self, id: &str) -> Option<Arc<dyn Computer>> {
        self.inner
            .computers
            .read()
            .expect("computer registry poisoned")
            .get(id)
            .cloned()
    }

    /// Executes the plan: pre-hooks, then components (sequentially or in
    /// parallel), then post-hooks. The first error aborts the remainder
    /// and is returned, except [`Error::PlanExecutionEndingEarly`],
    /// which clients throw to stop execution intentionally and which is
    /// swallowed here, at the top level only.
    pub async fn execute<P: Plan>(
        &self,
        ctx: &Context,
        plan_name: &str,
        plan: Arc<P>,
    ) -> TaskResult<()> {
        let analyzed = self.analyzed::<P>(plan_name)?;

        match self.run_analyzed(ctx, &analyzed, plan).await {
            Err(Error::PlanExecutionEndingEarly) => Ok(()),
            result => result,
        }
    }

    /// Recursive entry used for nested plans: same flow as
    /// [`Engine::execute`] but nothing is swallowed.
    pub(crate) async fn execute_inner<P: Plan>(
        &self,
        ctx: &Context,
        plan: Arc<P>,
    ) -> TaskResult<()> {
        let analyzed = self.analyzed::<P>(type_name::<P>())?;
        self.run_analyzed(ctx, &analyzed, plan).await
    }

    async fn run_analyzed<P: Plan>(
        &self,
        ctx: &Context,
        analyzed: &AnalyzedPlan<P>,
        plan: Arc<P>,
    ) -> TaskResult<()> {
        for hook in &analyzed.pre_hooks {
            hook.pre_execute(ctx, Arc::clone(&plan) as Arc<dyn PlanView>)
                .await?;
        }

        if analyzed.sequential {
            self.run_sequential(ctx, analyzed, &plan).await?;
        } else {
            self.run_parallel(ctx, analyzed, &plan).await?;
        }

        for hook in &analyzed.post_hooks {
            hook.post_execute(ctx, Arc::clone(&plan) as Arc<dyn PlanView>)
                .await?;
        }

        Ok(())
    }

    /// Runs components one by one, each fully before the next begins.
    async fn run_sequential<P: Plan>(
        &self,
        ctx: &Context,
        analyzed: &AnalyzedPlan<P>,
        plan: &Arc<P>,
    ) -> TaskResult<()> {
        for component in &analyzed.components {
            match &component.kind {
                ComponentKind::Computer { .. } => {
                    let Some(computer) = self.computer(component.id) else {
                        continue;
                    };
                    computer
                        .compute(ctx.clone(), Arc::clone(plan) as Arc<dyn PlanView>)
                        .await?;
                }
                ComponentKind::Nested { execute, .. } => {
                    execute(self.clone(), ctx.clone(), Arc::clone(plan)).await?;
                }
            }
        }

        Ok(())
    }

    /// Runs components as a cancellable task group: every async output
    /// is bound before anything starts, then all component tasks run
    /// under a child context that the first error cancels.
    async fn run_parallel<P: Plan>(
        &self,
        ctx: &Context,
        analyzed: &AnalyzedPlan<P>,
        plan: &Arc<P>,
    ) -> TaskResult<()> {
        let group_ctx = ctx.child();
        let mut tasks: Vec<Arc<dyn SilentTask>> = Vec::with_capacity(analyzed.components.len());

        for component in &analyzed.components {
            match &component.kind {
                ComponentKind::Computer { binder } => {
                    let Some(computer) = self.computer(component.id) else {
                        continue;
                    };

                    let plan_view = Arc::clone(plan) as Arc<dyn PlanView>;
                    let task = Task::new(move |task_ctx| async move {
                        computer.compute(task_ctx, plan_view).await
                    });

                    // Bind into the plan before any component starts, so
                    // sibling accessors never observe a missing task.
                    if let Some(binder) = binder {
                        binder(plan.as_ref(), task.clone());
                    }

                    tasks.push(Arc::new(task));
                }
                ComponentKind::Nested { execute, .. } => {
                    let engine = self.clone();
                    let nested_plan = Arc::clone(plan);
                    let execute = Arc::clone(execute);
                    tasks.push(Arc::new(Task::new_silent(move |task_ctx| async move {
                        execute(engine, task_ctx, nested_plan).await
                    })));
                }
            }
        }

        for task in &tasks {
            task.execute(&group_ctx);
        }

        let mut completions: FuturesUnordered<_> =
            tasks.iter().map(|task| task.error()).collect();

        let mut first_error = None;
        while let Some(error) = completions.next().await {
            if let Some(error) = error {
                if first_error.is_none() {
                    group_ctx.cancel();
                    first_error = Some(error);
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Probes whether every component of the plan can run: each
    /// registered computer is invoked under panic recovery. A panic
    /// (a failed plan downcast, missing wiring) translates into
    /// [`Error::PlanNotExecutable`]. Output components without a
    /// registered computer fail the probe; plain component keys without
    /// one are skipped, like they would be at execution. Nested plans
    /// are probed recursively.
    pub async fn is_executable<P: Plan>(&self, plan: &Arc<P>) -> TaskResult<()> {
        let analyzed = self.analyzed::<P>(type_name::<P>())?;

        for component in &analyzed.components {
            match &component.kind {
                ComponentKind::Computer { binder } => {
                    let Some(computer) = self.computer(component.id) else {
                        if binder.is_some() {
                            return Err(Error::PlanNotExecutable(format!(
                                "no computer registered for output {}",
                                component.id
                            )));
                        }
                        continue;
                    };

                    let probe = AssertUnwindSafe(computer.compute(
                        Context::background(),
                        Arc::clone(plan) as Arc<dyn PlanView>,
                    ))
                    .catch_unwind()
                    .await;

                    if let Err(payload) = probe {
                        return Err(Error::PlanNotExecutable(panic_text(payload.as_ref())));
                    }
                }
                ComponentKind::Nested { verify, .. } => {
                    verify(self.clone(), Arc::clone(plan)).await?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests;
