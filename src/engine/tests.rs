//! Unit tests for the engine: registration, analysis, hooks, parallel
//! and sequential execution, executability probing and nested plans.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::computer::{outcome_value, AsyncOutput, AsyncResult, Computer, OutcomeValue, SilentComputer};
use crate::context::Context;
use crate::engine::Engine;
use crate::error::{Error, TaskResult};
use crate::plan::{expect_plan, Blueprint, Plan, PlanView, PostHook, PreHook};
use crate::task::Task;

// --- a small parallel plan with a dependency between its outputs ------

#[derive(Default)]
struct Doubled(AsyncResult<i64>);

impl AsyncOutput for Doubled {
    fn bind(&self, task: Task<OutcomeValue>) {
        self.0.bind(task);
    }
}

#[derive(Default)]
struct PlusTen(AsyncResult<i64>);

impl AsyncOutput for PlusTen {
    fn bind(&self, task: Task<OutcomeValue>) {
        self.0.bind(task);
    }
}

#[derive(Default)]
struct MathPlan {
    input: i64,
    doubled: Doubled,
    plus_ten: PlusTen,
}

impl Plan for MathPlan {
    fn is_sequential(&self) -> bool {
        false
    }

    fn blueprint(b: &mut Blueprint<Self>) {
        b.computes(|p: &MathPlan| &p.doubled)
            .computes(|p: &MathPlan| &p.plus_ten);
    }
}

struct DoubleComputer;

#[async_trait]
impl Computer for DoubleComputer {
    async fn compute(&self, _ctx: Context, plan: Arc<dyn PlanView>) -> TaskResult<OutcomeValue> {
        let plan = expect_plan::<MathPlan>(&plan);
        Ok(outcome_value(plan.input * 2))
    }
}

/// Depends on [`Doubled`] through the plan's accessor.
struct PlusTenComputer;

#[async_trait]
impl Computer for PlusTenComputer {
    async fn compute(&self, _ctx: Context, plan: Arc<dyn PlanView>) -> TaskResult<OutcomeValue> {
        let plan = expect_plan::<MathPlan>(&plan);
        let doubled = plan.doubled.0.get().await?;
        Ok(outcome_value(doubled + 10))
    }
}

fn math_engine() -> Engine {
    let engine = Engine::new();
    engine.register_computer::<Doubled>(DoubleComputer);
    engine.register_computer::<PlusTen>(PlusTenComputer);
    engine
}

#[tokio::test]
async fn parallel_plan_computes_dependent_outputs() {
    let engine = math_engine();
    let plan_name = engine.analyze_plan(&MathPlan::default()).unwrap();

    let plan = Arc::new(MathPlan {
        input: 16,
        ..MathPlan::default()
    });
    engine
        .execute(&Context::background(), &plan_name, Arc::clone(&plan))
        .await
        .unwrap();

    assert_eq!(plan.doubled.0.get().await, Ok(32));
    assert_eq!(plan.plus_ten.0.get().await, Ok(42));
}

#[tokio::test]
async fn registration_and_analysis_are_observable() {
    let engine = Engine::new();
    assert!(!engine.is_registered::<Doubled>());
    assert!(!engine.is_analyzed::<MathPlan>());

    engine.register_computer::<Doubled>(DoubleComputer);
    engine.analyze_plan(&MathPlan::default()).unwrap();

    assert!(engine.is_registered::<Doubled>());
    assert!(!engine.is_registered::<PlusTen>());
    assert!(engine.is_analyzed::<MathPlan>());
}

#[tokio::test]
async fn executing_an_unanalyzed_plan_fails() {
    let engine = math_engine();
    let plan = Arc::new(MathPlan::default());

    let err = engine
        .execute(&Context::background(), std::any::type_name::<MathPlan>(), plan)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PlanNotAnalyzed));
}

#[tokio::test]
async fn later_registration_replaces_the_earlier_computer() {
    struct FixedDouble(i64);

    #[async_trait]
    impl Computer for FixedDouble {
        async fn compute(
            &self,
            _ctx: Context,
            _plan: Arc<dyn PlanView>,
        ) -> TaskResult<OutcomeValue> {
            Ok(outcome_value(self.0))
        }
    }

    let engine = math_engine();
    engine.register_computer::<Doubled>(FixedDouble(1000));
    let plan_name = engine.analyze_plan(&MathPlan::default()).unwrap();

    let plan = Arc::new(MathPlan::default());
    engine
        .execute(&Context::background(), &plan_name, Arc::clone(&plan))
        .await
        .unwrap();

    assert_eq!(plan.doubled.0.get().await, Ok(1000));
}

// --- sequential plans -------------------------------------------------

type StepLog = Arc<Mutex<Vec<&'static str>>>;

#[derive(Default)]
struct StepOne;
#[derive(Default)]
struct StepTwo;

struct SequentialPlan {
    log: StepLog,
}

impl Plan for SequentialPlan {
    fn is_sequential(&self) -> bool {
        true
    }

    fn blueprint(b: &mut Blueprint<Self>) {
        b.component::<StepOne>().component::<StepTwo>();
    }
}

struct StepComputer {
    name: &'static str,
    delay: Duration,
}

#[async_trait]
impl SilentComputer for StepComputer {
    async fn compute(&self, _ctx: Context, plan: Arc<dyn PlanView>) -> TaskResult<()> {
        let plan = expect_plan::<SequentialPlan>(&plan);
        tokio::time::sleep(self.delay).await;
        plan.log.lock().unwrap().push(self.name);
        Ok(())
    }
}

#[tokio::test]
async fn sequential_components_run_in_declared_order() {
    let engine = Engine::new();
    engine.register_silent_computer::<StepOne>(StepComputer {
        name: "one",
        delay: Duration::from_millis(30),
    });
    engine.register_silent_computer::<StepTwo>(StepComputer {
        name: "two",
        delay: Duration::from_millis(1),
    });

    let log: StepLog = StepLog::default();
    let plan = Arc::new(SequentialPlan {
        log: Arc::clone(&log),
    });
    let plan_name = engine.analyze_plan(plan.as_ref()).unwrap();

    engine
        .execute(&Context::background(), &plan_name, plan)
        .await
        .unwrap();

    // The slower first step still finishes before the second starts.
    assert_eq!(*log.lock().unwrap(), vec!["one", "two"]);
}

#[tokio::test]
async fn components_without_a_computer_are_skipped() {
    let engine = Engine::new();
    engine.register_silent_computer::<StepTwo>(StepComputer {
        name: "two",
        delay: Duration::from_millis(1),
    });

    let log: StepLog = StepLog::default();
    let plan = Arc::new(SequentialPlan {
        log: Arc::clone(&log),
    });
    let plan_name = engine.analyze_plan(plan.as_ref()).unwrap();

    engine
        .execute(&Context::background(), &plan_name, plan)
        .await
        .unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["two"]);
}

#[tokio::test]
async fn analyzing_a_sequential_plan_with_async_outputs_fails() {
    struct BadPlan {
        out: AsyncResult<i32>,
    }

    impl Plan for BadPlan {
        fn is_sequential(&self) -> bool {
            true
        }

        fn blueprint(b: &mut Blueprint<Self>) {
            b.computes(|p: &BadPlan| &p.out);
        }
    }

    let engine = Engine::new();
    let err = engine
        .analyze_plan(&BadPlan {
            out: AsyncResult::default(),
        })
        .unwrap_err();
    assert!(matches!(err, Error::SequentialPlanHasAsyncOutput));
    assert!(!engine.is_analyzed::<BadPlan>());
}

// --- hooks ------------------------------------------------------------

struct LogHook {
    name: &'static str,
    log: StepLog,
}

#[async_trait]
impl PreHook for LogHook {
    async fn pre_execute(&self, _ctx: &Context, _plan: Arc<dyn PlanView>) -> TaskResult<()> {
        self.log.lock().unwrap().push(self.name);
        Ok(())
    }
}

#[async_trait]
impl PostHook for LogHook {
    async fn post_execute(&self, _ctx: &Context, _plan: Arc<dyn PlanView>) -> TaskResult<()> {
        self.log.lock().unwrap().push(self.name);
        Ok(())
    }
}

struct HookedPlan {
    log: StepLog,
}

impl Plan for HookedPlan {
    fn is_sequential(&self) -> bool {
        true
    }

    fn blueprint(b: &mut Blueprint<Self>) {
        b.component::<StepOne>();
    }
}

#[tokio::test]
async fn hooks_run_around_components_in_order() {
    let log: StepLog = StepLog::default();

    let engine = Engine::new();
    engine.register_silent_computer::<StepOne>(StepLogger {
        log_name: "component",
    });

    let plan = Arc::new(HookedPlan {
        log: Arc::clone(&log),
    });
    let plan_name = engine.analyze_plan(plan.as_ref()).unwrap();

    engine
        .connect_pre_hook::<HookedPlan>(LogHook {
            name: "pre",
            log: Arc::clone(&log),
        })
        .unwrap();
    engine
        .connect_post_hook::<HookedPlan>(LogHook {
            name: "post",
            log: Arc::clone(&log),
        })
        .unwrap();

    engine
        .execute(&Context::background(), &plan_name, plan)
        .await
        .unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["pre", "component", "post"]);
}

/// Silent computer that appends to the [`HookedPlan`] log.
struct StepLogger {
    log_name: &'static str,
}

#[async_trait]
impl SilentComputer for StepLogger {
    async fn compute(&self, _ctx: Context, plan: Arc<dyn PlanView>) -> TaskResult<()> {
        let plan = expect_plan::<HookedPlan>(&plan);
        plan.log.lock().unwrap().push(self.log_name);
        Ok(())
    }
}

#[tokio::test]
async fn failing_pre_hook_skips_components_and_post_hooks() {
    struct FailingPre;

    #[async_trait]
    impl PreHook for FailingPre {
        async fn pre_execute(&self, _ctx: &Context, _plan: Arc<dyn PlanView>) -> TaskResult<()> {
            Err(Error::msg("pre failed"))
        }
    }

    let log: StepLog = StepLog::default();
    let engine = Engine::new();
    engine.register_silent_computer::<StepOne>(StepLogger {
        log_name: "component",
    });

    let plan = Arc::new(HookedPlan {
        log: Arc::clone(&log),
    });
    let plan_name = engine.analyze_plan(plan.as_ref()).unwrap();
    engine.connect_pre_hook::<HookedPlan>(FailingPre).unwrap();
    engine
        .connect_post_hook::<HookedPlan>(LogHook {
            name: "post",
            log: Arc::clone(&log),
        })
        .unwrap();

    let err = engine
        .execute(&Context::background(), &plan_name, plan)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "pre failed");
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn ending_early_is_swallowed_at_the_top_level() {
    struct EndEarly;

    #[async_trait]
    impl PreHook for EndEarly {
        async fn pre_execute(&self, _ctx: &Context, _plan: Arc<dyn PlanView>) -> TaskResult<()> {
            Err(Error::PlanExecutionEndingEarly)
        }
    }

    let log: StepLog = StepLog::default();
    let engine = Engine::new();
    engine.register_silent_computer::<StepOne>(StepLogger {
        log_name: "component",
    });

    let plan = Arc::new(HookedPlan {
        log: Arc::clone(&log),
    });
    let plan_name = engine.analyze_plan(plan.as_ref()).unwrap();
    engine.connect_pre_hook::<HookedPlan>(EndEarly).unwrap();

    // The intentional early stop surfaces as success, and nothing ran.
    engine
        .execute(&Context::background(), &plan_name, plan)
        .await
        .unwrap();
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn connecting_hooks_requires_an_analyzed_plan() {
    let engine = Engine::new();
    let log: StepLog = StepLog::default();

    let err = engine
        .connect_pre_hook::<HookedPlan>(LogHook {
            name: "pre",
            log,
        })
        .unwrap_err();
    assert!(matches!(err, Error::PlanNotAnalyzed));
}

// --- error propagation in parallel plans ------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn first_component_error_cancels_the_siblings() {
    #[derive(Default)]
    struct Fast(AsyncResult<i32>);
    impl AsyncOutput for Fast {
        fn bind(&self, task: Task<OutcomeValue>) {
            self.0.bind(task);
        }
    }

    #[derive(Default)]
    struct Slow(AsyncResult<i32>);
    impl AsyncOutput for Slow {
        fn bind(&self, task: Task<OutcomeValue>) {
            self.0.bind(task);
        }
    }

    #[derive(Default)]
    struct RacyPlan {
        fast: Fast,
        slow: Slow,
    }

    impl Plan for RacyPlan {
        fn is_sequential(&self) -> bool {
            false
        }

        fn blueprint(b: &mut Blueprint<Self>) {
            b.computes(|p: &RacyPlan| &p.fast)
                .computes(|p: &RacyPlan| &p.slow);
        }
    }

    struct FailsFast;

    #[async_trait]
    impl Computer for FailsFast {
        async fn compute(
            &self,
            _ctx: Context,
            _plan: Arc<dyn PlanView>,
        ) -> TaskResult<OutcomeValue> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(Error::msg("fast component failed"))
        }
    }

    struct NeverFinishes;

    #[async_trait]
    impl Computer for NeverFinishes {
        async fn compute(
            &self,
            _ctx: Context,
            _plan: Arc<dyn PlanView>,
        ) -> TaskResult<OutcomeValue> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(outcome_value(0))
        }
    }

    let engine = Engine::new();
    engine.register_computer::<Fast>(FailsFast);
    engine.register_computer::<Slow>(NeverFinishes);
    let plan_name = engine.analyze_plan(&RacyPlan::default()).unwrap();

    let plan = Arc::new(RacyPlan::default());
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        engine.execute(&Context::background(), &plan_name, Arc::clone(&plan)),
    )
    .await
    .expect("sibling cancellation should unblock the group");

    assert_eq!(result.unwrap_err().to_string(), "fast component failed");

    // The slow sibling was cancelled, not left running.
    assert!(plan.slow.0.get().await.unwrap_err().is_cancellation());
}

// --- executability ----------------------------------------------------

#[tokio::test]
async fn fully_registered_plans_are_executable() {
    let engine = math_engine();
    engine.analyze_plan(&MathPlan::default()).unwrap();

    let plan = Arc::new(MathPlan::default());
    engine.is_executable(&plan).await.unwrap();
}

#[tokio::test]
async fn missing_registration_makes_the_plan_not_executable() {
    let engine = Engine::new();
    engine.register_computer::<Doubled>(DoubleComputer);
    engine.analyze_plan(&MathPlan::default()).unwrap();

    let plan = Arc::new(MathPlan::default());
    let err = engine.is_executable(&plan).await.unwrap_err();
    assert!(matches!(err, Error::PlanNotExecutable(_)));
}

#[tokio::test]
async fn computer_panics_make_the_plan_not_executable() {
    /// Casts the plan to the wrong type, like a mis-wired computer.
    struct WrongCast;

    #[async_trait]
    impl Computer for WrongCast {
        async fn compute(&self, _ctx: Context, plan: Arc<dyn PlanView>) -> TaskResult<OutcomeValue> {
            let plan = expect_plan::<SequentialPlan>(&plan);
            plan.log.lock().unwrap().push("never reached");
            Ok(outcome_value(()))
        }
    }

    let engine = Engine::new();
    engine.register_computer::<Doubled>(WrongCast);
    engine.register_computer::<PlusTen>(PlusTenComputer);
    engine.analyze_plan(&MathPlan::default()).unwrap();

    let plan = Arc::new(MathPlan::default());
    let err = engine.is_executable(&plan).await.unwrap_err();
    assert!(matches!(err, Error::PlanNotExecutable(_)));
}

// --- nested plans -----------------------------------------------------

#[derive(Default)]
struct InnerCounter;

struct InnerPlan {
    counter: Arc<AtomicUsize>,
}

impl Plan for InnerPlan {
    fn is_sequential(&self) -> bool {
        true
    }

    fn blueprint(b: &mut Blueprint<Self>) {
        b.component::<InnerCounter>();
    }
}

struct CountingComputer;

#[async_trait]
impl SilentComputer for CountingComputer {
    async fn compute(&self, _ctx: Context, plan: Arc<dyn PlanView>) -> TaskResult<()> {
        let plan = expect_plan::<InnerPlan>(&plan);
        plan.counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct OuterPlan {
    inner: Arc<InnerPlan>,
    doubled: Doubled,
    input: i64,
}

impl Plan for OuterPlan {
    fn is_sequential(&self) -> bool {
        false
    }

    fn blueprint(b: &mut Blueprint<Self>) {
        b.computes(|p: &OuterPlan| &p.doubled)
            .nested(|p: &OuterPlan| Arc::clone(&p.inner));
    }
}

struct OuterDouble;

#[async_trait]
impl Computer for OuterDouble {
    async fn compute(&self, _ctx: Context, plan: Arc<dyn PlanView>) -> TaskResult<OutcomeValue> {
        let plan = expect_plan::<OuterPlan>(&plan);
        Ok(outcome_value(plan.input * 2))
    }
}

#[tokio::test]
async fn nested_plans_execute_recursively() {
    let engine = Engine::new();
    engine.register_computer::<Doubled>(OuterDouble);
    engine.register_silent_computer::<InnerCounter>(CountingComputer);

    let counter = Arc::new(AtomicUsize::new(0));
    let inner = Arc::new(InnerPlan {
        counter: Arc::clone(&counter),
    });

    engine.analyze_plan(inner.as_ref()).unwrap();
    let plan_name = engine
        .analyze_plan(&OuterPlan {
            inner: Arc::clone(&inner),
            doubled: Doubled::default(),
            input: 0,
        })
        .unwrap();

    let plan = Arc::new(OuterPlan {
        inner,
        doubled: Doubled::default(),
        input: 4,
    });
    engine
        .execute(&Context::background(), &plan_name, Arc::clone(&plan))
        .await
        .unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(plan.doubled.0.get().await, Ok(8));
}

#[tokio::test]
async fn nested_plans_must_be_analyzed_before_the_parent_runs() {
    let engine = Engine::new();
    engine.register_computer::<Doubled>(OuterDouble);
    engine.register_silent_computer::<InnerCounter>(CountingComputer);

    let inner = Arc::new(InnerPlan {
        counter: Arc::new(AtomicUsize::new(0)),
    });
    let plan_name = engine
        .analyze_plan(&OuterPlan {
            inner: Arc::clone(&inner),
            doubled: Doubled::default(),
            input: 0,
        })
        .unwrap();

    let plan = Arc::new(OuterPlan {
        inner,
        doubled: Doubled::default(),
        input: 4,
    });
    let err = engine
        .execute(&Context::background(), &plan_name, plan)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PlanNotAnalyzed));
}
