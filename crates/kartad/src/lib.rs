pub mod dispatcher;
pub mod executor;
pub mod feature_runner;
pub mod job_runner;
// lifecycle helpers stay behind their module path.
pub mod lifecycle;
pub mod logging;
pub mod pool;
pub mod runtime;
pub mod scenario_runner;
pub mod selection;
pub mod step_target;

pub use dispatcher::*;
pub use executor::*;
pub use feature_runner::*;
pub use job_runner::*;
pub use logging::*;
pub use pool::*;
pub use runtime::*;
pub use scenario_runner::*;
pub use selection::*;
pub use step_target::*;

#[cfg(test)]
mod tests {
    use super::{
        DispatchError, Dispatcher, FeatureRunner, JobRunner, KartaRuntime, KartaRuntimeBuilder,
        PoolError, RemoteScenarioExecutor, RuntimeError, ScenarioExecutor, ScenarioRunner,
        StepTarget, ThreadPoolGroupManager,
    };
    use std::any::TypeId;
    use std::sync::Arc;

    #[test]
    fn crate_root_reexports_runtime_types() {
        let _ = TypeId::of::<KartaRuntime>();
        let _ = TypeId::of::<KartaRuntimeBuilder>();
        let _ = TypeId::of::<RuntimeError>();
        let _ = TypeId::of::<Dispatcher>();
        let _ = TypeId::of::<DispatchError>();
        let _ = TypeId::of::<FeatureRunner>();
        let _ = TypeId::of::<JobRunner>();
        let _ = TypeId::of::<ThreadPoolGroupManager>();
        let _ = TypeId::of::<PoolError>();
        let _ = TypeId::of::<StepTarget>();
    }

    #[test]
    fn both_executors_are_scenario_executors() {
        fn assert_executor<T: ScenarioExecutor + 'static>() {}
        assert_executor::<ScenarioRunner>();
        assert_executor::<RemoteScenarioExecutor>();
        let _shared: Option<Arc<dyn ScenarioExecutor>> = None;
    }
}
