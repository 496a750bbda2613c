pub mod clock;
pub mod ecs;
pub mod estimator;
pub mod interruption;
pub mod matching;
pub mod network;
pub mod plan;
pub mod replan;
pub mod routing;
pub mod runner;
pub mod scenario;
pub mod services;
pub mod systems;
pub mod telemetry;
pub mod telemetry_export;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;
