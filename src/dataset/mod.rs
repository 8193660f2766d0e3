//! Input tasks and the sampler that orders them into a work queue.
//!
//! - **Task**: immutable prompt record with a stable, derived id
//! - **DistributionSpec**: target weights (and toolsets) per category
//! - **TaskSampler**: seed-driven stratified sampler producing a [`SamplePlan`]

pub mod distribution;
pub mod loader;
pub mod sampler;
pub mod task;

pub use distribution::{CategorySpec, DistributionSpec, UNWEIGHTED};
pub use loader::{load_tasks, parse_tasks};
pub use sampler::{apportion, SamplePlan, SampledTask, Shortfall, TaskSampler};
pub use task::{derive_task_id, Task};
