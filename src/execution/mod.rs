//! Tool execution: the enrichment proxy and the runners it dispatches to.

pub mod jobs;
pub mod proxy;
pub mod runner;

pub use jobs::{HttpJobScheduler, JobRunner, JobScheduler, JobStatus, JobSubmission, SharedScheduler};
pub use proxy::{ExecuteRequest, ExecutionProxy, ExecutionResponse, SuppliedCredentials};
pub use runner::{
    BuiltinRunner, CommandRunner, Invocation, RunnerRegistry, SharedRunner, ToolRunner,
};
