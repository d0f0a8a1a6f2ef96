mod execution;
mod secret;
mod task;
mod vm;
mod worker;
mod worker_metrics;
mod workspace;

pub use execution::Execution;
pub use secret::{Secret, SecretType};
pub use task::{Task, TaskState, TaskType};
pub use vm::{Vm, VmNet, VmStatus, validate_transition};
pub use worker::{Worker, WorkerStatus};
pub use worker_metrics::WorkerMetrics;
pub use workspace::Workspace;
