pub mod filters;
pub mod memory;
pub mod sqlite;
pub mod traits;

pub use filters::{ExecutionFilter, SecretFilter, TaskFilter, VmFilter, WorkerFilter, WorkerMetricsFilter, WorkspaceFilter};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{ExecutionRepository, ResourceReservation, SecretRepository, Store, TaskRepository, VmRepository, WorkerMetricsRepository, WorkerRepository, WorkspaceRepository};
