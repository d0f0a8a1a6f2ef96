//! Service registry (C7, §4.7): worker identity, heartbeat, resource
//! reporting, and the change-watch consumers subscribe to.

pub mod etcd;
pub mod memory;
pub mod query;
pub mod traits;

pub use etcd::EtcdRegistry;
pub use memory::MemoryRegistry;
pub use query::WorkerQuery;
pub use traits::{RegistryEvent, RegistryStream, ServiceRegistry};
