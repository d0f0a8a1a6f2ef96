pub mod hypervisor;
pub mod secrets_handoff;
pub mod vm;

pub use hypervisor::HypervisorClient;
pub use secrets_handoff::SecretsHandoff;
pub use vm::{run_idle_watcher, CreateVmArgs, Orchestrator};
