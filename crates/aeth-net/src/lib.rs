pub mod bridge;
pub mod ip_alloc;
mod shell;

pub use bridge::{Fabric, VmNetAssignment};
pub use ip_alloc::IpAllocator;
