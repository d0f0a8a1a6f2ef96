use std::sync::Mutex;

use aeth_core::CoreError;

/// Per-worker IPv4 allocator over a single /24-shaped subnet, tracked as a
/// bitmap of the usable host octets (§4.1, §5: "guarded by a dedicated
/// mutex"). Offset 0 is the network address, 1 the gateway, 255 the
/// broadcast address — none are ever handed out.
pub struct IpAllocator {
    prefix: String,
    gateway_offset: u8,
    used: Mutex<Vec<bool>>,
}

impl IpAllocator {
    /// `subnet_prefix` is the first three octets, e.g. `"172.16.0"`.
    pub fn new(subnet_prefix: impl Into<String>) -> Self {
        let mut used = vec![false; 256];
        used[0] = true;
        used[1] = true; // gateway
        used[255] = true; // broadcast
        Self {
            prefix: subnet_prefix.into(),
            gateway_offset: 1,
            used: Mutex::new(used),
        }
    }

    pub fn gateway(&self) -> String {
        format!("{}.{}", self.prefix, self.gateway_offset)
    }

    /// Allocate the next free address, returning `resource-exhausted` when
    /// the subnet is full (§4.1).
    pub fn allocate(&self) -> Result<String, CoreError> {
        let mut used = self.used.lock().expect("ip allocator mutex poisoned");
        for offset in 2u16..255 {
            if !used[offset as usize] {
                used[offset as usize] = true;
                return Ok(format!("{}.{}", self.prefix, offset));
            }
        }
        Err(CoreError::resource_exhausted(format!(
            "no free IPv4 addresses remaining in subnet {}.0/24",
            self.prefix
        )))
    }

    /// Release an address back to the pool. Idempotent: releasing an
    /// address that was never allocated, or releasing twice, is a no-op.
    pub fn release(&self, addr: &str) {
        let Some(offset) = addr
            .strip_prefix(&format!("{}.", self.prefix))
            .and_then(|s| s.parse::<u16>().ok())
        else {
            return;
        };
        if !(2..255).contains(&offset) {
            return;
        }
        let mut used = self.used.lock().expect("ip allocator mutex poisoned");
        used[offset as usize] = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_distinct_addresses() {
        let alloc = IpAllocator::new("172.16.0");
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        assert_ne!(a, b);
        assert_eq!(alloc.gateway(), "172.16.0.1");
    }

    #[test]
    fn never_hands_out_network_gateway_or_broadcast() {
        let alloc = IpAllocator::new("172.16.0");
        for _ in 0..252 {
            let ip = alloc.allocate().unwrap();
            assert!(!ip.ends_with(".0"));
            assert!(!ip.ends_with(".1"));
            assert!(!ip.ends_with(".255"));
        }
        assert!(alloc.allocate().is_err());
    }

    #[test]
    fn release_then_reallocate_reuses_address() {
        let alloc = IpAllocator::new("172.16.0");
        let a = alloc.allocate().unwrap();
        alloc.release(&a);
        let b = alloc.allocate().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn double_release_is_idempotent() {
        let alloc = IpAllocator::new("172.16.0");
        let a = alloc.allocate().unwrap();
        alloc.release(&a);
        alloc.release(&a);
        assert!(alloc.allocate().is_ok());
    }

    #[test]
    fn exhaustion_is_resource_exhausted() {
        let alloc = IpAllocator::new("172.16.0");
        for _ in 0..252 {
            alloc.allocate().unwrap();
        }
        let err = alloc.allocate().unwrap_err();
        assert_eq!(err.kind, aeth_core::ErrorKind::ResourceExhausted);
    }
}
