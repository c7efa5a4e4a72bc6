//! Striped per-device locks.
//!
//! Writers hold a device's stripe across store write and dispatch. Catch-up
//! holds every stripe of its scope while querying, so each command is either
//! committed and dispatched before the query or invisible to it.

use crate::subscriptions::DeviceScope;
use crate::types::DeviceId;
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeSet;

pub struct DeviceLocks {
    stripes: Vec<Mutex<()>>,
}

impl DeviceLocks {
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    fn index(&self, device_id: &DeviceId) -> usize {
        crc32fast::hash(device_id.as_str().as_bytes()) as usize % self.stripes.len()
    }

    pub fn lock(&self, device_id: &DeviceId) -> MutexGuard<'_, ()> {
        self.stripes[self.index(device_id)].lock()
    }

    /// Lock every stripe covering `scope`, in ascending index order.
    pub fn lock_scope(&self, scope: &DeviceScope) -> Vec<MutexGuard<'_, ()>> {
        let indices: BTreeSet<usize> = match scope {
            DeviceScope::AllPermitted => (0..self.stripes.len()).collect(),
            DeviceScope::Devices(devices) => devices.iter().map(|d| self.index(d)).collect(),
        };
        indices.into_iter().map(|i| self.stripes[i].lock()).collect()
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_device_same_stripe() {
        let locks = DeviceLocks::new(8);
        let a = DeviceId::new("dev-1");
        assert_eq!(locks.index(&a), locks.index(&a.clone()));
        assert!(locks.index(&a) < locks.stripe_count());
    }

    #[test]
    fn test_scope_locks_are_released() {
        let locks = DeviceLocks::new(4);
        let scope = DeviceScope::Devices(
            [DeviceId::new("a"), DeviceId::new("b")].into_iter().collect(),
        );
        {
            let guards = locks.lock_scope(&scope);
            assert!(!guards.is_empty() && guards.len() <= 2);
        }
        assert_eq!(locks.lock_scope(&DeviceScope::AllPermitted).len(), 4);
        drop(locks.lock(&DeviceId::new("a")));
    }

    #[test]
    fn test_zero_stripes_clamped() {
        assert_eq!(DeviceLocks::new(0).stripe_count(), 1);
    }
}
