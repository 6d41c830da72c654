//! The per-interface address cache. Decides whether an observed address is
//! new for its interface. Guarded by a single coarse mutex; the cache is
//! small and every operation is O(1) average, so the lock exists for
//! correctness under concurrent event delivery, not for throughput.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct AddrCache {
    inner: Mutex<HashMap<u32, HashSet<IpAddr>>>,
}

impl AddrCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, if_index: u32, addr: IpAddr) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .get(&if_index)
            .is_some_and(|addrs| addrs.contains(&addr))
    }

    pub fn insert(&self, if_index: u32, addr: IpAddr) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entry(if_index).or_default().insert(addr);
    }

    /// Removing an unknown interface or address is a no-op.
    pub fn remove(&self, if_index: u32, addr: IpAddr) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(addrs) = inner.get_mut(&if_index) {
            addrs.remove(&addr);
            if addrs.is_empty() {
                inner.remove(&if_index);
            }
        }
    }
}
