use std::collections::HashSet;
use std::sync::Mutex;

use crate::monero::Subaddress;

use super::BridgeError;

/// Pool of wallet subaddresses handed out exclusively, one live invoice per
/// subaddress. The mutex serializes concurrent accepts; an address leaves
/// the pool on allocate and comes back only on release.
pub struct SubaddressAllocator {
    inner: Mutex<Pool>,
}

struct Pool {
    free: Vec<Subaddress>,
    /// Minor indices currently out on loan. Guards against double release
    /// and against replenish re-adding a loaned address.
    loaned: HashSet<u32>,
}

impl SubaddressAllocator {
    pub fn new(seed: Vec<Subaddress>) -> Self {
        Self {
            inner: Mutex::new(Pool {
                free: seed,
                loaned: HashSet::new(),
            }),
        }
    }

    pub fn allocate(&self) -> Result<Subaddress, BridgeError> {
        let mut pool = self.inner.lock().expect("allocator mutex poisoned");
        match pool.free.pop() {
            Some(sub) => {
                pool.loaned.insert(sub.minor_index);
                Ok(sub)
            }
            None => Err(BridgeError::PoolExhausted),
        }
    }

    /// Return a subaddress to the pool. Only honoured for addresses this
    /// allocator actually loaned out, so a stray double release is inert.
    pub fn release(&self, sub: Subaddress) {
        let mut pool = self.inner.lock().expect("allocator mutex poisoned");
        if pool.loaned.remove(&sub.minor_index) {
            pool.free.push(sub);
        }
    }

    /// Record a subaddress as out on loan without going through `allocate`,
    /// used when resuming monitored invoices after a restart.
    pub fn mark_loaned(&self, sub: &Subaddress) {
        let mut pool = self.inner.lock().expect("allocator mutex poisoned");
        pool.free.retain(|s| s.minor_index != sub.minor_index);
        pool.loaned.insert(sub.minor_index);
    }

    /// Add a freshly created subaddress to the pool (replenish worker).
    pub fn add(&self, sub: Subaddress) {
        let mut pool = self.inner.lock().expect("allocator mutex poisoned");
        if !pool.loaned.contains(&sub.minor_index)
            && !pool.free.iter().any(|s| s.minor_index == sub.minor_index)
        {
            pool.free.push(sub);
        }
    }

    /// Free + loaned, the pool's total footprint.
    pub fn tracked(&self) -> usize {
        let pool = self.inner.lock().expect("allocator mutex poisoned");
        pool.free.len() + pool.loaned.len()
    }

    pub fn free_count(&self) -> usize {
        self.inner
            .lock()
            .expect("allocator mutex poisoned")
            .free
            .len()
    }
}
