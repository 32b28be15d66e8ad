//! Connection storage: fd → pooled state, plus a bounded recycle cache.

use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use ahash::AHashMap;

use crate::pool::{ObjectPool, PoolIdx};
use crate::server::conn::ConnectionState;

pub(crate) struct ConnectionStorage {
    active: AHashMap<RawFd, PoolIdx>,
    pool: ObjectPool<ConnectionState>,
    cached: Vec<PoolIdx>,
    max_cached: usize,
}

impl ConnectionStorage {
    pub(crate) fn new(max_cached: usize) -> Self {
        Self {
            active: AHashMap::new(),
            pool: ObjectPool::new(),
            cached: Vec::new(),
            max_cached,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn cached_len(&self) -> usize {
        self.cached.len()
    }

    pub(crate) fn contains(&self, fd: RawFd) -> bool {
        self.active.contains_key(&fd)
    }

    pub(crate) fn fds(&self) -> Vec<RawFd> {
        self.active.keys().copied().collect()
    }

    /// Bind a fresh or recycled state to `fd`.
    pub(crate) fn insert(&mut self, fd: RawFd) -> PoolIdx {
        let idx = match self.cached.pop() {
            Some(idx) => {
                self.pool.get_mut(idx).reset();
                idx
            }
            None => self.pool.alloc(ConnectionState::new()),
        };
        self.active.insert(fd, idx);
        idx
    }

    pub(crate) fn get(&self, fd: RawFd) -> Option<&ConnectionState> {
        self.active.get(&fd).map(|idx| self.pool.get(*idx))
    }

    pub(crate) fn get_mut(&mut self, fd: RawFd) -> Option<&mut ConnectionState> {
        let idx = *self.active.get(&fd)?;
        Some(self.pool.get_mut(idx))
    }

    /// Detach `fd` and either cache the state for reuse or release it back
    /// into the pool. The caller has already run transport shutdown.
    pub(crate) fn recycle_or_release(&mut self, fd: RawFd) {
        let Some(idx) = self.active.remove(&fd) else {
            return;
        };
        let state = self.pool.get_mut(idx);
        // drop transport, pending work and any live coroutine frame
        state.reset();
        if self.cached.len() < self.max_cached {
            state.touch(Instant::now());
            self.cached.push(idx);
        } else {
            let _ = self.pool.release(idx);
        }
    }

    /// Free cached states idle past `timeout`.
    pub(crate) fn sweep_cached(&mut self, now: Instant, timeout: Duration) {
        let pool = &mut self.pool;
        self.cached.retain(|idx| {
            let stale = now.saturating_duration_since(pool.get(*idx).last_activity) > timeout;
            if stale {
                let _ = pool.release(*idx);
            }
            !stale
        });
    }

    /// Live pooled objects, active plus cached.
    pub(crate) fn pooled(&self) -> usize {
        self.pool.len()
    }
}

impl std::fmt::Debug for ConnectionStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStorage")
            .field("active", &self.active.len())
            .field("cached", &self.cached.len())
            .finish()
    }
}
