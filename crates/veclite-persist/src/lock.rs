use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use veclite_core::{Result, VecliteError};

/// A granted lock: the epoch fences release/renew against stale holders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquired {
    pub epoch: u64,
}

/// Named TTL-based exclusion. The in-process implementation covers the
/// single-writer-per-process contract; multi-process hosts plug in an
/// external provider.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Errs with `Locked` while another holder's TTL is live.
    async fn acquire(&self, name: &str, ttl_ms: u64, holder: &str) -> Result<Acquired>;
    async fn release(&self, name: &str, epoch: u64, holder: &str) -> Result<()>;
    async fn renew(&self, name: &str, epoch: u64, ttl_ms: u64, holder: &str) -> Result<()>;
}

#[derive(Debug)]
struct LockState {
    holder: String,
    epoch: u64,
    deadline: Instant,
}

/// In-process memory lock.
#[derive(Debug, Default)]
pub struct MemoryLock {
    locks: Mutex<HashMap<String, LockState>>,
    next_epoch: Mutex<u64>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockProvider for MemoryLock {
    async fn acquire(&self, name: &str, ttl_ms: u64, holder: &str) -> Result<Acquired> {
        let mut locks = self.locks.lock();
        let now = Instant::now();
        if let Some(state) = locks.get(name) {
            if state.deadline > now && state.holder != holder {
                return Err(VecliteError::Locked(format!(
                    "{name} held by {}",
                    state.holder
                )));
            }
        }
        let epoch = {
            let mut next = self.next_epoch.lock();
            *next += 1;
            *next
        };
        locks.insert(
            name.to_string(),
            LockState {
                holder: holder.to_string(),
                epoch,
                deadline: now + Duration::from_millis(ttl_ms),
            },
        );
        Ok(Acquired { epoch })
    }

    async fn release(&self, name: &str, epoch: u64, holder: &str) -> Result<()> {
        let mut locks = self.locks.lock();
        if let Some(state) = locks.get(name) {
            if state.epoch == epoch && state.holder == holder {
                locks.remove(name);
            }
        }
        Ok(())
    }

    async fn renew(&self, name: &str, epoch: u64, ttl_ms: u64, holder: &str) -> Result<()> {
        let mut locks = self.locks.lock();
        match locks.get_mut(name) {
            Some(state) if state.epoch == epoch && state.holder == holder => {
                state.deadline = Instant::now() + Duration::from_millis(ttl_ms);
                Ok(())
            }
            _ => Err(VecliteError::Locked(format!(
                "{name}: renew from a stale holder"
            ))),
        }
    }
}
