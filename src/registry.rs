//! Process-wide map of managed services.
//!
//! One entry per service name. Each entry pairs the descriptor with an
//! operation mutex, so mutating calls serialize per name while status reads
//! clone the descriptor out without waiting on in-flight transitions.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};

use dashmap::DashMap;

use crate::status::ServiceStatus;

/// Everything the bridge knows about one managed service.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    /// None when the entry was re-derived from the OS after a host restart.
    pub exec_path: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub status: ServiceStatus,
    /// Reason for the most recent failed transition, cleared on success.
    pub last_error: Option<String>,
}

impl ServiceDescriptor {
    pub(crate) fn new(name: &str) -> Self {
        ServiceDescriptor {
            name: name.to_string(),
            exec_path: None,
            config_path: None,
            status: ServiceStatus::Unknown,
            last_error: None,
        }
    }
}

/// Registry slot for one service name.
pub struct ServiceEntry {
    /// Held for the whole of any mutating operation on this name.
    op_lock: Mutex<()>,
    state: RwLock<ServiceDescriptor>,
}

impl ServiceEntry {
    fn new(descriptor: ServiceDescriptor) -> Self {
        ServiceEntry {
            op_lock: Mutex::new(()),
            state: RwLock::new(descriptor),
        }
    }

    /// Blocks until any in-flight mutation on this name finishes.
    pub(crate) fn lock_for_op(&self) -> MutexGuard<'_, ()> {
        self.op_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Non-blocking acquisition, used by status refresh.
    pub(crate) fn try_lock_for_op(&self) -> Option<MutexGuard<'_, ()>> {
        match self.op_lock.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Clone of the current descriptor. Never touches the op lock.
    pub fn snapshot(&self) -> ServiceDescriptor {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn update(&self, apply: impl FnOnce(&mut ServiceDescriptor)) {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        apply(&mut guard);
    }

    pub(crate) fn set_status(&self, status: ServiceStatus) {
        self.update(|d| d.status = status);
    }

    /// Marks the descriptor failed and remembers why.
    pub(crate) fn record_failure(&self, reason: &str) {
        self.update(|d| {
            d.status = ServiceStatus::Failed(reason.to_string());
            d.last_error = Some(reason.to_string());
        });
    }
}

/// Name-keyed registry. Sharded, so operations on different names never
/// contend on a single lock.
#[derive(Default)]
pub struct ServiceRegistry {
    entries: DashMap<String, Arc<ServiceEntry>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        ServiceRegistry {
            entries: DashMap::new(),
        }
    }

    /// Existing entry for `name`, if this process has seen it.
    pub fn get(&self, name: &str) -> Option<Arc<ServiceEntry>> {
        self.entries.get(name).map(|e| Arc::clone(e.value()))
    }

    /// Entry for `name`, inserting a fresh Unknown descriptor when absent.
    pub(crate) fn get_or_insert(&self, name: &str) -> Arc<ServiceEntry> {
        Arc::clone(
            self.entries
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(ServiceEntry::new(ServiceDescriptor::new(name))))
                .value(),
        )
    }

    /// Re-inserts `entry` when a concurrent failure pruned it from the map.
    /// Keeps whoever holds the entry's op lock operating on the mapped slot.
    pub(crate) fn attach(&self, name: &str, entry: &Arc<ServiceEntry>) {
        self.entries
            .entry(name.to_string())
            .or_insert_with(|| Arc::clone(entry));
    }

    pub(crate) fn remove(&self, name: &str) {
        self.entries.remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of every descriptor, for diagnostics.
    pub fn snapshot_all(&self) -> Vec<ServiceDescriptor> {
        self.entries.iter().map(|e| e.value().snapshot()).collect()
    }
}
